//! Local directory content store
//!
//! File-based content-addressed storage. Objects are encrypted while they
//! stream in, hashed with BLAKE3 over the ciphertext and written atomically.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use super::{ContentRef, ContentStore, ObjectReader, UploadSource, check_declared_size};
use crate::cipher::{CtrCipher, generate_key};
use crate::error::StoreError;

/// Configuration for the blob directory store
#[derive(Debug, Clone)]
pub struct BlobDirStoreConfig {
    /// Base directory for object storage
    pub base_dir: PathBuf,
    /// Number of subdirectory levels (for sharding)
    pub shard_depth: u8,
}

impl BlobDirStoreConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            shard_depth: 2, // e.g., ab/cd/abcdef...
        }
    }
}

/// Content store backed by a local directory
pub struct BlobDirStore {
    config: BlobDirStoreConfig,
}

impl BlobDirStore {
    /// Create a new store, creating the base directory if needed
    pub async fn new(config: BlobDirStoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.base_dir).await?;

        info!(path = %config.base_dir.display(), "Blob directory store initialized");

        Ok(Self { config })
    }

    /// Get the base directory
    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    /// Check if an object exists
    pub fn exists(&self, hash: &str) -> bool {
        self.object_path(hash).is_ok_and(|path| path.exists())
    }

    /// Get the file path for an object
    fn object_path(&self, hash: &str) -> Result<PathBuf, StoreError> {
        if hash.len() < 2 * self.config.shard_depth as usize
            || !hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(StoreError::not_found(hash));
        }

        let mut path = self.config.base_dir.clone();
        for level in 0..self.config.shard_depth as usize {
            path.push(&hash[level * 2..level * 2 + 2]);
        }
        path.push(hash);
        Ok(path)
    }

    async fn open_object(&self, hash: &str) -> Result<File, StoreError> {
        let path = self.object_path(hash)?;
        File::open(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::not_found(hash)
            } else {
                StoreError::Io(e.to_string())
            }
        })
    }
}

#[async_trait]
impl ContentStore for BlobDirStore {
    #[instrument(skip(self, source), fields(declared = ?declared_size))]
    async fn upload_sequential(
        &self,
        name: &str,
        declared_size: Option<u64>,
        mut source: UploadSource,
    ) -> Result<ContentRef, StoreError> {
        let key = generate_key();
        let mut cipher = CtrCipher::new(&key)?;
        let mut hasher = blake3::Hasher::new();

        // Stream into a uniquely named temp file, then rename into place
        let temp_path = self
            .config
            .base_dir
            .join(format!(".upload-{}.tmp", hex::encode(rand::random::<[u8; 8]>())));
        let mut file = File::create(&temp_path).await?;

        let mut received = 0u64;
        let streamed: Result<(), StoreError> = async {
            while let Some(chunk) = source.next_chunk().await {
                let mut data = chunk.to_vec();
                cipher.apply(&mut data);
                hasher.update(&data);
                file.write_all(&data).await?;
                received += data.len() as u64;
            }
            check_declared_size(declared_size, received)?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(e) = streamed {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove partial upload");
            }
            return Err(e);
        }
        drop(file);

        let content = ContentRef::new(hasher.finalize().to_hex().to_string(), key);
        let path = self.object_path(&content.hash)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Atomic rename
        fs::rename(&temp_path, &path).await?;

        debug!(hash = %content.short_hash(), size = received, "Stored object");
        Ok(content)
    }

    #[instrument(skip(self), fields(hash = %content.short_hash()))]
    async fn download(&self, content: &ContentRef) -> Result<Bytes, StoreError> {
        let mut file = self.open_object(&content.hash).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        // Verify hash
        let actual = blake3::hash(&data).to_hex();
        if actual.as_str() != content.hash {
            warn!(
                expected = %content.hash,
                actual = %actual,
                "Object hash mismatch"
            );
            return Err(StoreError::Serialization("Hash mismatch".into()));
        }

        CtrCipher::new(&content.key)?.apply(&mut data);
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, key), fields(decrypting = key.is_some()))]
    async fn open_stream(
        &self,
        hash: &str,
        key: Option<&str>,
    ) -> Result<Box<dyn ObjectReader>, StoreError> {
        let file = self.open_object(hash).await?;
        let cipher = key.map(CtrCipher::new).transpose()?;
        Ok(Box::new(BlobReader { file, cipher }))
    }
}

struct BlobReader {
    file: File,
    cipher: Option<CtrCipher>,
}

#[async_trait]
impl ObjectReader for BlobReader {
    fn is_seekable(&self) -> bool {
        true
    }

    async fn seek(&mut self, offset: u64) -> Result<(), StoreError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.seek(offset);
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StoreError> {
        let n = self.file.read(buf).await?;
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut buf[..n]);
        }
        Ok(n)
    }
}
