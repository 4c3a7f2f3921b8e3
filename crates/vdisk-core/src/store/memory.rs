//! In-memory content store
//!
//! Keeps every object encrypted in a `DashMap`, the same way a remote store
//! would hold it. Chunking, seekability and failures are configurable so the
//! streaming adapters can be driven through awkward transports in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{ContentRef, ContentStore, ObjectReader, UploadSource, check_declared_size};
use crate::cipher::{CtrCipher, generate_key};
use crate::error::StoreError;

/// Behaviour knobs for [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryStoreOptions {
    /// Largest number of bytes a single stream read returns
    pub chunk_size: usize,
    /// Whether opened streams support seeking
    pub seekable: bool,
    /// Artificial latency before a stream is handed out
    pub open_delay: Option<Duration>,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            seekable: false,
            open_delay: None,
        }
    }
}

/// In-memory implementation of ContentStore
#[derive(Debug, Default)]
pub struct MemoryStore {
    options: MemoryStoreOptions,
    /// Ciphertext by hex hash
    objects: DashMap<String, Bytes>,
    /// Completed uploads per object name
    uploads: DashMap<String, usize>,
    stream_opens: AtomicU64,
    fail_uploads: AtomicBool,
    fail_downloads: AtomicBool,
}

impl MemoryStore {
    /// Create a new in-memory store with default options
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MemoryStoreOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Make every following upload fail with a transport error
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Make every following download or stream open fail
    pub fn set_fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    /// Number of completed uploads stored under `name`
    pub fn upload_count(&self, name: &str) -> usize {
        self.uploads.get(name).map(|count| *count).unwrap_or(0)
    }

    /// Number of distinct objects held
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of streams opened so far
    pub fn stream_opens(&self) -> u64 {
        self.stream_opens.load(Ordering::SeqCst)
    }

    /// Raw stored bytes of an object
    pub fn ciphertext(&self, hash: &str) -> Option<Bytes> {
        self.objects.get(hash).map(|data| data.clone())
    }

    fn object(&self, hash: &str) -> Result<Bytes, StoreError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(StoreError::transport("injected download failure"));
        }
        self.ciphertext(hash)
            .ok_or_else(|| StoreError::not_found(hash))
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn upload_sequential(
        &self,
        name: &str,
        declared_size: Option<u64>,
        mut source: UploadSource,
    ) -> Result<ContentRef, StoreError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StoreError::transport("injected upload failure"));
        }

        let key = generate_key();
        let mut cipher = CtrCipher::new(&key)?;
        let mut ciphertext = BytesMut::new();
        while let Some(chunk) = source.next_chunk().await {
            trace!(name = %name, len = chunk.len(), "Received chunk");
            let start = ciphertext.len();
            ciphertext.extend_from_slice(&chunk);
            cipher.apply(&mut ciphertext[start..]);
        }
        check_declared_size(declared_size, ciphertext.len() as u64)?;

        let data = ciphertext.freeze();
        let content = ContentRef::new(blake3::hash(&data).to_hex().to_string(), key);
        debug!(name = %name, hash = %content.short_hash(), size = data.len(), "Stored object");

        self.objects.insert(content.hash.clone(), data);
        *self.uploads.entry(name.to_string()).or_default() += 1;
        Ok(content)
    }

    async fn download(&self, content: &ContentRef) -> Result<Bytes, StoreError> {
        let ciphertext = self.object(&content.hash)?;
        let mut plain = ciphertext.to_vec();
        CtrCipher::new(&content.key)?.apply(&mut plain);
        Ok(Bytes::from(plain))
    }

    async fn open_stream(
        &self,
        hash: &str,
        key: Option<&str>,
    ) -> Result<Box<dyn ObjectReader>, StoreError> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.options.open_delay {
            tokio::time::sleep(delay).await;
        }

        let data = self.object(hash)?;
        let cipher = key.map(CtrCipher::new).transpose()?;
        Ok(Box::new(MemoryReader {
            data,
            position: 0,
            chunk_size: self.options.chunk_size.max(1),
            seekable: self.options.seekable,
            cipher,
        }))
    }
}

struct MemoryReader {
    data: Bytes,
    position: usize,
    chunk_size: usize,
    seekable: bool,
    cipher: Option<CtrCipher>,
}

#[async_trait]
impl ObjectReader for MemoryReader {
    fn is_seekable(&self) -> bool {
        self.seekable
    }

    async fn seek(&mut self, offset: u64) -> Result<(), StoreError> {
        if !self.seekable {
            return Err(StoreError::transport("stream is not seekable"));
        }
        self.position = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.seek(self.position as u64);
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StoreError> {
        let remaining = self.data.len() - self.position;
        let n = buf.len().min(self.chunk_size).min(remaining);
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut buf[..n]);
        }
        self.position += n;
        Ok(n)
    }
}
