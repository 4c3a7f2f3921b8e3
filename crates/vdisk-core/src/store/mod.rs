//! Content store boundary
//!
//! Objects are uploaded as a sequence of chunks and come back as a
//! `(hash, key)` pair. Every object is encrypted with fresh key material
//! (see [`crate::cipher`]) and addressed by the BLAKE3 digest of its
//! ciphertext.

mod blob_dir;
mod memory;

pub use blob_dir::{BlobDirStore, BlobDirStoreConfig};
pub use memory::{MemoryStore, MemoryStoreOptions};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};

use crate::error::StoreError;

/// Separator between hash and key in the pointer record encoding.
const RECORD_SEPARATOR: char = '|';

/// What an upload yields: where the object lives and how to decrypt it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentRef {
    /// Hex BLAKE3 digest of the stored ciphertext
    pub hash: String,
    /// Hex key material
    pub key: String,
}

impl ContentRef {
    pub fn new(hash: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            key: key.into(),
        }
    }

    /// Encode as `<hash>|<key>`
    pub fn to_record(&self) -> String {
        format!("{}{RECORD_SEPARATOR}{}", self.hash, self.key)
    }

    /// Parse a `<hash>|<key>` record. Both halves must be non-empty.
    pub fn parse_record(record: &str) -> Option<Self> {
        let (hash, key) = record.trim().split_once(RECORD_SEPARATOR)?;
        if hash.is_empty() || key.is_empty() || key.contains(RECORD_SEPARATOR) {
            return None;
        }
        Some(Self::new(hash, key))
    }

    /// Get a short hash for display (first 8 chars)
    pub fn short_hash(&self) -> &str {
        self.hash.get(..8).unwrap_or(&self.hash)
    }
}

impl std::fmt::Display for ContentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentRef({})", self.short_hash())
    }
}

/// Pull side of a remote object
#[async_trait]
pub trait ObjectReader: Send {
    /// Whether [`ObjectReader::seek`] is supported
    fn is_seekable(&self) -> bool;

    /// Reposition to an absolute offset (seekable readers only)
    async fn seek(&mut self, offset: u64) -> Result<(), StoreError>;

    /// Read up to `buf.len()` bytes. Returns 0 at end of stream; short
    /// reads are allowed anywhere else.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StoreError>;
}

/// Chunk producer consumed by [`ContentStore::upload_sequential`]
///
/// Each chunk taken from the queue advances the flushed counter observed by
/// the writer that produced it.
pub struct UploadSource {
    chunks: mpsc::Receiver<Bytes>,
    flushed: watch::Sender<u64>,
}

impl UploadSource {
    pub fn new(chunks: mpsc::Receiver<Bytes>, flushed: watch::Sender<u64>) -> Self {
        Self { chunks, flushed }
    }

    /// A source that yields `data` as a single chunk.
    pub fn from_bytes(data: Bytes) -> Self {
        let (tx, rx) = mpsc::channel(1);
        if !data.is_empty() {
            // Capacity is one and the channel is fresh, so this cannot fail.
            let _ = tx.try_send(data);
        }
        let (flushed, _) = watch::channel(0);
        Self::new(rx, flushed)
    }

    /// Next chunk, or `None` once the producer is done.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.recv().await?;
        let len = chunk.len() as u64;
        self.flushed.send_modify(|flushed| *flushed += len);
        Some(chunk)
    }

    /// Drain the source into one buffer.
    pub async fn collect(mut self) -> Bytes {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

/// The remote object store the core talks to
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Upload a whole object held in memory.
    async fn upload(&self, name: &str, data: Bytes) -> Result<ContentRef, StoreError> {
        let size = data.len() as u64;
        self.upload_sequential(name, Some(size), UploadSource::from_bytes(data))
            .await
    }

    /// Upload an object by pulling chunks from `source` until it is
    /// exhausted. A declared size that disagrees with the bytes received
    /// fails the upload.
    async fn upload_sequential(
        &self,
        name: &str,
        declared_size: Option<u64>,
        source: UploadSource,
    ) -> Result<ContentRef, StoreError>;

    /// Download and decrypt a whole object.
    async fn download(&self, content: &ContentRef) -> Result<Bytes, StoreError>;

    /// Open a sequential stream over an object. With `key` the stream yields
    /// plaintext, without it the raw ciphertext.
    async fn open_stream(
        &self,
        hash: &str,
        key: Option<&str>,
    ) -> Result<Box<dyn ObjectReader>, StoreError>;
}

pub(crate) fn check_declared_size(declared: Option<u64>, received: u64) -> Result<(), StoreError> {
    match declared {
        Some(expected) if expected != received => Err(StoreError::transport(format!(
            "declared {expected} bytes but received {received}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let content = ContentRef::new("abcdef0123456789", "00ff");
        assert_eq!(content.to_record(), "abcdef0123456789|00ff");
        assert_eq!(
            ContentRef::parse_record("abcdef0123456789|00ff\n"),
            Some(content)
        );
    }

    #[test]
    fn test_parse_record_rejects_corruption() {
        assert_eq!(ContentRef::parse_record(""), None);
        assert_eq!(ContentRef::parse_record("nohash"), None);
        assert_eq!(ContentRef::parse_record("|key"), None);
        assert_eq!(ContentRef::parse_record("hash|"), None);
        assert_eq!(ContentRef::parse_record("a|b|c"), None);
    }

    #[test]
    fn test_display_uses_short_hash() {
        let content = ContentRef::new("0123456789abcdef", "k");
        assert_eq!(content.to_string(), "ContentRef(01234567)");
        assert_eq!(ContentRef::new("abc", "k").short_hash(), "abc");
    }

    #[tokio::test]
    async fn test_source_advances_flushed_counter() {
        let (tx, rx) = mpsc::channel(4);
        let (flushed_tx, flushed_rx) = watch::channel(0);
        let mut source = UploadSource::new(rx, flushed_tx);

        tx.send(Bytes::from_static(b"hello")).await.unwrap();
        tx.send(Bytes::from_static(b"!!")).await.unwrap();
        drop(tx);

        assert_eq!(*flushed_rx.borrow(), 0);
        assert_eq!(source.next_chunk().await.unwrap(), "hello");
        assert_eq!(*flushed_rx.borrow(), 5);
        assert_eq!(source.next_chunk().await.unwrap(), "!!");
        assert_eq!(*flushed_rx.borrow(), 7);
        assert!(source.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_from_bytes_collects() {
        let source = UploadSource::from_bytes(Bytes::from_static(b"whole object"));
        assert_eq!(source.collect().await, "whole object");

        let empty = UploadSource::from_bytes(Bytes::new());
        assert!(empty.collect().await.is_empty());
    }

    #[test]
    fn test_declared_size_check() {
        assert!(check_declared_size(None, 10).is_ok());
        assert!(check_declared_size(Some(10), 10).is_ok());
        assert!(matches!(
            check_declared_size(Some(10), 3),
            Err(StoreError::Transport(_))
        ));
    }
}
