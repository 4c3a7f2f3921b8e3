//! Download adapter
//!
//! Serves offset-addressed reads from a remote object. The transport stream
//! is opened on the first read, at most once at a time per handle, and
//! released when it runs dry so the next read starts over from the top.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::cipher::CtrCipher;
use crate::error::StoreError;
use crate::session::HandleId;
use crate::store::{ContentRef, ContentStore, ObjectReader};

/// Size of the scratch buffer used to skip to a starting offset
const SKIP_CHUNK: usize = 64 * 1024;

/// Where decryption happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// The store hands out plaintext
    Plain,
    /// The store hands out ciphertext and the session decrypts it
    Decrypting,
}

struct OpenStream {
    reader: Box<dyn ObjectReader>,
    cipher: Option<CtrCipher>,
    fresh: bool,
}

impl OpenStream {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StoreError> {
        self.reader.seek(offset).await?;
        let n = self.reader.read(buf).await?;
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.seek(offset);
            cipher.apply(&mut buf[..n]);
        }
        Ok(n)
    }

    /// Fill `buf` from the sequential stream. Returns the byte count and
    /// whether the stream ended.
    async fn fill(&mut self, buf: &mut [u8], offset: u64) -> Result<(usize, bool), StoreError> {
        if self.fresh {
            self.fresh = false;
            if offset > 0 && !self.skip(offset).await? {
                return Ok((0, true));
            }
        }

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Ok((filled, true));
            }
            trace!(n, filled, "Transport read");
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.apply(&mut buf[filled..filled + n]);
            }
            filled += n;
        }
        Ok((filled, false))
    }

    /// Discard `count` bytes. Returns false if the stream ended first.
    async fn skip(&mut self, count: u64) -> Result<bool, StoreError> {
        let mut scratch = vec![0u8; SKIP_CHUNK.min(count as usize)];
        let mut remaining = count;
        while remaining > 0 {
            let want = scratch.len().min(remaining as usize);
            let n = self.reader.read(&mut scratch[..want]).await?;
            if n == 0 {
                return Ok(false);
            }
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.apply(&mut scratch[..n]);
            }
            remaining -= n as u64;
        }
        Ok(true)
    }
}

/// Read side of one open file
pub struct Downloader {
    id: HandleId,
    content: ContentRef,
    mode: DownloadMode,
    store: Arc<dyn ContentStore>,
    stream: Mutex<Option<OpenStream>>,
    opens: AtomicU64,
}

impl Downloader {
    pub fn new(
        id: HandleId,
        content: ContentRef,
        mode: DownloadMode,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            id,
            content,
            mode,
            store,
            stream: Mutex::new(None),
            opens: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn content(&self) -> &ContentRef {
        &self.content
    }

    pub fn mode(&self) -> DownloadMode {
        self.mode
    }

    /// Read into `buf` starting at `offset`.
    ///
    /// The buffer is filled completely unless the object ends first. On a
    /// sequential transport `offset` only positions the first read after the
    /// stream is opened; later reads continue where the stream left off.
    pub async fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, StoreError> {
        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            *slot = Some(self.open().await?);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(StoreError::Closed);
        };

        let result = if stream.reader.is_seekable() {
            stream.read_at(buf, offset).await.map(|n| (n, false))
        } else {
            stream.fill(buf, offset).await
        };

        match result {
            Ok((n, ended)) => {
                if ended {
                    debug!(handle = %self.id, n, "End of stream, releasing");
                    *slot = None;
                }
                Ok(n)
            }
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }

    /// Number of transport streams opened so far.
    pub fn transport_opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Drop the transport stream, if any.
    pub async fn release(&self) {
        *self.stream.lock().await = None;
    }

    async fn open(&self) -> Result<OpenStream, StoreError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(handle = %self.id, hash = %self.content.short_hash(), mode = ?self.mode, "Opening stream");

        let (reader, cipher) = match self.mode {
            DownloadMode::Plain => (
                self.store
                    .open_stream(&self.content.hash, Some(&self.content.key))
                    .await?,
                None,
            ),
            DownloadMode::Decrypting => (
                self.store.open_stream(&self.content.hash, None).await?,
                Some(CtrCipher::new(&self.content.key)?),
            ),
        };

        Ok(OpenStream {
            reader,
            cipher,
            fresh: true,
        })
    }
}
