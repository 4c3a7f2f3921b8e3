//! Upload adapter
//!
//! Turns offset-addressed write calls into the push stream a
//! [`ContentStore`] consumes. Chunks travel through a bounded queue; a write
//! returns only once the store has taken its bytes, which bounds the data in
//! flight per session. Writes that arrive ahead of the current offset are
//! parked until the gap is filled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::session::HandleId;
use crate::store::{ContentRef, ContentStore, UploadSource};

const UNDECLARED: u64 = u64::MAX;

/// Limits applied to each upload session
#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    /// Chunks the queue holds before writers wait
    pub queue_depth: usize,
    /// Out-of-order bytes one session may park
    pub max_parked_bytes: u64,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            max_parked_bytes: 64 * 1024 * 1024,
        }
    }
}

struct UploadState {
    next_offset: u64,
    parked: BTreeMap<u64, Bytes>,
    parked_bytes: u64,
    sender: Option<mpsc::Sender<Bytes>>,
    source: Option<UploadSource>,
    task: Option<JoinHandle<Result<ContentRef, StoreError>>>,
    is_final: bool,
}

/// One file being written to the store
pub struct UploadSession {
    id: HandleId,
    name: String,
    store: Arc<dyn ContentStore>,
    options: UploadOptions,
    declared: AtomicU64,
    written: AtomicU64,
    flushed: watch::Receiver<u64>,
    finalizing: AtomicBool,
    state: Mutex<UploadState>,
}

impl UploadSession {
    pub fn new(
        id: HandleId,
        name: impl Into<String>,
        store: Arc<dyn ContentStore>,
        options: UploadOptions,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(options.queue_depth.max(1));
        let (flushed_tx, flushed) = watch::channel(0);

        Self {
            id,
            name: name.into(),
            store,
            options,
            declared: AtomicU64::new(UNDECLARED),
            written: AtomicU64::new(0),
            flushed,
            finalizing: AtomicBool::new(false),
            state: Mutex::new(UploadState {
                next_offset: 0,
                parked: BTreeMap::new(),
                parked_bytes: 0,
                sender: Some(sender),
                source: Some(UploadSource::new(receiver, flushed_tx)),
                task: None,
                is_final: false,
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `data` after everything written so far.
    pub async fn write(&self, data: Bytes) -> Result<(), StoreError> {
        let offset = self.state.lock().await.next_offset;
        self.write_at(offset, data).await
    }

    /// Write `data` at `offset`.
    ///
    /// In-order data is queued and the call waits until the store has taken
    /// it. Data ahead of the current offset is parked and the call returns at
    /// once. Data behind the current offset is rejected.
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), StoreError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        let end = offset.checked_add(len).ok_or_else(|| {
            StoreError::transport(format!("write of {len} bytes at {offset} overflows"))
        })?;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.is_final {
                return Err(StoreError::Closed);
            }
            if offset < state.next_offset {
                return Err(StoreError::NonSequential {
                    expected: state.next_offset,
                    got: offset,
                });
            }

            if offset > state.next_offset {
                if state.parked_bytes + len > self.options.max_parked_bytes {
                    return Err(StoreError::transport(format!(
                        "out-of-order data exceeds {} bytes",
                        self.options.max_parked_bytes
                    )));
                }
                debug!(handle = %self.id, offset, len, "Parking out-of-order write");
                state.parked_bytes += len;
                state.parked.insert(offset, data);
                self.written.fetch_max(end, Ordering::SeqCst);
                return Ok(());
            }

            self.ensure_started(state);
            Self::enqueue(state, data).await?;
            self.written.fetch_max(end, Ordering::SeqCst);

            while let Some((&at, _)) = state.parked.first_key_value() {
                if at > state.next_offset {
                    break;
                }
                let Some((at, chunk)) = state.parked.pop_first() else {
                    break;
                };
                state.parked_bytes -= chunk.len() as u64;
                let skip = (state.next_offset - at) as usize;
                if skip < chunk.len() {
                    Self::enqueue(state, chunk.slice(skip..)).await?;
                }
            }
        }

        let mut flushed = self.flushed.clone();
        flushed
            .wait_for(|flushed| *flushed >= end)
            .await
            .map_err(|_| StoreError::Closed)?;
        Ok(())
    }

    /// Declare the total length of the object.
    pub fn set_size(&self, size: u64) {
        self.declared.store(size, Ordering::SeqCst);
    }

    pub fn declared_size(&self) -> Option<u64> {
        match self.declared.load(Ordering::SeqCst) {
            UNDECLARED => None,
            size => Some(size),
        }
    }

    /// Bytes the store has taken so far.
    pub fn flushed(&self) -> u64 {
        *self.flushed.borrow()
    }

    /// Highest offset written, parked data included.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// True exactly when the flushed length equals the declared size.
    pub fn is_finished(&self) -> bool {
        self.declared_size() == Some(self.flushed())
    }

    /// Claim the right to finalize this session. Only the first caller wins.
    pub fn begin_finalize(&self) -> bool {
        self.finalizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Mark no more input, wait for the store and return where the object
    /// landed. A second call returns `Ok(None)`.
    pub async fn close(&self) -> Result<Option<ContentRef>, StoreError> {
        let task = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.is_final {
                return Ok(None);
            }
            state.is_final = true;

            if let Some((&at, _)) = state.parked.first_key_value() {
                let expected = state.next_offset;
                state.parked.clear();
                state.sender = None;
                state.source = None;
                if let Some(task) = state.task.take() {
                    task.abort();
                }
                return Err(StoreError::NonSequential { expected, got: at });
            }

            self.ensure_started(state);
            state.sender = None;
            state.task.take()
        };

        let Some(task) = task else {
            return Err(StoreError::Closed);
        };
        let content = task
            .await
            .map_err(|e| StoreError::transport(format!("upload task failed: {e}")))??;
        debug!(handle = %self.id, name = %self.name, hash = %content.short_hash(), "Upload complete");
        Ok(Some(content))
    }

    /// Drop everything and stop the network task.
    pub async fn abort(&self) {
        let mut state = self.state.lock().await;
        state.is_final = true;
        state.parked.clear();
        state.parked_bytes = 0;
        state.sender = None;
        state.source = None;
        if let Some(task) = state.task.take() {
            warn!(handle = %self.id, name = %self.name, "Aborting unfinished upload");
            task.abort();
        }
    }

    /// Start the network upload on first use.
    fn ensure_started(&self, state: &mut UploadState) {
        let Some(source) = state.source.take() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let name = self.name.clone();
        let declared = self.declared_size();
        debug!(handle = %self.id, name = %name, ?declared, "Starting upload");
        state.task = Some(tokio::spawn(async move {
            store.upload_sequential(&name, declared, source).await
        }));
    }

    async fn enqueue(state: &mut UploadState, chunk: Bytes) -> Result<(), StoreError> {
        let len = chunk.len() as u64;
        let sender = state.sender.as_ref().ok_or(StoreError::Closed)?;
        sender.send(chunk).await.map_err(|_| StoreError::Closed)?;
        state.next_offset += len;
        Ok(())
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock()
            && let Some(task) = state.task.take()
        {
            task.abort();
        }
    }
}
