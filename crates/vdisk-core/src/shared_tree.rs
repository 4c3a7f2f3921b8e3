//! Process-wide tree shared by all handles
//!
//! The tree is loaded on first use. Every mutation runs under one lock and
//! every save uploads the latest snapshot, one save at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error};

use crate::gateway::TreeGateway;
use crate::tree::Node;

/// Result of a tree save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Failed,
}

/// Running totals of tree saves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub completed: u64,
    pub failed: u64,
}

/// Load, inspect, mutate and save the namespace
#[async_trait]
pub trait TreeStore: Send + Sync + 'static {
    /// Make sure the tree is loaded.
    async fn load(&self);

    /// Lenient resolution (see [`Node::resolve`]), cloned out of the tree.
    async fn resolve(&self, path: &str) -> Option<Node>;

    /// Strict lookup (see [`Node::lookup`]), cloned out of the tree.
    async fn lookup(&self, path: &str) -> Option<Node>;

    /// Run `f` against the tree under the lock, read only.
    async fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Node) -> R + Send,
        R: Send;

    /// Run `f` against the tree under the lock.
    async fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Node) -> R + Send,
        R: Send;

    /// Upload the current tree and repoint the pointer record.
    async fn save(&self) -> SaveOutcome;

    /// A copy of the whole tree.
    async fn snapshot(&self) -> Node;
}

/// [`TreeStore`] backed by a [`TreeGateway`]
pub struct SharedTree {
    gateway: TreeGateway,
    root: OnceCell<Mutex<Node>>,
    save_lock: Mutex<()>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl SharedTree {
    pub fn new(gateway: TreeGateway) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            root: OnceCell::new(),
            save_lock: Mutex::new(()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn gateway(&self) -> &TreeGateway {
        &self.gateway
    }

    pub fn stats(&self) -> SaveStats {
        SaveStats {
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    async fn root(&self) -> &Mutex<Node> {
        self.root
            .get_or_init(|| async { Mutex::new(self.gateway.load_or_default().await) })
            .await
    }
}

#[async_trait]
impl TreeStore for SharedTree {
    async fn load(&self) {
        self.root().await;
    }

    async fn resolve(&self, path: &str) -> Option<Node> {
        self.root().await.lock().await.resolve(path).cloned()
    }

    async fn lookup(&self, path: &str) -> Option<Node> {
        self.root().await.lock().await.lookup(path).cloned()
    }

    async fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Node) -> R + Send,
        R: Send,
    {
        let root = self.root().await.lock().await;
        f(&*root)
    }

    async fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Node) -> R + Send,
        R: Send,
    {
        let mut root = self.root().await.lock().await;
        f(&mut *root)
    }

    async fn save(&self) -> SaveOutcome {
        let _saving = self.save_lock.lock().await;
        let snapshot = self.snapshot().await;

        match self.gateway.save(&snapshot).await {
            Ok(content) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                debug!(hash = %content.short_hash(), "Tree saved");
                SaveOutcome::Saved
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                error!(error = %e, "Tree save failed, pointer left unchanged");
                SaveOutcome::Failed
            }
        }
    }

    async fn snapshot(&self) -> Node {
        self.root().await.lock().await.clone()
    }
}
