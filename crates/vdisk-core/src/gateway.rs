//! Tree persistence
//!
//! The whole tree is stored as one JSON object. A small local pointer record
//! holds `<hash>|<key>` of the latest copy. The pointer is only rewritten
//! after the new object is fully uploaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::store::{ContentRef, ContentStore};
use crate::tree::Node;

/// Local file naming the current tree object
#[derive(Debug, Clone)]
pub struct PointerRecord {
    path: PathBuf,
}

impl PointerRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current reference, or `None` when the record is missing or corrupt.
    pub async fn read(&self) -> Option<ContentRef> {
        match fs::read_to_string(&self.path).await {
            Ok(record) => {
                let parsed = ContentRef::parse_record(&record);
                if parsed.is_none() {
                    warn!(path = %self.path.display(), "Pointer record is corrupt, ignoring it");
                }
                parsed
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read pointer record");
                None
            }
        }
    }

    /// Replace the record atomically (write to temp, then rename).
    pub async fn write(&self, content: &ContentRef) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content.to_record()).await?;
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

/// Loads and saves the tree through the content store
pub struct TreeGateway {
    store: Arc<dyn ContentStore>,
    pointer: PointerRecord,
    object_name: String,
}

impl TreeGateway {
    pub fn new(
        store: Arc<dyn ContentStore>,
        pointer: PointerRecord,
        object_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pointer,
            object_name: object_name.into(),
        }
    }

    pub fn pointer(&self) -> &PointerRecord {
        &self.pointer
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Load the tree named by the pointer record.
    ///
    /// Never fails: a missing pointer, an unreachable object or an
    /// undecodable document all yield an empty root.
    #[instrument(skip(self), fields(pointer = %self.pointer.path.display()))]
    pub async fn load_or_default(&self) -> Node {
        let Some(content) = self.pointer.read().await else {
            info!("No pointer record, starting with an empty tree");
            return Node::root();
        };

        match self.load(&content).await {
            Ok(root) => {
                info!(hash = %content.short_hash(), files = root.file_count(), "Loaded tree");
                root
            }
            Err(e) => {
                warn!(hash = %content.short_hash(), error = %e, "Cannot load tree, starting empty");
                Node::root()
            }
        }
    }

    /// Serialize and upload `root`, then point the record at it.
    ///
    /// On failure the pointer keeps naming the previous object.
    #[instrument(skip(self, root))]
    pub async fn save(&self, root: &Node) -> Result<ContentRef, StoreError> {
        let document = serde_json::to_vec(root)?;
        let content = self
            .store
            .upload(&self.object_name, Bytes::from(document))
            .await?;
        self.pointer.write(&content).await?;
        debug!(hash = %content.short_hash(), "Saved tree");
        Ok(content)
    }

    async fn load(&self, content: &ContentRef) -> Result<Node, StoreError> {
        let document = self.store.download(content).await?;
        let root: Node = serde_json::from_slice(&document)?;
        Ok(root)
    }
}
