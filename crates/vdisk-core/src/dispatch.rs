//! Operation dispatcher
//!
//! Routes filesystem verbs to the tree and to per-handle upload/download
//! sessions. Every verb answers with an [`FsResult`]; tree persistence
//! failures are logged by the tree store and never reach the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::VdiskConfig;
use crate::download::{DownloadMode, Downloader};
use crate::error::{FsError, FsResult, StoreError};
use crate::session::{HandleId, HandleState, Session, SessionRegistry};
use crate::shared_tree::TreeStore;
use crate::store::{ContentRef, ContentStore};
use crate::tree::{Node, TreeError, file_name, is_within, normalize, split_parent};
use crate::upload::{UploadOptions, UploadSession};

/// Shortest allowed folder or rename target name
pub const MIN_NAME_LEN: usize = 3;
/// Longest allowed folder or rename target name
pub const MAX_NAME_LEN: usize = 63;

const RESERVED_CHARS: [char; 5] = ['"', '<', '>', '|', '\0'];

/// Requested access on open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// What to do when the target does or does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fail unless the entry exists
    OpenExisting,
    /// Fail if the entry exists
    CreateNew,
    /// Create or truncate
    CreateAlways,
    OpenOrCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenInfo {
    pub handle: HandleId,
    pub is_directory: bool,
}

/// Directory entry or stat result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileInfo {
    pub fn from_node(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            is_directory: node.is_folder(),
            size: node.size,
            modified: node.date.unwrap_or_else(Utc::now),
        }
    }

    fn pending(name: impl Into<String>, upload: &UploadSession) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
            size: upload.written(),
            modified: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total: u64,
    pub free: u64,
}

/// Host hook that extends the allowed duration of a slow request
pub trait KeepAlive: Send + Sync {
    fn reset_timeout(&self, handle: HandleId);
}

/// For hosts without a request watchdog
pub struct NoKeepAlive;

impl KeepAlive for NoKeepAlive {
    fn reset_timeout(&self, _handle: HandleId) {}
}

/// The verbs a filesystem host drives
#[async_trait]
pub trait FileSystemOps: Send + Sync {
    async fn create_file(
        &self,
        path: &str,
        access: Access,
        disposition: Disposition,
    ) -> FsResult<OpenInfo>;
    async fn create_directory(&self, path: &str) -> FsResult<()>;
    async fn read_file(&self, handle: HandleId, buf: &mut [u8], offset: u64) -> FsResult<usize>;
    async fn write_file(&self, handle: HandleId, data: &[u8], offset: u64) -> FsResult<usize>;
    async fn set_end_of_file(&self, handle: HandleId, length: u64) -> FsResult<()>;
    async fn close_file(&self, handle: HandleId) -> FsResult<()>;
    async fn delete_file(&self, path: &str) -> FsResult<()>;
    async fn delete_directory(&self, path: &str) -> FsResult<()>;
    async fn move_file(&self, from: &str, to: &str, replace: bool) -> FsResult<()>;
    async fn find_files(&self, path: &str) -> FsResult<Vec<FileInfo>>;
    async fn get_file_information(&self, path: &str) -> FsResult<FileInfo>;
    fn disk_free_space(&self) -> DiskSpace;
    /// Wait for deferred upload finalizations.
    async fn shutdown(&self);
}

/// Tunables for [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub decrypt_locally: bool,
    pub upload: UploadOptions,
    pub write_timeout: Option<Duration>,
    pub capacity_bytes: u64,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from(&VdiskConfig::default())
    }
}

impl From<&VdiskConfig> for DispatcherOptions {
    fn from(config: &VdiskConfig) -> Self {
        Self {
            decrypt_locally: config.decrypt_locally,
            upload: UploadOptions {
                queue_depth: config.upload_queue_depth,
                max_parked_bytes: config.max_parked_bytes,
            },
            write_timeout: config.write_timeout(),
            capacity_bytes: config.capacity_bytes,
        }
    }
}

/// Name rule for folders and rename targets: 3 to 63 characters, none of
/// them reserved or control characters.
pub fn is_valid_name(name: &str) -> bool {
    let len = name.chars().count();
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len)
        && !name
            .chars()
            .any(|c| c.is_control() || RESERVED_CHARS.contains(&c))
}

/// Routes verbs to the tree and the handle sessions
pub struct Dispatcher<T: TreeStore> {
    tree: Arc<T>,
    store: Arc<dyn ContentStore>,
    sessions: SessionRegistry,
    options: DispatcherOptions,
    keep_alive: Arc<dyn KeepAlive>,
    finalizers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: TreeStore> Dispatcher<T> {
    pub fn new(tree: Arc<T>, store: Arc<dyn ContentStore>, options: DispatcherOptions) -> Self {
        Self {
            tree,
            store,
            sessions: SessionRegistry::new(),
            options,
            keep_alive: Arc::new(NoKeepAlive),
            finalizers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Arc<dyn KeepAlive>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn tree(&self) -> &Arc<T> {
        &self.tree
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn open_upload(&self, path: &str, created: bool) -> FsResult<OpenInfo> {
        let handle = self.sessions.begin(path, created);
        let name = file_name(path).unwrap_or_default();
        let upload = UploadSession::new(
            handle,
            name,
            Arc::clone(&self.store),
            self.options.upload,
        );
        self.sessions
            .activate(handle, Session::Upload(Arc::new(upload)))?;
        Ok(OpenInfo {
            handle,
            is_directory: false,
        })
    }

    fn open_download(&self, path: &str, leaf: &Node) -> FsResult<OpenInfo> {
        if leaf.is_pending() {
            debug!(path, "Content not finalized yet");
            return Err(FsError::Pending);
        }
        let content = ContentRef::new(
            leaf.hash.clone().unwrap_or_default(),
            leaf.key.clone().unwrap_or_default(),
        );
        let mode = if self.options.decrypt_locally {
            DownloadMode::Decrypting
        } else {
            DownloadMode::Plain
        };

        let handle = self.sessions.begin(path, false);
        let download = Downloader::new(handle, content, mode, Arc::clone(&self.store));
        self.sessions
            .activate(handle, Session::Download(Arc::new(download)))?;
        Ok(OpenInfo {
            handle,
            is_directory: false,
        })
    }

    /// Publish a finished upload: place a provisional leaf right away, then
    /// record the real hash and key once the store has the object.
    ///
    /// The leaf is found again by its upload id, so a rename while the upload
    /// runs keeps the content, and a newer upload of the same path wins.
    async fn finalize(&self, path: String, upload: &Arc<UploadSession>) {
        if !upload.is_finished() || !upload.begin_finalize() {
            return;
        }

        let size = upload.flushed();
        let owner = upload.id().0;
        let placed = self
            .tree
            .mutate(|root| place_provisional(root, &path, size, owner))
            .await;
        if let Err(e) = placed {
            warn!(path = %path, error = %e, "Cannot place finished file in the tree");
        }
        self.tree.save().await;

        let tree = Arc::clone(&self.tree);
        let upload = Arc::clone(upload);
        let task = tokio::spawn(async move {
            match upload.close().await {
                Ok(Some(content)) => {
                    let updated = tree
                        .mutate(|root| {
                            root.find_upload_mut(owner).map(|leaf| {
                                leaf.set_content(content.hash.clone(), content.key.clone());
                                leaf.name.clone()
                            })
                        })
                        .await;
                    match updated {
                        Some(name) => {
                            info!(
                                path = %path,
                                name = %name,
                                hash = %content.short_hash(),
                                size,
                                "File finalized"
                            );
                            tree.save().await;
                        }
                        None => warn!(
                            path = %path,
                            hash = %content.short_hash(),
                            "Upload finished after its file was deleted or rewritten"
                        ),
                    }
                }
                Ok(None) => {}
                Err(e) => error!(path = %path, error = %e, "Deferred upload failed"),
            }
        });

        let mut finalizers = self.finalizers.lock().await;
        finalizers.retain(|task| !task.is_finished());
        finalizers.push(task);
    }

    async fn remove_entry(&self, path: &str, folder: bool) -> FsResult<()> {
        let path = normalize(path);
        let (parent, name) = split_parent(&path);
        let name = name.ok_or(FsError::PathNotFound)?;

        self.tree
            .mutate(|root| {
                let parent = root
                    .lookup_mut(parent)
                    .filter(|node| node.is_folder())
                    .ok_or(FsError::PathNotFound)?;
                let child = parent.child(name).ok_or(FsError::PathNotFound)?;
                if child.is_folder() != folder {
                    return Err(FsError::AccessDenied);
                }
                if folder && !child.children.is_empty() {
                    return Err(FsError::DirectoryNotEmpty);
                }
                parent.remove_child(name);
                Ok(())
            })
            .await?;

        self.tree.save().await;
        Ok(())
    }
}

/// Put a leaf carrying the sentinel hash at `path`, owned by `upload`,
/// creating it if needed.
fn place_provisional(
    root: &mut Node,
    path: &str,
    size: u64,
    upload: u64,
) -> Result<(), TreeError> {
    let (parent, name) = split_parent(path);
    let name = name.ok_or_else(|| TreeError::NoSuchChild(path.to_string()))?;
    let now = Utc::now();

    let folder = root
        .lookup_mut(parent)
        .filter(|node| node.is_folder())
        .ok_or(TreeError::NotAFolder)?;
    match folder.child_mut(name) {
        Some(leaf) if !leaf.is_folder() => {
            leaf.size = size;
            leaf.date = Some(now);
            leaf.mark_pending(upload);
            Ok(())
        }
        Some(_) => Err(TreeError::DuplicateName(name.to_string())),
        None => folder.add_child(Node::pending_file(name, size, now, upload)),
    }
}

#[async_trait]
impl<T: TreeStore> FileSystemOps for Dispatcher<T> {
    async fn create_file(
        &self,
        path: &str,
        access: Access,
        disposition: Disposition,
    ) -> FsResult<OpenInfo> {
        debug!(path, ?access, ?disposition, "CreateFile");
        let path = normalize(path);

        match self.tree.lookup(&path).await {
            Some(_) if disposition == Disposition::CreateNew => Err(FsError::AlreadyExists),
            Some(node) if node.is_folder() => {
                let handle = self.sessions.begin(&path, false);
                self.sessions.open_directory(handle)?;
                Ok(OpenInfo {
                    handle,
                    is_directory: true,
                })
            }
            Some(node) => {
                if access.writes() || disposition == Disposition::CreateAlways {
                    self.open_upload(&path, disposition == Disposition::CreateAlways)
                } else {
                    self.open_download(&path, &node)
                }
            }
            None => {
                if disposition == Disposition::OpenExisting {
                    return Err(FsError::NotFound);
                }
                let (parent, name) = split_parent(&path);
                if name.is_none() {
                    return Err(FsError::NotFound);
                }
                let parent_is_folder = self
                    .tree
                    .read(|root| root.lookup(parent).is_some_and(Node::is_folder))
                    .await;
                if !parent_is_folder {
                    return Err(FsError::PathNotFound);
                }
                self.open_upload(&path, true)
            }
        }
    }

    async fn create_directory(&self, path: &str) -> FsResult<()> {
        debug!(path, "CreateDirectory");
        let path = normalize(path);
        let (parent, name) = split_parent(&path);
        let name = name.ok_or(FsError::InvalidName)?;
        if !is_valid_name(name) {
            return Err(FsError::InvalidName);
        }

        self.tree
            .mutate(|root| {
                let folder = root
                    .lookup_mut(parent)
                    .filter(|node| node.is_folder())
                    .ok_or(FsError::PathNotFound)?;
                folder.add_child(Node::folder(name)).map_err(FsError::from)
            })
            .await?;

        self.tree.save().await;
        Ok(())
    }

    async fn read_file(&self, handle: HandleId, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let download = self.sessions.download(handle)?;
        download.read(buf, offset).await.map_err(|e| {
            warn!(handle = %handle, offset, error = %e, "Read failed");
            FsError::NotFound
        })
    }

    async fn write_file(&self, handle: HandleId, data: &[u8], offset: u64) -> FsResult<usize> {
        let upload = self.sessions.upload(handle)?;
        self.keep_alive.reset_timeout(handle);

        // Uploads replace the whole object, so a handle on an existing file
        // cannot start writing past offset 0 (appends, patches).
        if offset > 0 && upload.written() == 0 && !self.sessions.created(handle) {
            warn!(handle = %handle, offset, "Write into existing content is not supported");
            return Err(FsError::AccessDenied);
        }

        let write = upload.write_at(offset, Bytes::copy_from_slice(data));
        let written = match self.options.write_timeout {
            Some(limit) => match tokio::time::timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::transport(format!(
                    "write blocked for more than {}s",
                    limit.as_secs()
                ))),
            },
            None => write.await,
        };
        if let Err(e) = written {
            warn!(handle = %handle, offset, len = data.len(), error = %e, "Write failed");
            return Err(FsError::AccessDenied);
        }

        if let Some(path) = self.sessions.path(handle) {
            self.finalize(path, &upload).await;
        }
        Ok(data.len())
    }

    async fn set_end_of_file(&self, handle: HandleId, length: u64) -> FsResult<()> {
        debug!(handle = %handle, length, "SetEndOfFile");
        match self.sessions.state(handle) {
            None => Err(FsError::InvalidHandle),
            Some(HandleState::Active(Session::Upload(upload))) => {
                upload.set_size(length);
                if let Some(path) = self.sessions.path(handle) {
                    self.finalize(path, &upload).await;
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    async fn close_file(&self, handle: HandleId) -> FsResult<()> {
        let closed = self.sessions.close(handle)?;
        debug!(handle = %handle, path = %closed.path, state = ?closed.previous, "CloseFile");

        match closed.previous {
            HandleState::Active(Session::Upload(upload)) => {
                if upload.declared_size().is_none() {
                    let written = upload.written();
                    if written > 0 || closed.created {
                        upload.set_size(written);
                    }
                }
                if !upload.is_finished() {
                    warn!(
                        handle = %handle,
                        declared = ?upload.declared_size(),
                        flushed = upload.flushed(),
                        written = upload.written(),
                        "Closing unfinished upload"
                    );
                    upload.abort().await;
                    self.sessions.remove(handle);
                    // Written data that never reached the store is lost.
                    return if upload.written() > 0 {
                        Err(FsError::AccessDenied)
                    } else {
                        Ok(())
                    };
                }
                self.finalize(closed.path, &upload).await;
            }
            HandleState::Active(Session::Download(download)) => download.release().await,
            _ => {}
        }

        self.sessions.remove(handle);
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> FsResult<()> {
        debug!(path, "DeleteFile");
        self.remove_entry(path, false).await
    }

    async fn delete_directory(&self, path: &str) -> FsResult<()> {
        debug!(path, "DeleteDirectory");
        self.remove_entry(path, true).await
    }

    async fn move_file(&self, from: &str, to: &str, replace: bool) -> FsResult<()> {
        debug!(from, to, replace, "MoveFile");
        let from = normalize(from);
        let to = normalize(to);
        let (to_parent, new_name) = split_parent(&to);
        let new_name = new_name.ok_or(FsError::InvalidName)?;
        if !is_valid_name(new_name) {
            return Err(FsError::InvalidName);
        }
        let (from_parent, name) = split_parent(&from);
        let name = name.ok_or(FsError::PathNotFound)?;

        let moved = self
            .tree
            .mutate(|root| {
                if root.lookup(&from).is_none() {
                    return Err(FsError::PathNotFound);
                }
                if from == to {
                    return Ok(false);
                }
                if is_within(to_parent, &from) {
                    return Err(FsError::from(TreeError::IntoOwnSubtree));
                }

                let target = root
                    .lookup_mut(to_parent)
                    .filter(|node| node.is_folder())
                    .ok_or(FsError::PathNotFound)?;
                if let Some(existing) = target.child(new_name) {
                    if !replace || existing.is_folder() {
                        return Err(FsError::AlreadyExists);
                    }
                    target.remove_child(new_name);
                }

                root.move_child(from_parent, to_parent, name, new_name)?;
                Ok(true)
            })
            .await?;

        if moved {
            self.sessions.rename_path(&from, &to);
            self.tree.save().await;
        }
        Ok(())
    }

    async fn find_files(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        debug!(path, "FindFiles");
        let path = normalize(path);
        let mut entries = self
            .tree
            .read(|root| {
                root.lookup(&path)
                    .filter(|node| node.is_folder())
                    .map(|folder| folder.children.iter().map(FileInfo::from_node).collect::<Vec<_>>())
            })
            .await
            .ok_or(FsError::PathNotFound)?;

        for (name, upload) in self.sessions.pending_in(&path) {
            if !entries.iter().any(|entry| entry.name == name) {
                entries.push(FileInfo::pending(name, &upload));
            }
        }
        Ok(entries)
    }

    async fn get_file_information(&self, path: &str) -> FsResult<FileInfo> {
        let path = normalize(path);
        let info = self
            .tree
            .read(|root| root.lookup(&path).map(FileInfo::from_node))
            .await;
        if let Some(info) = info {
            return Ok(info);
        }

        match self.sessions.pending_upload(&path) {
            Some(upload) => Ok(FileInfo::pending(
                file_name(&path).unwrap_or_default(),
                &upload,
            )),
            None => Err(FsError::NotFound),
        }
    }

    fn disk_free_space(&self) -> DiskSpace {
        DiskSpace {
            total: self.options.capacity_bytes,
            free: self.options.capacity_bytes,
        }
    }

    async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.finalizers.lock().await);
        if !tasks.is_empty() {
            info!(pending = tasks.len(), "Waiting for deferred uploads");
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Finalizer task failed");
            }
        }
    }
}
