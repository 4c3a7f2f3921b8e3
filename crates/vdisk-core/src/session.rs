//! Per-handle session registry
//!
//! Each open handle walks a small state machine:
//! `Creating | Opening -> Active(Upload | Download) | Directory -> Closed`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;

use crate::download::Downloader;
use crate::error::{FsError, FsResult};
use crate::tree::{normalize, split_parent};
use crate::upload::UploadSession;

/// Opaque handle identifier handed to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Live transfer bound to a handle
#[derive(Clone)]
pub enum Session {
    Upload(Arc<UploadSession>),
    Download(Arc<Downloader>),
}

#[derive(Clone)]
pub enum HandleState {
    /// Handle allocated for a new or truncated file
    Creating,
    /// Handle allocated for an existing file
    Opening,
    Active(Session),
    /// Handle bound to a folder; no transfer
    Directory,
    Closed,
}

impl HandleState {
    fn label(&self) -> &'static str {
        match self {
            HandleState::Creating => "creating",
            HandleState::Opening => "opening",
            HandleState::Active(Session::Upload(_)) => "upload",
            HandleState::Active(Session::Download(_)) => "download",
            HandleState::Directory => "directory",
            HandleState::Closed => "closed",
        }
    }
}

impl fmt::Debug for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct HandleEntry {
    path: String,
    created: bool,
    state: HandleState,
}

/// What was bound to a handle when it was closed
pub struct ClosedHandle {
    pub path: String,
    pub created: bool,
    pub previous: HandleState,
}

/// Registry of open handles keyed by [`HandleId`]
#[derive(Default)]
pub struct SessionRegistry {
    entries: DashMap<HandleId, HandleEntry>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle for `path` in the `Creating` or `Opening` state.
    pub fn begin(&self, path: &str, creating: bool) -> HandleId {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let state = if creating {
            HandleState::Creating
        } else {
            HandleState::Opening
        };
        trace!(handle = %id, path = %path, state = state.label(), "Handle allocated");
        self.entries.insert(
            id,
            HandleEntry {
                path: normalize(path),
                created: creating,
                state,
            },
        );
        id
    }

    /// Bind a transfer. Uploads need `Creating` or `Opening`, downloads need
    /// `Opening`.
    pub fn activate(&self, id: HandleId, session: Session) -> FsResult<()> {
        let mut entry = self.entries.get_mut(&id).ok_or(FsError::InvalidHandle)?;
        let allowed = matches!(
            (&entry.state, &session),
            (HandleState::Creating | HandleState::Opening, Session::Upload(_))
                | (HandleState::Opening, Session::Download(_))
        );
        if !allowed {
            return Err(FsError::InvalidHandle);
        }
        entry.state = HandleState::Active(session);
        Ok(())
    }

    /// Bind an `Opening` handle to a folder.
    pub fn open_directory(&self, id: HandleId) -> FsResult<()> {
        let mut entry = self.entries.get_mut(&id).ok_or(FsError::InvalidHandle)?;
        if !matches!(entry.state, HandleState::Opening) {
            return Err(FsError::InvalidHandle);
        }
        entry.state = HandleState::Directory;
        Ok(())
    }

    pub fn state(&self, id: HandleId) -> Option<HandleState> {
        self.entries.get(&id).map(|entry| entry.state.clone())
    }

    pub fn path(&self, id: HandleId) -> Option<String> {
        self.entries.get(&id).map(|entry| entry.path.clone())
    }

    /// True when `id` was opened to create or truncate its file.
    pub fn created(&self, id: HandleId) -> bool {
        self.entries.get(&id).is_some_and(|entry| entry.created)
    }

    /// The upload bound to `id`.
    pub fn upload(&self, id: HandleId) -> FsResult<Arc<UploadSession>> {
        match self.state(id) {
            Some(HandleState::Active(Session::Upload(upload))) => Ok(upload),
            _ => Err(FsError::InvalidHandle),
        }
    }

    /// The download bound to `id`.
    pub fn download(&self, id: HandleId) -> FsResult<Arc<Downloader>> {
        match self.state(id) {
            Some(HandleState::Active(Session::Download(download))) => Ok(download),
            _ => Err(FsError::InvalidHandle),
        }
    }

    /// Move the handle to `Closed` and hand back what it held.
    pub fn close(&self, id: HandleId) -> FsResult<ClosedHandle> {
        let mut entry = self.entries.get_mut(&id).ok_or(FsError::InvalidHandle)?;
        if matches!(entry.state, HandleState::Closed) {
            return Err(FsError::InvalidHandle);
        }
        let previous = std::mem::replace(&mut entry.state, HandleState::Closed);
        Ok(ClosedHandle {
            path: entry.path.clone(),
            created: entry.created,
            previous,
        })
    }

    /// Forget the handle entirely.
    pub fn remove(&self, id: HandleId) {
        self.entries.remove(&id);
    }

    /// Rewrite the path of every handle at or below `from`.
    pub fn rename_path(&self, from: &str, to: &str) {
        let from = normalize(from);
        let to = normalize(to);
        for mut entry in self.entries.iter_mut() {
            let renamed = if entry.path == from {
                Some(to.clone())
            } else {
                entry
                    .path
                    .strip_prefix(&format!("{from}/"))
                    .map(|rest| normalize(&format!("{to}/{rest}")))
            };
            if let Some(path) = renamed {
                entry.path = path;
            }
        }
    }

    /// An active upload targeting `path`, if any.
    pub fn pending_upload(&self, path: &str) -> Option<Arc<UploadSession>> {
        let path = normalize(path);
        self.entries.iter().find_map(|entry| match &entry.state {
            HandleState::Active(Session::Upload(upload)) if entry.path == path => {
                Some(Arc::clone(upload))
            }
            _ => None,
        })
    }

    /// Names and uploads of active uploads directly inside `folder`.
    pub fn pending_in(&self, folder: &str) -> Vec<(String, Arc<UploadSession>)> {
        let folder = normalize(folder);
        self.entries
            .iter()
            .filter_map(|entry| {
                let HandleState::Active(Session::Upload(upload)) = &entry.state else {
                    return None;
                };
                let (parent, name) = split_parent(&entry.path);
                (normalize(parent) == folder)
                    .then(|| name.map(|name| (name.to_string(), Arc::clone(upload))))
                    .flatten()
            })
            .collect()
    }

    /// Number of handles not yet removed
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
