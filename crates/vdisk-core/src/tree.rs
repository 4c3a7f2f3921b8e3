//! Hierarchical namespace of folders and files.
//!
//! A [`Node`] is a folder exactly when it carries neither a content hash nor a
//! key. The root is an unnamed folder. The whole tree is serialized as one
//! JSON document and stored as a single object (see [`crate::gateway`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path separator used by every path handed to the tree.
pub const SEPARATOR: char = '/';

/// Hash recorded on a leaf whose upload has not been finalized yet.
pub const UNKNOWN_HASH: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("target is not a folder")]
    NotAFolder,
    #[error("a child named {0:?} already exists")]
    DuplicateName(String),
    #[error("no child named {0:?}")]
    NoSuchChild(String),
    #[error("cannot move a folder into its own subtree")]
    IntoOwnSubtree,
}

/// A folder or file in the namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub children: Vec<Node>,
    /// Upload that owns this leaf while it is pending. Not persisted.
    #[serde(skip)]
    pub upload: Option<u64>,
}

impl Node {
    /// The unnamed root folder of an empty tree.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn file(
        name: impl Into<String>,
        hash: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        date: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            hash: Some(hash.into()),
            key: Some(key.into()),
            size,
            date: Some(date),
            children: Vec::new(),
            upload: None,
        }
    }

    /// A leaf whose content is still being uploaded by `upload`.
    pub fn pending_file(
        name: impl Into<String>,
        size: u64,
        date: DateTime<Utc>,
        upload: u64,
    ) -> Self {
        Self {
            name: name.into(),
            hash: Some(UNKNOWN_HASH.to_string()),
            key: None,
            size,
            date: Some(date),
            children: Vec::new(),
            upload: Some(upload),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.hash.as_deref().unwrap_or_default().is_empty()
            && self.key.as_deref().unwrap_or_default().is_empty()
    }

    /// True for a leaf still carrying the [`UNKNOWN_HASH`] marker.
    pub fn is_pending(&self) -> bool {
        self.hash.as_deref() == Some(UNKNOWN_HASH)
    }

    /// Hand this leaf to `upload`. An earlier owner can no longer finalize it.
    pub fn mark_pending(&mut self, upload: u64) {
        self.hash = Some(UNKNOWN_HASH.to_string());
        self.key = None;
        self.upload = Some(upload);
    }

    pub fn set_content(&mut self, hash: impl Into<String>, key: impl Into<String>) {
        self.hash = Some(hash.into());
        self.key = Some(key.into());
        self.upload = None;
    }

    /// The pending leaf owned by `upload`, wherever it has moved to.
    pub fn find_upload_mut(&mut self, upload: u64) -> Option<&mut Node> {
        if self.upload == Some(upload) {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_upload_mut(upload))
    }

    /// Resolve `path` starting at this node.
    ///
    /// The first segment must match this node's name (an unnamed node matches
    /// an empty leading segment) and the remainder is resolved against the
    /// children. When no child matches, a folder answers for the path itself,
    /// so a missing path yields its nearest existing ancestor folder.
    pub fn resolve(&self, path: &str) -> Option<&Node> {
        let trail = self.locate(path)?;
        Some(self.node_at(&trail))
    }

    pub fn resolve_mut(&mut self, path: &str) -> Option<&mut Node> {
        let trail = self.locate(path)?;
        Some(self.node_at_mut(&trail))
    }

    /// Strict lookup: every non-empty segment must name an existing child.
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        let trail = self.locate_exact(path)?;
        Some(self.node_at(&trail))
    }

    pub fn lookup_mut(&mut self, path: &str) -> Option<&mut Node> {
        let trail = self.locate_exact(path)?;
        Some(self.node_at_mut(&trail))
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|child| child.name == name)
    }

    /// Append `node` to this folder. Child names are unique within a folder.
    pub fn add_child(&mut self, node: Node) -> Result<(), TreeError> {
        if !self.is_folder() {
            return Err(TreeError::NotAFolder);
        }
        if self.child(&node.name).is_some() {
            return Err(TreeError::DuplicateName(node.name));
        }
        self.children.push(node);
        Ok(())
    }

    pub fn remove_child(&mut self, name: &str) -> Option<Node> {
        let index = self.children.iter().position(|child| child.name == name)?;
        Some(self.children.remove(index))
    }

    pub fn rename(&mut self, new_name: impl Into<String>) {
        self.name = new_name.into();
    }

    /// Detach `name` from `src_folder` and attach it to `dst_folder` as
    /// `new_name`. Both folders are given as strict paths from this node.
    pub fn move_child(
        &mut self,
        src_folder: &str,
        dst_folder: &str,
        name: &str,
        new_name: &str,
    ) -> Result<(), TreeError> {
        let moved = join_path(src_folder, name);
        if is_within(dst_folder, &moved) {
            return Err(TreeError::IntoOwnSubtree);
        }

        let dst = self.lookup(dst_folder).ok_or(TreeError::NotAFolder)?;
        if !dst.is_folder() {
            return Err(TreeError::NotAFolder);
        }
        let same_folder = normalize(src_folder) == normalize(dst_folder);
        if dst.child(new_name).is_some() && !(same_folder && name == new_name) {
            return Err(TreeError::DuplicateName(new_name.to_string()));
        }

        let src = self
            .lookup_mut(src_folder)
            .filter(|node| node.is_folder())
            .ok_or(TreeError::NotAFolder)?;
        let mut node = src
            .remove_child(name)
            .ok_or_else(|| TreeError::NoSuchChild(name.to_string()))?;
        node.rename(new_name);

        let dst = self
            .lookup_mut(dst_folder)
            .ok_or(TreeError::NotAFolder)?;
        dst.add_child(node)
    }

    /// Number of leaves in this subtree.
    pub fn file_count(&self) -> usize {
        if self.is_folder() {
            self.children.iter().map(Node::file_count).sum()
        } else {
            1
        }
    }

    fn locate(&self, path: &str) -> Option<Vec<usize>> {
        if path == self.name {
            return Some(Vec::new());
        }
        if path.is_empty() {
            return None;
        }

        let (first, rest) = path.split_once(SEPARATOR).unwrap_or((path, ""));
        if first == self.name {
            for (index, child) in self.children.iter().enumerate() {
                if let Some(mut trail) = child.locate(rest) {
                    trail.insert(0, index);
                    return Some(trail);
                }
            }
            return self.is_folder().then(Vec::new);
        }

        // A relative path handed to the unnamed root answers with the root.
        self.name.is_empty().then(Vec::new)
    }

    fn locate_exact(&self, path: &str) -> Option<Vec<usize>> {
        let mut trail = Vec::new();
        let mut node = self;
        for segment in segments(path) {
            let index = node.children.iter().position(|child| child.name == segment)?;
            trail.push(index);
            node = &node.children[index];
        }
        Some(trail)
    }

    fn node_at(&self, trail: &[usize]) -> &Node {
        trail.iter().fold(self, |node, &index| &node.children[index])
    }

    fn node_at_mut(&mut self, trail: &[usize]) -> &mut Node {
        trail
            .iter()
            .fold(self, |node, &index| &mut node.children[index])
    }
}

/// Non-empty segments of `path`.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|segment| !segment.is_empty())
}

/// Last non-empty segment of `path`, if any.
pub fn file_name(path: &str) -> Option<&str> {
    segments(path).last()
}

/// Split `path` into its parent folder path and final segment.
pub fn split_parent(path: &str) -> (&str, Option<&str>) {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(index) => {
            let name = &trimmed[index + 1..];
            (&trimmed[..index], (!name.is_empty()).then_some(name))
        }
        None => ("", (!trimmed.is_empty()).then_some(trimmed)),
    }
}

/// Join a folder path and a child name into an absolute path.
pub fn join_path(parent: &str, name: &str) -> String {
    let mut path = normalize(parent);
    if !path.ends_with(SEPARATOR) {
        path.push(SEPARATOR);
    }
    path.push_str(name);
    path
}

/// Canonical absolute form of `path` (`/a/b`, or `/` for the root).
pub fn normalize(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in segments(path) {
        normalized.push(SEPARATOR);
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push(SEPARATOR);
    }
    normalized
}

/// True when `path` is `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    let path = normalize(path);
    let ancestor = normalize(ancestor);
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(&ancestor)
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
}
