use std::collections::HashMap;

use vdisk_core::tree::{is_within, join_path, normalize};

pub const ROOT_INO: u64 = 1;

const FIRST_DYNAMIC_INO: u64 = 2;

/// Maps kernel inode numbers to tree paths and back.
///
/// The tree is addressed by path, so an inode is just a stable name for a
/// path. Renames rewrite the path of the moved entry and of everything below
/// it, keeping inode numbers the kernel already holds valid.
pub struct InodeTable {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    lookup_counts: HashMap<u64, u64>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            lookup_counts: HashMap::new(),
            next_inode: FIRST_DYNAMIC_INO,
        };
        table.paths.insert(ROOT_INO, "/".into());
        table.inodes.insert("/".into(), ROOT_INO);
        // Never evict the root
        table.lookup_counts.insert(ROOT_INO, u64::MAX);
        table
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    pub fn ino(&self, path: &str) -> Option<u64> {
        self.inodes.get(&normalize(path)).copied()
    }

    /// Path of `name` inside the directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.path(parent).map(|dir| join_path(dir, name))
    }

    /// Inode for `path`, allocating one if needed. Does not count a lookup.
    pub fn assign(&mut self, path: &str) -> u64 {
        let path = normalize(path);
        if let Some(ino) = self.inodes.get(&path) {
            return *ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(ino, path.clone());
        self.inodes.insert(path, ino);
        self.lookup_counts.insert(ino, 0);
        ino
    }

    /// Inode for `path` handed to the kernel in an entry reply.
    pub fn remember(&mut self, path: &str) -> u64 {
        let ino = self.assign(path);
        if let Some(count) = self.lookup_counts.get_mut(&ino) {
            *count = count.saturating_add(1);
        }
        ino
    }

    pub fn lookup_count(&self, ino: u64) -> u64 {
        self.lookup_counts.get(&ino).copied().unwrap_or(0)
    }

    /// Drop `nlookup` kernel references. Evicts the inode at zero.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        let Some(count) = self.lookup_counts.get_mut(&ino) else {
            return;
        };
        if *count == u64::MAX {
            return;
        }
        *count = count.saturating_sub(nlookup);
        if *count == 0 {
            self.evict(ino);
        }
    }

    /// Forget `path` and everything below it.
    pub fn remove_path(&mut self, path: &str) {
        let path = normalize(path);
        let doomed: Vec<u64> = self
            .paths
            .iter()
            .filter(|(ino, p)| **ino != ROOT_INO && is_within(p, &path))
            .map(|(ino, _)| *ino)
            .collect();
        for ino in doomed {
            self.evict(ino);
        }
    }

    /// Move `from` and its descendants to `to`.
    pub fn rename(&mut self, from: &str, to: &str) {
        let from = normalize(from);
        let to = normalize(to);
        if from == to {
            return;
        }
        // Whatever the target path named before is replaced.
        self.remove_path(&to);

        let moved: Vec<(u64, String)> = self
            .paths
            .iter()
            .filter(|(ino, p)| **ino != ROOT_INO && is_within(p, &from))
            .map(|(ino, p)| (*ino, p.clone()))
            .collect();
        for (ino, old) in moved {
            let renamed = format!("{to}{}", &old[from.len()..]);
            self.inodes.remove(&old);
            self.inodes.insert(renamed.clone(), ino);
            self.paths.insert(ino, renamed);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn evict(&mut self, ino: u64) {
        if let Some(path) = self.paths.remove(&ino) {
            self.inodes.remove(&path);
        }
        self.lookup_counts.remove(&ino);
    }
}
