//! Inode-to-path table for the kernel bridge.
//!
//! The dispatcher is path-based but the kernel addresses files by inode, so
//! the bridge interns every path the kernel learns about. Paths are
//! mount-relative ("" is the root, inode 1). Entries the kernel holds a
//! lookup count on stay until `forget`; entries interned for readdir
//! listings carry no count and simply persist.

use std::collections::HashMap;

use crate::paths::base_name;

pub const ROOT_INODE: u64 = 1;

struct InodeRecord {
    path: String,
    lookups: u64,
}

pub struct InodeTable {
    by_ino: HashMap<u64, InodeRecord>,
    by_path: HashMap<String, u64>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INODE + 1,
        };
        table.by_ino.insert(
            ROOT_INODE,
            InodeRecord {
                path: String::new(),
                lookups: 0,
            },
        );
        table.by_path.insert(String::new(), ROOT_INODE);
        table
    }

    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(|r| r.path.as_str())
    }

    /// The path of `name` under the directory `parent` refers to.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.path_of(parent)?;
        if parent_path.is_empty() {
            Some(name.to_string())
        } else {
            Some(format!("{parent_path}/{name}"))
        }
    }

    /// Interns `path` and bumps its kernel lookup count.
    pub fn intern(&mut self, path: &str) -> u64 {
        let ino = self.assign(path);
        if let Some(record) = self.by_ino.get_mut(&ino) {
            record.lookups += 1;
        }
        ino
    }

    /// Interns `path` without counting a kernel lookup (readdir rows).
    pub fn assign(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(
            ino,
            InodeRecord {
                path: path.to_string(),
                lookups: 0,
            },
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Drops `nlookup` kernel references; the entry is removed once the
    /// count reaches zero. The root is never removed.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let remove = match self.by_ino.get_mut(&ino) {
            Some(record) => {
                record.lookups = record.lookups.saturating_sub(nlookup);
                record.lookups == 0
            }
            None => false,
        };
        if remove {
            if let Some(record) = self.by_ino.remove(&ino) {
                // Only drop the path mapping if it still points here; a
                // rename may have remapped it.
                if self.by_path.get(&record.path) == Some(&ino) {
                    self.by_path.remove(&record.path);
                }
            }
        }
    }

    /// Unmaps a path after unlink/rmdir. Inodes the kernel still references
    /// keep their records until forgotten; the path just no longer resolves
    /// to them.
    pub fn remove_path(&mut self, path: &str) {
        self.by_path.remove(path);
    }

    /// Rewrites `old_path` (and everything under it) to `new_path`.
    pub fn rename(&mut self, old_path: &str, new_path: &str) {
        let prefix = format!("{old_path}/");
        let affected: Vec<String> = self
            .by_path
            .keys()
            .filter(|p| p.as_str() == old_path || p.starts_with(&prefix))
            .cloned()
            .collect();

        for path in affected {
            if let Some(ino) = self.by_path.remove(&path) {
                let moved = format!("{new_path}{}", &path[old_path.len()..]);
                if let Some(record) = self.by_ino.get_mut(&ino) {
                    record.path = moved.clone();
                }
                self.by_path.insert(moved, ino);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }

    /// Base name of the path behind `ino`, for log context.
    pub fn name_of(&self, ino: u64) -> Option<&str> {
        self.path_of(ino).map(base_name)
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
