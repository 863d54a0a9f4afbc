//! Per-node state that outlives individual processes.
//!
//! Directories are computed once per node index and reused across restarts so
//! a rejoining node finds its prior on-disk state. The registry also keeps the
//! host id each node reports, which need not match its local index.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

/// On-disk locations of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDirs {
    pub root: PathBuf,
    pub scratch: PathBuf,
}

impl NodeDirs {
    /// Creates both directories.
    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.scratch)
    }

    /// Removes both directories and everything under them.
    pub fn clear(&self) -> io::Result<()> {
        for dir in [&self.root, &self.scratch] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Tracks directories and reported host ids by node index.
#[derive(Debug, Default)]
pub struct NodeStateRegistry {
    dirs: BTreeMap<usize, NodeDirs>,
    reported_ids: BTreeMap<usize, u32>,
}

impl NodeStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached directories for `index`, computing them on first use.
    pub fn dirs_or_insert_with(
        &mut self,
        index: usize,
        compute: impl FnOnce() -> NodeDirs,
    ) -> &NodeDirs {
        self.dirs.entry(index).or_insert_with(|| {
            let dirs = compute();
            tracing::debug!(node = index, root = %dirs.root.display(), "recorded node directories");
            dirs
        })
    }

    pub fn dirs(&self, index: usize) -> Option<&NodeDirs> {
        self.dirs.get(&index)
    }

    /// Records the host id a node reported in its output.
    pub fn record_reported_id(&mut self, index: usize, host_id: u32) {
        self.reported_ids.insert(index, host_id);
    }

    pub fn reported_id(&self, index: usize) -> Option<u32> {
        self.reported_ids.get(&index).copied()
    }

    /// Forgets the reported id of a node whose process is gone.
    pub fn forget_reported_id(&mut self, index: usize) {
        self.reported_ids.remove(&index);
    }

    /// Index of the node that reported the lowest host id.
    pub fn lowest_reported(&self) -> Option<usize> {
        self.reported_ids
            .iter()
            .min_by_key(|&(index, id)| (*id, *index))
            .map(|(index, _)| *index)
    }

    /// Number of nodes with recorded directories.
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}
