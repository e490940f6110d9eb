use std::fmt;
use std::fs::{self, File, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::InternalId;
use crate::error::KiraError;
use crate::id_map::DIGEST_HEX_LEN;

const LEAF_SKEW_FACTOR: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLayout {
    pub segment_width: u8,
    pub depth: u8,
    pub max_entries_per_dir: u64,
}

impl Default for ShardLayout {
    fn default() -> Self {
        Self {
            segment_width: 2,
            depth: 3,
            max_entries_per_dir: 10_000,
        }
    }
}

impl fmt::Display for ShardLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} (max {} per dir)",
            self.depth, self.segment_width, self.max_entries_per_dir
        )
    }
}

impl ShardLayout {
    pub fn validate(&self) -> Result<(), KiraError> {
        if !(1..=4).contains(&self.segment_width) || !(1..=4).contains(&self.depth) {
            return Err(KiraError::ShardCapacity(format!(
                "segment width and depth must be within 1..=4, got {self}"
            )));
        }
        if usize::from(self.segment_width) * usize::from(self.depth) > DIGEST_HEX_LEN {
            return Err(KiraError::ShardCapacity(format!(
                "layout {self} consumes more than {DIGEST_HEX_LEN} digest digits"
            )));
        }
        if self.fanout_per_level() > self.max_entries_per_dir {
            return Err(KiraError::ShardCapacity(format!(
                "interior fan-out {} exceeds the bound {}",
                self.fanout_per_level(),
                self.max_entries_per_dir
            )));
        }
        Ok(())
    }

    pub fn fanout_per_level(&self) -> u64 {
        16u64.pow(u32::from(self.segment_width))
    }

    pub fn leaf_directories(&self) -> u64 {
        16u64.pow(u32::from(self.segment_width) * u32::from(self.depth))
    }

    pub fn expected_leaf_load(&self, corpus: u64) -> u64 {
        corpus.div_ceil(self.leaf_directories())
    }

    pub fn check_capacity(&self, corpus: u64) -> Result<(), KiraError> {
        self.validate()?;
        let load = self.expected_leaf_load(corpus).saturating_mul(LEAF_SKEW_FACTOR);
        if load > self.max_entries_per_dir {
            return Err(KiraError::ShardCapacity(format!(
                "{corpus} models give ~{load} entries per leaf with layout {self}"
            )));
        }
        Ok(())
    }

    pub fn canonical_path_for(&self, id: &InternalId) -> Utf8PathBuf {
        let mut path = self.leaf_dir_for(id);
        path.push(id.as_str());
        path
    }

    pub fn leaf_dir_for(&self, id: &InternalId) -> Utf8PathBuf {
        let width = usize::from(self.segment_width);
        let digest = id.digest();
        let mut path = Utf8PathBuf::from(id.prefix());
        for level in 0..usize::from(self.depth) {
            path.push(&digest[level * width..(level + 1) * width]);
        }
        path
    }
}

#[derive(Debug, Clone)]
pub struct ShardPlanner {
    root: Utf8PathBuf,
    layout: ShardLayout,
}

impl ShardPlanner {
    pub fn new(root: Utf8PathBuf, layout: ShardLayout) -> Result<Self, KiraError> {
        layout.validate()?;
        Ok(Self { root, layout })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn layout(&self) -> ShardLayout {
        self.layout
    }

    pub fn canonical_path_for(&self, id: &InternalId) -> Utf8PathBuf {
        self.layout.canonical_path_for(id)
    }

    pub fn absolute_path_for(&self, id: &InternalId) -> Utf8PathBuf {
        self.root.join(self.layout.canonical_path_for(id))
    }

    /// Creates the leaf directory of `id` and holds an exclusive lock on it
    /// until the returned guard is dropped.
    pub fn ensure_path(&self, id: &InternalId) -> Result<LeafLock, KiraError> {
        let leaf = self.root.join(self.layout.leaf_dir_for(id));
        let parent = leaf
            .parent()
            .ok_or_else(|| KiraError::Filesystem(format!("leaf {leaf} has no parent")))?;
        let leaf_name = leaf
            .file_name()
            .ok_or_else(|| KiraError::Filesystem(format!("leaf {leaf} has no name")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {parent}: {err}")))?;

        let lock_path = parent.join(format!(".{leaf_name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("open {lock_path}: {err}")))?;
        FileExt::lock_exclusive(&file)
            .map_err(|err| KiraError::Filesystem(format!("lock {lock_path}: {err}")))?;

        if !leaf.as_std_path().is_dir() {
            debug!(leaf = %leaf, "creating leaf directory");
            fs::create_dir(leaf.as_std_path())
                .or_else(|err| match err.kind() {
                    std::io::ErrorKind::AlreadyExists => Ok(()),
                    _ => Err(err),
                })
                .map_err(|err| KiraError::Filesystem(format!("create {leaf}: {err}")))?;
        }

        Ok(LeafLock { file, leaf })
    }
}

#[derive(Debug)]
pub struct LeafLock {
    file: File,
    leaf: Utf8PathBuf,
}

impl LeafLock {
    pub fn leaf(&self) -> &Utf8Path {
        &self.leaf
    }
}

impl Drop for LeafLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
