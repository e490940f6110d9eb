use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::{Builder, NamedTempFile};

use crate::error::KiraError;

#[derive(Debug, Clone)]
pub struct Store {
    models_root: Utf8PathBuf,
    ledger_root: Utf8PathBuf,
    staging_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, KiraError> {
        Ok(Self::with_data_root(&Self::default_data_root()?))
    }

    pub fn default_data_root() -> Result<Utf8PathBuf, KiraError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-csm")).ok()
            })
            .ok_or_else(|| KiraError::Filesystem("unable to resolve data directory".to_string()))
    }

    pub fn with_data_root(data_root: &Utf8Path) -> Self {
        Self {
            models_root: data_root.join("computed-models"),
            ledger_root: data_root.join("holdings"),
            staging_root: data_root.join("staging"),
        }
    }

    pub fn new_with_paths(
        models_root: Utf8PathBuf,
        ledger_root: Utf8PathBuf,
        staging_root: Utf8PathBuf,
    ) -> Self {
        Self {
            models_root,
            ledger_root,
            staging_root,
        }
    }

    pub fn models_root(&self) -> &Utf8Path {
        &self.models_root
    }

    pub fn ledger_root(&self) -> &Utf8Path {
        &self.ledger_root
    }

    pub fn staging_root(&self) -> &Utf8Path {
        &self.staging_root
    }

    pub fn staging_dir(&self, provider_key: &str) -> Utf8PathBuf {
        self.staging_root.join(provider_key)
    }

    pub fn ensure_roots(&self) -> Result<(), KiraError> {
        for root in [&self.models_root, &self.ledger_root, &self.staging_root] {
            fs::create_dir_all(root.as_std_path())
                .map_err(|err| KiraError::Filesystem(format!("create {root}: {err}")))?;
        }
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
        let mut temp = Self::temp_beside(path)?;
        temp.write_all(content)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Self::persist(temp, path)
    }

    pub fn copy_stream_atomic(reader: &mut dyn Read, path: &Utf8Path) -> Result<u64, KiraError> {
        let mut temp = Self::temp_beside(path)?;
        let written =
            io::copy(reader, &mut temp).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Self::persist(temp, path)?;
        Ok(written)
    }

    pub fn temp_beside(path: &Utf8Path) -> Result<NamedTempFile, KiraError> {
        let parent = path
            .parent()
            .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix(".kira-csm")
            .suffix(".tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn persist(temp: NamedTempFile, path: &Utf8Path) -> Result<(), KiraError> {
        temp.as_file()
            .sync_all()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if let Some(parent) = path.parent() {
            sync_dir(parent.as_std_path())?;
        }
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), KiraError> {
        let mut file = fs::File::open(source.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("open {source}: {err}")))?;
        Self::copy_stream_atomic(&mut file, dest).map(|_| ())
    }

    pub fn remove_extra_files(dir: &Utf8Path, keep: &[String]) -> Result<Vec<String>, KiraError> {
        let mut removed = Vec::new();
        if !dir.as_std_path().is_dir() {
            return Ok(removed);
        }
        let entries =
            fs::read_dir(dir.as_std_path()).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_file() && !keep.contains(&name) {
                fs::remove_file(entry.path())
                    .map_err(|err| KiraError::Filesystem(err.to_string()))?;
                removed.push(name);
            }
        }
        Ok(removed)
    }

    pub fn remove_dir_if_exists(dir: &Utf8Path) -> Result<(), KiraError> {
        if dir.as_std_path().exists() {
            fs::remove_dir_all(dir.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

pub fn sync_dir(dir: &Path) -> Result<(), KiraError> {
    // Directory handles cannot be opened for syncing on Windows.
    #[cfg(unix)]
    {
        let handle = fs::File::open(dir).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        handle
            .sync_all()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

pub(crate) fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, KiraError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| KiraError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}
