use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::entry::PluginDescription;
use crate::list::PluginList;
use crate::marker::CrashMarker;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read plugin database: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse plugin database: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Reads a serialized [`PluginList`]. A missing file is an empty list.
pub fn read_list(path: &Path) -> Result<PluginList, StoreError> {
    match fs::read(path) {
        Ok(raw) if raw.is_empty() => Ok(PluginList::new()),
        Ok(raw) => PluginList::deserialize(&raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PluginList::new()),
        Err(err) => Err(err.into()),
    }
}

/// Replaces `path` with the serialized list. The bytes go to a temporary
/// sibling first so readers only ever see a complete file.
pub fn write_list(path: &Path, list: &PluginList) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let bytes = list.serialize()?;
    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(&bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// File backed plugin list shared between the host and the scanner.
#[derive(Debug)]
pub struct PluginStore {
    path: PathBuf,
    data: Mutex<PluginList>,
}

impl PluginStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = read_list(&path)?;
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> PluginList {
        self.data.lock().clone()
    }

    pub fn plugins(&self) -> Vec<PluginDescription> {
        self.data.lock().descriptions().cloned().collect()
    }

    pub fn blacklist(&self) -> Vec<String> {
        self.data.lock().blacklist().map(str::to_owned).collect()
    }

    pub fn upsert(&self, description: PluginDescription) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        data.add(description);
        self.persist_locked(&data)
    }

    pub fn merge(&self, other: &PluginList) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        data.merge(other);
        self.persist_locked(&data)
    }

    pub fn add_blacklisted(&self, identifier: impl Into<String>) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        if data.add_blacklisted(identifier) {
            self.persist_locked(&data)?;
        }
        Ok(())
    }

    pub fn remove_blacklisted(&self, identifier: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        if data.remove_blacklisted(identifier) {
            self.persist_locked(&data)?;
        }
        Ok(())
    }

    /// Moves identifiers left in `marker` to the blacklist.
    pub fn apply_crash_marker(&self, marker: &CrashMarker) -> Result<Vec<String>, StoreError> {
        let mut data = self.data.lock();
        let applied = marker.apply(&mut data)?;
        if !applied.is_empty() {
            self.persist_locked(&data)?;
        }
        Ok(applied)
    }

    /// Replaces the in-memory list with the one stored at `path`. When the
    /// file cannot be parsed the current list is kept.
    pub fn reload_from(&self, path: &Path) -> Result<(), StoreError> {
        let loaded = read_list(path)?;
        *self.data.lock() = loaded;
        Ok(())
    }

    /// Merges the list stored at `path` into memory, keeping the current list
    /// untouched when the file is unreadable.
    pub fn merge_file(&self, path: &Path) -> Result<(), StoreError> {
        let loaded = read_list(path)?;
        self.data.lock().merge(&loaded);
        Ok(())
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let data = self.data.lock();
        self.persist_locked(&data)
    }

    fn persist_locked(&self, data: &PluginList) -> Result<(), StoreError> {
        write_list(&self.path, data)
    }
}
