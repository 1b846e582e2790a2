use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::list::PluginList;

/// File naming the plugin currently being probed.
///
/// The scanner writes it right before loading an untrusted binary and removes
/// it once the probe returns. If the file is still around on the next start,
/// the probe took the process down with it and the identifiers it names are
/// moved to the blacklist.
#[derive(Debug, Clone)]
pub struct CrashMarker {
    path: PathBuf,
}

impl CrashMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_armed(&self) -> bool {
        self.path.exists()
    }

    pub fn arm(&self, identifier: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{identifier}\n"))
    }

    pub fn disarm(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Identifiers recorded in the marker, without touching it.
    pub fn pending(&self) -> io::Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned)
                .collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Blacklists everything the marker names and removes it. Returns the
    /// identifiers that were blacklisted.
    pub fn apply(&self, list: &mut PluginList) -> io::Result<Vec<String>> {
        let pending = self.pending()?;
        for identifier in &pending {
            log::warn!("blacklisting {identifier}: previous probe never completed");
            list.add_blacklisted(identifier.clone());
        }
        self.disarm()?;
        Ok(pending)
    }
}
