use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{PluginDescription, PluginFormat, PluginMetadata};

/// Where candidates are looked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// User configured roots, searched for every format.
    pub roots: Vec<PathBuf>,
    /// Also search each format's [`PluginFormat::default_search_paths`].
    pub include_default_roots: bool,
    pub max_depth: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            include_default_roots: true,
            max_depth: 4,
        }
    }
}

impl ScanConfig {
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            include_default_roots: false,
            ..Self::default()
        }
    }

    pub fn roots_for(&self, format: PluginFormat) -> Vec<PathBuf> {
        let mut roots = self.roots.clone();
        if self.include_default_roots {
            for root in format.default_search_paths() {
                if !roots.contains(&root) {
                    roots.push(root);
                }
            }
        }
        roots
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("unsupported plugin format")]
    Unsupported,
}

/// Loads a candidate far enough to describe it. Implementations may crash or
/// hang on hostile input, which is why probing happens in the scanner worker.
pub trait PluginProber {
    fn probe(&self, format: PluginFormat, path: &Path) -> Result<PluginMetadata, ProbeError>;
}

/// Describes plugins from the `manifest.json` shipped next to (or inside) the
/// bundle, falling back to a name derived from the file.
#[derive(Debug, Default)]
pub struct ManifestProber;

#[derive(Debug, Deserialize)]
struct ManifestFile {
    pub id: Option<String>,
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub is_instrument: Option<bool>,
    pub has_editor: Option<bool>,
    pub num_inputs: Option<u32>,
    pub num_outputs: Option<u32>,
}

impl PluginProber for ManifestProber {
    fn probe(&self, format: PluginFormat, path: &Path) -> Result<PluginMetadata, ProbeError> {
        if !path.exists() {
            return Err(ProbeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} no longer exists", path.display()),
            )));
        }
        let Some(manifest) = find_manifest(format, path)? else {
            return Ok(stub_metadata(format, path));
        };
        let id = manifest
            .id
            .or_else(|| default_id(path))
            .unwrap_or_else(|| path.display().to_string());
        let name = manifest.name.unwrap_or_else(|| {
            path.file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .into()
        });
        Ok(PluginMetadata {
            id,
            name,
            vendor: manifest.vendor,
            category: manifest.category,
            version: manifest.version,
            description: manifest.description,
            is_instrument: manifest.is_instrument.unwrap_or(false),
            has_editor: manifest.has_editor.unwrap_or(false),
            num_inputs: manifest.num_inputs.unwrap_or(0),
            num_outputs: manifest.num_outputs.unwrap_or(2),
        })
    }
}

fn find_manifest(format: PluginFormat, path: &Path) -> Result<Option<ManifestFile>, ProbeError> {
    let mut candidates = Vec::new();
    if path.is_dir() {
        candidates.push(path.join("Contents/manifest.json"));
        candidates.push(path.join("manifest.json"));
    } else if let Some(stem) = path.file_stem() {
        // Single file plugins carry `<stem>.json` next to them.
        let mut sidecar = path.with_file_name(stem);
        sidecar.set_extension("json");
        candidates.push(sidecar);
    }
    if matches!(format, PluginFormat::Clap | PluginFormat::Harmoniq) && path.is_file() {
        if let Some(parent) = path.parent() {
            candidates.push(parent.join("manifest.json"));
        }
    }
    for candidate in candidates {
        if candidate.is_file() {
            let raw = fs::read_to_string(candidate)?;
            let manifest: ManifestFile = serde_json::from_str(&raw)?;
            return Ok(Some(manifest));
        }
    }
    Ok(None)
}

fn default_id(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn stub_metadata(format: PluginFormat, path: &Path) -> PluginMetadata {
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let id = format!("{name}#{format}");
    PluginMetadata {
        id,
        name,
        vendor: None,
        category: None,
        version: None,
        description: None,
        is_instrument: matches!(format, PluginFormat::Harmoniq),
        has_editor: false,
        num_inputs: 0,
        num_outputs: 2,
    }
}

/// Every candidate for `format` below the configured roots, sorted and
/// without duplicates.
pub fn find_candidates(format: PluginFormat, config: &ScanConfig) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    for root in config.roots_for(format) {
        if !root.exists() {
            continue;
        }
        let walker = WalkDir::new(&root).max_depth(config.max_depth).into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if let Some(io) = err.io_error() {
                        log::debug!("skipping entry while scanning {}: {}", root.display(), io);
                    }
                    continue;
                }
            };
            if let Some((candidate_format, candidate)) = classify_candidate(entry.path()) {
                if candidate_format == format {
                    found.insert(candidate);
                }
            }
        }
    }
    found.into_iter().collect()
}

/// Whether `description` was recorded after the file at `path` last changed.
pub fn is_up_to_date(description: &PluginDescription, path: &Path) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|meta| meta.modified()) else {
        return false;
    };
    let modified: DateTime<Utc> = DateTime::from(modified);
    description.last_seen >= modified
}

fn classify_candidate(path: &Path) -> Option<(PluginFormat, PathBuf)> {
    if path.is_file() {
        if let Some(parent) = path.parent() {
            if path.file_name()?.eq("plugin.clap") {
                let bundle = parent.parent().filter(|bundle| {
                    bundle
                        .extension()
                        .map(|ext| ext.eq_ignore_ascii_case("clap"))
                        .unwrap_or(false)
                });
                return Some((PluginFormat::Clap, bundle.unwrap_or(path).to_path_buf()));
            }
        }
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("clap") => return Some((PluginFormat::Clap, path.to_path_buf())),
            Some("hqplug") => return Some((PluginFormat::Harmoniq, path.to_path_buf())),
            _ => {}
        }
    } else if path.is_dir() {
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            if name.ends_with(".clap") {
                return Some((PluginFormat::Clap, path.to_path_buf()));
            }
            if name.ends_with(".vst3") {
                return Some((PluginFormat::Vst3, path.to_path_buf()));
            }
            if name.ends_with(".ovst3") {
                return Some((PluginFormat::Ovst3, path.to_path_buf()));
            }
        }
    }
    None
}
