use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum PluginFormat {
    Clap,
    Vst3,
    Ovst3,
    Harmoniq,
}

impl PluginFormat {
    pub const ALL: [PluginFormat; 4] = [Self::Clap, Self::Vst3, Self::Ovst3, Self::Harmoniq];

    /// Stable lowercase name used on the scanner wire and in settings keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clap => "clap",
            Self::Vst3 => "vst3",
            Self::Ovst3 => "ovst3",
            Self::Harmoniq => "harmoniq",
        }
    }

    /// Locations searched when the user has not configured anything else.
    pub fn default_search_paths(self) -> Vec<PathBuf> {
        let mut roots = vec![PathBuf::from(format!(
            "/usr/share/harmoniq-studio/plugins/{}",
            self.as_str()
        ))];
        if let Some(home) = dirs::home_dir() {
            match self {
                Self::Clap => roots.push(home.join(".clap")),
                Self::Vst3 | Self::Ovst3 => roots.push(home.join(".vst3")),
                Self::Harmoniq => roots.push(home.join(".harmoniq/plugins")),
            }
        }
        roots
    }
}

impl fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported plugin format: {0}")]
pub struct UnknownFormat(pub String);

impl FromStr for PluginFormat {
    type Err = UnknownFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "clap" => Ok(Self::Clap),
            "vst3" => Ok(Self::Vst3),
            "ovst3" | "openvst3" => Ok(Self::Ovst3),
            "harmoniq" | "hq" | "hqplug" => Ok(Self::Harmoniq),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

/// Identity of a discovered plugin: the format it was found through and the
/// file (or identifier) it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PluginKey {
    pub format: PluginFormat,
    pub identifier: String,
}

impl PluginKey {
    pub fn new(format: PluginFormat, identifier: impl Into<String>) -> Self {
        Self {
            format,
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.format, self.identifier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginMetadata {
    pub id: String,
    pub name: String,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub is_instrument: bool,
    pub has_editor: bool,
    pub num_inputs: u32,
    pub num_outputs: u32,
}

impl PluginMetadata {
    pub fn into_description(
        self,
        format: PluginFormat,
        identifier: impl Into<String>,
    ) -> PluginDescription {
        PluginDescription::new(PluginKey::new(format, identifier), self)
    }
}

/// One discoverable plugin. Lists key descriptions by [`PluginKey`]; the
/// metadata is opaque to the scanner itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDescription {
    pub key: PluginKey,
    pub metadata: PluginMetadata,
    pub last_seen: DateTime<Utc>,
}

impl PluginDescription {
    pub fn new(key: PluginKey, metadata: PluginMetadata) -> Self {
        Self {
            key,
            metadata,
            last_seen: Utc::now(),
        }
    }

    pub fn format(&self) -> PluginFormat {
        self.key.format
    }

    pub fn identifier(&self) -> &str {
        &self.key.identifier
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}
