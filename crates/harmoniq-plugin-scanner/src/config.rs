use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use harmoniq_plugin_db::ScanConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command line switch that turns the host executable into a scan worker.
pub const WORKER_FLAG: &str = "--scan-worker";

pub const ENV_WORKER_EXECUTABLE: &str = "HARMONIQ_PLUGIN_SCANNER_WORKER";
pub const ENV_LIST_FILE: &str = "HARMONIQ_SCANNER_LIST_FILE";
pub const ENV_CRASH_MARKER: &str = "HARMONIQ_SCANNER_CRASH_MARKER";
pub const ENV_USER_LIST: &str = "HARMONIQ_SCANNER_USER_LIST";
pub const ENV_SEARCH_ROOTS: &str = "HARMONIQ_SCANNER_SEARCH_ROOTS";
pub const ENV_DEFAULT_ROOTS: &str = "HARMONIQ_SCANNER_DEFAULT_ROOTS";
pub const ENV_MAX_DEPTH: &str = "HARMONIQ_SCANNER_MAX_DEPTH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read scanner config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse scanner config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("search roots cannot be passed to the worker: {0}")]
    Roots(#[from] env::JoinPathsError),
}

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub executable: PathBuf,
    pub args: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        let executable = env::var_os(ENV_WORKER_EXECUTABLE)
            .map(PathBuf::from)
            .or_else(|| env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("harmoniq-plugin-scanner"));
        Self {
            executable,
            args: vec![WORKER_FLAG.to_owned()],
        }
    }
}

/// Host side settings for the out-of-process scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub worker: WorkerCommand,
    /// Scan results shared with the worker. Cleared when a scan starts.
    pub list_file: PathBuf,
    /// Names the candidate a worker is probing right now.
    pub crash_marker: PathBuf,
    /// The host's persisted plugin list.
    pub user_list: PathBuf,
    pub search: ScanConfig,
    /// Longest silence tolerated from a worker that owes us a status.
    #[serde(rename = "launch_timeout_ms", with = "duration_ms")]
    pub launch_timeout: Duration,
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Grace period between `quit` and killing the worker.
    #[serde(rename = "quit_timeout_ms", with = "duration_ms")]
    pub quit_timeout: Duration,
    /// Relaunches allowed in a row without the worker making progress.
    pub max_relaunches: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let data_dir = app_dir(dirs::data_dir());
        Self {
            worker: WorkerCommand::default(),
            list_file: data_dir.join("Temp").join("ScannerPluginList.json"),
            crash_marker: data_dir.join("DeadPlugins.txt"),
            user_list: app_dir(dirs::config_dir()).join("plugins.json"),
            search: ScanConfig::default(),
            launch_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            quit_timeout: Duration::from_secs(2),
            max_relaunches: 3,
        }
    }
}

fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(env::temp_dir).join("HarmoniqStudio")
}

impl ScannerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Keeps every file the scanner touches inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            list_file: dir.join("scanner-list.json"),
            crash_marker: dir.join("dead-plugins.txt"),
            user_list: dir.join("plugins.json"),
            ..Self::default()
        }
    }

    /// Environment handed to the worker so it works on the same files.
    pub fn worker_env(&self) -> Result<Vec<(&'static str, OsString)>, ConfigError> {
        Ok(vec![
            (ENV_LIST_FILE, self.list_file.clone().into_os_string()),
            (ENV_CRASH_MARKER, self.crash_marker.clone().into_os_string()),
            (ENV_USER_LIST, self.user_list.clone().into_os_string()),
            (ENV_SEARCH_ROOTS, env::join_paths(&self.search.roots)?),
            (
                ENV_DEFAULT_ROOTS,
                OsString::from(if self.search.include_default_roots { "1" } else { "0" }),
            ),
            (ENV_MAX_DEPTH, OsString::from(self.search.max_depth.to_string())),
        ])
    }
}

/// What the worker learns from the master at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub list_file: PathBuf,
    pub crash_marker: PathBuf,
    pub user_list: Option<PathBuf>,
    pub search: ScanConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = ScannerConfig::default();
        let mut search = ScanConfig::default();
        if let Some(roots) = env::var_os(ENV_SEARCH_ROOTS) {
            search.roots = env::split_paths(&roots)
                .filter(|root| !root.as_os_str().is_empty())
                .collect();
        }
        if let Ok(flag) = env::var(ENV_DEFAULT_ROOTS) {
            search.include_default_roots = flag != "0";
        }
        if let Some(depth) = env::var(ENV_MAX_DEPTH).ok().and_then(|raw| raw.parse().ok()) {
            search.max_depth = depth;
        }
        Self {
            list_file: env::var_os(ENV_LIST_FILE)
                .map(PathBuf::from)
                .unwrap_or(defaults.list_file),
            crash_marker: env::var_os(ENV_CRASH_MARKER)
                .map(PathBuf::from)
                .unwrap_or(defaults.crash_marker),
            user_list: env::var_os(ENV_USER_LIST).map(PathBuf::from),
            search,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
