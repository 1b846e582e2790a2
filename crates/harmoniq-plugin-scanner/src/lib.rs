//! Out-of-process plugin scanning for Harmoniq Studio.
//!
//! The host side [`PluginScanner`] launches this crate's binary as a worker
//! process, talks to it over length prefixed frames on its stdin/stdout and
//! relaunches it when a plugin crashes or hangs the probe. Results flow back
//! through the file backed list in `harmoniq-plugin-db`.

pub mod config;
pub mod events;
pub mod ipc;
pub mod master;
pub mod scanner;
pub mod session;
pub mod worker;

pub use config::{ScannerConfig, WorkerCommand, WorkerConfig};
pub use events::{ScanEvent, Subscription, SubscriptionId};
pub use master::{ScanError, ScanMaster};
pub use scanner::PluginScanner;
pub use session::ScanState;
pub use worker::WorkerExit;
