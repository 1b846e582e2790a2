//! Persistent plugin list shared by the Harmoniq host and its out-of-process
//! plugin scanner: descriptions, blacklist, crash marker and candidate
//! discovery.

mod entry;
mod list;
mod marker;
mod scan;
mod store_json;

pub use entry::*;
pub use list::*;
pub use marker::*;
pub use scan::*;
pub use store_json::*;
