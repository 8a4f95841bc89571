//! Configuration loading and hot-reloading for stowage.
//!
//! Uses figment for YAML-based configuration layered over defaults and
//! `STOWAGE_*` environment variables, and notify + arc-swap for live file
//! watching.

pub mod schema;
pub mod watcher;

pub use schema::{Config, LogConfig, LogFormat, PopupConfig, RedirectSetting};
pub use watcher::ConfigWatcher;
