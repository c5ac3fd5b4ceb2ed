//! # relay-settings
//!
//! Options for the relay engine, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`EngineOptions::default()`]
//! 2. **Options file**: a JSON object deep-merged over the defaults
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! The options are a plain value handed to `RelayEngine::new`; there is no
//! process-wide settings singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_options, load_options_from_path};
pub use types::{EngineOptions, OfflinePolicy};
