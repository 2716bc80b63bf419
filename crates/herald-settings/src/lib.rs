//! # herald-settings
//!
//! Layered configuration for the Herald delivery server.
//!
//! Settings are resolved in three layers (lowest to highest priority):
//! 1. **Compiled defaults**: [`HeraldSettings::default()`]
//! 2. **Settings file**: `~/.herald/settings.json` or an explicit path, deep-merged
//! 3. **Environment**: `HERALD_*` overrides
//!
//! Settings are loaded once by the binary and passed down by value; library
//! crates never read a global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
