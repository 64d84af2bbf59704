//! # strata-settings
//!
//! Configuration for the strata object store.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`StrataSettings::default()`]
//! 2. **Settings file**: `$STRATA_HOME/settings.json` or
//!    `~/.strata/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `STRATA_*` overrides (highest priority)
//!
//! There is no process-wide settings singleton. Callers load a
//! [`StrataSettings`] once and hand the relevant section to each store they
//! open.
//!
//! # Usage
//!
//! ```no_run
//! use strata_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("lock timeout: {}ms", settings.store.lock_timeout_ms);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
