//! # clinic-settings
//!
//! Configuration for the clinic gateway, loaded in three layers (later wins):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **JSON file**: path given on the command line or in `CLINIC_CONFIG`
//! 3. **Environment**: `CLINIC_*` with `__` as the nesting separator
//!    (`CLINIC_RATE_LIMIT__REQUESTS_PER_MINUTE=30`), plus a few flat names
//!    kept from earlier deployments (`JWT_SECRET`, `AGENT_ENDPOINT`, ...)
//!
//! There is no global instance: `main` loads the settings once and passes
//! them down.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{config_path_from_env, load_settings};
pub use secrecy::{ExposeSecret, SecretString};
pub use types::*;
