//! vmscale-core — shared configuration for the vmscale workspace.
//!
//! Settings are assembled in three layers: built-in defaults, an optional
//! TOML file, then environment overrides (a `.env` file is honoured).
//!
//! ```text
//! Settings
//!   ├── autoscale  thresholds, polling interval, control-plane timeout
//!   ├── proxmox    host, port, API token, TLS verification
//!   ├── server     listen port, data directory
//!   └── software   catalog offered when provisioning
//! ```

pub mod config;

pub use config::{
    AutoscaleSettings, ConfigError, ConfigResult, ProxmoxSettings, ServerSettings, Settings,
    SoftwareCatalog, SoftwareOption, load_env_file,
};
