//! Settings loading and validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Top-level settings for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub autoscale: AutoscaleSettings,
    pub proxmox: ProxmoxSettings,
    pub server: ServerSettings,
    /// Installable software offered at provisioning, keyed by id.
    pub software: SoftwareCatalog,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            autoscale: AutoscaleSettings::default(),
            proxmox: ProxmoxSettings::default(),
            server: ServerSettings::default(),
            software: default_software(),
        }
    }
}

pub type SoftwareCatalog = BTreeMap<String, SoftwareOption>;

/// One entry of the software catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoftwareOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Script run inside the guest to install it.
    pub install_script: String,
}

fn default_software() -> SoftwareCatalog {
    let option = |name: &str, description: &str, install_script: &str| SoftwareOption {
        name: name.to_string(),
        description: description.to_string(),
        install_script: install_script.to_string(),
    };
    BTreeMap::from([
        (
            "arr_suite".to_string(),
            option(
                "ARR Suite",
                "Media management suite including Sonarr, Radarr, and related applications",
                "arr_suite_install.sh",
            ),
        ),
        (
            "office_suite".to_string(),
            option(
                "Open Source Office Suite",
                "LibreOffice for document, spreadsheet, and presentation editing",
                "libreoffice_install.sh",
            ),
        ),
    ])
}

/// Read an env file into the process environment. Variables already set
/// win. Without a path, `.env` is searched for from the working directory
/// upwards. Returns the file read, if any.
pub fn load_env_file(path: Option<&Path>) -> Option<PathBuf> {
    let loaded = match path {
        Some(p) => dotenvy::from_path(p).map(|()| p.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => Some(path),
        Err(e) if e.not_found() => None,
        Err(e) => {
            warn!(error = %e, "ignoring unreadable .env file");
            None
        }
    }
}

/// Autoscaling policy and loop timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoscaleSettings {
    /// Scale up above this CPU percentage.
    pub cpu_threshold_high: f64,
    /// Scale down below this CPU percentage.
    pub cpu_threshold_low: f64,
    /// Sleep between polling cycles, in seconds. Single source of truth
    /// for the loop cadence (env: `SCALING_INTERVAL`).
    pub interval_secs: u64,
    /// Upper bound for each control-plane call, in seconds.
    pub call_timeout_secs: u64,
    /// How long `stop()` waits for the loop to exit, in seconds.
    pub stop_timeout_secs: u64,
    /// Start the controller when the daemon boots.
    pub autostart: bool,
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            cpu_threshold_high: 80.0,
            cpu_threshold_low: 20.0,
            interval_secs: 60,
            call_timeout_secs: 10,
            stop_timeout_secs: 5,
            autostart: true,
        }
    }
}

impl AutoscaleSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Connection settings for the Proxmox VE API.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxmoxSettings {
    pub host: String,
    pub port: u16,
    /// API user, e.g. `root@pam`.
    pub user: String,
    pub token_name: String,
    pub token_value: String,
    pub verify_tls: bool,
}

impl Default for ProxmoxSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8006,
            user: "root@pam".to_string(),
            token_name: String::new(),
            token_value: String::new(),
            verify_tls: false,
        }
    }
}

// The token secret never reaches logs.
impl fmt::Debug for ProxmoxSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxmoxSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("token_name", &self.token_name)
            .field("token_value", &"<redacted>")
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

impl ProxmoxSettings {
    /// Base URL of the JSON API.
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/api2/json", self.host, self.port)
    }
}

/// HTTP listener and storage location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: PathBuf::from("/var/lib/vmscale"),
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the optional TOML file, then the
    /// process environment (after reading `.env` if present).
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        if let Some(env_file) = load_env_file(None) {
            debug!(path = ?env_file, ".env loaded");
        }

        let mut settings = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML settings file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let a = &mut self.autoscale;
        override_parsed(&lookup, "CPU_THRESHOLD_HIGH", &mut a.cpu_threshold_high)?;
        override_parsed(&lookup, "CPU_THRESHOLD_LOW", &mut a.cpu_threshold_low)?;
        override_parsed(&lookup, "SCALING_INTERVAL", &mut a.interval_secs)?;
        override_parsed(&lookup, "CONTROL_PLANE_TIMEOUT", &mut a.call_timeout_secs)?;
        override_bool(&lookup, "VMSCALE_AUTOSTART", &mut a.autostart)?;

        let p = &mut self.proxmox;
        override_string(&lookup, "PROXMOX_HOST", &mut p.host);
        override_parsed(&lookup, "PROXMOX_PORT", &mut p.port)?;
        override_string(&lookup, "PROXMOX_USER", &mut p.user);
        override_string(&lookup, "PROXMOX_TOKEN_NAME", &mut p.token_name);
        override_string(&lookup, "PROXMOX_TOKEN_VALUE", &mut p.token_value);
        override_bool(&lookup, "PROXMOX_VERIFY_TLS", &mut p.verify_tls)?;

        let s = &mut self.server;
        override_parsed(&lookup, "VMSCALE_LISTEN_PORT", &mut s.port)?;
        if let Some(dir) = lookup("VMSCALE_DATA_DIR") {
            s.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        let a = &self.autoscale;
        let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        if !in_range(a.cpu_threshold_low) || !in_range(a.cpu_threshold_high) {
            return Err(ConfigError::Invalid(format!(
                "cpu thresholds must be within 0..=100 (low={}, high={})",
                a.cpu_threshold_low, a.cpu_threshold_high
            )));
        }
        if a.cpu_threshold_low > a.cpu_threshold_high {
            return Err(ConfigError::Invalid(format!(
                "cpu_threshold_low ({}) exceeds cpu_threshold_high ({})",
                a.cpu_threshold_low, a.cpu_threshold_high
            )));
        }
        if a.interval_secs == 0 {
            return Err(ConfigError::Invalid("interval_secs must be at least 1".into()));
        }
        if a.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_secs must be at least 1".into(),
            ));
        }
        if self.proxmox.host.trim().is_empty() {
            return Err(ConfigError::Invalid("proxmox host is empty".into()));
        }
        if let Some((key, _)) = self
            .software
            .iter()
            .find(|(_, opt)| opt.install_script.trim().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "software option {key} has no install script"
            )));
        }
        Ok(())
    }
}

fn override_string<F>(lookup: &F, key: &'static str, slot: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(key) {
        *slot = v;
    }
}

fn override_parsed<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw })?;
    }
    Ok(())
}

fn override_bool<F>(lookup: &F, key: &'static str, slot: &mut bool) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => return Err(ConfigError::InvalidValue { key, value: raw }),
        };
    }
    Ok(())
}
