use crate::transport::{DEFAULT_QUERY_PORT, DEFAULT_TRANSFER_PORT, TransportConfig};
use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Invalid output format: {}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_query_port")]
    pub query_port: u16,

    /// Used when an `ftinit*` reply does not name a port
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,

    /// Query login; no login is attempted when unset
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Virtual server selected after login
    #[serde(default)]
    pub server_id: Option<u32>,

    #[serde(default)]
    pub nickname: Option<String>,

    #[serde(default)]
    pub output_format: OutputFormat,

    #[serde(default = "default_true")]
    pub keepalive_enabled: bool,

    /// Idle seconds before a keepalive command is sent
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Off by default; servers whitelist query clients from flood protection
    #[serde(default)]
    pub antispam_enabled: bool,

    #[serde(default = "default_antispam_interval")]
    pub antispam_interval_ms: u64,

    /// 0 waits forever
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_query_port() -> u16 {
    DEFAULT_QUERY_PORT
}

fn default_transfer_port() -> u16 {
    DEFAULT_TRANSFER_PORT
}

fn default_true() -> bool {
    true
}

fn default_keepalive_interval() -> u64 {
    240 // below the server's 300s idle disconnect
}

fn default_antispam_interval() -> u64 {
    350
}

fn default_command_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            query_port: DEFAULT_QUERY_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            username: None,
            password: None,
            server_id: None,
            nickname: None,
            output_format: OutputFormat::Text,
            keepalive_enabled: true,
            keepalive_interval_secs: default_keepalive_interval(),
            antispam_enabled: false,
            antispam_interval_ms: default_antispam_interval(),
            command_timeout_secs: default_command_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Settings {
    /// Load config from ~/.config/tsquery/config.toml
    /// Returns default settings if file doesn't exist or fails to parse
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            log::warn!("Could not determine config directory, using defaults");
            return Self::default();
        };

        if !path.exists() {
            log::debug!("No config file found at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(settings) => {
                log::debug!("Loaded settings from: {}", path.display());
                settings
            }
            Err(e) => {
                log::warn!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save config to ~/.config/tsquery/config.toml
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let Some(path) = config_path() else {
            anyhow::bail!("Could not determine config directory");
        };
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize settings to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        log::info!("Saved settings to: {}", path.display());

        Ok(())
    }

    /// Timers and pacing for the query connection
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            keepalive: self
                .keepalive_enabled
                .then(|| Duration::from_secs(self.keepalive_interval_secs.max(1))),
            antispam: self
                .antispam_enabled
                .then(|| Duration::from_millis(self.antispam_interval_ms)),
            command_timeout: (self.command_timeout_secs > 0)
                .then(|| Duration::from_secs(self.command_timeout_secs)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..TransportConfig::default()
        }
    }
}

/// Get the path to the config file: ~/.config/tsquery/config.toml
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "tsquery").map(|dirs| dirs.config_dir().join("config.toml"))
}
