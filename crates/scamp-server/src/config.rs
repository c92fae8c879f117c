//! Service configuration: TOML file + CLI overrides.

use crate::error::{ServiceError, ServiceResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub tls: TlsSection,
}

/// `[service]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub keep_sessions_open: bool,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            queue_capacity: default_queue_capacity(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            request_timeout_secs: default_request_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            keep_sessions_open: true,
        }
    }
}

/// `[tls]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    /// Directory holding `<service>.crt` and `<service>.key`.
    #[serde(default = "default_services_dir")]
    pub services_dir: String,
    /// Explicit certificate path, overriding `services_dir`.
    pub cert: Option<String>,
    /// Explicit key path, overriding `services_dir`.
    pub key: Option<String>,
    /// CA bundle for client certificates. Enables mutual TLS when set.
    pub client_ca: Option<String>,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            services_dir: default_services_dir(),
            cert: None,
            key: None,
            client_ca: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:30100".to_string()
}
fn default_queue_capacity() -> usize {
    100
}
fn default_max_concurrent_sessions() -> usize {
    1024
}
fn default_request_timeout() -> u64 {
    30
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_services_dir() -> String {
    "/etc/SCAMP/services".to_string()
}
fn default_true() -> bool {
    true
}

/// Values supplied on the command line; `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub services_dir: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub client_ca: Option<String>,
    pub queue_capacity: Option<usize>,
    pub max_concurrent_sessions: Option<usize>,
    pub request_timeout_secs: Option<u64>,
}

/// Resolved service configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen: String,
    pub queue_capacity: usize,
    pub max_concurrent_sessions: usize,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keep_sessions_open: bool,
    pub services_dir: PathBuf,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), Overrides::default())
    }
}

impl ServiceConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> ServiceResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text into the raw file structure.
    pub fn parse(content: &str) -> ServiceResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| ServiceError::Config(format!("config parse error: {e}")))
    }

    fn resolve(file: ConfigFile, cli: Overrides) -> Self {
        let services_dir = cli.services_dir.unwrap_or(file.tls.services_dir);
        Self {
            listen: cli.listen.unwrap_or(file.service.listen),
            queue_capacity: cli.queue_capacity.unwrap_or(file.service.queue_capacity),
            max_concurrent_sessions: cli
                .max_concurrent_sessions
                .unwrap_or(file.service.max_concurrent_sessions),
            request_timeout: Duration::from_secs(
                cli.request_timeout_secs
                    .unwrap_or(file.service.request_timeout_secs),
            ),
            handshake_timeout: Duration::from_secs(file.service.handshake_timeout_secs),
            keep_sessions_open: file.service.keep_sessions_open,
            services_dir: expand_tilde_str(&services_dir),
            cert: cli.cert.or(file.tls.cert).map(|s| expand_tilde_str(&s)),
            key: cli.key.or(file.tls.key).map(|s| expand_tilde_str(&s)),
            client_ca: cli.client_ca.or(file.tls.client_ca).map(|s| expand_tilde_str(&s)),
        }
    }

    fn validate(&self) -> ServiceResult<()> {
        if self.queue_capacity == 0 {
            return Err(ServiceError::Config("queue_capacity must be at least 1".into()));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ServiceError::Config(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Certificate for `name`, if one exists on disk.
    pub fn cert_path(&self, name: &str) -> Option<PathBuf> {
        self.credential_path(self.cert.as_ref(), name, "crt")
    }

    /// Private key for `name`, if one exists on disk.
    pub fn key_path(&self, name: &str) -> Option<PathBuf> {
        self.credential_path(self.key.as_ref(), name, "key")
    }

    fn credential_path(&self, explicit: Option<&PathBuf>, name: &str, ext: &str) -> Option<PathBuf> {
        let path = match explicit {
            Some(p) => p.clone(),
            None => self.services_dir.join(format!("{name}.{ext}")),
        };
        path.is_file().then_some(path)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
