//! Client and server settings (TOML).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::ledger::DEFAULT_LEDGER_TTL;
use crate::paths::expand_home;
use crate::sync::window::SyncWindow;
use crate::wire::{DEFAULT_SLICE_SIZE, MAX_SLICE_SIZE};

pub const DEFAULT_PORT: u16 = 7878;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CHUNK_RETRY_LIMIT: u32 = 32;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_client_id() -> String {
    format!("dirsync-{}", std::process::id())
}

fn default_interval_secs() -> u64 {
    60
}

fn default_ledger_ttl_secs() -> u64 {
    DEFAULT_LEDGER_TTL.as_secs()
}

fn default_chunk_retry_limit() -> u32 {
    DEFAULT_CHUNK_RETRY_LIMIT
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_slice_size() -> usize {
    DEFAULT_SLICE_SIZE
}

fn default_max_failed_logins() -> u32 {
    5
}

fn default_lockout_secs() -> u64 {
    300
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let path = expand_home(path);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
}

/// One remote folder mirrored into one local directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSettings {
    /// Folder relative to the server root; empty for the root itself
    #[serde(default)]
    pub remote_folder: String,
    pub local_root: PathBuf,
    /// Only sync files created within this many days; 0 for everything
    #[serde(default)]
    pub days_before: i32,
    /// Delete local files older than this many days before each cycle
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub window: SyncWindow,
}

impl TargetSettings {
    pub fn new(remote_folder: impl Into<String>, local_root: impl Into<PathBuf>) -> Self {
        Self {
            remote_folder: remote_folder.into(),
            local_root: local_root.into(),
            days_before: 0,
            retention_days: None,
            window: SyncWindow::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Scrambler secret; must match the server's
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_ledger_ttl_secs")]
    pub ledger_ttl_secs: u64,
    /// Same-offset retries per file; 0 retries forever
    #[serde(default = "default_chunk_retry_limit")]
    pub chunk_retry_limit: u32,
    #[serde(default)]
    pub targets: Vec<TargetSettings>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            user: String::new(),
            password: String::new(),
            secret: None,
            interval_secs: default_interval_secs(),
            ledger_ttl_secs: default_ledger_ttl_secs(),
            chunk_retry_limit: default_chunk_retry_limit(),
            targets: Vec::new(),
        }
    }
}

impl ClientSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings: Self = load_toml(path)?;
        for target in &mut settings.targets {
            target.local_root = expand_home(&target.local_root);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(SyncError::Config("host must not be empty".to_string()));
        }
        if self.interval_secs == 0 {
            return Err(SyncError::Config("interval_secs must be positive".to_string()));
        }
        for target in &self.targets {
            if target.local_root.as_os_str().is_empty() {
                return Err(SyncError::Config(format!(
                    "target '{}' has no local_root",
                    target.remote_folder
                )));
            }
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub root: PathBuf,
    /// user -> password; empty accepts any credentials
    #[serde(default)]
    pub users: HashMap<String, String>,
    #[serde(default)]
    pub secret: Option<String>,
    /// Bytes per content chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Bytes per frame slice
    #[serde(default = "default_slice_size")]
    pub slice_size: usize,
    #[serde(default = "default_max_failed_logins")]
    pub max_failed_logins: u32,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

impl ServerSettings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            root: root.into(),
            users: HashMap::new(),
            secret: None,
            chunk_size: default_chunk_size(),
            slice_size: default_slice_size(),
            max_failed_logins: default_max_failed_logins(),
            lockout_secs: default_lockout_secs(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut settings: Self = load_toml(path)?;
        settings.root = expand_home(&settings.root);
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be positive".to_string()));
        }
        if self.slice_size == 0 || self.slice_size > MAX_SLICE_SIZE {
            return Err(SyncError::Config(format!(
                "slice_size must be in 1..={}",
                MAX_SLICE_SIZE
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn lockout(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }
}
