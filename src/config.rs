use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7700".to_string()
}
fn default_workers() -> usize { 4 }
fn default_idle_timeout() -> u64 { 300 }
fn default_max_event_bytes() -> usize { 1024 * 1024 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            workers: default_workers(),
            idle_timeout_secs: default_idle_timeout(),
            max_event_bytes: default_max_event_bytes(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_true")]
    pub require_credentials: bool,
}

fn default_true() -> bool { true }

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            require_credentials: default_true(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Sealed index blob. Relative paths resolve under the data directory.
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    /// Store sealing key, created on first use if absent.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
}

fn default_index_path() -> PathBuf {
    PathBuf::from("faces.index")
}
fn default_key_path() -> PathBuf {
    PathBuf::from("store.key")
}
fn default_dimension() -> usize { 128 }
fn default_match_threshold() -> f32 { 0.2 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            key_path: default_key_path(),
            dimension: default_dimension(),
            match_threshold: default_match_threshold(),
            create_if_missing: default_true(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LivenessConfig {
    #[serde(default = "default_true")]
    pub required: bool,
    /// EAR below this reads as closed eyes.
    #[serde(default = "default_blink_threshold")]
    pub blink_threshold: f32,
    /// Relative drop below baseline that also counts as a blink.
    #[serde(default = "default_drop_fraction")]
    pub drop_fraction: f32,
    #[serde(default = "default_consec_frames")]
    pub consec_frames: u32,
    #[serde(default = "default_baseline_frames")]
    pub baseline_frames: u32,
    #[serde(default = "default_liveness_timeout")]
    pub timeout_secs: u64,
}

fn default_blink_threshold() -> f32 { 0.25 }
fn default_drop_fraction() -> f32 { 0.15 }
fn default_consec_frames() -> u32 { 1 }
fn default_baseline_frames() -> u32 { 5 }
fn default_liveness_timeout() -> u64 { 10 }

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            required: default_true(),
            blink_threshold: default_blink_threshold(),
            drop_fraction: default_drop_fraction(),
            consec_frames: default_consec_frames(),
            baseline_frames: default_baseline_frames(),
            timeout_secs: default_liveness_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AuditConfig {
    /// Append-only JSON-lines audit log. Unset selects the no-op sink.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Config {
    /// Loads the given file, or full defaults when `path` is None and the
    /// default location does not exist. Callers validate after applying
    /// their own overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_path(p),
            None => {
                let default = default_config_file();
                if default.exists() {
                    Self::load_from_path(&default)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GateError::Other(anyhow::anyhow!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::debug!("Loading config from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| GateError::Other(anyhow::anyhow!("Config parse error: {}", e)))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.workers == 0 {
            return Err(GateError::Other(anyhow::anyhow!(
                "Worker count must be at least 1, got {}",
                self.server.workers
            )));
        }
        if self.server.max_event_bytes < 1024 {
            return Err(GateError::Other(anyhow::anyhow!(
                "Max event size must be at least 1024 bytes, got {}",
                self.server.max_event_bytes
            )));
        }

        // A credential-requiring server with no keys would reject every
        // frame; refuse to start instead.
        if self.security.require_credentials && self.security.api_keys.is_empty() {
            return Err(GateError::Other(anyhow::anyhow!(
                "Credential checking is enabled but security.api_keys is empty"
            )));
        }

        if self.store.index_path.as_os_str().is_empty()
            || self.store.key_path.as_os_str().is_empty()
        {
            return Err(GateError::Other(anyhow::anyhow!(
                "Store paths must not be empty"
            )));
        }
        if self.store.dimension == 0 || self.store.dimension > 4096 {
            return Err(GateError::Other(anyhow::anyhow!(
                "Embedding dimension must be between 1 and 4096, got {}",
                self.store.dimension
            )));
        }
        if self.store.match_threshold <= 0.0 {
            return Err(GateError::Other(anyhow::anyhow!(
                "Match threshold must be positive, got {}",
                self.store.match_threshold
            )));
        }

        if self.liveness.blink_threshold <= 0.0 || self.liveness.blink_threshold >= 1.0 {
            return Err(GateError::Other(anyhow::anyhow!(
                "Blink threshold must be between 0.0 and 1.0, got {}",
                self.liveness.blink_threshold
            )));
        }
        if self.liveness.drop_fraction <= 0.0 || self.liveness.drop_fraction >= 1.0 {
            return Err(GateError::Other(anyhow::anyhow!(
                "Drop fraction must be between 0.0 and 1.0, got {}",
                self.liveness.drop_fraction
            )));
        }
        if self.liveness.timeout_secs == 0 || self.liveness.timeout_secs > 120 {
            return Err(GateError::Other(anyhow::anyhow!(
                "Liveness timeout must be between 1 and 120 seconds, got {}",
                self.liveness.timeout_secs
            )));
        }
        if self.liveness.consec_frames == 0 {
            return Err(GateError::Other(anyhow::anyhow!(
                "Consecutive closed-eye frame count must be at least 1"
            )));
        }

        Ok(())
    }

    /// Store paths with relative entries resolved under the data directory.
    pub fn resolved_store(&self) -> StoreConfig {
        let mut store = self.store.clone();
        store.index_path = resolve_data_path(&store.index_path);
        store.key_path = resolve_data_path(&store.key_path);
        store
    }
}

fn resolve_data_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir().join(path)
    }
}

pub fn data_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("", "", "facegate") {
        dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./facegate_data")
    }
}

fn default_config_file() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("", "", "facegate") {
        dirs.config_dir().join("facegate.toml")
    } else {
        PathBuf::from("./facegate.toml")
    }
}
