use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;

use crate::errors::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
const GENERATED_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token clients must present. Generated at startup when unset.
    pub auth_secret: Option<String>,
    /// Admission threshold in percent of total CPU.
    pub cpu_allocation_limit: f64,
    pub worker: WorkerConfig,
    pub model_dir: PathBuf,
    /// Probe `url` inputs with a HEAD request before admitting them.
    pub check_url_reachability: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            program: "python3".to_string(),
            script: Some(PathBuf::from("Translate.py")),
            args: Vec::new(),
            working_dir: None,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 5001,
            auth_secret: None,
            cpu_allocation_limit: 80.0,
            worker: WorkerConfig::default(),
            model_dir: default_model_dir(),
            check_url_reachability: true,
        }
    }
}

fn default_model_dir() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".transumate").join("models")
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cpu_allocation_limit > 0.0 && self.cpu_allocation_limit <= 100.0) {
            return Err(ConfigError::CpuLimitOutOfRange(self.cpu_allocation_limit));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::EmptyWorkerProgram);
        }
        if matches!(&self.auth_secret, Some(secret) if secret.trim().is_empty()) {
            return Err(ConfigError::EmptySecret);
        }
        Ok(())
    }
}

/// Loads the configuration file. A missing or unreadable file is not fatal:
/// the gateway falls back to defaults and says so.
pub fn load_config(path: &Path) -> GatewayConfig {
    match GatewayConfig::from_file(path) {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            GatewayConfig::default()
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            GatewayConfig::default()
        }
    }
}

/// The configured secret, or a freshly generated one when none is set.
pub fn resolve_secret(config: &GatewayConfig) -> (String, bool) {
    match &config.auth_secret {
        Some(secret) => (secret.clone(), false),
        None => (generate_secret(), true),
    }
}

pub fn generate_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LEN)
        .map(char::from)
        .collect()
}
