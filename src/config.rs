//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. An explicit `--config` path
//! 2. `provcert.toml` next to the executable
//! 3. `~/.config/provcert/config.toml` (`%LOCALAPPDATA%\provcert\config.toml` on Windows)
//! 4. Environment variable overrides (e.g. `PROVCERT_DB_KEY`)
//!
//! CLI arguments always take precedence over config file values.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ProvcertError, Result, ResultExt as _};
use crate::model::StatusPipeline;

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvcertConfig {
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub deployment: DeploymentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db: PathBuf,
    pub keys_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file.  Empty string means no file
    /// logging.
    pub json_log_file: String,
    /// Whether to also output JSON to stdout (for container pipelines).
    pub json_stdout: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub db_key: Option<String>,
}

/// Per-deployment ledger rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Administrator identity gating mutations.  `None` leaves the gate open.
    pub admin_id: Option<String>,
    /// Ordered certificate statuses.
    pub status_pipeline: Vec<String>,
    /// Accepted batch origins.  Empty accepts any well-formed origin.
    pub origin_vocabulary: Vec<String>,
    pub require_prover_custodian: bool,
    pub stage_order: StageOrder,
}

/// Whether certificates on a batch must follow pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOrder {
    /// A new stage may not precede the furthest stage already certified on
    /// the batch.  Repeats and skips are allowed.
    #[default]
    Monotonic,
    /// Any stage may be certified at any time.
    Unordered,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("provcert-ledger.db"),
            keys_dir: PathBuf::from("provcert-keys"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            admin_id: None,
            status_pipeline: StatusPipeline::diamond().stages().to_vec(),
            origin_vocabulary: Vec::new(),
            require_prover_custodian: true,
            stage_order: StageOrder::Monotonic,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl ProvcertConfig {
    /// Try to load from a specific path.  Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: ProvcertConfig = toml::from_str(&text).ctx_config("parse config TOML")?;
        Ok(cfg)
    }

    /// Load config using the standard search order.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("provcert.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        #[cfg(windows)]
        {
            if let Ok(local) = std::env::var("LOCALAPPDATA") {
                let candidate = PathBuf::from(local).join("provcert").join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        #[cfg(not(windows))]
        {
            if let Some(home) = std::env::var_os("HOME") {
                let candidate = PathBuf::from(home)
                    .join(".config")
                    .join("provcert")
                    .join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("PROVCERT_DB_KEY") {
            self.security.db_key = Some(key);
        }
        if let Ok(db) = std::env::var("PROVCERT_DB") {
            self.paths.db = PathBuf::from(db);
        }
        if let Ok(level) = std::env::var("PROVCERT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(admin) = std::env::var("PROVCERT_ADMIN_ID") {
            self.deployment.admin_id = Some(admin);
        }
    }
}

impl DeploymentConfig {
    pub fn pipeline(&self) -> Result<StatusPipeline> {
        StatusPipeline::new(self.status_pipeline.iter().cloned())
            .map_err(|e| ProvcertError::Config(format!("status_pipeline: {e}")))
    }
}
