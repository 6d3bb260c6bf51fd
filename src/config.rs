//! Configuration for quorum.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (QUORUM_HOME, QUORUM_DATABASE)
//! 2. Config file (.quorum/config.yaml)
//! 3. Defaults (~/.quorum)
//!
//! Config file discovery:
//! - Searches current directory and parents for .quorum/config.yaml
//! - Paths in config file are relative to the .quorum/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::time::Instant;

use crate::core::transaction::TxOptions;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".quorum";
const DATABASE_FILE: &str = "quorum.db";

const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 2;
const DEFAULT_RUN_RESULTS_BUFFER: usize = 100;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub observation: ObservationConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file (relative to .quorum/)
    pub path: Option<String>,
    pub lock_timeout_ms: Option<u64>,
    pub idle_in_tx_session_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObservationConfig {
    pub timeout_seconds: Option<u64>,
    pub grace_period_seconds: Option<u64>,
    pub run_results_buffer: Option<usize>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to quorum home (engine state)
    pub home: PathBuf,
    /// SQLite database holding run results
    pub database_path: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Transaction options applied to run persistence
    pub tx_options: TxOptions,
    pub observation: ObservationSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationSettings {
    pub timeout: Duration,
    /// Extra time a run may take past `timeout` before it is abandoned
    pub grace_period: Duration,
    /// Capacity of the queue between observations and the run saver
    pub run_results_buffer: usize,
}

impl Default for ObservationSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECONDS),
            run_results_buffer: DEFAULT_RUN_RESULTS_BUFFER,
        }
    }
}

impl ObservationSettings {
    /// Deadline for an observation starting now
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout + self.grace_period
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Overrides taken from the environment
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    database: Option<PathBuf>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("QUORUM_HOME").ok().map(PathBuf::from),
            database: std::env::var("QUORUM_DATABASE").ok().map(PathBuf::from),
        }
    }
}

/// Non-zero milliseconds; zero means "use the default"
fn millis(value: Option<u64>) -> Option<Duration> {
    value.filter(|ms| *ms > 0).map(Duration::from_millis)
}

fn resolve(
    default_home: PathBuf,
    config: Option<(&Path, ConfigFile)>,
    env: EnvOverrides,
) -> ResolvedConfig {
    let Some((config_path, config)) = config else {
        let home = env.home.unwrap_or(default_home);
        let database_path = env.database.unwrap_or_else(|| home.join(DATABASE_FILE));

        return ResolvedConfig {
            home,
            database_path,
            config_file: None,
            tx_options: TxOptions::default(),
            observation: ObservationSettings::default(),
        };
    };

    let quorum_dir = config_path.parent().unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env.home {
        env_home
    } else if let Some(ref home_path) = config.home {
        resolve_path(quorum_dir, home_path)
    } else {
        default_home
    };

    let database_path = if let Some(env_db) = env.database {
        env_db
    } else if let Some(ref db_path) = config.database.path {
        resolve_path(quorum_dir, db_path)
    } else {
        home.join(DATABASE_FILE)
    };

    let mut tx_options = TxOptions::default();
    if let Some(timeout) = millis(config.database.lock_timeout_ms) {
        tx_options = tx_options.with_lock_timeout(timeout);
    }
    if let Some(timeout) = millis(config.database.idle_in_tx_session_timeout_ms) {
        tx_options = tx_options.with_idle_in_tx_session_timeout(timeout);
    }

    let defaults = ObservationSettings::default();
    let observation = ObservationSettings {
        timeout: config
            .observation
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        grace_period: config
            .observation
            .grace_period_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.grace_period),
        run_results_buffer: config
            .observation
            .run_results_buffer
            .filter(|n| *n > 0)
            .unwrap_or(defaults.run_results_buffer),
    };

    ResolvedConfig {
        home,
        database_path,
        config_file: Some(config_path.to_path_buf()),
        tx_options,
        observation,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config = match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };

    Ok(resolve(
        default_home,
        config.as_ref().map(|(path, file)| (path.as_path(), file.clone())),
        EnvOverrides::from_env(),
    ))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the quorum home directory (engine state)
pub fn quorum_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the run results database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database_path.clone())
}
