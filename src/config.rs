//! Configuration for rulekeeper.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RULEKEEPER_HOME, RULEKEEPER_DB)
//! 2. Config file (.rulekeeper/config.yaml)
//! 3. Defaults (~/.rulekeeper, database `rulekeeper.db` inside it)
//!
//! Config file discovery:
//! - Searches current directory and parents for .rulekeeper/config.yaml
//! - `paths.home` is relative to the .rulekeeper/ directory
//! - `paths.database` is relative to the resolved home

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{EngineSettings, ExecutorSettings, RetryPolicy, SafetyLimits};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".rulekeeper";
const DEFAULT_DB_FILE: &str = "rulekeeper.db";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub limits: Option<SafetyLimits>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub collaborator_retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .rulekeeper/)
    pub home: Option<String>,
    /// SQLite database file (relative to home)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub batch_size: Option<usize>,
    pub storage_retry_delay_ms: Option<u64>,
    pub worker_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub timeout_seconds: Option<u64>,
    /// Pause before the single retry of a 5xx response
    pub retry: Option<RetryConfig>,
}

/// Retry tuning. The attempt count is fixed at one retry; only the pause
/// before it can be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub delay_ms: Option<u64>,
}

impl RetryConfig {
    fn policy(&self) -> RetryPolicy {
        self.delay_ms.map(RetryPolicy::from_delay_ms).unwrap_or_default()
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// SQLite database path
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub engine: EngineSettings,
    pub executor: ExecutorSettings,
    pub webhook_timeout: Duration,
    /// Pause between scheduler passes of the `worker` command
    pub worker_interval: Duration,
}

/// Environment overrides
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    database: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("RULEKEEPER_HOME").ok().filter(|v| !v.is_empty()),
            database: std::env::var("RULEKEEPER_DB").ok().filter(|v| !v.is_empty()),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

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

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path).canonicalize().unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file (if any), environment overrides and defaults.
fn resolve(config_file: Option<(PathBuf, ConfigFile)>, env: EnvOverrides, default_home: PathBuf) -> ResolvedConfig {
    let (config_path, file) = match config_file {
        Some((path, file)) => (Some(path), Some(file)),
        None => (None, None),
    };

    let home = if let Some(env_home) = env.home {
        PathBuf::from(env_home)
    } else if let (Some(path), Some(home_path)) = (&config_path, file.as_ref().and_then(|f| f.paths.home.as_ref())) {
        let config_dir = path.parent().unwrap_or(Path::new("."));
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let database = if let Some(env_db) = env.database {
        PathBuf::from(env_db)
    } else if let Some(db_path) = file.as_ref().and_then(|f| f.paths.database.as_ref()) {
        resolve_path(&home, db_path)
    } else {
        home.join(DEFAULT_DB_FILE)
    };

    let engine_file = file.as_ref().and_then(|f| f.engine.clone());
    let defaults = EngineSettings::default();
    let engine = EngineSettings {
        batch_size: engine_file
            .as_ref()
            .and_then(|e| e.batch_size)
            .unwrap_or(defaults.batch_size),
        storage_retry_delay: engine_file
            .as_ref()
            .and_then(|e| e.storage_retry_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.storage_retry_delay),
    };
    let worker_interval = Duration::from_secs(
        engine_file
            .as_ref()
            .and_then(|e| e.worker_interval_seconds)
            .unwrap_or(15),
    );

    let webhook = file.as_ref().and_then(|f| f.webhook.clone());
    let webhook_timeout = Duration::from_secs(webhook.as_ref().and_then(|w| w.timeout_seconds).unwrap_or(10));
    let executor = ExecutorSettings {
        limits: file.as_ref().and_then(|f| f.limits.clone()).unwrap_or_default(),
        collaborator_retry: file
            .as_ref()
            .and_then(|f| f.collaborator_retry.as_ref())
            .map(RetryConfig::policy)
            .unwrap_or_default(),
        webhook_retry: webhook
            .and_then(|w| w.retry)
            .map(|r| r.policy())
            .unwrap_or_default(),
    };

    ResolvedConfig {
        home,
        database,
        config_file: config_path,
        engine,
        executor,
        webhook_timeout,
        worker_interval,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let config_file = match find_config_file(&cwd) {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };

    Ok(resolve(config_file, EnvOverrides::from_env(), default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(root: &Path, body: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", body).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, EnvOverrides::default(), PathBuf::from("/home/u/.rulekeeper"));

        assert_eq!(config.home, PathBuf::from("/home/u/.rulekeeper"));
        assert_eq!(config.database, PathBuf::from("/home/u/.rulekeeper/rulekeeper.db"));
        assert!(config.config_file.is_none());
        assert_eq!(config.engine.batch_size, 200);
        assert!(config.executor.limits.webhook_allowed_domains.is_empty());
        assert_eq!(config.webhook_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"
version: "1.0"
paths:
  home: ./state
  database: engine.db
engine:
  batch_size: 50
  storage_retry_delay_ms: 10
limits:
  max_subject_chars: 80
  webhook_allowed_domains: ["hooks.example.com"]
webhook:
  timeout_seconds: 3
  retry:
    delay_ms: 100
collaborator_retry:
  delay_ms: 20
"#,
        );

        let file = load_config_file(&path).unwrap();
        assert_eq!(file.version, "1.0");
        assert_eq!(file.paths.database.as_deref(), Some("engine.db"));

        let config = resolve(Some((path.clone(), file)), EnvOverrides::default(), PathBuf::from("/unused"));
        assert_eq!(config.home, path.parent().unwrap().join("state"));
        assert_eq!(config.database, config.home.join("engine.db"));
        assert_eq!(config.engine.batch_size, 50);
        assert_eq!(config.engine.storage_retry_delay, Duration::from_millis(10));
        assert_eq!(config.executor.limits.max_subject_chars, 80);
        assert_eq!(config.executor.limits.max_body_chars, 20_000);
        assert!(!config.executor.limits.header_denylist.is_empty());
        assert_eq!(config.executor.webhook_retry.delay(), Duration::from_millis(100));
        assert_eq!(config.executor.collaborator_retry.delay(), Duration::from_millis(20));
        assert_eq!(config.webhook_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_attempt_count_is_not_configurable() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            temp.path(),
            r#"
version: "1.0"
webhook:
  retry:
    max_attempts: 4
    delay_ms: 5
collaborator_retry:
  max_attempts: 10
"#,
        );

        let file = load_config_file(&path).unwrap();
        let config = resolve(Some((path, file)), EnvOverrides::default(), PathBuf::from("/unused"));
        let webhook = config.executor.webhook_retry;
        assert_eq!(webhook.delay(), Duration::from_millis(5));
        assert!(webhook.should_retry(1));
        assert!(!webhook.should_retry(2));
        assert_eq!(config.executor.collaborator_retry, RetryPolicy::default());
        assert!(!config.executor.collaborator_retry.should_retry(2));
    }

    #[test]
    fn test_env_overrides_win() {
        let env = EnvOverrides {
            home: Some("/srv/rk".to_string()),
            database: Some("/data/rules.db".to_string()),
        };
        let config = resolve(None, env, PathBuf::from("/home/u/.rulekeeper"));
        assert_eq!(config.home, PathBuf::from("/srv/rk"));
        assert_eq!(config.database, PathBuf::from("/data/rules.db"));
    }

    #[test]
    fn test_find_config_walks_up() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), "version: \"1.0\"");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(path));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(resolve_path(&base, "./subdir"), PathBuf::from("/home/user/project/subdir"));
        assert_eq!(resolve_path(&base, "/absolute/path"), PathBuf::from("/absolute/path"));
    }
}
