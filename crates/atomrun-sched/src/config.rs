//! Settings and the runtime context built from them.
//!
//! Settings are read from a YAML file (default `~/.atomrun/settings.yaml`,
//! overridden by `ATOMRUN_SETTINGS`). Environment variables take precedence
//! over the file:
//!
//! - `ATOMRUN_LOG_DIR` sets the runner log directory
//! - `ATOMRUN_BIDTRIES` sets the bid retry bound
//!
//! Database, run directory and calculation names are resolved once, when a
//! [`Context`] is built.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calculation::{CalculationRegistry, DEFAULT_RESULTS_FILE, ScriptCalculation};
use crate::error::{SchedError, SchedResult};
use crate::persistence::{JobStore, LocalStore, RestStore, RetryPolicy, SqliteStore};
use crate::runner::{Runner, RunnerConfig};
use crate::scanner::ScanOrder;
use crate::supervisor::MultiRunnerSupervisor;

/// Environment variable naming the settings file.
pub const SETTINGS_ENV: &str = "ATOMRUN_SETTINGS";

/// Complete settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Job stores by name.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseSettings>,

    /// Run directories by name.
    #[serde(default)]
    pub run_directories: BTreeMap<String, PathBuf>,

    /// Calculation styles by name.
    #[serde(default)]
    pub calculations: BTreeMap<String, CalculationSettings>,

    #[serde(default)]
    pub runner: RunnerSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// Kind of job store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Directory tree of JSON documents.
    Local,
    /// SQLite document database.
    #[serde(alias = "sqlite")]
    Document,
    /// REST service.
    Remote,
}

/// One job store.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub style: StoreKind,

    /// Root directory (local) or database file (document).
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Base URL of a remote store.
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token for a remote store.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("style", &self.style)
            .field("path", &self.path)
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// An external program implementing a calculation style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationSettings {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_results_file")]
    pub results_file: String,

    /// Kill the program after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Runner defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_bidtries")]
    pub bidtries: u32,

    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    #[serde(default)]
    pub scan_order: ScanOrder,

    #[serde(default = "default_record_style")]
    pub record_style: String,

    #[serde(default = "default_delete_attempts")]
    pub delete_attempts: u32,
}

/// Retry budget for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_results_file() -> String {
    DEFAULT_RESULTS_FILE.to_string()
}

fn default_bidtries() -> u32 {
    10
}

fn default_record_style() -> String {
    "calculation".to_string()
}

fn default_delete_attempts() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            bidtries: default_bidtries(),
            log_directory: None,
            scan_order: ScanOrder::default(),
            record_style: default_record_style(),
            delete_attempts: default_delete_attempts(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Settings {
    /// `~/.atomrun/settings.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".atomrun").join("settings.yaml"))
    }

    /// Parse settings from YAML text.
    pub fn from_yaml(text: &str) -> SchedResult<Self> {
        let settings: Settings = serde_yaml_ng::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> SchedResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SchedError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        debug!("Loaded settings from {}", path.display());
        Self::from_yaml(&text)
    }

    /// Load settings with the following precedence:
    /// 1. `path` if given, else `ATOMRUN_SETTINGS`, else the default path
    ///    when it exists, else built-in defaults
    /// 2. Environment overrides
    pub fn load(path: Option<&Path>) -> SchedResult<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(SETTINGS_ENV).map(PathBuf::from));

        let settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(path)?,
                None => Settings::default(),
            },
        };

        let settings = settings.merge_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment overrides.
    pub fn merge_env(self) -> Self {
        self.merge_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any variable source. Unset or unparsable
    /// variables leave the value unchanged.
    pub fn merge_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("ATOMRUN_LOG_DIR") {
            self.runner.log_directory = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ATOMRUN_BIDTRIES") {
            if let Ok(val) = v.parse() {
                self.runner.bidtries = val;
            }
        }
        self
    }

    /// Check that every entry is usable.
    pub fn validate(&self) -> SchedResult<()> {
        for (name, db) in &self.databases {
            match db.style {
                StoreKind::Local | StoreKind::Document if db.path.is_none() => {
                    return Err(SchedError::ConfigError(format!(
                        "database {name} needs a path"
                    )));
                }
                StoreKind::Remote if db.url.is_none() => {
                    return Err(SchedError::ConfigError(format!(
                        "database {name} needs a url"
                    )));
                }
                _ => {}
            }
            if db.api_key.as_deref().is_some_and(str::is_empty) {
                return Err(SchedError::ConfigError(format!(
                    "database {name}: api_key must not be empty; omit it to disable authentication"
                )));
            }
        }

        for (name, calc) in &self.calculations {
            if calc.program.trim().is_empty() {
                return Err(SchedError::ConfigError(format!(
                    "calculation {name} needs a program"
                )));
            }
        }

        if self.runner.bidtries == 0 {
            return Err(SchedError::ConfigError(
                "bidtries must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SchedError::ConfigError(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            ..Default::default()
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            bidtries: self.runner.bidtries,
            record_style: self.runner.record_style.clone(),
            log_dir: self.runner.log_directory.clone(),
            scan_order: self.runner.scan_order,
            delete_attempts: self.runner.delete_attempts,
            ..Default::default()
        }
    }

    /// Build the calculation registry.
    pub fn registry(&self) -> CalculationRegistry {
        let mut registry = CalculationRegistry::new();
        for (style, calc) in &self.calculations {
            let mut script = ScriptCalculation::new(style.as_str(), calc.program.as_str())
                .with_args(calc.args.iter().cloned())
                .with_results_file(calc.results_file.as_str());
            if let Some(secs) = calc.timeout_secs {
                script = script.with_timeout(Duration::from_secs(secs));
            }
            registry.register(Arc::new(script));
        }
        registry
    }

    /// Resolve a run directory name. An existing directory path is accepted
    /// as well.
    pub fn run_directory(&self, name: &str) -> SchedResult<PathBuf> {
        if let Some(path) = self.run_directories.get(name) {
            return Ok(path.clone());
        }
        let path = PathBuf::from(name);
        if path.is_dir() {
            return Ok(path);
        }
        Err(SchedError::UnknownRunDirectory(name.to_string()))
    }

    /// Open the named job store.
    pub async fn open_store(&self, name: &str) -> SchedResult<Arc<dyn JobStore>> {
        let db = self
            .databases
            .get(name)
            .ok_or_else(|| SchedError::UnknownDatabase(name.to_string()))?;
        let missing = || SchedError::ConfigError(format!("database {name} is incomplete"));

        let store: Arc<dyn JobStore> = match db.style {
            StoreKind::Local => Arc::new(LocalStore::new(db.path.as_ref().ok_or_else(missing)?).await?),
            StoreKind::Document => Arc::new(
                SqliteStore::new(db.path.as_ref().ok_or_else(missing)?)?
                    .with_retry(self.retry_policy()),
            ),
            StoreKind::Remote => {
                let mut store = RestStore::new(db.url.clone().ok_or_else(missing)?)?
                    .with_retry(self.retry_policy());
                if let Some(key) = &db.api_key {
                    store = store.with_api_key(key.clone());
                }
                Arc::new(store)
            }
        };
        debug!("Opened {:?} store {}", db.style, name);
        Ok(store)
    }
}

/// Everything a command needs, resolved once at startup.
#[derive(Clone)]
pub struct Context {
    pub settings: Settings,
    pub database: String,
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<CalculationRegistry>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("database", &self.database)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Resolve the named database and the calculation registry.
    pub async fn from_settings(settings: Settings, database: &str) -> SchedResult<Self> {
        let store = settings.open_store(database).await?;
        let registry = Arc::new(settings.registry());
        Ok(Self {
            settings,
            database: database.to_string(),
            store,
            registry,
        })
    }

    pub fn run_directory(&self, name: &str) -> SchedResult<PathBuf> {
        self.settings.run_directory(name)
    }

    /// A runner using the configured defaults.
    pub fn runner(&self, config: RunnerConfig) -> Runner {
        Runner::new(self.store.clone(), self.registry.clone()).with_config(config)
    }

    pub fn supervisor(&self, config: RunnerConfig) -> MultiRunnerSupervisor {
        MultiRunnerSupervisor::new(self.store.clone(), self.registry.clone(), config)
    }

    /// Store partitions of every registered calculation style.
    pub fn record_styles(&self) -> Vec<String> {
        let config = self.settings.runner_config();
        self.registry
            .styles()
            .iter()
            .map(|style| config.store_style(style))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
databases:
  master:
    style: local
    path: /data/library
  archive:
    style: document
    path: /data/archive.db
  shared:
    style: remote
    url: http://store.cluster:8080
    api_key: s3cret
run_directories:
  main: /scratch/run_main
calculations:
  E_vs_r_scan:
    program: python
    args: ["-m", "calc_E_vs_r_scan"]
    timeout_secs: 3600
  relax_box:
    program: lmp
runner:
  bidtries: 7
  log_directory: /scratch/logs
  scan_order: shuffled
retry:
  max_attempts: 3
"#;

    #[test]
    fn test_parse_example() {
        let settings = Settings::from_yaml(EXAMPLE).unwrap();
        assert_eq!(settings.databases.len(), 3);
        assert_eq!(settings.databases["archive"].style, StoreKind::Document);
        assert_eq!(
            settings.run_directory("main").unwrap(),
            PathBuf::from("/scratch/run_main")
        );
        assert_eq!(
            settings.calculations["relax_box"].results_file,
            "results.json"
        );

        let config = settings.runner_config();
        assert_eq!(config.bidtries, 7);
        assert_eq!(config.scan_order, ScanOrder::Shuffled);
        assert_eq!(config.record_style, "calculation");
        assert_eq!(config.log_dir, Some(PathBuf::from("/scratch/logs")));

        let retry = settings.retry_policy();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_backoff, Duration::from_millis(500));

        assert_eq!(settings.registry().styles(), ["E_vs_r_scan", "relax_box"]);
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert_eq!(settings.runner.bidtries, 10);
        assert_eq!(settings.runner.scan_order, ScanOrder::Listing);
        assert_eq!(settings.retry.max_backoff_ms, 30_000);
        assert!(settings.registry().is_empty());
    }

    #[test]
    fn test_validation() {
        let no_path = "databases:\n  master:\n    style: local\n";
        assert!(matches!(
            Settings::from_yaml(no_path),
            Err(SchedError::ConfigError(_))
        ));

        let no_url = "databases:\n  master:\n    style: remote\n";
        assert!(Settings::from_yaml(no_url).is_err());

        let zero = "runner:\n  bidtries: 0\n";
        assert!(Settings::from_yaml(zero).is_err());

        let bad_style = "databases:\n  master:\n    style: mongo\n    path: /x\n";
        assert!(matches!(
            Settings::from_yaml(bad_style),
            Err(SchedError::YamlError(_))
        ));

        let sqlite_alias = "databases:\n  master:\n    style: sqlite\n    path: /x.db\n";
        assert_eq!(
            Settings::from_yaml(sqlite_alias).unwrap().databases["master"].style,
            StoreKind::Document
        );
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::default().merge_from(|key| match key {
            "ATOMRUN_LOG_DIR" => Some("/tmp/runner-logs".to_string()),
            "ATOMRUN_BIDTRIES" => Some("3".to_string()),
            _ => None,
        });
        assert_eq!(settings.runner.bidtries, 3);
        assert_eq!(
            settings.runner.log_directory,
            Some(PathBuf::from("/tmp/runner-logs"))
        );

        let unparsable = Settings::default().merge_from(|key| {
            (key == "ATOMRUN_BIDTRIES").then(|| "many".to_string())
        });
        assert_eq!(unparsable.runner.bidtries, 10);
    }

    #[test]
    fn test_api_key_redacted() {
        let settings = Settings::from_yaml(EXAMPLE).unwrap();
        let debug = format!("{:?}", settings.databases["shared"]);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_unknown_names() {
        let settings = Settings::from_yaml(EXAMPLE).unwrap();
        assert!(matches!(
            settings.run_directory("nope"),
            Err(SchedError::UnknownRunDirectory(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let literal = dir.path().to_str().unwrap();
        assert_eq!(settings.run_directory(literal).unwrap(), dir.path());
    }

    #[tokio::test]
    async fn test_context_from_settings() {
        let root = tempfile::tempdir().unwrap();
        let yaml = format!(
            "databases:\n  master:\n    style: local\n    path: {}\n  db:\n    style: document\n    path: {}\ncalculations:\n  E_vs_r_scan:\n    program: python\n",
            root.path().join("library").display(),
            root.path().join("jobs.db").display(),
        );
        let settings = Settings::from_yaml(&yaml).unwrap();

        let ctx = Context::from_settings(settings.clone(), "master").await.unwrap();
        assert_eq!(ctx.record_styles(), ["calculation_E_vs_r_scan"]);
        assert!(ctx.registry.get("E_vs_r_scan").is_ok());

        let sqlite = Context::from_settings(settings.clone(), "db").await.unwrap();
        assert!(sqlite.store.get_record("s", "n").await.unwrap().is_none());

        assert!(matches!(
            Context::from_settings(settings, "missing").await,
            Err(SchedError::UnknownDatabase(_))
        ));
    }
}
