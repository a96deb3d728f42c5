//! Layered configuration for the allocator.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (tino.toml)
//! ```toml
//! [database]
//! path = "/data/tino.db"
//!
//! [[categories]]
//! name = "B"
//! expected = 120000000
//!
//! [[categories]]
//! name = "C"
//! expected = 120000000
//!
//! [batch]
//! target_batch = 100000
//! candidate_batch = 150000
//!
//! [checkpoint]
//! dir = "/data/bloom"
//! rounds = 2
//!
//! [cursor]
//! strategy = "requery"
//! ```
//!
//! Environment variables use the `TINO_` prefix with `__` between nested
//! keys, e.g. `TINO_BATCH__TARGET_BATCH=50000`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checkpoint::FilterSizing;
use crate::cursor::CursorStrategy;
use crate::filter::MAX_HASH_COUNT;
use crate::model::Category;

/// Main allocator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    pub database: DatabaseConfig,
    /// Categories processed in order, each with its expected cardinality
    pub categories: Vec<CategoryConfig>,
    pub batch: BatchConfig,
    pub filter: FilterConfig,
    pub checkpoint: CheckpointConfig,
    pub residual: ResidualConfig,
    pub progress: ProgressConfig,
    pub cursor: CursorConfig,
    pub engine: EngineConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            categories: DEFAULT_CATEGORIES
                .iter()
                .map(|name| CategoryConfig::new(*name, DEFAULT_EXPECTED_PER_CATEGORY))
                .collect(),
            batch: BatchConfig::default(),
            filter: FilterConfig::default(),
            checkpoint: CheckpointConfig::default(),
            residual: ResidualConfig::default(),
            progress: ProgressConfig::default(),
            cursor: CursorConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AllocatorConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(AllocatorConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with TINO_ prefix
        figment = figment.merge(Env::prefixed("TINO_").split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: AllocatorConfig = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.categories.is_empty() {
            return Err(ConfigError::invalid("at least one category is required"));
        }
        let mut seen = FxHashSet::default();
        for category in &self.categories {
            if category.name.as_str().is_empty() {
                return Err(ConfigError::invalid("category names must not be empty"));
            }
            if !seen.insert(category.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "category '{}' is listed more than once",
                    category.name
                )));
            }
        }
        let sizes = [
            ("batch.target_batch", self.batch.target_batch),
            ("batch.candidate_batch", self.batch.candidate_batch),
            ("batch.target_page_size", self.batch.target_page_size),
            ("batch.source_page_size", self.batch.source_page_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.filter.bits_per_entry == 0 {
            return Err(ConfigError::invalid("filter.bits_per_entry must be greater than zero"));
        }
        if self.filter.k == 0 || self.filter.k > MAX_HASH_COUNT {
            return Err(ConfigError::invalid(format!(
                "filter.k must be between 1 and {MAX_HASH_COUNT}"
            )));
        }
        if self.checkpoint.rounds == 0 {
            return Err(ConfigError::invalid("checkpoint.rounds must be greater than zero"));
        }
        if self.residual.enabled && self.residual.limit == 0 {
            return Err(ConfigError::invalid("residual.limit must be greater than zero"));
        }
        if self.engine.no_progress_rounds == 0 {
            return Err(ConfigError::invalid(
                "engine.no_progress_rounds must be at least one",
            ));
        }
        Ok(())
    }

    /// Restrict the run to `names`, in that order.
    ///
    /// Names without a configured entry get the default expected cardinality.
    pub fn select_categories(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let selected = names
            .iter()
            .map(|name| {
                self.categories
                    .iter()
                    .find(|c| c.name.as_str() == name)
                    .cloned()
                    .unwrap_or_else(|| CategoryConfig::new(name.as_str(), DEFAULT_EXPECTED_PER_CATEGORY))
            })
            .collect();
        self.categories = selected;
    }

    pub fn filter_sizing(&self, category: &CategoryConfig) -> FilterSizing {
        FilterSizing {
            expected: category.expected,
            bits_per_entry: self.filter.bits_per_entry,
            k: self.filter.k,
        }
    }
}

/// Backing store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

/// One category and the cardinality its filter is sized for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: Category,
    #[serde(default = "default_expected")]
    pub expected: u64,
}

impl CategoryConfig {
    pub fn new(name: impl Into<String>, expected: u64) -> Self {
        Self {
            name: Category::new(name),
            expected,
        }
    }
}

fn default_expected() -> u64 {
    DEFAULT_EXPECTED_PER_CATEGORY
}

/// Round sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Target keys pulled per round
    pub target_batch: usize,
    /// Minimum candidate buffer size per round
    pub candidate_batch: usize,
    /// Rows per target cursor query
    pub target_page_size: usize,
    /// Rows per source cursor query
    pub source_page_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            target_batch: DEFAULT_TARGET_BATCH,
            candidate_batch: DEFAULT_CANDIDATE_BATCH,
            target_page_size: DEFAULT_TARGET_PAGE_SIZE,
            source_page_size: DEFAULT_SOURCE_PAGE_SIZE,
        }
    }
}

/// Membership filter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub bits_per_entry: u32,
    pub k: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            bits_per_entry: DEFAULT_BITS_PER_ENTRY,
            k: DEFAULT_HASH_COUNT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory holding filter checkpoints
    pub dir: PathBuf,
    /// Rounds between checkpoints
    pub rounds: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            rounds: DEFAULT_CHECKPOINT_ROUNDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidualConfig {
    pub enabled: bool,
    /// Targets per sweep
    pub limit: usize,
    /// Maximum sweeps
    pub rounds: u32,
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: DEFAULT_RESIDUAL_LIMIT,
            rounds: DEFAULT_RESIDUAL_ROUNDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// CSV ledger path; `None` disables the ledger
    pub ledger: Option<PathBuf>,
    pub log_interval_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            ledger: Some(PathBuf::from(DEFAULT_LEDGER_PATH)),
            log_interval_secs: DEFAULT_LOG_INTERVAL_SECS,
        }
    }
}

impl ProgressConfig {
    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub strategy: CursorStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive zero-update rounds before streaming stops
    pub no_progress_rounds: u32,
    /// Fixed shuffle seed for reproducible runs
    pub shuffle_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            no_progress_rounds: DEFAULT_NO_PROGRESS_ROUNDS,
            shuffle_seed: None,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residual: Option<ResidualOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidualOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<CursorStrategy>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = AllocatorConfig::default();
        assert_eq!(config.batch.target_batch, DEFAULT_TARGET_BATCH);
        assert_eq!(config.batch.candidate_batch, DEFAULT_CANDIDATE_BATCH);
        assert_eq!(config.checkpoint.rounds, 2);
        assert_eq!(config.filter.bits_per_entry, 12);
        assert_eq!(config.filter.k, 7);
        assert_eq!(config.residual.limit, 50_000);
        assert_eq!(config.residual.rounds, 50);
        assert_eq!(config.engine.no_progress_rounds, 1);
        assert_eq!(config.cursor.strategy, CursorStrategy::Ordered);
        let names: Vec<&str> = config.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["B", "C"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_file_and_overrides_layering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tino.toml");
        fs::write(
            &path,
            r#"
[database]
path = "from-file.db"

[[categories]]
name = "individual"
expected = 1000

[batch]
target_batch = 500

[checkpoint]
dir = "/from/file"

[cursor]
strategy = "requery"
"#,
        )
        .unwrap();

        let overrides = ConfigOverrides {
            checkpoint: Some(CheckpointOverrides {
                dir: Some(PathBuf::from("/from/cli")),
            }),
            residual: Some(ResidualOverrides {
                enabled: Some(false),
            }),
            ..Default::default()
        };
        let config = AllocatorConfig::load(Some(&path), overrides).unwrap();
        assert_eq!(config.database.path, PathBuf::from("from-file.db"));
        assert_eq!(config.checkpoint.dir, PathBuf::from("/from/cli"));
        assert_eq!(config.checkpoint.rounds, DEFAULT_CHECKPOINT_ROUNDS);
        assert_eq!(config.batch.target_batch, 500);
        assert_eq!(config.batch.candidate_batch, DEFAULT_CANDIDATE_BATCH);
        assert_eq!(config.cursor.strategy, CursorStrategy::Requery);
        assert!(!config.residual.enabled);
        assert_eq!(config.categories, vec![CategoryConfig::new("individual", 1000)]);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut config = AllocatorConfig::default();
        config.filter.k = 0;
        assert!(config.validate().unwrap_err().message.contains("filter.k"));
        config.filter.k = MAX_HASH_COUNT + 1;
        assert!(config.validate().unwrap_err().message.contains("filter.k"));

        let mut config = AllocatorConfig::default();
        config.batch.candidate_batch = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .message
            .contains("batch.candidate_batch"));

        let mut config = AllocatorConfig::default();
        config.categories.push(CategoryConfig::new("B", 10));
        assert!(config.validate().unwrap_err().message.contains("more than once"));

        let mut config = AllocatorConfig::default();
        config.categories.clear();
        assert!(config.validate().is_err());

        let mut config = AllocatorConfig::default();
        config.engine.no_progress_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_select_categories_keeps_configured_sizing() {
        let mut config = AllocatorConfig::default();
        config.categories = vec![CategoryConfig::new("B", 42), CategoryConfig::new("C", 7)];
        config.select_categories(&["C".to_string(), "Z".to_string()]);
        assert_eq!(
            config.categories,
            vec![
                CategoryConfig::new("C", 7),
                CategoryConfig::new("Z", DEFAULT_EXPECTED_PER_CATEGORY)
            ]
        );
        let sizing = config.filter_sizing(&config.categories[0]);
        assert_eq!(sizing.expected, 7);
        assert_eq!(sizing.k, DEFAULT_HASH_COUNT);
    }

    #[test]
    fn test_strategy_serde() {
        let json = serde_json::to_string(&CursorStrategy::Requery).unwrap();
        assert_eq!(json, "\"requery\"");
        let strategy: CursorStrategy = serde_json::from_str("\"ordered\"").unwrap();
        assert_eq!(strategy, CursorStrategy::Ordered);
    }
}
