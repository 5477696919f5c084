use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine configuration, loadable from `.filesmith/config.toml`.
///
/// Every field has a default so a partial (or absent) config file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Paths the engine may touch. Empty means full filesystem access,
    /// which is logged loudly at startup.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,

    /// Sizes both the counting semaphore and the worker pool.
    #[serde(default = "default_parallel_ops")]
    pub parallel_ops: usize,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub hooks: HooksConfig,

    /// Fire the auto-sync notifier after every successful mutation.
    #[serde(default)]
    pub auto_sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Root of the backup store. Defaults to `<os temp>/mcp-batch-backups`.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    #[serde(default = "default_backup_max_age_days")]
    pub max_age_days: u64,

    #[serde(default = "default_backup_max_count")]
    pub max_count: usize,

    /// How long the in-memory metadata cache may serve stale listings.
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_medium_pct")]
    pub medium_pct: f64,

    #[serde(default = "default_high_pct")]
    pub high_pct: f64,

    #[serde(default = "default_medium_occurrences")]
    pub medium_occurrences: usize,

    #[serde(default = "default_high_occurrences")]
    pub high_occurrences: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    #[serde(default = "default_max_list_items")]
    pub max_list_items: usize,

    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,

    /// Trim result payloads for token-constrained callers.
    #[serde(default)]
    pub compact_mode: bool,

    /// Files over this size are rejected by the edit engine.
    #[serde(default = "default_edit_max_file_size")]
    pub edit_max_file_size: u64,

    /// Files over this size are skipped by content search.
    #[serde(default = "default_search_max_file_size")]
    pub search_max_file_size: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub config_path: Option<PathBuf>,

    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_parallel_ops() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

fn default_backup_dir() -> PathBuf {
    std::env::temp_dir().join("mcp-batch-backups")
}

fn default_backup_max_age_days() -> u64 {
    7
}

fn default_backup_max_count() -> usize {
    100
}

fn default_metadata_ttl_secs() -> u64 {
    300
}

fn default_medium_pct() -> f64 {
    30.0
}

fn default_high_pct() -> f64 {
    50.0
}

fn default_medium_occurrences() -> usize {
    50
}

fn default_high_occurrences() -> usize {
    100
}

fn default_max_search_results() -> usize {
    1000
}

fn default_max_list_items() -> usize {
    500
}

fn default_max_response_size() -> usize {
    1024 * 1024
}

fn default_edit_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_search_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_cache_max_entries() -> usize {
    256
}

fn default_hook_timeout_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allowed_paths: vec![],
            parallel_ops: default_parallel_ops(),
            backup: BackupConfig::default(),
            risk: RiskConfig::default(),
            limits: LimitsConfig::default(),
            hooks: HooksConfig::default(),
            auto_sync: false,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            max_age_days: default_backup_max_age_days(),
            max_count: default_backup_max_count(),
            metadata_ttl_secs: default_metadata_ttl_secs(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            medium_pct: default_medium_pct(),
            high_pct: default_high_pct(),
            medium_occurrences: default_medium_occurrences(),
            high_occurrences: default_high_occurrences(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_search_results: default_max_search_results(),
            max_list_items: default_max_list_items(),
            max_response_size: default_max_response_size(),
            compact_mode: false,
            edit_max_file_size: default_edit_max_file_size(),
            search_max_file_size: default_search_max_file_size(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            config_path: None,
            timeout_secs: default_hook_timeout_secs(),
        }
    }
}

impl EngineConfig {
    /// Load config from `.filesmith/config.toml` under the working
    /// directory if it exists, otherwise return defaults.
    pub fn load() -> Result<Self> {
        if let Ok(cwd) = std::env::current_dir() {
            let config_path = cwd.join(".filesmith").join("config.toml");
            if config_path.exists() {
                return Self::load_from_path(&config_path);
            }
        }
        Ok(Self::default())
    }

    /// Load config from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.allowed_paths.is_empty());
        assert_eq!(config.backup.max_age_days, 7);
        assert_eq!(config.backup.max_count, 100);
        assert_eq!(config.risk.medium_pct, 30.0);
        assert_eq!(config.risk.high_pct, 50.0);
        assert_eq!(config.risk.medium_occurrences, 50);
        assert_eq!(config.risk.high_occurrences, 100);
        assert_eq!(config.limits.edit_max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.hooks.timeout_secs, 60);
    }

    #[test]
    fn test_load_save_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = EngineConfig::default();
        config.allowed_paths = vec![PathBuf::from("/srv/projects")];
        config.parallel_ops = 2;
        config.backup.max_count = 25;
        config.limits.compact_mode = true;

        config.save_to_path(&config_path).unwrap();

        let loaded = EngineConfig::load_from_path(&config_path).unwrap();
        assert_eq!(loaded.allowed_paths, vec![PathBuf::from("/srv/projects")]);
        assert_eq!(loaded.parallel_ops, 2);
        assert_eq!(loaded.backup.max_count, 25);
        assert!(loaded.limits.compact_mode);
    }

    #[test]
    fn test_partial_config() {
        let toml_content = r#"
[risk]
high_pct = 75.0
"#;

        let config: EngineConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.risk.high_pct, 75.0);
        // Everything else keeps its default
        assert_eq!(config.risk.medium_pct, 30.0);
        assert_eq!(config.backup.max_count, 100);
        assert!(!config.auto_sync);
    }

    #[test]
    fn test_backup_dir_default_under_temp() {
        let config = EngineConfig::default();
        assert!(config
            .backup
            .backup_dir
            .ends_with("mcp-batch-backups"));
    }
}
