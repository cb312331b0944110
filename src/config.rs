//! Configuration file support.
//!
//! Config files are loaded in order (later overrides earlier):
//! 1. `~/.config/axondb/config.toml` (user defaults)
//! 2. `.axondb.toml` in the database root (project overrides)
//!
//! Values passed programmatically override all config file values.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::index::IndexConfig;
use crate::writebuf::WriteBufferConfig;

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub write_buffer: WriteBufferConfig,
    pub index: IndexConfig,
    /// Charged-byte budget for the unified chunk/sparse-index cache.
    pub cache_budget_bytes: usize,
    /// Rebuild automatically when the startup health check flags a
    /// corrupt index.
    pub auto_repair: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_buffer: WriteBufferConfig::default(),
            index: IndexConfig::default(),
            cache_budget_bytes: Self::DEFAULT_CACHE_BUDGET,
            auto_repair: true,
        }
    }
}

impl EngineConfig {
    /// 64 MB of charged cache by default.
    pub const DEFAULT_CACHE_BUDGET: usize = 64 << 20;

    /// Load configuration from user and project config files, falling
    /// back to defaults for anything unset.
    pub fn load(root: &Path) -> Self {
        let user_config = dirs::config_dir()
            .map(|d| d.join("axondb/config.toml"))
            .and_then(|p| ConfigFile::load_file(&p))
            .unwrap_or_default();
        let project_config =
            ConfigFile::load_file(&root.join(".axondb.toml")).unwrap_or_default();

        let merged = user_config.override_with(project_config);
        let resolved = merged.resolve();
        tracing::debug!(
            cache_budget = resolved.cache_budget_bytes,
            auto_repair = resolved.auto_repair,
            max_buffer = resolved.write_buffer.max_buffer_size,
            "effective config after merge"
        );
        resolved
    }
}

/// Raw file shape: everything optional so layers can partially override.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    cache_budget_bytes: Option<usize>,
    auto_repair: Option<bool>,
    max_buffer_size: Option<usize>,
    flush_interval_ms: Option<u64>,
    max_concurrent_writes: Option<usize>,
    split_threshold: Option<usize>,
    merge_threshold: Option<usize>,
    warm_fields: Option<usize>,
}

impl ConfigFile {
    fn load_file(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("failed to read config {}: {}", path.display(), e);
                return None;
            }
        };
        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "loaded config");
                Some(config)
            }
            Err(e) => {
                tracing::warn!("failed to parse config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Layer another file on top (other wins where present).
    fn override_with(self, other: Self) -> Self {
        Self {
            cache_budget_bytes: other.cache_budget_bytes.or(self.cache_budget_bytes),
            auto_repair: other.auto_repair.or(self.auto_repair),
            max_buffer_size: other.max_buffer_size.or(self.max_buffer_size),
            flush_interval_ms: other.flush_interval_ms.or(self.flush_interval_ms),
            max_concurrent_writes: other.max_concurrent_writes.or(self.max_concurrent_writes),
            split_threshold: other.split_threshold.or(self.split_threshold),
            merge_threshold: other.merge_threshold.or(self.merge_threshold),
            warm_fields: other.warm_fields.or(self.warm_fields),
        }
    }

    fn resolve(self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(v) = self.cache_budget_bytes {
            config.cache_budget_bytes = v;
        }
        if let Some(v) = self.auto_repair {
            config.auto_repair = v;
        }
        if let Some(v) = self.max_buffer_size {
            config.write_buffer.max_buffer_size = v;
        }
        if let Some(v) = self.flush_interval_ms {
            config.write_buffer.flush_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.max_concurrent_writes {
            config.write_buffer.max_concurrent = v;
        }
        if let Some(v) = self.split_threshold {
            config.index.split_threshold = v;
        }
        if let Some(v) = self.merge_threshold {
            config.index.merge_threshold = v;
        }
        if let Some(v) = self.warm_fields {
            config.index.warm_fields = v;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::load(dir.path());
        assert_eq!(config.cache_budget_bytes, EngineConfig::DEFAULT_CACHE_BUDGET);
        assert!(config.auto_repair);
    }

    #[test]
    fn test_project_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".axondb.toml"),
            "cache_budget_bytes = 1024\nsplit_threshold = 40\nauto_repair = false\n",
        )
        .unwrap();

        let config = EngineConfig::load(dir.path());
        assert_eq!(config.cache_budget_bytes, 1024);
        assert_eq!(config.index.split_threshold, 40);
        assert!(!config.auto_repair);
        // Untouched values keep defaults
        assert_eq!(
            config.index.merge_threshold,
            IndexConfig::default().merge_threshold
        );
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(".axondb.toml"), "cache_budget_bytes = [").unwrap();
        let config = EngineConfig::load(dir.path());
        assert_eq!(config.cache_budget_bytes, EngineConfig::DEFAULT_CACHE_BUDGET);
    }

    #[test]
    fn test_override_with_prefers_other() {
        let base = ConfigFile {
            cache_budget_bytes: Some(1),
            auto_repair: Some(true),
            ..ConfigFile::default()
        };
        let top = ConfigFile {
            cache_budget_bytes: Some(2),
            ..ConfigFile::default()
        };
        let merged = base.override_with(top);
        assert_eq!(merged.cache_budget_bytes, Some(2));
        assert_eq!(merged.auto_repair, Some(true));
    }
}
