//! Runtime configuration (§6 Configuration keys).
//!
//! A minimal struct constructed programmatically, with a `Default` impl
//! pointing at a sensible relative path. No TOML/YAML parsing dependency
//! is introduced — an embedding CLI is free to layer one on top and build
//! this struct from whatever format it likes.

use std::path::PathBuf;

/// Caching configuration for the external LLM-completion boundary. The core
/// does not implement caching itself (out of scope, §1); this only carries
/// the keys an embedder's cache would read.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmCacheConfig {
    pub enabled: bool,
    pub path_or_url: Option<String>,
}

impl Default for LlmCacheConfig {
    fn default() -> Self {
        LlmCacheConfig {
            enabled: false,
            path_or_url: None,
        }
    }
}

/// Durability (checkpoint/recovery, C11) configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DurabilityConfig {
    pub enabled: bool,
    pub storage_path: PathBuf,
    pub max_checkpoint_size_mb: usize,
    pub keep_last_n: usize,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        DurabilityConfig {
            enabled: true,
            storage_path: PathBuf::from("checkpoints"),
            max_checkpoint_size_mb: 8,
            keep_last_n: 10,
        }
    }
}

/// Global runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Opaque model selector, passed through to the external completion
    /// provider (the core never interprets it).
    pub model: String,
    pub llm_cache: LlmCacheConfig,
    pub durability: DurabilityConfig,
}

impl Default for RuntimeConfig {
    /// A config pointing durability at `"checkpoints"` in the current
    /// working directory, retaining the last 10 checkpoints per agent, with
    /// the LLM cache disabled.
    fn default() -> Self {
        RuntimeConfig {
            model: String::new(),
            llm_cache: LlmCacheConfig::default(),
            durability: DurabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_relative_checkpoints_dir() {
        let config = RuntimeConfig::default();
        assert_eq!(config.durability.storage_path, PathBuf::from("checkpoints"));
        assert!(config.durability.enabled);
        assert_eq!(config.durability.keep_last_n, 10);
        assert!(!config.llm_cache.enabled);
    }
}
