//! Configuration System
//!
//! Hierarchical configuration loaded from:
//! - ralc.toml (default configuration)
//! - ralc.local.toml (git-ignored local overrides)
//! - Environment variables (RALC_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # ralc.toml
//! [optimizer]
//! join_algorithm = "shuffle_hash"
//! max_fixpoint_iterations = 32
//!
//! [analysis]
//! chaining = false
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! RALC_OPTIMIZER__JOIN_ALGORITHM=symmetric_hash
//! RALC_CODEGEN__COMMON_SUBEXPRESSION_ELIMINATION=false
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::optimizer::JoinAlgorithm;
use crate::rules::DEFAULT_MAX_ITERATIONS;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub codegen: CodegenConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rule-based optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Physical join chosen for every logical join
    #[serde(default)]
    pub join_algorithm: JoinAlgorithm,

    /// Cap on passes of one fixpoint rule group
    #[serde(default = "default_max_fixpoint_iterations")]
    pub max_fixpoint_iterations: usize,

    /// Swap the inputs of every join before optimizing
    #[serde(default)]
    pub swap_join_sides: bool,

    /// Check scanned relations against the catalog when one is given
    #[serde(default = "default_true")]
    pub check_catalog: bool,
}

/// Program graph passes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_true")]
    pub dead_code_elimination: bool,

    #[serde(default = "default_true")]
    pub chaining: bool,

    /// Reject programs that may read a variable before assigning it
    #[serde(default = "default_true")]
    pub validate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodegenConfig {
    /// Share hash tables and scans between operators computing the same input
    #[serde(default = "default_true")]
    pub common_subexpression_elimination: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_true() -> bool {
    true
}
fn default_max_fixpoint_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. ralc.toml (base configuration)
    /// 2. ralc.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (RALC_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("ralc.toml"))
            .merge(Toml::file("ralc.local.toml"))
            .merge(Env::prefixed("RALC_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RALC_").split("__"))
            .extract()
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            join_algorithm: JoinAlgorithm::default(),
            max_fixpoint_iterations: DEFAULT_MAX_ITERATIONS,
            swap_join_sides: false,
            check_catalog: true,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            dead_code_elimination: true,
            chaining: true,
            validate: true,
        }
    }
}

impl Default for CodegenConfig {
    fn default() -> Self {
        CodegenConfig {
            common_subexpression_elimination: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.optimizer.join_algorithm, JoinAlgorithm::Hash);
        assert_eq!(config.optimizer.max_fixpoint_iterations, 64);
        assert!(!config.optimizer.swap_join_sides);
        assert!(config.optimizer.check_catalog);
        assert!(config.analysis.dead_code_elimination);
        assert!(config.analysis.chaining);
        assert!(config.codegen.common_subexpression_elimination);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = toml::to_string(&Config::default()).unwrap();
        assert!(toml_str.contains("[optimizer]"));
        assert!(toml_str.contains("join_algorithm = \"hash\""));
        assert!(toml_str.contains("[codegen]"));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config::default();
        let back: Config = toml::from_str(&toml::to_string(&config).unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [optimizer]
            join_algorithm = "shuffle_hash"
            "#,
        )
        .unwrap();
        assert_eq!(config.optimizer.join_algorithm, JoinAlgorithm::ShuffleHash);
        assert_eq!(config.optimizer.max_fixpoint_iterations, 64);
        assert!(config.analysis.validate);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
