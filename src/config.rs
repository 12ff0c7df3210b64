//! Engine configuration

use serde::{Deserialize, Serialize};

/// Configuration for an execution engine instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When true, every kernel is wrapped with profiling instrumentation:
    /// timing, output shape logging and a NaN/Inf scan over result values.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { debug: false }
    }
}

impl EngineConfig {
    /// Build a config from environment variables (`CRUCIBLE_DEBUG=1`).
    pub fn from_env() -> Self {
        let debug = std::env::var("CRUCIBLE_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self { debug }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(!config.debug);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default().with_debug(true);
        assert!(config.debug);
    }
}
