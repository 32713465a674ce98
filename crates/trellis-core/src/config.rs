//! Engine configuration.
//!
//! Reads `trellis.toml` from a caller-provided directory and deserializes it
//! into [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Engine-wide defaults. Document and step settings override these per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default per-attempt step timeout in seconds.
    pub default_step_timeout_secs: u64,
    /// Default whole-run timeout in seconds.
    pub default_run_timeout_secs: u64,
    /// Consecutive failures before a step's circuit breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long an open breaker waits before admitting a half-open trial.
    pub breaker_recovery_timeout_ms: u64,
    /// Branch concurrency cap for `parallel` steps without their own limit.
    pub max_parallel_branches: u32,
    /// Deadline for the built-in custom-step runner, in milliseconds.
    pub custom_step_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: 300,
            default_run_timeout_secs: 1800,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout_ms: 30_000,
            max_parallel_branches: 8,
            custom_step_timeout_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn default_run_timeout(&self) -> Duration {
        Duration::from_secs(self.default_run_timeout_secs)
    }

    pub fn breaker_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.breaker_recovery_timeout_ms)
    }

    pub fn custom_step_timeout(&self) -> Duration {
        Duration::from_millis(self.custom_step_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load configuration from `{dir}/trellis.toml`.
///
/// - Missing file: returns [`EngineConfig::default`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
pub async fn load_engine_config(dir: &Path) -> EngineConfig {
    let path = dir.join("trellis.toml");

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no trellis.toml at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
