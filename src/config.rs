//! Runtime limits and locations.
//!
//! Values come from `AGENT_*` environment variables (a `.env` file is loaded
//! by the binary first), falling back to the defaults below.

use std::path::PathBuf;
use std::time::Duration;

/// Consecutive replay failures after which a route is no longer replayed.
pub const FAILURE_THRESHOLD: u32 = 3;
pub const MAX_EXPLORATION_STEPS: usize = 25;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub failure_threshold: u32,
    pub max_exploration_steps: usize,
    /// Wall-clock budget for one exploration.
    pub exploration_budget: Duration,
    pub action_timeout: Duration,
    pub provider_timeout: Duration,
    pub verify_timeout: Duration,
    pub store_timeout: Duration,
    /// Proposals below this confidence count as a provider failure.
    pub min_confidence: f32,
    /// Full passes over the provider chain per decision point.
    pub attempts_per_point: usize,
    pub routes_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            max_exploration_steps: MAX_EXPLORATION_STEPS,
            exploration_budget: Duration::from_secs(600),
            action_timeout: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(60),
            verify_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
            min_confidence: 0.5,
            attempts_per_point: 2,
            routes_dir: default_routes_dir(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            failure_threshold: env_parse("AGENT_FAILURE_THRESHOLD").unwrap_or(d.failure_threshold),
            max_exploration_steps: env_parse("AGENT_MAX_EXPLORATION_STEPS")
                .unwrap_or(d.max_exploration_steps),
            exploration_budget: env_secs("AGENT_EXPLORATION_BUDGET_SECS")
                .unwrap_or(d.exploration_budget),
            action_timeout: env_secs("AGENT_ACTION_TIMEOUT_SECS").unwrap_or(d.action_timeout),
            provider_timeout: env_secs("AGENT_PROVIDER_TIMEOUT_SECS").unwrap_or(d.provider_timeout),
            verify_timeout: env_secs("AGENT_VERIFY_TIMEOUT_SECS").unwrap_or(d.verify_timeout),
            store_timeout: env_secs("AGENT_STORE_TIMEOUT_SECS").unwrap_or(d.store_timeout),
            min_confidence: env_parse("AGENT_MIN_CONFIDENCE").unwrap_or(d.min_confidence),
            attempts_per_point: env_parse("AGENT_ATTEMPTS_PER_POINT")
                .unwrap_or(d.attempts_per_point)
                .max(1),
            routes_dir: std::env::var("AGENT_ROUTES_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.routes_dir),
        }
    }
}

fn default_routes_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("publish-agent")
        .join("routes")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("[Config] Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.max_exploration_steps, 25);
        assert!(cfg.attempts_per_point >= 1);
        assert!(cfg.routes_dir.ends_with("routes"));
    }
}
