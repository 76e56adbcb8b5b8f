//! Decision providers and the ordered fallback chain over them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::types::{Decision, HistoryEntry, ObservedState};

/// Proposes the next action for a goal given the current UI state.
#[async_trait]
pub trait VisionDecisionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(
        &self,
        state: &ObservedState,
        goal: &str,
        history: &[HistoryEntry],
        timeout: Duration,
    ) -> Result<Decision, AgentError>;
}

/// Static priority list of providers: primary first, then fallbacks.
pub struct ProviderChain {
    providers: Vec<Arc<dyn VisionDecisionProvider>>,
    timeout: Duration,
    min_confidence: f32,
    attempts_per_point: usize,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn VisionDecisionProvider>>, config: &AgentConfig) -> Self {
        Self {
            providers,
            timeout: config.provider_timeout,
            min_confidence: config.min_confidence,
            attempts_per_point: config.attempts_per_point.max(1),
        }
    }

    /// Ask providers in order until one returns a usable decision.
    ///
    /// Errors, timeouts and low-confidence proposals hand over to the next
    /// provider. After `attempts_per_point` passes the decision point fails.
    pub async fn decide(
        &self,
        state: &ObservedState,
        goal: &str,
        history: &[HistoryEntry],
    ) -> Result<Decision, AgentError> {
        let mut last = String::from("no providers configured");
        let mut attempts = 0;

        for pass in 1..=self.attempts_per_point {
            for provider in &self.providers {
                attempts += 1;
                let call = provider.decide(state, goal, history, self.timeout);
                let err = match tokio::time::timeout(self.timeout, call).await {
                    // NaN confidence counts as low.
                    Ok(Ok(Decision::Act(p))) if !(p.confidence >= self.min_confidence) => {
                        AgentError::LowConfidence {
                            provider: provider.name().to_string(),
                            confidence: p.confidence,
                            threshold: self.min_confidence,
                        }
                    }
                    Ok(Ok(decision)) => {
                        debug!("[Chain] '{}' decided on pass {}", provider.name(), pass);
                        return Ok(decision);
                    }
                    Ok(Err(e)) => e,
                    Err(_) => AgentError::Timeout {
                        what: format!("provider '{}'", provider.name()),
                        ms: self.timeout.as_millis() as u64,
                    },
                };
                warn!("[Chain] '{}' failed: {}", provider.name(), err);
                last = err.to_string();
            }
        }

        Err(AgentError::ProviderUnavailable { attempts, last })
    }
}
