#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use listener_engines::ph1harm::Ph1HarmRuntime;
use listener_kernel_contracts::ph1harm::SafetyAssessment;
use listener_kernel_contracts::ph1mode::Mode;
use listener_kernel_contracts::{ContractViolation, ReasonCodeId, Validate};
use tracing::warn;

use crate::collab::{CollaboratorError, HarmScoreSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ph1HarmWiringConfig {
    pub classifier_timeout_ms: u32,
}

impl Ph1HarmWiringConfig {
    pub fn mvp_v1() -> Self {
        Self {
            classifier_timeout_ms: 3_000,
        }
    }
}

/// Classifier adapter: external scores under a timeout, keyword guardrail always.
#[derive(Clone)]
pub struct Ph1HarmWiring {
    config: Ph1HarmWiringConfig,
    runtime: Ph1HarmRuntime,
    source: Arc<dyn HarmScoreSource>,
}

impl Ph1HarmWiring {
    pub fn new(
        config: Ph1HarmWiringConfig,
        runtime: Ph1HarmRuntime,
        source: Arc<dyn HarmScoreSource>,
    ) -> Result<Self, ContractViolation> {
        if config.classifier_timeout_ms == 0 || config.classifier_timeout_ms > 60_000 {
            return Err(ContractViolation::InvalidValue {
                field: "ph1harm_wiring_config.classifier_timeout_ms",
                reason: "must be within 1..=60_000",
            });
        }
        Ok(Self {
            config,
            runtime,
            source,
        })
    }

    /// Never fails: an unavailable, erroring, slow or malformed classifier degrades the
    /// result to the keyword guardrail.
    pub async fn assess(&self, text: &str, mode: Mode) -> (SafetyAssessment, ReasonCodeId) {
        if text.trim().is_empty() {
            return self.runtime.assess(text, mode, None);
        }
        let timeout = Duration::from_millis(u64::from(self.config.classifier_timeout_ms));
        let scores = match tokio::time::timeout(timeout, self.source.score(text, mode)).await {
            Ok(Ok(scores)) => match scores.validate() {
                Ok(()) => Some(scores),
                Err(violation) => {
                    warn!(error = %violation, "harm classifier returned invalid scores; degrading");
                    None
                }
            },
            Ok(Err(err)) => {
                warn!(error = %err, "harm classifier unavailable; degrading to keyword guardrail");
                None
            }
            Err(_) => {
                warn!(
                    error = %CollaboratorError::Timeout,
                    timeout_ms = self.config.classifier_timeout_ms,
                    "harm classifier timed out; degrading to keyword guardrail"
                );
                None
            }
        };
        self.runtime.assess(text, mode, scores.as_ref())
    }
}
