#![forbid(unsafe_code)]

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const PH1COOL_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Per-user admission and escalation counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownState {
    pub schema_version: SchemaVersion,
    /// Admission times inside the current rate window, oldest first.
    pub admissions: VecDeque<MonotonicTimeNs>,
    pub cooldown_until: Option<MonotonicTimeNs>,
    pub consecutive_safety: u32,
    pub safety_streak_started_at: Option<MonotonicTimeNs>,
    /// Cooldowns imposed since the last doubling reset; drives the exponential length.
    pub cooldown_triggers: u32,
    pub last_trigger_at: Option<MonotonicTimeNs>,
}

impl CooldownState {
    pub fn new() -> Self {
        Self {
            schema_version: PH1COOL_CONTRACT_VERSION,
            admissions: VecDeque::new(),
            cooldown_until: None,
            consecutive_safety: 0,
            safety_streak_started_at: None,
            cooldown_triggers: 0,
            last_trigger_at: None,
        }
    }

    pub fn cooldown_active_at(&self, now: MonotonicTimeNs) -> bool {
        matches!(self.cooldown_until, Some(until) if until > now)
    }
}

impl Default for CooldownState {
    fn default() -> Self {
        Self::new()
    }
}

impl Validate for CooldownState {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1COOL_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "cooldown_state.schema_version",
                reason: "must match PH1COOL_CONTRACT_VERSION",
            });
        }
        if (self.consecutive_safety == 0) != self.safety_streak_started_at.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "cooldown_state.safety_streak_started_at",
                reason: "must be present exactly when consecutive_safety > 0",
            });
        }
        if (self.cooldown_triggers == 0) != self.last_trigger_at.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "cooldown_state.last_trigger_at",
                reason: "must be present exactly when cooldown_triggers > 0",
            });
        }
        if self
            .admissions
            .iter()
            .zip(self.admissions.iter().skip(1))
            .any(|(a, b)| a > b)
        {
            return Err(ContractViolation::InvalidValue {
                field: "cooldown_state.admissions",
                reason: "must be ordered oldest first",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmitCause {
    Admitted,
    CooldownActive,
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmitDecision {
    pub schema_version: SchemaVersion,
    pub allowed: bool,
    pub retry_after_seconds: u32,
    pub cause: AdmitCause,
    pub reason_code: ReasonCodeId,
}

impl AdmitDecision {
    pub fn v1(
        cause: AdmitCause,
        retry_after_seconds: u32,
        reason_code: ReasonCodeId,
    ) -> Result<Self, ContractViolation> {
        let d = Self {
            schema_version: PH1COOL_CONTRACT_VERSION,
            allowed: cause == AdmitCause::Admitted,
            retry_after_seconds,
            cause,
            reason_code,
        };
        d.validate()?;
        Ok(d)
    }
}

impl Validate for AdmitDecision {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1COOL_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "admit_decision.schema_version",
                reason: "must match PH1COOL_CONTRACT_VERSION",
            });
        }
        if self.allowed != (self.cause == AdmitCause::Admitted) {
            return Err(ContractViolation::InvalidValue {
                field: "admit_decision.allowed",
                reason: "must be true exactly when cause=admitted",
            });
        }
        if self.allowed && self.retry_after_seconds != 0 {
            return Err(ContractViolation::InvalidValue {
                field: "admit_decision.retry_after_seconds",
                reason: "must be 0 when admitted",
            });
        }
        if !self.allowed && self.retry_after_seconds == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "admit_decision.retry_after_seconds",
                reason: "must be > 0 when rejected",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_cool_contract_01_rejection_requires_retry_after() {
        assert!(AdmitDecision::v1(AdmitCause::RateLimited, 0, ReasonCodeId(1)).is_err());
        let d = AdmitDecision::v1(AdmitCause::CooldownActive, 30, ReasonCodeId(1)).unwrap();
        assert!(!d.allowed);
        assert!(AdmitDecision::v1(AdmitCause::Admitted, 3, ReasonCodeId(1)).is_err());
    }

    #[test]
    fn at_cool_contract_02_streak_fields_must_agree() {
        let mut s = CooldownState::new();
        assert!(s.validate().is_ok());
        s.consecutive_safety = 1;
        assert!(s.validate().is_err());
        s.safety_streak_started_at = Some(MonotonicTimeNs(5));
        assert!(s.validate().is_ok());
    }
}
