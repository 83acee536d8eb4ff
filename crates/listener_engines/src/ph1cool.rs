#![forbid(unsafe_code)]

use listener_kernel_contracts::ph1cool::{
    AdmitCause, AdmitDecision, CooldownState, PH1COOL_CONTRACT_VERSION,
};
use listener_kernel_contracts::ph1mode::Mode;
use listener_kernel_contracts::{ceil_secs_until, MonotonicTimeNs, ReasonCodeId, NS_PER_SECOND};

pub mod reason_codes {
    use listener_kernel_contracts::ReasonCodeId;

    // PH1.COOL reason-code namespace.
    pub const COOL_ADMITTED: ReasonCodeId = ReasonCodeId(0x434F_0001);
    pub const COOL_COOLDOWN_ACTIVE: ReasonCodeId = ReasonCodeId(0x434F_0010);
    pub const COOL_RATE_LIMITED: ReasonCodeId = ReasonCodeId(0x434F_0011);
    pub const COOL_COOLDOWN_IMPOSED: ReasonCodeId = ReasonCodeId(0x434F_0012);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ph1CoolConfig {
    pub rate_max_requests: u32,
    pub rate_window_s: u32,
    pub cooldown_base_s: u32,
    pub cooldown_max_s: u32,
    /// Consecutive SAFETY turns that trigger a cooldown.
    pub escalation_threshold: u32,
    pub escalation_span_s: u32,
    pub doubling_reset_s: u32,
}

impl Ph1CoolConfig {
    pub fn mvp_v1() -> Self {
        Self {
            rate_max_requests: 20,
            rate_window_s: 60,
            cooldown_base_s: 60,
            cooldown_max_s: 900,
            escalation_threshold: 2,
            escalation_span_s: 300,
            doubling_reset_s: 900,
        }
    }
}

/// Result of recording a processed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub imposed_cooldown_s: Option<u32>,
    pub reason_code: Option<ReasonCodeId>,
}

#[derive(Debug, Clone)]
pub struct Ph1CoolRuntime {
    config: Ph1CoolConfig,
}

impl Ph1CoolRuntime {
    pub fn new(config: Ph1CoolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> Ph1CoolConfig {
        self.config
    }

    /// Check-and-admit. Mutates `state` only when the request is admitted or an expired
    /// cooldown/admission needs pruning.
    pub fn admit(&self, state: &mut CooldownState, now: MonotonicTimeNs) -> AdmitDecision {
        if let Some(until) = state.cooldown_until {
            if until > now {
                return decision(
                    AdmitCause::CooldownActive,
                    ceil_secs_until(now, until).max(1),
                    reason_codes::COOL_COOLDOWN_ACTIVE,
                );
            }
            state.cooldown_until = None;
        }

        let window_ns = u64::from(self.config.rate_window_s) * NS_PER_SECOND;
        while let Some(oldest) = state.admissions.front().copied() {
            if oldest.0.saturating_add(window_ns) <= now.0 {
                state.admissions.pop_front();
            } else {
                break;
            }
        }

        if state.admissions.len() >= self.config.rate_max_requests as usize {
            let oldest = state.admissions.front().copied().unwrap_or(now);
            let frees_at = MonotonicTimeNs(oldest.0.saturating_add(window_ns));
            return decision(
                AdmitCause::RateLimited,
                ceil_secs_until(now, frees_at).max(1),
                reason_codes::COOL_RATE_LIMITED,
            );
        }

        state.admissions.push_back(now);
        decision(AdmitCause::Admitted, 0, reason_codes::COOL_ADMITTED)
    }

    /// Folds a processed turn's resulting mode into the escalation counters.
    pub fn record_outcome(
        &self,
        state: &mut CooldownState,
        mode: Mode,
        now: MonotonicTimeNs,
    ) -> OutcomeRecord {
        let none = OutcomeRecord {
            imposed_cooldown_s: None,
            reason_code: None,
        };
        if mode == Mode::Cooldown {
            return none;
        }

        if let Some(last) = state.last_trigger_at {
            if now.saturating_elapsed_since(last)
                >= u64::from(self.config.doubling_reset_s) * NS_PER_SECOND
            {
                state.cooldown_triggers = 0;
                state.last_trigger_at = None;
            }
        }

        if mode != Mode::Safety {
            state.consecutive_safety = 0;
            state.safety_streak_started_at = None;
            return none;
        }

        let span_ns = u64::from(self.config.escalation_span_s) * NS_PER_SECOND;
        match state.safety_streak_started_at {
            Some(started) if now.saturating_elapsed_since(started) <= span_ns => {
                state.consecutive_safety = state.consecutive_safety.saturating_add(1);
            }
            _ => {
                state.consecutive_safety = 1;
                state.safety_streak_started_at = Some(now);
            }
        }

        if state.consecutive_safety < self.config.escalation_threshold {
            return none;
        }

        let length = self.cooldown_length_s(state.cooldown_triggers);
        state.cooldown_until = Some(now.plus_secs(u64::from(length)));
        state.cooldown_triggers = state.cooldown_triggers.saturating_add(1);
        state.last_trigger_at = Some(now);
        state.consecutive_safety = 0;
        state.safety_streak_started_at = None;
        OutcomeRecord {
            imposed_cooldown_s: Some(length),
            reason_code: Some(reason_codes::COOL_COOLDOWN_IMPOSED),
        }
    }

    pub fn cooldown_length_s(&self, triggers: u32) -> u32 {
        let factor = 1u64.checked_shl(triggers.min(32)).unwrap_or(u64::MAX);
        let length = u64::from(self.config.cooldown_base_s).saturating_mul(factor);
        length.min(u64::from(self.config.cooldown_max_s)) as u32
    }

    pub fn remaining_s(&self, state: &CooldownState, now: MonotonicTimeNs) -> u32 {
        match state.cooldown_until {
            Some(until) if until > now => ceil_secs_until(now, until),
            _ => 0,
        }
    }

    /// No active cooldown and no admission left inside the rate window.
    pub fn is_quiescent(&self, state: &CooldownState, now: MonotonicTimeNs) -> bool {
        let window_ns = u64::from(self.config.rate_window_s) * NS_PER_SECOND;
        !state.cooldown_active_at(now)
            && state
                .admissions
                .back()
                .map_or(true, |last| last.0.saturating_add(window_ns) <= now.0)
    }
}

fn decision(cause: AdmitCause, retry_after_seconds: u32, reason_code: ReasonCodeId) -> AdmitDecision {
    AdmitDecision {
        schema_version: PH1COOL_CONTRACT_VERSION,
        allowed: cause == AdmitCause::Admitted,
        retry_after_seconds,
        cause,
        reason_code,
    }
}
