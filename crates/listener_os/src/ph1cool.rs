#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use listener_engines::ph1cool::{OutcomeRecord, Ph1CoolConfig, Ph1CoolRuntime};
use listener_kernel_contracts::ph1cool::{AdmitDecision, CooldownState};
use listener_kernel_contracts::ph1mode::Mode;
use listener_kernel_contracts::ph1sess::UserId;
use listener_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use tracing::info;

type Slot = Arc<Mutex<CooldownState>>;

/// Explicitly owned per-user cooldown records. Every read-check-update runs under the
/// user's own lock; the map lock is only held to find or create a slot.
pub struct CooldownManager {
    runtime: Ph1CoolRuntime,
    users: Mutex<HashMap<UserId, Slot>>,
}

impl CooldownManager {
    pub fn new(config: Ph1CoolConfig) -> Result<Self, ContractViolation> {
        if config.rate_max_requests == 0 || config.rate_max_requests > 10_000 {
            return Err(ContractViolation::InvalidValue {
                field: "ph1cool_config.rate_max_requests",
                reason: "must be within 1..=10_000",
            });
        }
        if config.rate_window_s == 0 || config.rate_window_s > 86_400 {
            return Err(ContractViolation::InvalidValue {
                field: "ph1cool_config.rate_window_s",
                reason: "must be within 1..=86_400",
            });
        }
        if config.cooldown_base_s == 0 || config.cooldown_max_s < config.cooldown_base_s {
            return Err(ContractViolation::InvalidValue {
                field: "ph1cool_config.cooldown_max_s",
                reason: "must be >= cooldown_base_s > 0",
            });
        }
        if config.escalation_threshold == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "ph1cool_config.escalation_threshold",
                reason: "must be > 0",
            });
        }
        Ok(Self {
            runtime: Ph1CoolRuntime::new(config),
            users: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> Ph1CoolConfig {
        self.runtime.config()
    }

    /// Finds the user's slot, seeding a new one from `load` (persisted state) when absent.
    fn slot(&self, user_id: &UserId, load: impl FnOnce() -> Option<CooldownState>) -> Slot {
        if let Some(slot) = lock(&self.users).get(user_id) {
            return Arc::clone(slot);
        }
        let seeded = load().unwrap_or_default();
        let mut users = lock(&self.users);
        Arc::clone(
            users
                .entry(user_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(seeded))),
        )
    }

    pub fn admit(
        &self,
        user_id: &UserId,
        now: MonotonicTimeNs,
        load: impl FnOnce() -> Option<CooldownState>,
    ) -> AdmitDecision {
        let slot = self.slot(user_id, load);
        let mut state = lock(&slot);
        let decision = self.runtime.admit(&mut state, now);
        if !decision.allowed {
            info!(
                user_id = %user_id,
                cause = ?decision.cause,
                retry_after_seconds = decision.retry_after_seconds,
                reason_code = decision.reason_code.0,
                "turn rejected at admission"
            );
        }
        decision
    }

    /// The decision `admit` would make at `now`, without logging an admission.
    pub fn peek(
        &self,
        user_id: &UserId,
        now: MonotonicTimeNs,
        load: impl FnOnce() -> Option<CooldownState>,
    ) -> AdmitDecision {
        let slot = self.slot(user_id, load);
        let mut scratch = lock(&slot).clone();
        self.runtime.admit(&mut scratch, now)
    }

    /// Applies a processed turn's mode. A cooldown that became active after the turn was
    /// admitted wins: nothing is applied and `persist` is not called. Otherwise `persist`
    /// sees the updated state before it is committed; an `Err` leaves the record untouched.
    pub fn record_outcome<E>(
        &self,
        user_id: &UserId,
        mode: Mode,
        now: MonotonicTimeNs,
        load: impl FnOnce() -> Option<CooldownState>,
        persist: impl FnOnce(&CooldownState) -> Result<(), E>,
    ) -> Result<OutcomeCommit, E> {
        let slot = self.slot(user_id, load);
        let mut state = lock(&slot);
        let remaining = self.runtime.remaining_s(&state, now);
        if remaining > 0 {
            return Ok(OutcomeCommit::CooldownActive {
                retry_after_seconds: remaining,
            });
        }
        let mut next = state.clone();
        let record = self.runtime.record_outcome(&mut next, mode, now);
        persist(&next)?;
        *state = next;
        if let Some(secs) = record.imposed_cooldown_s {
            info!(
                user_id = %user_id,
                cooldown_seconds = secs,
                triggers = state.cooldown_triggers,
                "cooldown imposed after repeated safety turns"
            );
        }
        Ok(OutcomeCommit::Applied {
            record,
            cooldown_seconds: self.runtime.remaining_s(&state, now),
        })
    }

    pub fn remaining_s(&self, user_id: &UserId, now: MonotonicTimeNs) -> u32 {
        let slot = lock(&self.users).get(user_id).cloned();
        match slot {
            Some(slot) => self.runtime.remaining_s(&lock(&slot), now),
            None => 0,
        }
    }

    /// Clears the user's record. `clear` removes the persisted copy under the user's lock;
    /// on `Err` the in-memory record is kept.
    pub fn reset<E>(
        &self,
        user_id: &UserId,
        clear: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let slot = self.slot(user_id, || None);
        let mut state = lock(&slot);
        clear()?;
        *state = CooldownState::new();
        info!(user_id = %user_id, "cooldown state reset");
        Ok(())
    }

    /// Drops in-memory records that no longer constrain admission and that no caller holds.
    /// Escalation counters come back from the persisted row on next use.
    pub fn evict_quiescent(&self, now: MonotonicTimeNs) -> usize {
        let mut users = lock(&self.users);
        let before = users.len();
        users.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(state) => !self.runtime.is_quiescent(&state, now),
                Err(_) => true,
            }
        });
        before - users.len()
    }

    pub fn tracked_users(&self) -> usize {
        lock(&self.users).len()
    }

    pub fn snapshot(&self, user_id: &UserId) -> Option<CooldownState> {
        let slot = lock(&self.users).get(user_id).cloned()?;
        let state = lock(&slot).clone();
        Some(state)
    }
}

/// What `record_outcome` did with a processed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeCommit {
    Applied {
        record: OutcomeRecord,
        cooldown_seconds: u32,
    },
    /// A cooldown started while the turn was in flight; the turn must be gated.
    CooldownActive { retry_after_seconds: u32 },
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
