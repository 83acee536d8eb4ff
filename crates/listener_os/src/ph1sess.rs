#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use listener_engines::ph1loop::Ph1LoopRuntime;
use listener_engines::ph1mode::{self, INITIAL_MODE};
use listener_engines::ph1shape::{infer_intent, shape};
use listener_kernel_contracts::ph1cool::AdmitCause;
use listener_kernel_contracts::ph1harm::{HarmReason, SafetyAssessment, SafetyLevel};
use listener_kernel_contracts::ph1loop::DetectorSignal;
use listener_kernel_contracts::ph1mode::{Mode, TurnIntent};
use listener_kernel_contracts::ph1sess::{validate_utterance, SessionId, Turn, TurnId, UserId};
use listener_kernel_contracts::ph1shape::ResponseDirective;
use listener_kernel_contracts::{
    ContractViolation, MonotonicTimeNs, ReasonCodeId, Validate, NS_PER_SECOND,
};
use listener_storage::ph1f::{SessionRow, StorageError};
use listener_storage::repo::{CooldownRepo, SessionTurnRepo, TurnCommitRepo};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::ph1cool::{CooldownManager, OutcomeCommit};
use crate::ph1harm::Ph1HarmWiring;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEngineConfig {
    pub window_turns: u8,
    pub idle_archive_s: u32,
}

impl SessionEngineConfig {
    pub fn mvp_v1() -> Self {
        Self {
            window_turns: 8,
            idle_archive_s: 30 * 60,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("utterance is empty")]
    EmptyUtterance,
    #[error("another turn is already in flight for this session")]
    ConcurrentTurnConflict,
    #[error("session belongs to a different user")]
    SessionOwnerMismatch,
    #[error("session has been archived")]
    SessionArchived,
    #[error("reply generation unavailable")]
    GenerationUnavailable,
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid input: {0}")]
    Contract(#[from] ContractViolation),
}

impl TurnError {
    /// Text safe to show the user. Internal detail stays in logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            TurnError::EmptyUtterance => "I didn't catch that. Please try again.",
            TurnError::ConcurrentTurnConflict => {
                "Still working on your last message. Please try again in a moment."
            }
            TurnError::SessionOwnerMismatch | TurnError::SessionArchived => {
                "This conversation has ended. Please start a new one."
            }
            TurnError::GenerationUnavailable | TurnError::Storage(_) => {
                "Something went wrong on our side. Please try again."
            }
            TurnError::Contract(_) => "That message couldn't be processed. Please try again.",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TurnError::ConcurrentTurnConflict
                | TurnError::GenerationUnavailable
                | TurnError::Storage(_)
        )
    }
}

/// A persisted session header that cannot be loaded as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionLoadError {
    #[error("persisted session references unknown mode token {token:?}")]
    InvalidSessionState { token: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: SessionId,
    pub mode: Mode,
    pub allowed: bool,
    pub safety_level: SafetyLevel,
    pub reasons: Vec<HarmReason>,
    pub confidence: f32,
    pub degraded: bool,
    pub signal: DetectorSignal,
    /// Cooldown time left for this user; `0` when none is active.
    pub cooldown_seconds: u32,
    /// Set when the turn was rejected at admission.
    pub retry_after_seconds: u32,
    pub directive: ResponseDirective,
    pub turn_id: Option<TurnId>,
    pub session_reset: bool,
    pub reason_code: ReasonCodeId,
    /// Earlier utterances of the session, oldest first, for the reply generator.
    #[serde(skip)]
    pub context: Vec<String>,
}

#[derive(Debug)]
struct LiveSession {
    session_id: SessionId,
    user_id: UserId,
    mode: Mode,
    window: VecDeque<Turn>,
    created_at: MonotonicTimeNs,
    last_activity_at: MonotonicTimeNs,
    next_turn_seq: u64,
    archived: bool,
    reset_pending: bool,
}

impl LiveSession {
    fn row(
        &self,
        mode: Mode,
        now: MonotonicTimeNs,
        next_turn_seq: u64,
    ) -> Result<SessionRow, ContractViolation> {
        SessionRow::v1(
            self.session_id,
            self.user_id.clone(),
            mode.as_str().to_string(),
            self.created_at,
            now.max(self.created_at),
            next_turn_seq,
            false,
        )
    }
}

type LiveSlot = Arc<AsyncMutex<LiveSession>>;

/// Orchestrates one turn: admission, classification, detection, transition, shaping and the
/// single commit into session history.
pub struct SessionEngine<R> {
    config: SessionEngineConfig,
    harm: Ph1HarmWiring,
    detector: Ph1LoopRuntime,
    cooldowns: Arc<CooldownManager>,
    store: Arc<Mutex<R>>,
    live: Mutex<HashMap<SessionId, LiveSlot>>,
}

impl<R> SessionEngine<R>
where
    R: TurnCommitRepo + Send + 'static,
{
    pub fn new(
        config: SessionEngineConfig,
        harm: Ph1HarmWiring,
        detector: Ph1LoopRuntime,
        cooldowns: Arc<CooldownManager>,
        store: Arc<Mutex<R>>,
    ) -> Result<Self, ContractViolation> {
        if config.window_turns == 0 || config.window_turns > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "session_engine_config.window_turns",
                reason: "must be within 1..=64",
            });
        }
        if config.idle_archive_s == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "session_engine_config.idle_archive_s",
                reason: "must be > 0",
            });
        }
        Ok(Self {
            config,
            harm,
            detector,
            cooldowns,
            store,
            live: Mutex::new(HashMap::new()),
        })
    }

    pub fn cooldowns(&self) -> &CooldownManager {
        &self.cooldowns
    }

    pub fn store(&self) -> &Arc<Mutex<R>> {
        &self.store
    }

    pub fn live_sessions(&self) -> usize {
        lock(&self.live).len()
    }

    pub async fn process_turn(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        text: &str,
        now: MonotonicTimeNs,
    ) -> Result<TurnOutcome, TurnError> {
        if text.trim().is_empty() {
            return Err(TurnError::EmptyUtterance);
        }
        validate_utterance("turn.text", text)?;

        let mut session = self.lock_session(session_id, user_id, now)?;

        let admit = self.cooldowns.admit(user_id, now, || {
            lock(&self.store).cooldown_row(user_id)
        });
        if !admit.allowed {
            return self.commit_gated(session, admit.cause, admit.retry_after_seconds, now);
        }

        let (assessment, harm_code) = self.harm.assess(text, session.mode).await;
        // Nothing below suspends; dropping the future above leaves the session untouched.

        let window: Vec<Turn> = session.window.iter().cloned().collect();
        let check = self.detector.check(&window, text, assessment.level);
        let intent = infer_intent(text);
        let transition = ph1mode::next(session.mode, assessment.level, check.signal, false, intent);
        let directive = shape(transition.to, &assessment);
        let turn_id = TurnId(session.next_turn_seq);
        let turn = Turn::v1(
            turn_id,
            text.to_string(),
            assessment.clone(),
            transition.to,
            now,
        )?;
        let row = session.row(transition.to, now, session.next_turn_seq + 1)?;

        let commit = self.cooldowns.record_outcome(
            user_id,
            transition.to,
            now,
            || lock(&self.store).cooldown_row(user_id),
            |state| {
                lock(&self.store).commit_turn_rows(user_id, state.clone(), row, turn.clone())
            },
        )?;
        let (cool, cooldown_seconds) = match commit {
            OutcomeCommit::Applied {
                record,
                cooldown_seconds,
            } => (record, cooldown_seconds),
            OutcomeCommit::CooldownActive {
                retry_after_seconds,
            } => {
                info!(
                    session_id = %session_id,
                    user_id = %user_id,
                    retry_after_seconds,
                    "cooldown began while turn was in flight; turn gated"
                );
                return self.commit_gated(
                    session,
                    AdmitCause::CooldownActive,
                    retry_after_seconds,
                    now,
                );
            }
        };

        let context: Vec<String> = window.iter().map(|t| t.text.clone()).collect();
        let session_reset = session.reset_pending;
        session.mode = transition.to;
        session.window.push_back(turn);
        while session.window.len() > usize::from(self.config.window_turns) {
            session.window.pop_front();
        }
        session.next_turn_seq += 1;
        session.last_activity_at = now;
        session.reset_pending = false;

        debug!(
            session_id = %session_id,
            user_id = %user_id,
            from = transition.from.as_str(),
            mode = transition.to.as_str(),
            reason_code = transition.reason_code.0,
            harm_reason_code = harm_code.0,
            signal = check.signal.as_str(),
            degraded = assessment.degraded,
            "mode transition"
        );

        Ok(TurnOutcome {
            session_id,
            mode: transition.to,
            allowed: true,
            safety_level: assessment.level,
            reasons: assessment.reason_list(),
            confidence: assessment.confidence,
            degraded: assessment.degraded,
            signal: check.signal,
            cooldown_seconds,
            retry_after_seconds: 0,
            directive,
            turn_id: Some(turn_id),
            session_reset,
            reason_code: cool.reason_code.unwrap_or(transition.reason_code),
            context,
        })
    }

    /// Answers a turn that admission would reject before any input is processed, without
    /// logging an admission. `None` means the turn may proceed to `process_turn`.
    pub fn check_gate(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        now: MonotonicTimeNs,
    ) -> Result<Option<TurnOutcome>, TurnError> {
        let session = self.lock_session(session_id, user_id, now)?;
        let decision = self.cooldowns.peek(user_id, now, || {
            lock(&self.store).cooldown_row(user_id)
        });
        if decision.allowed {
            return Ok(None);
        }
        self.commit_gated(session, decision.cause, decision.retry_after_seconds, now)
            .map(Some)
    }

    /// Clears the user's cooldown record in memory and in the store.
    pub fn reset_cooldown(&self, user_id: &UserId) -> Result<(), StorageError> {
        self.cooldowns
            .reset(user_id, || lock(&self.store).clear_cooldown_row(user_id))
    }

    fn lock_session(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        now: MonotonicTimeNs,
    ) -> Result<OwnedMutexGuard<LiveSession>, TurnError> {
        let slot = self.slot(session_id, user_id, now)?;
        let session = slot
            .try_lock_owned()
            .map_err(|_| TurnError::ConcurrentTurnConflict)?;
        if session.archived {
            return Err(TurnError::SessionArchived);
        }
        if &session.user_id != user_id {
            return Err(TurnError::SessionOwnerMismatch);
        }
        Ok(session)
    }

    fn commit_gated(
        &self,
        mut session: OwnedMutexGuard<LiveSession>,
        cause: AdmitCause,
        retry_after_seconds: u32,
        now: MonotonicTimeNs,
    ) -> Result<TurnOutcome, TurnError> {
        let transition = ph1mode::next(
            session.mode,
            SafetyLevel::Safe,
            DetectorSignal::None,
            true,
            TurnIntent::none(),
        );
        let assessment = SafetyAssessment::not_assessed(session.mode);
        let directive = shape(transition.to, &assessment);
        let row = session.row(transition.to, now, session.next_turn_seq)?;
        lock(&self.store).upsert_session_row(row)?;

        let session_reset = session.reset_pending;
        session.mode = transition.to;
        session.last_activity_at = now;
        session.reset_pending = false;

        let cooldown_seconds = match cause {
            AdmitCause::CooldownActive => retry_after_seconds,
            AdmitCause::Admitted | AdmitCause::RateLimited => 0,
        };
        Ok(TurnOutcome {
            session_id: session.session_id,
            mode: transition.to,
            allowed: false,
            safety_level: assessment.level,
            reasons: Vec::new(),
            confidence: assessment.confidence,
            degraded: false,
            signal: DetectorSignal::None,
            cooldown_seconds,
            retry_after_seconds,
            directive,
            turn_id: None,
            session_reset,
            reason_code: transition.reason_code,
            context: Vec::new(),
        })
    }

    /// Finds the live session, rehydrating it from the store or creating it on first use.
    fn slot(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        now: MonotonicTimeNs,
    ) -> Result<LiveSlot, TurnError> {
        session_id.validate()?;
        if let Some(slot) = lock(&self.live).get(&session_id) {
            return Ok(Arc::clone(slot));
        }

        let (row, recent) = {
            let store = lock(&self.store);
            let row = store.session_row(session_id);
            let recent = match &row {
                Some(_) => store.recent_turn_rows(session_id, usize::from(self.config.window_turns)),
                None => Vec::new(),
            };
            (row, recent)
        };

        let live = match row {
            Some(row) if row.archived => return Err(TurnError::SessionArchived),
            Some(row) => {
                let (mode, reset_pending) = match restore_mode(&row.mode_token) {
                    Ok(mode) => (mode, false),
                    Err(err) => {
                        error!(
                            session_id = %session_id,
                            user_id = %row.user_id,
                            error = %err,
                            "invalid persisted session state; resetting session to INTAKE"
                        );
                        (INITIAL_MODE, true)
                    }
                };
                LiveSession {
                    session_id,
                    user_id: row.user_id,
                    mode,
                    window: recent.into_iter().collect(),
                    created_at: row.created_at,
                    last_activity_at: row.last_activity_at,
                    next_turn_seq: row.next_turn_seq,
                    archived: false,
                    reset_pending,
                }
            }
            None => {
                info!(session_id = %session_id, user_id = %user_id, "session opened");
                LiveSession {
                    session_id,
                    user_id: user_id.clone(),
                    mode: INITIAL_MODE,
                    window: VecDeque::new(),
                    created_at: now,
                    last_activity_at: now,
                    next_turn_seq: 1,
                    archived: false,
                    reset_pending: false,
                }
            }
        };

        let mut map = lock(&self.live);
        Ok(Arc::clone(
            map.entry(session_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(live))),
        ))
    }

    /// Archives sessions idle for at least the configured threshold and releases quiescent
    /// cooldown records. Sessions with a turn in flight are skipped until the next sweep.
    pub fn sweep_idle(&self, now: MonotonicTimeNs) -> usize {
        let idle_ns = u64::from(self.config.idle_archive_s) * NS_PER_SECOND;
        let candidates: Vec<(SessionId, LiveSlot)> = lock(&self.live)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let mut archived = 0;
        for (session_id, slot) in candidates {
            let Ok(mut session) = slot.try_lock_owned() else {
                continue;
            };
            if now.saturating_elapsed_since(session.last_activity_at) < idle_ns {
                continue;
            }
            let persisted = {
                let mut store = lock(&self.store);
                match store.session_row(session_id) {
                    Some(_) => store.archive_session_row(session_id),
                    None => Ok(()),
                }
            };
            if let Err(err) = persisted {
                error!(session_id = %session_id, error = %err, "failed to archive idle session");
                continue;
            }
            session.archived = true;
            lock(&self.live).remove(&session_id);
            archived += 1;
            info!(session_id = %session_id, user_id = %session.user_id, "idle session archived");
        }
        let evicted = self.cooldowns.evict_quiescent(now);
        if evicted > 0 {
            debug!(evicted, "quiescent cooldown records released");
        }
        archived
    }
}

fn restore_mode(token: &str) -> Result<Mode, SessionLoadError> {
    Mode::parse(token).ok_or_else(|| SessionLoadError::InvalidSessionState {
        token: token.to_string(),
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{CollaboratorError, HarmScoreSource, NoScoreSource};
    use crate::ph1harm::Ph1HarmWiringConfig;
    use async_trait::async_trait;
    use listener_engines::ph1cool::Ph1CoolConfig;
    use listener_engines::ph1harm::{Ph1HarmConfig, Ph1HarmRuntime};
    use listener_engines::ph1loop::Ph1LoopConfig;
    use listener_engines::ph1shape::{COOLDOWN_SCRIPT, SAFETY_SCRIPT};
    use listener_kernel_contracts::ph1harm::HarmScores;
    use listener_storage::ph1f::ListenerStore;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Classifier that finds nothing unless the text asks it to stall.
    struct Calm;

    #[async_trait]
    impl HarmScoreSource for Calm {
        async fn score(&self, text: &str, _mode: Mode) -> Result<HarmScores, CollaboratorError> {
            if text.contains("stall") {
                std::future::pending::<()>().await;
            }
            Ok(HarmScores::default())
        }
    }

    struct Gated {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl HarmScoreSource for Gated {
        async fn score(&self, _text: &str, _mode: Mode) -> Result<HarmScores, CollaboratorError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(HarmScores::default())
        }
    }

    /// Classifier that parks texts containing "hold" until released.
    struct Held {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl HarmScoreSource for Held {
        async fn score(&self, text: &str, _mode: Mode) -> Result<HarmScores, CollaboratorError> {
            if text.contains("hold") {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(HarmScores::default())
        }
    }

    /// Store wrapper whose turn commits can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: ListenerStore,
        fail_commits: bool,
    }

    impl SessionTurnRepo for FlakyStore {
        fn upsert_session_row(&mut self, row: SessionRow) -> Result<(), StorageError> {
            self.inner.upsert_session_row(row)
        }
        fn session_row(&self, session_id: SessionId) -> Option<SessionRow> {
            self.inner.session_row(session_id)
        }
        fn append_turn_row(&mut self, session_id: SessionId, turn: Turn) -> Result<(), StorageError> {
            self.inner.append_turn_row(session_id, turn)
        }
        fn recent_turn_rows(&self, session_id: SessionId, limit: usize) -> Vec<Turn> {
            self.inner.recent_turn_rows(session_id, limit)
        }
        fn archive_session_row(&mut self, session_id: SessionId) -> Result<(), StorageError> {
            self.inner.archive_session_row(session_id)
        }
    }

    impl CooldownRepo for FlakyStore {
        fn put_cooldown_row(
            &mut self,
            user_id: &UserId,
            state: listener_kernel_contracts::ph1cool::CooldownState,
        ) -> Result<(), StorageError> {
            self.inner.put_cooldown_row(user_id, state)
        }
        fn cooldown_row(
            &self,
            user_id: &UserId,
        ) -> Option<listener_kernel_contracts::ph1cool::CooldownState> {
            self.inner.cooldown_row(user_id)
        }
        fn clear_cooldown_row(&mut self, user_id: &UserId) -> Result<(), StorageError> {
            self.inner.clear_cooldown_row(user_id)
        }
    }

    impl TurnCommitRepo for FlakyStore {
        fn commit_turn_rows(
            &mut self,
            user_id: &UserId,
            cooldown: listener_kernel_contracts::ph1cool::CooldownState,
            row: SessionRow,
            turn: Turn,
        ) -> Result<(), StorageError> {
            if self.fail_commits {
                return Err(StorageError::Unavailable);
            }
            self.inner.commit_turn_rows(user_id, cooldown, row, turn)
        }
    }

    fn engine_with<R>(source: Arc<dyn HarmScoreSource>, store: R) -> SessionEngine<R>
    where
        R: TurnCommitRepo + Send + 'static,
    {
        let harm = Ph1HarmWiring::new(
            Ph1HarmWiringConfig {
                classifier_timeout_ms: 60_000,
            },
            Ph1HarmRuntime::new(Ph1HarmConfig::mvp_v1()),
            source,
        )
        .unwrap();
        SessionEngine::new(
            SessionEngineConfig::mvp_v1(),
            harm,
            Ph1LoopRuntime::new(Ph1LoopConfig::mvp_v1()),
            Arc::new(CooldownManager::new(Ph1CoolConfig::mvp_v1()).unwrap()),
            Arc::new(Mutex::new(store)),
        )
        .unwrap()
    }

    fn engine() -> SessionEngine<ListenerStore> {
        engine_with(Arc::new(Calm), ListenerStore::new_in_memory())
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn at(secs: u64) -> MonotonicTimeNs {
        MonotonicTimeNs::from_secs(secs)
    }

    const SID: SessionId = SessionId(0xA11CE);

    #[tokio::test]
    async fn at_sess_01_calm_first_turn_moves_intake_to_vent() {
        let e = engine();
        let out = e
            .process_turn(SID, &user("user_a"), "I feel kind of stressed", at(1))
            .await
            .unwrap();
        assert!(out.allowed);
        assert_eq!(out.mode, Mode::Vent);
        assert_eq!(out.safety_level, SafetyLevel::Safe);
        assert_eq!(out.directive.mode, Mode::Vent);
        assert_eq!(out.turn_id, Some(TurnId(1)));
        assert!(!out.degraded);
        assert_eq!(e.store().lock().unwrap().turn_count(SID), 1);
    }

    #[tokio::test]
    async fn at_sess_02_high_risk_turn_enters_safety() {
        let e = engine();
        let out = e
            .process_turn(SID, &user("user_a"), "I want to kill myself", at(1))
            .await
            .unwrap();
        assert_eq!(out.mode, Mode::Safety);
        assert_eq!(out.safety_level, SafetyLevel::HighRisk);
        assert_eq!(out.reasons, vec![HarmReason::SelfHarm]);
        assert!(out.directive.constraints.emergency_contact_framing);
        assert_eq!(out.directive.fixed_reply.as_deref(), Some(SAFETY_SCRIPT));
    }

    #[tokio::test]
    async fn at_sess_03_escalation_overrides_plan_request() {
        let e = engine();
        let u = user("user_a");
        e.process_turn(SID, &u, "I am furious about work today", at(1))
            .await
            .unwrap();
        e.process_turn(SID, &u, "they made me want revenge honestly", at(2))
            .await
            .unwrap();
        let out = e
            .process_turn(SID, &u, "I could smash something, what should I do", at(3))
            .await
            .unwrap();
        assert_eq!(out.signal, DetectorSignal::Escalating);
        assert_eq!(out.mode, Mode::Regulate);
        assert_eq!(out.context.len(), 2);
    }

    #[tokio::test]
    async fn at_sess_04_repeated_safety_imposes_cooldown() {
        let e = engine();
        let u = user("user_a");
        for _ in 0..2 {
            let out = e
                .process_turn(SID, &u, "I want to kill myself", at(100))
                .await
                .unwrap();
            assert_eq!(out.mode, Mode::Safety);
        }
        let out = e
            .process_turn(SID, &u, "are you still there", at(130))
            .await
            .unwrap();
        assert!(!out.allowed);
        assert_eq!(out.mode, Mode::Cooldown);
        assert_eq!(out.retry_after_seconds, 30);
        assert_eq!(out.cooldown_seconds, 30);
        assert_eq!(out.turn_id, None);
        assert_eq!(out.directive.fixed_reply.as_deref(), Some(COOLDOWN_SCRIPT));
        assert_eq!(e.store().lock().unwrap().turn_count(SID), 2);

        let after = e
            .process_turn(SID, &u, "okay I am back now", at(161))
            .await
            .unwrap();
        assert!(after.allowed);
        assert_eq!(after.mode, Mode::Intake);
    }

    #[tokio::test]
    async fn at_sess_05_unavailable_classifier_degrades_but_answers() {
        let e = engine_with(Arc::new(NoScoreSource), ListenerStore::new_in_memory());
        let out = e
            .process_turn(SID, &user("user_a"), "I want revenge", at(1))
            .await
            .unwrap();
        assert!(out.degraded);
        assert_eq!(out.safety_level, SafetyLevel::Elevated);
        assert_eq!(out.reasons, vec![HarmReason::Revenge]);
    }

    #[tokio::test(start_paused = true)]
    async fn at_sess_06_cancelled_turn_releases_lock_and_records_nothing() {
        let e = engine();
        let u = user("user_a");
        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            e.process_turn(SID, &u, "please stall here", at(1)),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(e.store().lock().unwrap().turn_count(SID), 0);

        let out = e
            .process_turn(SID, &u, "I feel kind of stressed", at(2))
            .await
            .unwrap();
        assert_eq!(out.turn_id, Some(TurnId(1)));
        assert!(out.context.is_empty());
    }

    #[tokio::test]
    async fn at_sess_07_second_turn_in_flight_conflicts() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let e = Arc::new(engine_with(
            Arc::new(Gated {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            }),
            ListenerStore::new_in_memory(),
        ));
        let first = {
            let e = Arc::clone(&e);
            tokio::spawn(async move {
                e.process_turn(SID, &user("user_a"), "first message here", at(1))
                    .await
            })
        };
        entered.notified().await;
        let second = e
            .process_turn(SID, &user("user_a"), "second message here", at(1))
            .await;
        assert!(matches!(second, Err(TurnError::ConcurrentTurnConflict)));
        assert!(second.unwrap_err().retryable());

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.turn_id, Some(TurnId(1)));
    }

    #[tokio::test]
    async fn at_sess_08_invalid_persisted_mode_resets_to_intake() {
        let mut store = ListenerStore::new_in_memory();
        store
            .upsert_session_row(
                SessionRow::v1(
                    SID,
                    user("user_a"),
                    "DANCE".to_string(),
                    at(1),
                    at(1),
                    1,
                    false,
                )
                .unwrap(),
            )
            .unwrap();
        let e = engine_with(Arc::new(Calm), store);
        let out = e
            .process_turn(SID, &user("user_a"), "I feel kind of stressed", at(5))
            .await
            .unwrap();
        assert!(out.session_reset);
        assert_eq!(out.mode, Mode::Vent);
        let row = e.store().lock().unwrap().session_row(SID).unwrap();
        assert_eq!(row.mode_token, "VENT");

        let again = e
            .process_turn(SID, &user("user_a"), "still a bit tense", at(6))
            .await
            .unwrap();
        assert!(!again.session_reset);
    }

    #[tokio::test]
    async fn at_sess_09_owner_mismatch_and_empty_text_are_rejected() {
        let e = engine();
        e.process_turn(SID, &user("user_a"), "hello there", at(1))
            .await
            .unwrap();
        let other = e
            .process_turn(SID, &user("user_b"), "hello there", at(2))
            .await;
        assert!(matches!(other, Err(TurnError::SessionOwnerMismatch)));
        let empty = e.process_turn(SID, &user("user_a"), "   ", at(3)).await;
        assert!(matches!(empty, Err(TurnError::EmptyUtterance)));
        assert!(!TurnError::EmptyUtterance.retryable());
    }

    #[tokio::test]
    async fn at_sess_10_storage_failure_commits_nothing() {
        let e = engine_with(Arc::new(Calm), FlakyStore::default());
        let u = user("user_a");
        e.store().lock().unwrap().fail_commits = true;
        for _ in 0..2 {
            let out = e
                .process_turn(SID, &u, "I want to kill myself", at(1))
                .await;
            assert!(matches!(out, Err(TurnError::Storage(_))));
        }
        // Neither failed SAFETY turn counted toward a cooldown.
        assert_eq!(e.cooldowns().remaining_s(&u, at(1)), 0);
        assert_eq!(e.cooldowns().snapshot(&u).unwrap().consecutive_safety, 0);
        {
            let store = e.store().lock().unwrap();
            assert!(store.session_row(SID).is_none());
            assert!(store.cooldown_row(&u).is_none());
        }

        e.store().lock().unwrap().fail_commits = false;
        let out = e
            .process_turn(SID, &u, "I feel kind of stressed", at(2))
            .await
            .unwrap();
        assert_eq!(out.turn_id, Some(TurnId(1)));
        assert_eq!(out.mode, Mode::Vent);
    }

    #[tokio::test]
    async fn at_sess_11_idle_sessions_are_archived() {
        let e = engine();
        let u = user("user_a");
        e.process_turn(SID, &u, "hello there", at(10)).await.unwrap();
        assert_eq!(e.sweep_idle(at(20)), 0);
        assert_eq!(e.cooldowns().tracked_users(), 1);
        assert_eq!(e.sweep_idle(at(10 + 1_800)), 1);
        assert_eq!(e.live_sessions(), 0);
        assert_eq!(e.cooldowns().tracked_users(), 0);
        assert!(e.store().lock().unwrap().session_row(SID).unwrap().archived);

        let out = e.process_turn(SID, &u, "hello again", at(2_000)).await;
        assert!(matches!(out, Err(TurnError::SessionArchived)));
    }

    #[tokio::test]
    async fn at_sess_12_session_rehydrates_from_store() {
        let store = {
            let e = engine();
            let u = user("user_a");
            e.process_turn(SID, &u, "I am furious about work today", at(1))
                .await
                .unwrap();
            e.process_turn(SID, &u, "they made me want revenge honestly", at(2))
                .await
                .unwrap();
            let store = e.store().lock().unwrap().clone();
            store
        };
        let e = engine_with(Arc::new(Calm), store);
        let out = e
            .process_turn(
                SID,
                &user("user_a"),
                "I could smash something, what should I do",
                at(3),
            )
            .await
            .unwrap();
        assert_eq!(out.signal, DetectorSignal::Escalating);
        assert_eq!(out.turn_id, Some(TurnId(3)));
    }

    #[tokio::test]
    async fn at_sess_13_turn_in_flight_when_cooldown_starts_is_gated() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let e = Arc::new(engine_with(
            Arc::new(Held {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            }),
            ListenerStore::new_in_memory(),
        ));
        let other = SessionId(0xB0B);
        let parked = {
            let e = Arc::clone(&e);
            tokio::spawn(async move {
                e.process_turn(other, &user("user_a"), "please hold on a moment", at(100))
                    .await
            })
        };
        entered.notified().await;

        let u = user("user_a");
        for _ in 0..2 {
            let out = e
                .process_turn(SID, &u, "I want to kill myself", at(100))
                .await
                .unwrap();
            assert_eq!(out.mode, Mode::Safety);
        }
        release.notify_one();

        let out = parked.await.unwrap().unwrap();
        assert!(!out.allowed);
        assert_eq!(out.mode, Mode::Cooldown);
        assert_eq!(out.turn_id, None);
        assert_eq!(out.cooldown_seconds, 60);
        assert_eq!(out.retry_after_seconds, 60);
        assert_eq!(out.directive.fixed_reply.as_deref(), Some(COOLDOWN_SCRIPT));
        let store = e.store().lock().unwrap();
        assert_eq!(store.turn_count(other), 0);
        assert_eq!(store.session_row(other).unwrap().mode_token, "COOLDOWN");
    }

    #[tokio::test]
    async fn at_sess_14_rate_limited_turn_is_gated_without_a_cooldown() {
        let e = engine();
        let u = user("user_a");
        for i in 0..20 {
            let text = format!("small update number {i} about today");
            assert!(e.process_turn(SID, &u, &text, at(1)).await.unwrap().allowed);
        }
        let out = e
            .process_turn(SID, &u, "one more small update", at(1))
            .await
            .unwrap();
        assert!(!out.allowed);
        assert_eq!(out.mode, Mode::Cooldown);
        assert_eq!(out.cooldown_seconds, 0);
        assert_eq!(out.retry_after_seconds, 60);
        assert_eq!(out.turn_id, None);
        assert!(out.reasons.is_empty());
        assert_eq!(out.directive.fixed_reply.as_deref(), Some(COOLDOWN_SCRIPT));
        {
            let store = e.store().lock().unwrap();
            assert_eq!(store.turn_count(SID), 20);
            assert_eq!(store.session_row(SID).unwrap().mode_token, "COOLDOWN");
        }
        assert_eq!(e.cooldowns().remaining_s(&u, at(1)), 0);

        let after = e
            .process_turn(SID, &u, "okay back again", at(61))
            .await
            .unwrap();
        assert!(after.allowed);
        assert_eq!(after.mode, Mode::Intake);
        assert_eq!(after.turn_id, Some(TurnId(21)));
    }

    #[tokio::test]
    async fn at_sess_15_cooldown_reset_clears_persisted_state() {
        let e = engine();
        let u = user("user_a");
        for _ in 0..2 {
            e.process_turn(SID, &u, "I want to kill myself", at(100))
                .await
                .unwrap();
        }
        assert!(e.store().lock().unwrap().cooldown_row(&u).is_some());

        e.reset_cooldown(&u).unwrap();
        assert!(e.store().lock().unwrap().cooldown_row(&u).is_none());
        let out = e
            .process_turn(SID, &u, "I feel kind of stressed", at(110))
            .await
            .unwrap();
        assert!(out.allowed);
        assert_eq!(out.mode, Mode::Intake);

        let store = e.store().lock().unwrap().clone();
        let restarted = engine_with(Arc::new(Calm), store);
        let out = restarted
            .process_turn(SID, &u, "still a bit tense", at(120))
            .await
            .unwrap();
        assert!(out.allowed);
    }
}
