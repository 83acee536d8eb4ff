#![forbid(unsafe_code)]

use listener_kernel_contracts::ph1cool::CooldownState;
use listener_kernel_contracts::ph1sess::{SessionId, Turn, UserId};

use crate::ph1f::{ListenerStore, SessionRow, StorageError};

/// Typed repository interface for session headers and the append-only turn ledger.
pub trait SessionTurnRepo {
    fn upsert_session_row(&mut self, row: SessionRow) -> Result<(), StorageError>;
    fn session_row(&self, session_id: SessionId) -> Option<SessionRow>;
    fn append_turn_row(&mut self, session_id: SessionId, turn: Turn) -> Result<(), StorageError>;
    /// Most recent `limit` turns, oldest first.
    fn recent_turn_rows(&self, session_id: SessionId, limit: usize) -> Vec<Turn>;
    fn archive_session_row(&mut self, session_id: SessionId) -> Result<(), StorageError>;
}

/// Typed repository interface for per-user cooldown state.
pub trait CooldownRepo {
    fn put_cooldown_row(
        &mut self,
        user_id: &UserId,
        state: CooldownState,
    ) -> Result<(), StorageError>;
    fn cooldown_row(&self, user_id: &UserId) -> Option<CooldownState>;
    fn clear_cooldown_row(&mut self, user_id: &UserId) -> Result<(), StorageError>;
}

/// Persists everything one processed turn produces, all or nothing.
pub trait TurnCommitRepo: SessionTurnRepo + CooldownRepo {
    fn commit_turn_rows(
        &mut self,
        user_id: &UserId,
        cooldown: CooldownState,
        row: SessionRow,
        turn: Turn,
    ) -> Result<(), StorageError>;
}

impl SessionTurnRepo for ListenerStore {
    fn upsert_session_row(&mut self, row: SessionRow) -> Result<(), StorageError> {
        self.upsert_session(row)
    }

    fn session_row(&self, session_id: SessionId) -> Option<SessionRow> {
        self.session(session_id).cloned()
    }

    fn append_turn_row(&mut self, session_id: SessionId, turn: Turn) -> Result<(), StorageError> {
        self.append_turn(session_id, turn)
    }

    fn recent_turn_rows(&self, session_id: SessionId, limit: usize) -> Vec<Turn> {
        self.recent_turns(session_id, limit)
    }

    fn archive_session_row(&mut self, session_id: SessionId) -> Result<(), StorageError> {
        self.archive_session(session_id)
    }
}

impl CooldownRepo for ListenerStore {
    fn put_cooldown_row(
        &mut self,
        user_id: &UserId,
        state: CooldownState,
    ) -> Result<(), StorageError> {
        self.put_cooldown(user_id, state)
    }

    fn cooldown_row(&self, user_id: &UserId) -> Option<CooldownState> {
        self.cooldown(user_id).cloned()
    }

    fn clear_cooldown_row(&mut self, user_id: &UserId) -> Result<(), StorageError> {
        self.clear_cooldown(user_id);
        Ok(())
    }
}

impl TurnCommitRepo for ListenerStore {
    fn commit_turn_rows(
        &mut self,
        user_id: &UserId,
        cooldown: CooldownState,
        row: SessionRow,
        turn: Turn,
    ) -> Result<(), StorageError> {
        self.commit_turn(user_id, cooldown, row, turn)
    }
}
