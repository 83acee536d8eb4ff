#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use listener_kernel_contracts::ph1cool::CooldownState;
use listener_kernel_contracts::ph1sess::{SessionId, Turn, UserId};
use listener_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
/// Turns kept per live session; older ones are released as new ones arrive.
pub const DEFAULT_TURN_RETENTION: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("append-only violation on {table}")]
    AppendOnlyViolation { table: &'static str },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
    #[error("snapshot io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,
    #[error("snapshot format version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("store unavailable")]
    Unavailable,
}

/// Persisted session header. `mode_token` is kept as the raw persisted token so that a
/// corrupted or foreign value surfaces at load time instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub mode_token: String,
    pub created_at: MonotonicTimeNs,
    pub last_activity_at: MonotonicTimeNs,
    pub next_turn_seq: u64,
    pub archived: bool,
}

impl SessionRow {
    pub fn v1(
        session_id: SessionId,
        user_id: UserId,
        mode_token: String,
        created_at: MonotonicTimeNs,
        last_activity_at: MonotonicTimeNs,
        next_turn_seq: u64,
        archived: bool,
    ) -> Result<Self, ContractViolation> {
        let row = Self {
            session_id,
            user_id,
            mode_token,
            created_at,
            last_activity_at,
            next_turn_seq,
            archived,
        };
        row.validate()?;
        Ok(row)
    }
}

impl Validate for SessionRow {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.session_id.validate()?;
        if self.mode_token.is_empty() || self.mode_token.len() > 32 {
            return Err(ContractViolation::InvalidValue {
                field: "session_row.mode_token",
                reason: "must be 1..=32 chars",
            });
        }
        if self.last_activity_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "session_row.last_activity_at",
                reason: "must be >= created_at",
            });
        }
        if self.next_turn_seq == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "session_row.next_turn_seq",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SnapshotBody {
    sessions: Vec<SessionRow>,
    turns: Vec<(SessionId, Vec<Turn>)>,
    cooldowns: Vec<(UserId, CooldownState)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    format_version: u32,
    checksum_sha256: String,
    payload_json: String,
}

/// A point-in-time copy of the tables, written without holding the store.
#[derive(Debug)]
pub struct SnapshotJob {
    path: PathBuf,
    body: SnapshotBody,
}

impl SnapshotJob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(self) -> Result<(), StorageError> {
        write_snapshot(&self.path, &self.body)
    }
}

/// In-memory session/turn/cooldown tables with an optional JSON snapshot on disk.
#[derive(Debug, Clone)]
pub struct ListenerStore {
    sessions: BTreeMap<SessionId, SessionRow>,
    turns: BTreeMap<SessionId, VecDeque<Turn>>,
    cooldowns: BTreeMap<UserId, CooldownState>,
    snapshot_path: Option<PathBuf>,
    turn_retention: usize,
}

impl Default for ListenerStore {
    fn default() -> Self {
        Self {
            sessions: BTreeMap::new(),
            turns: BTreeMap::new(),
            cooldowns: BTreeMap::new(),
            snapshot_path: None,
            turn_retention: DEFAULT_TURN_RETENTION,
        }
    }
}

impl ListenerStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    /// Caps the turns kept per session. Values below 1 are raised to 1.
    pub fn with_turn_retention(mut self, limit: usize) -> Self {
        self.turn_retention = limit.max(1);
        for rows in self.turns.values_mut() {
            trim_front(rows, self.turn_retention);
        }
        self
    }

    /// Opens a store backed by `path`, loading the snapshot when one exists.
    pub fn open_snapshot(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut store = if path.exists() {
            Self::load_snapshot(&path)?
        } else {
            Self::new_in_memory()
        };
        store.snapshot_path = Some(path);
        Ok(store)
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Writes the snapshot when the store is file-backed. Returns whether anything was written.
    pub fn flush(&self) -> Result<bool, StorageError> {
        match self.snapshot_job() {
            Some(job) => {
                job.write()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Copies the tables for a later [`SnapshotJob::write`]; `None` when not file-backed.
    pub fn snapshot_job(&self) -> Option<SnapshotJob> {
        let path = self.snapshot_path.clone()?;
        Some(SnapshotJob {
            path,
            body: self.snapshot_body(),
        })
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), StorageError> {
        write_snapshot(path, &self.snapshot_body())
    }

    fn snapshot_body(&self) -> SnapshotBody {
        SnapshotBody {
            sessions: self.sessions.values().cloned().collect(),
            turns: self
                .turns
                .iter()
                .map(|(id, turns)| (*id, turns.iter().cloned().collect()))
                .collect(),
            cooldowns: self
                .cooldowns
                .iter()
                .map(|(u, s)| (u.clone(), s.clone()))
                .collect(),
        }
    }

    pub fn load_snapshot(path: &Path) -> Result<Self, StorageError> {
        let bytes = fs::read(path)?;
        let envelope: SnapshotEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(envelope.format_version));
        }
        if sha256_hex(envelope.payload_json.as_bytes()) != envelope.checksum_sha256 {
            return Err(StorageError::ChecksumMismatch);
        }
        let body: SnapshotBody = serde_json::from_str(&envelope.payload_json)?;
        let mut store = Self::new_in_memory();
        for row in body.sessions {
            row.validate()?;
            store.sessions.insert(row.session_id, row);
        }
        for (session_id, turns) in body.turns {
            if !store.sessions.contains_key(&session_id) {
                return Err(StorageError::ForeignKeyViolation {
                    table: "turns",
                    key: session_id.to_hex(),
                });
            }
            for turn in &turns {
                turn.validate()?;
            }
            store.turns.insert(session_id, turns.into());
        }
        for (user_id, state) in body.cooldowns {
            state.validate()?;
            store.cooldowns.insert(user_id, state);
        }
        Ok(store)
    }

    pub fn session_rows(&self) -> impl Iterator<Item = &SessionRow> {
        self.sessions.values()
    }

    pub fn turn_count(&self, session_id: SessionId) -> usize {
        self.turns.get(&session_id).map_or(0, VecDeque::len)
    }

    pub(crate) fn upsert_session(&mut self, row: SessionRow) -> Result<(), StorageError> {
        self.check_session_upsert(&row)?;
        self.sessions.insert(row.session_id, row);
        Ok(())
    }

    fn check_session_upsert(&self, row: &SessionRow) -> Result<(), StorageError> {
        row.validate()?;
        if let Some(existing) = self.sessions.get(&row.session_id) {
            if existing.user_id != row.user_id {
                return Err(StorageError::DuplicateKey {
                    table: "sessions",
                    key: row.session_id.to_hex(),
                });
            }
            if row.next_turn_seq < existing.next_turn_seq {
                return Err(StorageError::AppendOnlyViolation { table: "sessions" });
            }
        }
        Ok(())
    }

    pub(crate) fn session(&self, session_id: SessionId) -> Option<&SessionRow> {
        self.sessions.get(&session_id)
    }

    pub(crate) fn append_turn(
        &mut self,
        session_id: SessionId,
        turn: Turn,
    ) -> Result<(), StorageError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: "turns",
                key: session_id.to_hex(),
            });
        }
        self.check_turn_append(session_id, &turn)?;
        self.push_turn(session_id, turn);
        Ok(())
    }

    fn check_turn_append(&self, session_id: SessionId, turn: &Turn) -> Result<(), StorageError> {
        turn.validate()?;
        let last = self.turns.get(&session_id).and_then(VecDeque::back);
        if last.is_some_and(|last| last.turn_id >= turn.turn_id) {
            return Err(StorageError::AppendOnlyViolation { table: "turns" });
        }
        Ok(())
    }

    fn push_turn(&mut self, session_id: SessionId, turn: Turn) {
        let rows = self.turns.entry(session_id).or_default();
        rows.push_back(turn);
        trim_front(rows, self.turn_retention);
    }

    /// Writes the cooldown row, the session header and the turn of one processed turn.
    /// Every check runs before the first write, so an error leaves all three tables as they were.
    pub(crate) fn commit_turn(
        &mut self,
        user_id: &UserId,
        cooldown: CooldownState,
        row: SessionRow,
        turn: Turn,
    ) -> Result<(), StorageError> {
        cooldown.validate()?;
        self.check_session_upsert(&row)?;
        if row.archived {
            return Err(StorageError::AppendOnlyViolation { table: "sessions" });
        }
        let session_id = row.session_id;
        self.check_turn_append(session_id, &turn)?;

        self.cooldowns.insert(user_id.clone(), cooldown);
        self.sessions.insert(session_id, row);
        self.push_turn(session_id, turn);
        Ok(())
    }

    pub(crate) fn recent_turns(&self, session_id: SessionId, limit: usize) -> Vec<Turn> {
        match self.turns.get(&session_id) {
            Some(rows) => rows
                .iter()
                .skip(rows.len().saturating_sub(limit))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn archive_session(&mut self, session_id: SessionId) -> Result<(), StorageError> {
        let row = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "sessions",
                key: session_id.to_hex(),
            })?;
        row.archived = true;
        // Archived sessions never take another turn or rehydrate.
        self.turns.remove(&session_id);
        Ok(())
    }

    pub(crate) fn put_cooldown(
        &mut self,
        user_id: &UserId,
        state: CooldownState,
    ) -> Result<(), StorageError> {
        state.validate()?;
        self.cooldowns.insert(user_id.clone(), state);
        Ok(())
    }

    pub(crate) fn cooldown(&self, user_id: &UserId) -> Option<&CooldownState> {
        self.cooldowns.get(user_id)
    }

    pub(crate) fn clear_cooldown(&mut self, user_id: &UserId) {
        self.cooldowns.remove(user_id);
    }
}

fn write_snapshot(path: &Path, body: &SnapshotBody) -> Result<(), StorageError> {
    let payload_json = serde_json::to_string(body)?;
    let envelope = SnapshotEnvelope {
        format_version: SNAPSHOT_FORMAT_VERSION,
        checksum_sha256: sha256_hex(payload_json.as_bytes()),
        payload_json,
    };
    let bytes = serde_json::to_vec_pretty(&envelope)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn trim_front(rows: &mut VecDeque<Turn>, limit: usize) {
    while rows.len() > limit {
        rows.pop_front();
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
