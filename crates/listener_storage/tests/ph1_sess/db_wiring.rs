#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use listener_kernel_contracts::ph1harm::{AssessmentSource, SafetyAssessment, SafetyLevel};
use listener_kernel_contracts::ph1mode::Mode;
use listener_kernel_contracts::ph1sess::{SessionId, Turn, TurnId, UserId};
use listener_kernel_contracts::MonotonicTimeNs;
use listener_storage::ph1f::{ListenerStore, SessionRow, StorageError};
use listener_kernel_contracts::ph1cool::CooldownState;
use listener_storage::repo::{CooldownRepo, SessionTurnRepo, TurnCommitRepo};

fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

fn row(session: u128, user_id: &str, mode: &str, next_turn_seq: u64) -> SessionRow {
    SessionRow::v1(
        SessionId(session),
        user(user_id),
        mode.to_string(),
        MonotonicTimeNs(1),
        MonotonicTimeNs(1),
        next_turn_seq,
        false,
    )
    .unwrap()
}

fn turn(id: u64, text: &str) -> Turn {
    let assessment = SafetyAssessment::v1(
        SafetyLevel::Safe,
        BTreeSet::new(),
        0.9,
        false,
        AssessmentSource::Combined,
        Mode::Intake,
    )
    .unwrap();
    Turn::v1(
        TurnId(id),
        text.to_string(),
        assessment,
        Mode::Vent,
        MonotonicTimeNs(10 + id),
    )
    .unwrap()
}

#[test]
fn at_sess_db_01_turns_require_session_and_are_append_only() {
    let mut s = ListenerStore::new_in_memory();
    let orphan = s.append_turn_row(SessionId(7), turn(1, "hello"));
    assert!(matches!(
        orphan,
        Err(StorageError::ForeignKeyViolation { table: "turns", .. })
    ));

    s.upsert_session_row(row(7, "user_a", "INTAKE", 1)).unwrap();
    s.append_turn_row(SessionId(7), turn(1, "first")).unwrap();
    s.append_turn_row(SessionId(7), turn(2, "second")).unwrap();
    let replay = s.append_turn_row(SessionId(7), turn(2, "second again"));
    assert!(matches!(
        replay,
        Err(StorageError::AppendOnlyViolation { table: "turns" })
    ));

    let recent = s.recent_turn_rows(SessionId(7), 1);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].text, "second");
}

#[test]
fn at_sess_db_02_session_owner_cannot_change() {
    let mut s = ListenerStore::new_in_memory();
    s.upsert_session_row(row(9, "user_a", "VENT", 3)).unwrap();
    let hijack = s.upsert_session_row(row(9, "user_b", "VENT", 3));
    assert!(matches!(hijack, Err(StorageError::DuplicateKey { .. })));
    let rewind = s.upsert_session_row(row(9, "user_a", "VENT", 2));
    assert!(matches!(rewind, Err(StorageError::AppendOnlyViolation { .. })));
}

#[test]
fn at_sess_db_03_snapshot_round_trip_preserves_unknown_mode_token() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("listener.json");

    let mut s = ListenerStore::open_snapshot(&path).unwrap();
    s.upsert_session_row(row(11, "user_a", "VENT", 2)).unwrap();
    s.append_turn_row(SessionId(11), turn(1, "first")).unwrap();
    s.upsert_session_row(row(12, "user_a", "LEGACY_MODE", 1)).unwrap();
    s.archive_session_row(SessionId(12)).unwrap();
    assert!(s.flush().unwrap());

    let loaded = ListenerStore::open_snapshot(&path).unwrap();
    assert_eq!(loaded.session_row(SessionId(11)).unwrap().mode_token, "VENT");
    assert_eq!(loaded.recent_turn_rows(SessionId(11), 8), vec![turn(1, "first")]);
    let legacy = loaded.session_row(SessionId(12)).unwrap();
    assert_eq!(legacy.mode_token, "LEGACY_MODE");
    assert!(legacy.archived);
}

#[test]
fn at_sess_db_04_tampered_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("listener.json");
    let mut s = ListenerStore::open_snapshot(&path).unwrap();
    s.upsert_session_row(row(21, "user_a", "VENT", 1)).unwrap();
    s.flush().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, raw.replace("user_a", "user_z")).unwrap();
    assert!(matches!(
        ListenerStore::open_snapshot(&path),
        Err(StorageError::ChecksumMismatch)
    ));
}

#[test]
fn at_sess_db_05_in_memory_store_does_not_flush() {
    let s = ListenerStore::new_in_memory();
    assert!(!s.flush().unwrap());
    assert!(s.snapshot_path().is_none());
}

#[test]
fn at_sess_db_06_turn_commit_is_all_or_nothing() {
    let mut s = ListenerStore::new_in_memory();
    let u = user("user_a");
    let mut streak = CooldownState::new();
    streak.consecutive_safety = 1;
    streak.safety_streak_started_at = Some(MonotonicTimeNs(10));

    s.commit_turn_rows(&u, streak.clone(), row(31, "user_a", "SAFETY", 2), turn(1, "first"))
        .unwrap();
    assert_eq!(s.cooldown_row(&u), Some(streak.clone()));
    assert_eq!(s.turn_count(SessionId(31)), 1);

    // A replayed turn id fails the append check; nothing else may land either.
    let mut next = streak.clone();
    next.consecutive_safety = 2;
    let replay = s.commit_turn_rows(&u, next, row(31, "user_a", "VENT", 3), turn(1, "again"));
    assert!(matches!(
        replay,
        Err(StorageError::AppendOnlyViolation { table: "turns" })
    ));
    assert_eq!(s.cooldown_row(&u), Some(streak));
    let header = s.session_row(SessionId(31)).unwrap();
    assert_eq!(header.mode_token, "SAFETY");
    assert_eq!(header.next_turn_seq, 2);
    assert_eq!(s.turn_count(SessionId(31)), 1);
}

#[test]
fn at_sess_db_07_retention_caps_history_and_archive_releases_it() {
    let mut s = ListenerStore::new_in_memory().with_turn_retention(3);
    s.upsert_session_row(row(41, "user_a", "VENT", 1)).unwrap();
    for id in 1..=5 {
        s.append_turn_row(SessionId(41), turn(id, "again")).unwrap();
    }
    assert_eq!(s.turn_count(SessionId(41)), 3);
    let recent = s.recent_turn_rows(SessionId(41), 8);
    assert_eq!(recent.first().unwrap().turn_id, TurnId(3));
    // Ordering still holds against the released rows' successors.
    assert!(s.append_turn_row(SessionId(41), turn(5, "late")).is_err());

    s.archive_session_row(SessionId(41)).unwrap();
    assert_eq!(s.turn_count(SessionId(41)), 0);
    assert!(s.session_row(SessionId(41)).unwrap().archived);
}

#[test]
fn at_sess_db_08_snapshot_job_writes_detached_copy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("listener.json");
    let mut s = ListenerStore::open_snapshot(&path).unwrap();
    s.upsert_session_row(row(51, "user_a", "VENT", 2)).unwrap();
    let job = s.snapshot_job().unwrap();
    assert_eq!(job.path(), path.as_path());

    // Changes after the copy are not part of this write.
    s.upsert_session_row(row(52, "user_a", "VENT", 1)).unwrap();
    job.write().unwrap();
    let loaded = ListenerStore::open_snapshot(&path).unwrap();
    assert!(loaded.session_row(SessionId(51)).is_some());
    assert!(loaded.session_row(SessionId(52)).is_none());
    assert!(ListenerStore::new_in_memory().snapshot_job().is_none());
}
