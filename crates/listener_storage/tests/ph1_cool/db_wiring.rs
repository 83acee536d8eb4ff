#![forbid(unsafe_code)]

use listener_kernel_contracts::ph1cool::CooldownState;
use listener_kernel_contracts::ph1sess::UserId;
use listener_kernel_contracts::MonotonicTimeNs;
use listener_storage::ph1f::{ListenerStore, StorageError};
use listener_storage::repo::CooldownRepo;

#[test]
fn at_cool_db_01_put_get_clear() {
    let mut s = ListenerStore::new_in_memory();
    let u = UserId::new("user_a").unwrap();
    assert!(s.cooldown_row(&u).is_none());

    let mut state = CooldownState::new();
    state.cooldown_until = Some(MonotonicTimeNs::from_secs(60));
    state.cooldown_triggers = 1;
    state.last_trigger_at = Some(MonotonicTimeNs::from_secs(0));
    s.put_cooldown_row(&u, state.clone()).unwrap();
    assert_eq!(s.cooldown_row(&u), Some(state));

    s.clear_cooldown_row(&u).unwrap();
    assert!(s.cooldown_row(&u).is_none());
}

#[test]
fn at_cool_db_02_inconsistent_state_is_rejected() {
    let mut s = ListenerStore::new_in_memory();
    let u = UserId::new("user_a").unwrap();
    let mut state = CooldownState::new();
    state.cooldown_triggers = 2;
    assert!(matches!(
        s.put_cooldown_row(&u, state),
        Err(StorageError::ContractViolation(_))
    ));
}

#[test]
fn at_cool_db_03_cooldown_survives_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let u = UserId::new("user_a").unwrap();
    let mut state = CooldownState::new();
    state.admissions.push_back(MonotonicTimeNs::from_secs(3));
    state.consecutive_safety = 1;
    state.safety_streak_started_at = Some(MonotonicTimeNs::from_secs(3));

    let mut s = ListenerStore::open_snapshot(&path).unwrap();
    s.put_cooldown_row(&u, state.clone()).unwrap();
    s.flush().unwrap();

    let loaded = ListenerStore::open_snapshot(&path).unwrap();
    assert_eq!(loaded.cooldown_row(&u), Some(state));
}
