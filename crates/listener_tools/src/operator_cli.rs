#![forbid(unsafe_code)]

use std::path::Path;

use listener_engines::ph1auth::{AuthFailure, SignedTokenVerifier};
use listener_kernel_contracts::ph1sess::UserId;
use listener_storage::ph1f::ListenerStore;

pub fn build_verifier(secret: &str) -> Result<SignedTokenVerifier, String> {
    SignedTokenVerifier::new(secret.as_bytes().to_vec())
        .map_err(|_| "token secret must be at least 16 bytes".to_string())
}

pub fn execute_token_command(
    verifier: &SignedTokenVerifier,
    subcommand: &str,
    arg: Option<&str>,
) -> Result<String, String> {
    match subcommand {
        "mint" => {
            let raw = arg.ok_or_else(|| "usage: listener token mint <user_id>".to_string())?;
            let user_id = UserId::new(raw).map_err(|e| format!("invalid user id: {e}"))?;
            Ok(verifier.mint(&user_id))
        }
        "verify" => {
            let token = arg.ok_or_else(|| "usage: listener token verify <token>".to_string())?;
            match verifier.verify(token) {
                Ok(user_id) => Ok(format!("VALID {user_id}")),
                Err(AuthFailure::Malformed) => Err("INVALID malformed token".to_string()),
                Err(AuthFailure::SignatureMismatch) => {
                    Err("INVALID signature mismatch".to_string())
                }
            }
        }
        _ => Err(format!(
            "unknown token subcommand: {subcommand}. expected one of: mint, verify"
        )),
    }
}

/// Summarizes a store snapshot: one line per session plus totals.
pub fn execute_store_stats(path: &Path) -> Result<String, String> {
    if !path.exists() {
        return Err(format!("no store snapshot at '{}'", path.display()));
    }
    let store = ListenerStore::open_snapshot(path)
        .map_err(|e| format!("failed to load store snapshot '{}': {e}", path.display()))?;
    let mut lines = Vec::new();
    let mut total_turns = 0;
    let mut archived = 0;
    for row in store.session_rows() {
        let turns = store.turn_count(row.session_id);
        total_turns += turns;
        if row.archived {
            archived += 1;
        }
        lines.push(format!(
            "{} user={} mode={} turns={} archived={}",
            row.session_id, row.user_id, row.mode_token, turns, row.archived
        ));
    }
    lines.push(format!(
        "sessions={} archived={} turns={}",
        lines.len(),
        archived,
        total_turns
    ));
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use listener_kernel_contracts::ph1harm::{AssessmentSource, SafetyAssessment, SafetyLevel};
    use listener_kernel_contracts::ph1mode::Mode;
    use listener_kernel_contracts::ph1sess::{SessionId, Turn, TurnId};
    use listener_kernel_contracts::MonotonicTimeNs;
    use listener_storage::ph1f::SessionRow;
    use listener_storage::repo::SessionTurnRepo;
    use std::collections::BTreeSet;

    #[test]
    fn at_tools_01_mint_then_verify() {
        let v = build_verifier("tools-secret-0123456789").unwrap();
        let token = execute_token_command(&v, "mint", Some("user_a")).unwrap();
        assert_eq!(
            execute_token_command(&v, "verify", Some(&token)).unwrap(),
            "VALID user_a"
        );
        let other = build_verifier("another-secret-987654321").unwrap();
        assert!(execute_token_command(&other, "verify", Some(&token))
            .unwrap_err()
            .contains("signature mismatch"));
    }

    #[test]
    fn at_tools_02_bad_input_is_rejected() {
        assert!(build_verifier("short").is_err());
        let v = build_verifier("tools-secret-0123456789").unwrap();
        assert!(execute_token_command(&v, "mint", None).is_err());
        assert!(execute_token_command(&v, "mint", Some("bad user")).is_err());
        assert!(execute_token_command(&v, "rotate", None)
            .unwrap_err()
            .contains("expected one of"));
    }

    #[test]
    fn at_tools_03_store_stats_reads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let mut store = ListenerStore::open_snapshot(&path).unwrap();
        let sid = SessionId(0xfeed);
        let t = MonotonicTimeNs::from_secs(1);
        store
            .upsert_session_row(
                SessionRow::v1(sid, UserId::new("user_a").unwrap(), "VENT".into(), t, t, 2, false)
                    .unwrap(),
            )
            .unwrap();
        let assessment = SafetyAssessment::v1(
            SafetyLevel::Safe,
            BTreeSet::new(),
            0.9,
            false,
            AssessmentSource::Combined,
            Mode::Intake,
        )
        .unwrap();
        store
            .append_turn_row(
                sid,
                Turn::v1(TurnId(1), "hello".into(), assessment, Mode::Vent, t).unwrap(),
            )
            .unwrap();
        store.flush().unwrap();

        let out = execute_store_stats(&path).unwrap();
        assert!(out.contains("user=user_a mode=VENT turns=1 archived=false"));
        assert!(out.ends_with("sessions=1 archived=0 turns=1"));
        assert!(execute_store_stats(&dir.path().join("missing.json")).is_err());
    }
}
