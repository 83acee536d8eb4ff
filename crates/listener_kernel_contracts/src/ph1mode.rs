#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, ReasonCodeId, SchemaVersion, Validate};

pub const PH1MODE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Conversational policy state of a session. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Intake,
    Vent,
    Reflect,
    Regulate,
    Plan,
    Safety,
    Cooldown,
}

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::Intake,
        Mode::Vent,
        Mode::Reflect,
        Mode::Regulate,
        Mode::Plan,
        Mode::Safety,
        Mode::Cooldown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Intake => "INTAKE",
            Mode::Vent => "VENT",
            Mode::Reflect => "REFLECT",
            Mode::Regulate => "REGULATE",
            Mode::Plan => "PLAN",
            Mode::Safety => "SAFETY",
            Mode::Cooldown => "COOLDOWN",
        }
    }

    /// Parses a persisted mode token. Unknown tokens are a consistency fault for the caller.
    pub fn parse(token: &str) -> Option<Mode> {
        Mode::ALL.into_iter().find(|m| m.as_str() == token)
    }
}

/// A mode the user asked for in so many words ("just listen", "help me calm down").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModeRequest {
    Vent,
    Reflect,
    Regulate,
    Plan,
}

impl ModeRequest {
    pub fn mode(self) -> Mode {
        match self {
            ModeRequest::Vent => Mode::Vent,
            ModeRequest::Reflect => Mode::Reflect,
            ModeRequest::Regulate => Mode::Regulate,
            ModeRequest::Plan => Mode::Plan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentCue {
    None,
    Question,
    StuckFeeling,
    NextSteps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnIntent {
    pub explicit: Option<ModeRequest>,
    pub cue: IntentCue,
}

impl TurnIntent {
    pub fn none() -> Self {
        Self {
            explicit: None,
            cue: IntentCue::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModeTransition {
    pub schema_version: SchemaVersion,
    pub from: Mode,
    pub to: Mode,
    pub allowed: bool,
    pub reason_code: ReasonCodeId,
}

impl ModeTransition {
    pub fn v1(
        from: Mode,
        to: Mode,
        allowed: bool,
        reason_code: ReasonCodeId,
    ) -> Result<Self, ContractViolation> {
        let t = Self {
            schema_version: PH1MODE_CONTRACT_VERSION,
            from,
            to,
            allowed,
            reason_code,
        };
        t.validate()?;
        Ok(t)
    }
}

impl Validate for ModeTransition {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1MODE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "mode_transition.schema_version",
                reason: "must match PH1MODE_CONTRACT_VERSION",
            });
        }
        // Only the cooldown gate blocks a turn, and it always lands in COOLDOWN.
        if self.allowed == (self.to == Mode::Cooldown) {
            return Err(ContractViolation::InvalidValue {
                field: "mode_transition.allowed",
                reason: "must be false exactly when to=COOLDOWN",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_mode_contract_01_tokens_round_trip_and_unknown_is_none() {
        for m in Mode::ALL {
            assert_eq!(Mode::parse(m.as_str()), Some(m));
        }
        assert_eq!(Mode::parse("SLEEP"), None);
        assert_eq!(Mode::parse("vent"), None);
    }

    #[test]
    fn at_mode_contract_02_cooldown_transition_must_block() {
        assert!(ModeTransition::v1(Mode::Vent, Mode::Cooldown, false, ReasonCodeId(1)).is_ok());
        assert!(ModeTransition::v1(Mode::Vent, Mode::Cooldown, true, ReasonCodeId(1)).is_err());
        assert!(ModeTransition::v1(Mode::Vent, Mode::Plan, false, ReasonCodeId(1)).is_err());
    }
}
