#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ph1harm::SafetyAssessment;
use crate::ph1mode::Mode;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const PH1SESS_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_UTTERANCE_CHARS: usize = 4_000;

/// Verified, opaque user identity handle supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "user_id",
                reason: "must not be empty",
            });
        }
        if id.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: "user_id",
                reason: "must be <= 128 chars",
            });
        }
        crate::common::validate_token("user_id", &id, 128)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        UserId::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialized as 32 lowercase hex digits so JSON clients never round it through a float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(pub u128);

impl SessionId {
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn parse_hex(raw: &str) -> Result<Self, ContractViolation> {
        if raw.is_empty() || raw.len() > 32 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ContractViolation::InvalidValue {
                field: "session_id",
                reason: "must be 1..=32 hex digits",
            });
        }
        let id = u128::from_str_radix(raw, 16).map_err(|_| ContractViolation::InvalidValue {
            field: "session_id",
            reason: "must be 1..=32 hex digits",
        })?;
        let id = SessionId(id);
        id.validate()?;
        Ok(id)
    }
}

impl Validate for SessionId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "session_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for SessionId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionId::parse_hex(&value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Per-session turn sequence number, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TurnId(pub u64);

impl Validate for TurnId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "turn_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// One processed utterance. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub schema_version: SchemaVersion,
    pub turn_id: TurnId,
    pub text: String,
    pub assessment: SafetyAssessment,
    /// Mode the turn resolved to.
    pub mode: Mode,
    pub at: MonotonicTimeNs,
}

impl Turn {
    pub fn v1(
        turn_id: TurnId,
        text: String,
        assessment: SafetyAssessment,
        mode: Mode,
        at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let t = Self {
            schema_version: PH1SESS_CONTRACT_VERSION,
            turn_id,
            text,
            assessment,
            mode,
            at,
        };
        t.validate()?;
        Ok(t)
    }
}

impl Validate for Turn {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1SESS_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "turn.schema_version",
                reason: "must match PH1SESS_CONTRACT_VERSION",
            });
        }
        self.turn_id.validate()?;
        validate_utterance("turn.text", &self.text)?;
        if self.mode == Mode::Cooldown {
            return Err(ContractViolation::InvalidValue {
                field: "turn.mode",
                reason: "gated turns are never recorded",
            });
        }
        self.assessment.validate()
    }
}

pub fn validate_utterance(field: &'static str, text: &str) -> Result<(), ContractViolation> {
    if text.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if text.chars().count() > MAX_UTTERANCE_CHARS {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max utterance length",
        });
    }
    Ok(())
}
