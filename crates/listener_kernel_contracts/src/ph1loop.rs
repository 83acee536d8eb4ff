#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1LOOP_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorSignal {
    None,
    Looping,
    Escalating,
}

impl DetectorSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectorSignal::None => "none",
            DetectorSignal::Looping => "looping",
            DetectorSignal::Escalating => "escalating",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopCheck {
    pub schema_version: SchemaVersion,
    pub intervene: bool,
    pub signal: DetectorSignal,
    /// Similarity between the new utterance and the one before it, `0.0` with no history.
    pub last_similarity: f32,
}

impl LoopCheck {
    pub fn v1(signal: DetectorSignal, last_similarity: f32) -> Result<Self, ContractViolation> {
        let c = Self {
            schema_version: PH1LOOP_CONTRACT_VERSION,
            intervene: signal != DetectorSignal::None,
            signal,
            last_similarity,
        };
        c.validate()?;
        Ok(c)
    }
}

impl Validate for LoopCheck {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1LOOP_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "loop_check.schema_version",
                reason: "must match PH1LOOP_CONTRACT_VERSION",
            });
        }
        if self.intervene != (self.signal != DetectorSignal::None) {
            return Err(ContractViolation::InvalidValue {
                field: "loop_check.intervene",
                reason: "must be true exactly when signal != none",
            });
        }
        crate::common::validate_unit_interval("loop_check.last_similarity", self.last_similarity)
    }
}
