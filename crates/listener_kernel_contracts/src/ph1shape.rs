#![forbid(unsafe_code)]

use serde::Serialize;

use crate::ph1harm::{HarmReason, SafetyLevel};
use crate::ph1mode::Mode;
use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1SHAPE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Static constraints a reply must satisfy in a given mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TemplateConstraints {
    pub max_sentences: Option<u8>,
    pub unsolicited_advice: bool,
    pub paraphrase: bool,
    pub label_emotion: bool,
    pub validate_feeling: bool,
    pub grounding_exercises: u8,
    pub wait_for_user: bool,
    pub concrete_steps: u8,
    pub draft_message_optional: bool,
    pub emergency_contact_framing: bool,
    pub forbid_debate_or_shaming: bool,
    pub opening_question: Option<&'static str>,
    pub generation_permitted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseDirective {
    pub schema_version: SchemaVersion,
    pub mode: Mode,
    pub constraints: TemplateConstraints,
    pub safety_level: SafetyLevel,
    /// Reason tags the UI may show. Always a subset of the assessment's tags.
    pub surfaced_reasons: Vec<HarmReason>,
    /// Deterministic instruction text for the generation collaborator.
    pub guidance: String,
    /// Reply to use verbatim when generation is not permitted or unavailable.
    pub fixed_reply: Option<String>,
}

impl Validate for ResponseDirective {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1SHAPE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "response_directive.schema_version",
                reason: "must match PH1SHAPE_CONTRACT_VERSION",
            });
        }
        if self.guidance.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "response_directive.guidance",
                reason: "must be non-empty",
            });
        }
        if !self.constraints.generation_permitted && self.fixed_reply.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "response_directive.fixed_reply",
                reason: "must be present when generation is not permitted",
            });
        }
        if self
            .surfaced_reasons
            .iter()
            .zip(self.surfaced_reasons.iter().skip(1))
            .any(|(a, b)| a >= b)
        {
            return Err(ContractViolation::InvalidValue {
                field: "response_directive.surfaced_reasons",
                reason: "must be sorted and unique",
            });
        }
        match self.mode {
            Mode::Safety => {
                if !self.constraints.emergency_contact_framing
                    || !self.constraints.forbid_debate_or_shaming
                {
                    return Err(ContractViolation::InvalidValue {
                        field: "response_directive.constraints",
                        reason: "SAFETY requires emergency-contact framing and no debate/shaming",
                    });
                }
            }
            Mode::Regulate => {
                if self.constraints.grounding_exercises != 1 || !self.constraints.wait_for_user {
                    return Err(ContractViolation::InvalidValue {
                        field: "response_directive.constraints",
                        reason: "REGULATE requires exactly one grounding exercise then wait",
                    });
                }
            }
            Mode::Intake | Mode::Vent | Mode::Reflect | Mode::Plan | Mode::Cooldown => {}
        }
        Ok(())
    }
}
