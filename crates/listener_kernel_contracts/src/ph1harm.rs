#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::common::validate_unit_interval;
use crate::ph1mode::Mode;
use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1HARM_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Ordered so that `max` is the fail-safe combination of two verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SafetyLevel {
    Safe,
    Elevated,
    HighRisk,
}

impl SafetyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Elevated => "elevated",
            SafetyLevel::HighRisk => "high-risk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HarmReason {
    SelfHarm,
    Violence,
    Revenge,
    Harassment,
    Rage,
}

impl HarmReason {
    pub const ALL: [HarmReason; 5] = [
        HarmReason::SelfHarm,
        HarmReason::Violence,
        HarmReason::Revenge,
        HarmReason::Harassment,
        HarmReason::Rage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HarmReason::SelfHarm => "self-harm",
            HarmReason::Violence => "violence",
            HarmReason::Revenge => "revenge",
            HarmReason::Harassment => "harassment",
            HarmReason::Rage => "rage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssessmentSource {
    /// Keyword guardrail and external classifier both rendered a verdict.
    Combined,
    /// External classifier unavailable; keyword guardrail alone.
    KeywordOnly,
    /// Neither mechanism could read the text; fail-safe default applied.
    FallbackDefault,
    /// Turn was gated before classification (cooldown).
    NotAssessed,
}

/// Per-tag scores in `[0, 1]` returned by the external classification capability.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HarmScores {
    pub scores: BTreeMap<HarmReason, f32>,
}

impl HarmScores {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (HarmReason, f32)>) -> Self {
        let mut scores = BTreeMap::new();
        for (reason, score) in pairs {
            let slot = scores.entry(reason).or_insert(0.0_f32);
            if score > *slot {
                *slot = score;
            }
        }
        Self { scores }
    }

    pub fn max_score(&self) -> f32 {
        self.scores.values().copied().fold(0.0, f32::max)
    }
}

impl Validate for HarmScores {
    fn validate(&self) -> Result<(), ContractViolation> {
        for score in self.scores.values() {
            validate_unit_interval("harm_scores.score", *score)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAssessment {
    pub schema_version: SchemaVersion,
    pub level: SafetyLevel,
    pub reasons: BTreeSet<HarmReason>,
    pub confidence: f32,
    pub degraded: bool,
    pub source: AssessmentSource,
    pub assessed_under: Mode,
}

impl SafetyAssessment {
    pub fn v1(
        level: SafetyLevel,
        reasons: BTreeSet<HarmReason>,
        confidence: f32,
        degraded: bool,
        source: AssessmentSource,
        assessed_under: Mode,
    ) -> Result<Self, ContractViolation> {
        let a = Self {
            schema_version: PH1HARM_CONTRACT_VERSION,
            level,
            reasons,
            confidence,
            degraded,
            source,
            assessed_under,
        };
        a.validate()?;
        Ok(a)
    }

    /// Placeholder for a turn that was gated before classification. Reported as
    /// `elevated` so a blocked turn never reads as an all-clear.
    pub fn not_assessed(assessed_under: Mode) -> Self {
        Self {
            schema_version: PH1HARM_CONTRACT_VERSION,
            level: SafetyLevel::Elevated,
            reasons: BTreeSet::new(),
            confidence: 0.0,
            degraded: false,
            source: AssessmentSource::NotAssessed,
            assessed_under,
        }
    }

    pub fn reason_list(&self) -> Vec<HarmReason> {
        self.reasons.iter().copied().collect()
    }
}

impl Validate for SafetyAssessment {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PH1HARM_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "safety_assessment.schema_version",
                reason: "must match PH1HARM_CONTRACT_VERSION",
            });
        }
        validate_unit_interval("safety_assessment.confidence", self.confidence)?;
        if self.level == SafetyLevel::Safe && !self.reasons.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "safety_assessment.reasons",
                reason: "must be empty when level=safe",
            });
        }
        let degraded_source = matches!(
            self.source,
            AssessmentSource::KeywordOnly | AssessmentSource::FallbackDefault
        );
        if self.degraded != degraded_source {
            return Err(ContractViolation::InvalidValue {
                field: "safety_assessment.degraded",
                reason: "must be true exactly for keyword-only and fallback-default sources",
            });
        }
        if self.source == AssessmentSource::FallbackDefault && self.level == SafetyLevel::Safe {
            return Err(ContractViolation::InvalidValue {
                field: "safety_assessment.level",
                reason: "fallback-default must never be safe",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_harm_contract_01_level_order_is_fail_safe() {
        assert!(SafetyLevel::Safe < SafetyLevel::Elevated);
        assert!(SafetyLevel::Elevated < SafetyLevel::HighRisk);
        assert_eq!(
            SafetyLevel::Elevated.max(SafetyLevel::HighRisk),
            SafetyLevel::HighRisk
        );
    }

    #[test]
    fn at_harm_contract_02_safe_level_cannot_carry_reasons() {
        let reasons = BTreeSet::from([HarmReason::Rage]);
        let out = SafetyAssessment::v1(
            SafetyLevel::Safe,
            reasons,
            0.5,
            false,
            AssessmentSource::Combined,
            Mode::Vent,
        );
        assert!(out.is_err());
    }

    #[test]
    fn at_harm_contract_03_degraded_flag_tracks_source() {
        assert!(SafetyAssessment::v1(
            SafetyLevel::Safe,
            BTreeSet::new(),
            0.5,
            false,
            AssessmentSource::KeywordOnly,
            Mode::Vent,
        )
        .is_err());
        assert!(SafetyAssessment::v1(
            SafetyLevel::Safe,
            BTreeSet::new(),
            0.5,
            true,
            AssessmentSource::KeywordOnly,
            Mode::Vent,
        )
        .is_ok());
    }

    #[test]
    fn at_harm_contract_04_scores_keep_max_per_tag() {
        let scores = HarmScores::from_pairs([
            (HarmReason::SelfHarm, 0.2),
            (HarmReason::SelfHarm, 0.7),
            (HarmReason::Violence, 0.1),
        ]);
        assert_eq!(scores.scores.get(&HarmReason::SelfHarm), Some(&0.7));
        assert_eq!(scores.max_score(), 0.7);
        assert_eq!(
            serde_json::to_string(&HarmReason::SelfHarm).unwrap(),
            "\"self-harm\""
        );
    }
}
