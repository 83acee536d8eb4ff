#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use listener_kernel_contracts::ph1harm::{
    AssessmentSource, HarmReason, HarmScores, SafetyAssessment, SafetyLevel,
    PH1HARM_CONTRACT_VERSION,
};
use listener_kernel_contracts::ph1mode::Mode;
use listener_kernel_contracts::ReasonCodeId;

pub mod reason_codes {
    use listener_kernel_contracts::ReasonCodeId;

    // PH1.HARM reason-code namespace.
    pub const HARM_OK_COMBINED: ReasonCodeId = ReasonCodeId(0x4841_0001);
    pub const HARM_OK_EMPTY_TEXT: ReasonCodeId = ReasonCodeId(0x4841_0002);
    pub const HARM_HIGH_SEVERITY_PHRASE: ReasonCodeId = ReasonCodeId(0x4841_0010);
    pub const HARM_KEYWORD_MATCH: ReasonCodeId = ReasonCodeId(0x4841_0011);
    pub const HARM_SCORE_HIGH: ReasonCodeId = ReasonCodeId(0x4841_0012);
    pub const HARM_SCORE_LOW: ReasonCodeId = ReasonCodeId(0x4841_0013);

    pub const HARM_DEGRADED_KEYWORD_ONLY: ReasonCodeId = ReasonCodeId(0x4841_00F1);
    pub const HARM_DEGRADED_FALLBACK_DEFAULT: ReasonCodeId = ReasonCodeId(0x4841_00F2);
}

// Phrases are matched as contiguous runs of normalized tokens.
const HIGH_SEVERITY_PHRASES: &[(HarmReason, &str)] = &[
    (HarmReason::SelfHarm, "kill myself"),
    (HarmReason::SelfHarm, "killing myself"),
    (HarmReason::SelfHarm, "end my life"),
    (HarmReason::SelfHarm, "take my own life"),
    (HarmReason::SelfHarm, "end it all"),
    (HarmReason::SelfHarm, "don't want to be alive"),
    (HarmReason::Violence, "going to kill them"),
    (HarmReason::Violence, "going to kill him"),
    (HarmReason::Violence, "going to kill her"),
    (HarmReason::Violence, "gonna kill them"),
    (HarmReason::Violence, "gonna kill him"),
    (HarmReason::Violence, "gonna kill her"),
];

const KEYWORD_PHRASES: &[(HarmReason, &str)] = &[
    (HarmReason::SelfHarm, "suicide"),
    (HarmReason::SelfHarm, "suicidal"),
    (HarmReason::SelfHarm, "end it"),
    (HarmReason::SelfHarm, "can't go on"),
    (HarmReason::SelfHarm, "hurt myself"),
    (HarmReason::SelfHarm, "jump off"),
    (HarmReason::SelfHarm, "want to die"),
    (HarmReason::Violence, "hurt them"),
    (HarmReason::Violence, "hurt him"),
    (HarmReason::Violence, "hurt her"),
    (HarmReason::Violence, "murder"),
    (HarmReason::Violence, "attack"),
    (HarmReason::Violence, "stab"),
    (HarmReason::Violence, "shoot"),
    (HarmReason::Revenge, "revenge"),
    (HarmReason::Revenge, "get back at"),
    (HarmReason::Revenge, "make them pay"),
    (HarmReason::Revenge, "payback"),
    (HarmReason::Harassment, "harass"),
    (HarmReason::Harassment, "stalk"),
    (HarmReason::Harassment, "threaten"),
    (HarmReason::Rage, "smash"),
    (HarmReason::Rage, "destroy"),
    (HarmReason::Rage, "furious"),
    (HarmReason::Rage, "rage"),
    (HarmReason::Rage, "explode"),
    (HarmReason::Rage, "yell"),
    (HarmReason::Rage, "fume"),
];

// Everyday compounds masked before keyword matching.
const BENIGN_PHRASES: &[&str] = &[
    "panic attack",
    "anxiety attack",
    "heart attack",
    "asthma attack",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ph1HarmConfig {
    pub low_threshold: f32,
    pub high_threshold: f32,
    pub keyword_confidence: f32,
    pub high_severity_confidence: f32,
    /// Confidence of a keyword-only all-clear; the guardrail alone is a weak negative.
    pub keyword_clear_confidence: f32,
}

impl Ph1HarmConfig {
    pub fn mvp_v1() -> Self {
        Self {
            low_threshold: 0.50,
            high_threshold: 0.85,
            keyword_confidence: 0.7,
            high_severity_confidence: 1.0,
            keyword_clear_confidence: 0.5,
        }
    }
}

/// Outcome of one mechanism before the two are combined.
#[derive(Debug, Clone, PartialEq)]
pub struct MechanismVerdict {
    pub level: SafetyLevel,
    pub reasons: BTreeSet<HarmReason>,
    pub confidence: f32,
    pub reason_code: ReasonCodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordVerdict {
    pub verdict: MechanismVerdict,
    /// False when no token is in the guardrail's script, so a clear result means nothing.
    pub readable: bool,
}

#[derive(Debug, Clone)]
pub struct Ph1HarmRuntime {
    config: Ph1HarmConfig,
}

impl Ph1HarmRuntime {
    pub fn new(config: Ph1HarmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> Ph1HarmConfig {
        self.config
    }

    pub fn keyword_verdict(&self, text: &str) -> KeywordVerdict {
        let tokens = normalize_tokens(text);
        let readable = tokens
            .iter()
            .any(|t| t.chars().any(|c| c.is_ascii_alphabetic()));

        let high: BTreeSet<HarmReason> = HIGH_SEVERITY_PHRASES
            .iter()
            .filter(|(_, phrase)| contains_phrase(&tokens, phrase))
            .map(|(reason, _)| *reason)
            .collect();
        let masked = mask_phrases(&tokens, BENIGN_PHRASES);
        let mut reasons: BTreeSet<HarmReason> = KEYWORD_PHRASES
            .iter()
            .filter(|(_, phrase)| contains_phrase(&masked, phrase))
            .map(|(reason, _)| *reason)
            .collect();
        reasons.extend(high.iter().copied());

        let verdict = if !high.is_empty() {
            MechanismVerdict {
                level: SafetyLevel::HighRisk,
                reasons,
                confidence: self.config.high_severity_confidence,
                reason_code: reason_codes::HARM_HIGH_SEVERITY_PHRASE,
            }
        } else if !reasons.is_empty() {
            MechanismVerdict {
                level: SafetyLevel::Elevated,
                reasons,
                confidence: self.config.keyword_confidence,
                reason_code: reason_codes::HARM_KEYWORD_MATCH,
            }
        } else {
            MechanismVerdict {
                level: SafetyLevel::Safe,
                reasons,
                confidence: self.config.keyword_clear_confidence,
                reason_code: reason_codes::HARM_OK_COMBINED,
            }
        };
        KeywordVerdict { verdict, readable }
    }

    pub fn score_verdict(&self, scores: &HarmScores) -> MechanismVerdict {
        let max = scores.max_score();
        let reasons: BTreeSet<HarmReason> = scores
            .scores
            .iter()
            .filter(|(_, s)| **s >= self.config.low_threshold)
            .map(|(r, _)| *r)
            .collect();
        if max >= self.config.high_threshold {
            MechanismVerdict {
                level: SafetyLevel::HighRisk,
                reasons,
                confidence: max,
                reason_code: reason_codes::HARM_SCORE_HIGH,
            }
        } else if max >= self.config.low_threshold {
            MechanismVerdict {
                level: SafetyLevel::Elevated,
                reasons,
                confidence: max,
                reason_code: reason_codes::HARM_SCORE_LOW,
            }
        } else {
            MechanismVerdict {
                level: SafetyLevel::Safe,
                reasons: BTreeSet::new(),
                confidence: 1.0 - max,
                reason_code: reason_codes::HARM_OK_COMBINED,
            }
        }
    }

    /// Combines the keyword guardrail with the external scores. `scores == None` means the
    /// external classifier was unavailable for this turn.
    pub fn assess(
        &self,
        text: &str,
        mode: Mode,
        scores: Option<&HarmScores>,
    ) -> (SafetyAssessment, ReasonCodeId) {
        let keyword = self.keyword_verdict(text);
        let empty = text.trim().is_empty();

        match scores {
            Some(scores) => {
                let external = self.score_verdict(scores);
                let level = keyword.verdict.level.max(external.level);
                let confidence = match keyword.verdict.level.cmp(&external.level) {
                    std::cmp::Ordering::Greater => keyword.verdict.confidence,
                    std::cmp::Ordering::Less => external.confidence,
                    std::cmp::Ordering::Equal => {
                        keyword.verdict.confidence.max(external.confidence)
                    }
                };
                let reason_code = if keyword.verdict.level >= external.level {
                    keyword.verdict.reason_code
                } else {
                    external.reason_code
                };
                let mut reasons = keyword.verdict.reasons;
                if level != SafetyLevel::Safe {
                    reasons.extend(external.reasons);
                }
                let reason_code = if empty {
                    reason_codes::HARM_OK_EMPTY_TEXT
                } else {
                    reason_code
                };
                (
                    self.build(level, reasons, confidence, AssessmentSource::Combined, mode),
                    reason_code,
                )
            }
            None if empty => (
                self.build(
                    SafetyLevel::Safe,
                    BTreeSet::new(),
                    1.0,
                    AssessmentSource::KeywordOnly,
                    mode,
                ),
                reason_codes::HARM_OK_EMPTY_TEXT,
            ),
            None if !keyword.readable => (
                self.build(
                    SafetyLevel::Elevated,
                    BTreeSet::new(),
                    0.0,
                    AssessmentSource::FallbackDefault,
                    mode,
                ),
                reason_codes::HARM_DEGRADED_FALLBACK_DEFAULT,
            ),
            None => {
                let v = keyword.verdict;
                let reason_code = if v.level == SafetyLevel::Safe {
                    reason_codes::HARM_DEGRADED_KEYWORD_ONLY
                } else {
                    v.reason_code
                };
                (
                    self.build(
                        v.level,
                        v.reasons,
                        v.confidence,
                        AssessmentSource::KeywordOnly,
                        mode,
                    ),
                    reason_code,
                )
            }
        }
    }

    fn build(
        &self,
        level: SafetyLevel,
        reasons: BTreeSet<HarmReason>,
        confidence: f32,
        source: AssessmentSource,
        mode: Mode,
    ) -> SafetyAssessment {
        let degraded = matches!(
            source,
            AssessmentSource::KeywordOnly | AssessmentSource::FallbackDefault
        );
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        SafetyAssessment::v1(level, reasons, confidence, degraded, source, mode).unwrap_or(
            SafetyAssessment {
                schema_version: PH1HARM_CONTRACT_VERSION,
                level: SafetyLevel::Elevated,
                reasons: BTreeSet::new(),
                confidence: 0.0,
                degraded: true,
                source: AssessmentSource::FallbackDefault,
                assessed_under: mode,
            },
        )
    }
}

/// Lower-cases and splits on anything that is not alphanumeric or an apostrophe.
pub fn normalize_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace(['\u{2019}', '\u{2018}'], "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let needle: Vec<&str> = phrase.split(' ').collect();
    if needle.is_empty() || needle.len() > tokens.len() {
        return false;
    }
    tokens
        .windows(needle.len())
        .any(|w| w.iter().zip(needle.iter()).all(|(a, b)| a == b))
}

/// Blanks every token covered by one of `phrases`.
fn mask_phrases(tokens: &[String], phrases: &[&str]) -> Vec<String> {
    let mut masked = tokens.to_vec();
    for phrase in phrases {
        let needle: Vec<&str> = phrase.split(' ').collect();
        if needle.len() > tokens.len() {
            continue;
        }
        for start in 0..=tokens.len() - needle.len() {
            let window = &tokens[start..start + needle.len()];
            if window.iter().zip(needle.iter()).all(|(a, b)| a == b) {
                masked[start..start + needle.len()]
                    .iter_mut()
                    .for_each(String::clear);
            }
        }
    }
    masked
}
