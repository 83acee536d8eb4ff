#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use listener_kernel_contracts::ph1harm::SafetyLevel;
use listener_kernel_contracts::ph1loop::{DetectorSignal, LoopCheck, PH1LOOP_CONTRACT_VERSION};
use listener_kernel_contracts::ph1sess::Turn;

use crate::ph1harm::normalize_tokens;

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "all", "also", "and", "any", "are", "because", "been", "before",
    "but", "can", "can't", "could", "did", "didn't", "does", "doesn't", "don't", "feel", "for",
    "from", "get", "got", "had", "has", "have", "her", "him", "his", "how", "i'm", "i've", "into",
    "its", "it's", "just", "like", "more", "much", "not", "now", "off", "one", "our", "out",
    "really", "she", "should", "some", "still", "than", "that", "that's", "the", "their", "them",
    "then", "there", "they", "this", "too", "very", "was", "way", "were", "what", "when", "where",
    "which", "who", "why", "will", "with", "would", "you", "your",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ph1LoopConfig {
    pub loop_similarity_threshold: f32,
    /// Number of consecutive utterances (including the new one) that must chain.
    pub loop_chain_len: u8,
    pub escalation_window: u8,
}

impl Ph1LoopConfig {
    pub fn mvp_v1() -> Self {
        Self {
            loop_similarity_threshold: 0.6,
            loop_chain_len: 3,
            escalation_window: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ph1LoopRuntime {
    config: Ph1LoopConfig,
}

impl Ph1LoopRuntime {
    pub fn new(config: Ph1LoopConfig) -> Self {
        Self { config }
    }

    /// `window` is the session's recorded turns, oldest first.
    pub fn check(&self, window: &[Turn], new_text: &str, new_level: SafetyLevel) -> LoopCheck {
        let new_words = content_words(new_text);
        let last_similarity = window
            .last()
            .map(|t| jaccard(&content_words(&t.text), &new_words))
            .unwrap_or(0.0);

        let signal = if self.escalating(window, new_level) {
            DetectorSignal::Escalating
        } else if self.looping(window, &new_words, last_similarity) {
            DetectorSignal::Looping
        } else {
            DetectorSignal::None
        };

        LoopCheck::v1(signal, last_similarity).unwrap_or(LoopCheck {
            schema_version: PH1LOOP_CONTRACT_VERSION,
            intervene: signal != DetectorSignal::None,
            signal,
            last_similarity: 0.0,
        })
    }

    fn looping(&self, window: &[Turn], new_words: &BTreeSet<String>, last_similarity: f32) -> bool {
        let pairs_needed = usize::from(self.config.loop_chain_len.max(2)) - 1;
        if window.len() < pairs_needed {
            return false;
        }
        if last_similarity < self.config.loop_similarity_threshold {
            return false;
        }
        let tail = &window[window.len() - pairs_needed..];
        let mut sets: Vec<BTreeSet<String>> = tail.iter().map(|t| content_words(&t.text)).collect();
        sets.push(new_words.clone());
        sets.windows(2)
            .all(|w| jaccard(&w[0], &w[1]) >= self.config.loop_similarity_threshold)
    }

    fn escalating(&self, window: &[Turn], new_level: SafetyLevel) -> bool {
        let prior_needed = usize::from(self.config.escalation_window.max(1)) - 1;
        if window.len() < prior_needed {
            return false;
        }
        let mut levels: Vec<SafetyLevel> = window[window.len() - prior_needed..]
            .iter()
            .map(|t| t.assessment.level)
            .collect();
        levels.push(new_level);
        levels.iter().all(|l| *l >= SafetyLevel::Elevated)
            && levels.windows(2).all(|w| w[0] <= w[1])
    }
}

pub fn content_words(text: &str) -> BTreeSet<String> {
    normalize_tokens(text)
        .into_iter()
        .filter(|t| t.chars().count() >= 3 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Jaccard index of two word sets; two empty sets score `0.0`.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    inter as f32 / union as f32
}
