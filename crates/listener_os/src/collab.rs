#![forbid(unsafe_code)]

//! Narrow async seams to everything outside the session engine.

use async_trait::async_trait;
use listener_engines::ph1auth::SignedTokenVerifier;
use listener_kernel_contracts::ph1harm::HarmScores;
use listener_kernel_contracts::ph1mode::Mode;
use listener_kernel_contracts::ph1sess::UserId;
use listener_kernel_contracts::ph1shape::ResponseDirective;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable")]
    Unavailable,
    #[error("collaborator timed out")]
    Timeout,
    #[error("collaborator rejected the input")]
    Rejected,
    #[error("credential not accepted")]
    Unauthenticated,
}

/// External per-tag harm scoring. `mode` is context only.
#[async_trait]
pub trait HarmScoreSource: Send + Sync {
    async fn score(&self, text: &str, mode: Mode) -> Result<HarmScores, CollaboratorError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait Speaker: Send + Sync {
    async fn speak(
        &self,
        directive: &ResponseDirective,
        text: &str,
    ) -> Result<Vec<u8>, CollaboratorError>;
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// `context` holds the session's earlier utterances, oldest first.
    async fn generate(
        &self,
        directive: &ResponseDirective,
        context: &[String],
        text: &str,
    ) -> Result<String, CollaboratorError>;
}

/// Object storage for raw voice-note clips. `Ok(None)` means storage is not configured.
#[async_trait]
pub trait ClipStore: Send + Sync {
    async fn store_clip(
        &self,
        user_id: &UserId,
        audio: &[u8],
        format: &str,
    ) -> Result<Option<String>, CollaboratorError>;
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, CollaboratorError>;
}

#[async_trait]
impl IdentityVerifier for SignedTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<UserId, CollaboratorError> {
        SignedTokenVerifier::verify(self, credential).map_err(|_| CollaboratorError::Unauthenticated)
    }
}

/// Score source for deployments without an external classifier; every turn degrades.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScoreSource;

#[async_trait]
impl HarmScoreSource for NoScoreSource {
    async fn score(&self, _text: &str, _mode: Mode) -> Result<HarmScores, CollaboratorError> {
        Err(CollaboratorError::Unavailable)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoClipStore;

#[async_trait]
impl ClipStore for NoClipStore {
    async fn store_clip(
        &self,
        _user_id: &UserId,
        _audio: &[u8],
        _format: &str,
    ) -> Result<Option<String>, CollaboratorError> {
        Ok(None)
    }
}
