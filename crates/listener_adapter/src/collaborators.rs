#![forbid(unsafe_code)]

//! Provider-backed and offline implementations of the engine's collaborator seams.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use listener_engines::ph1shape::PLACEHOLDER_REPLY;
use listener_engines::provider::{
    chat_reply, moderation_scores, speak, transcribe, ContextLine, OpenAiProviderConfig,
    ProviderCallError,
};
use listener_kernel_contracts::ph1harm::HarmScores;
use listener_kernel_contracts::ph1mode::Mode;
use listener_kernel_contracts::ph1sess::UserId;
use listener_kernel_contracts::ph1shape::ResponseDirective;
use listener_os::collab::{
    ClipStore, CollaboratorError, HarmScoreSource, ReplyGenerator, Speaker, Transcriber,
};
use rand::Rng;
use tracing::{debug, warn};

pub const PLACEHOLDER_TRANSCRIPT: &str = "(transcript placeholder)";

fn provider_failure(err: ProviderCallError) -> CollaboratorError {
    warn!(
        provider = err.provider,
        detail = %err.safe_detail(),
        "provider call failed"
    );
    if err.is_timeout() {
        CollaboratorError::Timeout
    } else {
        CollaboratorError::Unavailable
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, CollaboratorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderCallError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(provider_failure),
        Err(_) => Err(CollaboratorError::Unavailable),
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiHarmScoreSource {
    config: Arc<OpenAiProviderConfig>,
    timeout_ms: u32,
}

impl OpenAiHarmScoreSource {
    pub fn new(config: Arc<OpenAiProviderConfig>, timeout_ms: u32) -> Self {
        Self { config, timeout_ms }
    }
}

#[async_trait]
impl HarmScoreSource for OpenAiHarmScoreSource {
    async fn score(&self, text: &str, _mode: Mode) -> Result<HarmScores, CollaboratorError> {
        let config = Arc::clone(&self.config);
        let timeout_ms = self.timeout_ms;
        let text = text.to_string();
        run_blocking(move || moderation_scores(&config, timeout_ms, &text)).await
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    config: Arc<OpenAiProviderConfig>,
}

impl OpenAiTranscriber {
    pub fn new(config: Arc<OpenAiProviderConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio: &[u8], format: &str) -> Result<String, CollaboratorError> {
        let config = Arc::clone(&self.config);
        let audio = audio.to_vec();
        let format = format.to_string();
        run_blocking(move || transcribe(&config, &audio, &format)).await
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiReplyGenerator {
    config: Arc<OpenAiProviderConfig>,
}

impl OpenAiReplyGenerator {
    pub fn new(config: Arc<OpenAiProviderConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiReplyGenerator {
    async fn generate(
        &self,
        directive: &ResponseDirective,
        context: &[String],
        text: &str,
    ) -> Result<String, CollaboratorError> {
        let config = Arc::clone(&self.config);
        let guidance = directive.guidance.clone();
        let context: Vec<ContextLine> = context
            .iter()
            .map(|line| ContextLine {
                from_user: true,
                text: line.clone(),
            })
            .collect();
        let text = text.to_string();
        run_blocking(move || chat_reply(&config, &guidance, &context, &text)).await
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiSpeaker {
    config: Arc<OpenAiProviderConfig>,
}

impl OpenAiSpeaker {
    pub fn new(config: Arc<OpenAiProviderConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Speaker for OpenAiSpeaker {
    async fn speak(
        &self,
        _directive: &ResponseDirective,
        text: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let config = Arc::clone(&self.config);
        let text = text.to_string();
        run_blocking(move || speak(&config, &text)).await
    }
}

/// Offline transcriber: every voice note reads as the same placeholder line.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderTranscriber;

#[async_trait]
impl Transcriber for PlaceholderTranscriber {
    async fn transcribe(&self, _audio: &[u8], _format: &str) -> Result<String, CollaboratorError> {
        Ok(PLACEHOLDER_TRANSCRIPT.to_string())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderReplyGenerator;

#[async_trait]
impl ReplyGenerator for PlaceholderReplyGenerator {
    async fn generate(
        &self,
        _directive: &ResponseDirective,
        _context: &[String],
        _text: &str,
    ) -> Result<String, CollaboratorError> {
        Ok(PLACEHOLDER_REPLY.to_string())
    }
}

/// Offline speech: the reply text's bytes stand in for audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoSpeaker;

#[async_trait]
impl Speaker for EchoSpeaker {
    async fn speak(
        &self,
        _directive: &ResponseDirective,
        text: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        Ok(text.as_bytes().to_vec())
    }
}

/// Keeps raw clips as `<root>/<hex user id>/<random id>.<format>` and answers a `file://` URL.
#[derive(Debug, Clone)]
pub struct DirectoryClipStore {
    root: PathBuf,
}

impl DirectoryClipStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

#[async_trait]
impl ClipStore for DirectoryClipStore {
    async fn store_clip(
        &self,
        user_id: &UserId,
        audio: &[u8],
        format: &str,
    ) -> Result<Option<String>, CollaboratorError> {
        let user_dir: String = user_id
            .as_str()
            .bytes()
            .map(|b| format!("{b:02x}"))
            .collect();
        let dir = self.root.join(user_dir);
        let clip_id: u128 = rand::thread_rng().gen();
        let path = dir.join(format!(
            "{clip_id:032x}.{}",
            format.trim().to_ascii_lowercase()
        ));
        let io_failure = |err: std::io::Error| {
            warn!(path = %path.display(), error = %err, "clip write failed");
            CollaboratorError::Unavailable
        };
        tokio::fs::create_dir_all(&dir).await.map_err(io_failure)?;
        tokio::fs::write(&path, audio).await.map_err(io_failure)?;
        debug!(path = %path.display(), bytes = audio.len(), "raw clip stored");
        Ok(Some(format!("file://{}", path.display())))
    }
}
