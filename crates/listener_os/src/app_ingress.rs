#![forbid(unsafe_code)]

use std::sync::Arc;

use listener_engines::provider::mime_for_format;
use listener_kernel_contracts::ph1sess::{SessionId, UserId};
use listener_kernel_contracts::ph1shape::ResponseDirective;
use listener_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use listener_storage::repo::TurnCommitRepo;
use serde::Serialize;
use tracing::warn;

use crate::collab::{ClipStore, CollaboratorError, ReplyGenerator, Speaker, Transcriber};
use crate::ph1sess::{SessionEngine, TurnError, TurnOutcome};

pub const MAX_VOICE_NOTE_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppVoiceIngressRequest {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub audio: Vec<u8>,
    pub format: String,
    /// Keep the raw clip in object storage before transcription.
    pub store_raw: bool,
}

impl AppVoiceIngressRequest {
    pub fn v1(
        session_id: SessionId,
        user_id: UserId,
        audio: Vec<u8>,
        format: String,
        store_raw: bool,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            session_id,
            user_id,
            audio,
            format,
            store_raw,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for AppVoiceIngressRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.session_id.validate()?;
        if self.audio.is_empty() || self.audio.len() > MAX_VOICE_NOTE_BYTES {
            return Err(ContractViolation::InvalidValue {
                field: "app_voice_ingress_request.audio",
                reason: "must be 1..=MAX_VOICE_NOTE_BYTES bytes",
            });
        }
        if mime_for_format(&self.format).is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "app_voice_ingress_request.format",
                reason: "unsupported audio format",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    /// Mode-mandated script; generation was not permitted.
    Fixed,
    Generated,
    /// Generation failed in SAFETY and the safety script was used instead.
    SafetyFallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppTurnResponse {
    pub outcome: TurnOutcome,
    pub transcript: Option<String>,
    pub reply_text: String,
    pub reply_source: ReplySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_audio_url: Option<String>,
    /// Absent when speech synthesis was unavailable or not requested.
    #[serde(skip)]
    pub reply_audio: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("transcription unavailable: {0}")]
    TranscriptionUnavailable(CollaboratorError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("invalid request: {0}")]
    Contract(#[from] ContractViolation),
}

impl IngressError {
    pub fn user_message(&self) -> &'static str {
        match self {
            IngressError::TranscriptionUnavailable(_) => {
                "I couldn't hear that clearly. Please try again."
            }
            IngressError::Turn(err) => err.user_message(),
            IngressError::Contract(_) => "That recording couldn't be processed. Please try again.",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            IngressError::TranscriptionUnavailable(_) => true,
            IngressError::Turn(err) => err.retryable(),
            IngressError::Contract(_) => false,
        }
    }
}

/// Voice-note and text turn pipeline around the session engine.
pub struct AppServerIngressRuntime<R> {
    engine: Arc<SessionEngine<R>>,
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ReplyGenerator>,
    speaker: Arc<dyn Speaker>,
    clips: Arc<dyn ClipStore>,
}

impl<R> AppServerIngressRuntime<R>
where
    R: TurnCommitRepo + Send + 'static,
{
    pub fn new(
        engine: Arc<SessionEngine<R>>,
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ReplyGenerator>,
        speaker: Arc<dyn Speaker>,
        clips: Arc<dyn ClipStore>,
    ) -> Self {
        Self {
            engine,
            transcriber,
            generator,
            speaker,
            clips,
        }
    }

    pub fn engine(&self) -> &Arc<SessionEngine<R>> {
        &self.engine
    }

    pub async fn run_text_turn(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        text: &str,
        now: MonotonicTimeNs,
    ) -> Result<AppTurnResponse, IngressError> {
        let outcome = self
            .engine
            .process_turn(session_id, user_id, text, now)
            .await?;
        let (reply_text, reply_source) = self.resolve_reply(&outcome, text).await?;
        Ok(AppTurnResponse {
            outcome,
            transcript: None,
            reply_text,
            reply_source,
            stored_audio_url: None,
            reply_audio: None,
        })
    }

    /// Gate, optionally store the clip, transcribe, run the turn, resolve the reply, then
    /// synthesize it. A gated user gets the cooldown script without any transcription.
    /// Clip storage and speech synthesis failures are logged and skipped.
    pub async fn run_voice_turn(
        &self,
        request: AppVoiceIngressRequest,
        now: MonotonicTimeNs,
    ) -> Result<AppTurnResponse, IngressError> {
        request.validate()?;
        if let Some(outcome) = self
            .engine
            .check_gate(request.session_id, &request.user_id, now)?
        {
            let (reply_text, reply_source) = self.resolve_reply(&outcome, "").await?;
            let reply_audio = self.speak(&request, &outcome, &reply_text).await;
            return Ok(AppTurnResponse {
                outcome,
                transcript: None,
                reply_text,
                reply_source,
                stored_audio_url: None,
                reply_audio,
            });
        }

        let stored_audio_url = if request.store_raw {
            self.store_clip(&request).await
        } else {
            None
        };
        let transcript = self
            .transcriber
            .transcribe(&request.audio, &request.format)
            .await
            .map_err(|err| {
                warn!(
                    session_id = %request.session_id,
                    user_id = %request.user_id,
                    error = %err,
                    "transcription failed"
                );
                IngressError::TranscriptionUnavailable(err)
            })?;
        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            return Err(TurnError::EmptyUtterance.into());
        }

        let outcome = self
            .engine
            .process_turn(request.session_id, &request.user_id, &transcript, now)
            .await?;
        let (reply_text, reply_source) = self.resolve_reply(&outcome, &transcript).await?;
        let reply_audio = self.speak(&request, &outcome, &reply_text).await;
        Ok(AppTurnResponse {
            outcome,
            transcript: Some(transcript),
            reply_text,
            reply_source,
            stored_audio_url,
            reply_audio,
        })
    }

    async fn store_clip(&self, request: &AppVoiceIngressRequest) -> Option<String> {
        match self
            .clips
            .store_clip(&request.user_id, &request.audio, &request.format)
            .await
        {
            Ok(url) => url,
            Err(err) => {
                warn!(
                    session_id = %request.session_id,
                    user_id = %request.user_id,
                    error = %err,
                    "raw clip storage failed; continuing without it"
                );
                None
            }
        }
    }

    async fn speak(
        &self,
        request: &AppVoiceIngressRequest,
        outcome: &TurnOutcome,
        reply_text: &str,
    ) -> Option<Vec<u8>> {
        match self.speaker.speak(&outcome.directive, reply_text).await {
            Ok(audio) if !audio.is_empty() => Some(audio),
            Ok(_) => None,
            Err(err) => {
                warn!(
                    session_id = %request.session_id,
                    user_id = %request.user_id,
                    error = %err,
                    "speech synthesis unavailable; returning text only"
                );
                None
            }
        }
    }

    async fn resolve_reply(
        &self,
        outcome: &TurnOutcome,
        text: &str,
    ) -> Result<(String, ReplySource), TurnError> {
        let directive: &ResponseDirective = &outcome.directive;
        if !directive.constraints.generation_permitted {
            return directive
                .fixed_reply
                .clone()
                .map(|reply| (reply, ReplySource::Fixed))
                .ok_or(TurnError::GenerationUnavailable);
        }
        match self
            .generator
            .generate(directive, &outcome.context, text)
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => Ok((reply, ReplySource::Generated)),
            Ok(_) | Err(_) => match &directive.fixed_reply {
                Some(script) => {
                    warn!(
                        session_id = %outcome.session_id,
                        mode = directive.mode.as_str(),
                        "reply generation unavailable; using fixed script"
                    );
                    Ok((script.clone(), ReplySource::SafetyFallback))
                }
                None => {
                    warn!(
                        session_id = %outcome.session_id,
                        mode = directive.mode.as_str(),
                        "reply generation unavailable"
                    );
                    Err(TurnError::GenerationUnavailable)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{HarmScoreSource, NoClipStore, NoScoreSource};
    use crate::ph1cool::CooldownManager;
    use crate::ph1harm::{Ph1HarmWiring, Ph1HarmWiringConfig};
    use crate::ph1sess::SessionEngineConfig;
    use async_trait::async_trait;
    use listener_engines::ph1cool::Ph1CoolConfig;
    use listener_engines::ph1harm::{Ph1HarmConfig, Ph1HarmRuntime};
    use listener_engines::ph1loop::{Ph1LoopConfig, Ph1LoopRuntime};
    use listener_engines::ph1shape::{COOLDOWN_SCRIPT, SAFETY_SCRIPT};
    use listener_kernel_contracts::ph1mode::Mode;
    use listener_storage::ph1f::ListenerStore;
    use std::sync::Mutex;

    struct FixedTranscript(Result<String, CollaboratorError>);

    #[async_trait]
    impl Transcriber for FixedTranscript {
        async fn transcribe(&self, _audio: &[u8], _format: &str) -> Result<String, CollaboratorError> {
            self.0.clone()
        }
    }

    struct Echo(Result<(), CollaboratorError>);

    #[async_trait]
    impl ReplyGenerator for Echo {
        async fn generate(
            &self,
            directive: &ResponseDirective,
            context: &[String],
            _text: &str,
        ) -> Result<String, CollaboratorError> {
            self.0?;
            Ok(format!("{} reply after {} turns", directive.mode.as_str(), context.len()))
        }
    }

    struct Voice(Result<(), CollaboratorError>);

    #[async_trait]
    impl Speaker for Voice {
        async fn speak(
            &self,
            _directive: &ResponseDirective,
            text: &str,
        ) -> Result<Vec<u8>, CollaboratorError> {
            self.0?;
            Ok(text.as_bytes().to_vec())
        }
    }

    struct MemoryClips {
        result: Result<(), CollaboratorError>,
        kept: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl ClipStore for MemoryClips {
        async fn store_clip(
            &self,
            user_id: &UserId,
            audio: &[u8],
            format: &str,
        ) -> Result<Option<String>, CollaboratorError> {
            self.result?;
            let mut kept = self.kept.lock().unwrap();
            kept.push((user_id.as_str().to_string(), audio.len()));
            Ok(Some(format!("mem://{}/{}.{}", user_id.as_str(), kept.len(), format)))
        }
    }

    fn runtime(
        transcript: Result<String, CollaboratorError>,
        generation: Result<(), CollaboratorError>,
        speech: Result<(), CollaboratorError>,
    ) -> AppServerIngressRuntime<ListenerStore> {
        runtime_with_clips(transcript, generation, speech, Arc::new(NoClipStore))
    }

    fn runtime_with_clips(
        transcript: Result<String, CollaboratorError>,
        generation: Result<(), CollaboratorError>,
        speech: Result<(), CollaboratorError>,
        clips: Arc<dyn ClipStore>,
    ) -> AppServerIngressRuntime<ListenerStore> {
        let source: Arc<dyn HarmScoreSource> = Arc::new(NoScoreSource);
        let harm = Ph1HarmWiring::new(
            Ph1HarmWiringConfig::mvp_v1(),
            Ph1HarmRuntime::new(Ph1HarmConfig::mvp_v1()),
            source,
        )
        .unwrap();
        let engine = SessionEngine::new(
            SessionEngineConfig::mvp_v1(),
            harm,
            Ph1LoopRuntime::new(Ph1LoopConfig::mvp_v1()),
            Arc::new(CooldownManager::new(Ph1CoolConfig::mvp_v1()).unwrap()),
            Arc::new(Mutex::new(ListenerStore::new_in_memory())),
        )
        .unwrap();
        AppServerIngressRuntime::new(
            Arc::new(engine),
            Arc::new(FixedTranscript(transcript)),
            Arc::new(Echo(generation)),
            Arc::new(Voice(speech)),
            clips,
        )
    }

    fn voice_request(format: &str) -> AppVoiceIngressRequest {
        AppVoiceIngressRequest::v1(
            SessionId(7),
            UserId::new("user_a").unwrap(),
            vec![1, 2, 3],
            format.to_string(),
            false,
        )
        .unwrap()
    }

    fn at(secs: u64) -> MonotonicTimeNs {
        MonotonicTimeNs::from_secs(secs)
    }

    #[tokio::test]
    async fn at_ingress_01_voice_note_runs_end_to_end() {
        let rt = runtime(Ok("I feel kind of stressed".into()), Ok(()), Ok(()));
        let out = rt.run_voice_turn(voice_request("webm"), at(1)).await.unwrap();
        assert_eq!(out.transcript.as_deref(), Some("I feel kind of stressed"));
        assert_eq!(out.outcome.mode, Mode::Vent);
        assert_eq!(out.reply_source, ReplySource::Generated);
        assert_eq!(out.reply_text, "VENT reply after 0 turns");
        assert_eq!(out.reply_audio, Some(out.reply_text.as_bytes().to_vec()));
    }

    #[tokio::test]
    async fn at_ingress_02_speech_failure_returns_text_only() {
        let rt = runtime(
            Ok("I feel kind of stressed".into()),
            Ok(()),
            Err(CollaboratorError::Unavailable),
        );
        let out = rt.run_voice_turn(voice_request("wav"), at(1)).await.unwrap();
        assert!(out.reply_audio.is_none());
        assert!(!out.reply_text.is_empty());
    }

    #[tokio::test]
    async fn at_ingress_03_transcription_failures_are_retryable() {
        let rt = runtime(Err(CollaboratorError::Timeout), Ok(()), Ok(()));
        let err = rt
            .run_voice_turn(voice_request("mp3"), at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, IngressError::TranscriptionUnavailable(_)));
        assert!(err.retryable());

        let rt = runtime(Ok("   ".into()), Ok(()), Ok(()));
        let err = rt
            .run_voice_turn(voice_request("mp3"), at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, IngressError::Turn(TurnError::EmptyUtterance)));
    }

    #[tokio::test]
    async fn at_ingress_04_generation_failure_falls_back_only_in_safety() {
        let rt = runtime(Ok(String::new()), Err(CollaboratorError::Unavailable), Ok(()));
        let u = UserId::new("user_a").unwrap();
        let out = rt
            .run_text_turn(SessionId(9), &u, "I want to kill myself", at(1))
            .await
            .unwrap();
        assert_eq!(out.reply_source, ReplySource::SafetyFallback);
        assert_eq!(out.reply_text, SAFETY_SCRIPT);

        let err = rt
            .run_text_turn(SessionId(10), &u, "I feel kind of stressed", at(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngressError::Turn(TurnError::GenerationUnavailable)
        ));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn at_ingress_05_cooldown_uses_fixed_script() {
        let rt = runtime(Ok(String::new()), Ok(()), Ok(()));
        let u = UserId::new("user_a").unwrap();
        for _ in 0..2 {
            rt.run_text_turn(SessionId(11), &u, "I want to kill myself", at(1))
                .await
                .unwrap();
        }
        let out = rt
            .run_text_turn(SessionId(11), &u, "hello again", at(5))
            .await
            .unwrap();
        assert!(!out.outcome.allowed);
        assert_eq!(out.reply_source, ReplySource::Fixed);
        assert_eq!(out.reply_text, COOLDOWN_SCRIPT);
    }

    #[test]
    fn at_ingress_06_voice_request_validates_format_and_size() {
        let u = UserId::new("user_a").unwrap();
        assert!(AppVoiceIngressRequest::v1(SessionId(1), u.clone(), vec![1], "aiff".into(), false).is_err());
        assert!(AppVoiceIngressRequest::v1(SessionId(1), u.clone(), Vec::new(), "wav".into(), false).is_err());
        assert!(AppVoiceIngressRequest::v1(SessionId(1), u, vec![1], " WAV ".into(), true).is_ok());
    }

    #[tokio::test]
    async fn at_ingress_07_gated_voice_note_skips_transcription() {
        let rt = runtime(Err(CollaboratorError::Unavailable), Ok(()), Ok(()));
        let u = UserId::new("user_a").unwrap();
        for _ in 0..2 {
            rt.run_text_turn(SessionId(7), &u, "I want to kill myself", at(1))
                .await
                .unwrap();
        }
        let out = rt.run_voice_turn(voice_request("webm"), at(5)).await.unwrap();
        assert!(!out.outcome.allowed);
        assert_eq!(out.outcome.mode, Mode::Cooldown);
        assert!(out.outcome.retry_after_seconds > 0);
        assert_eq!(out.transcript, None);
        assert_eq!(out.reply_source, ReplySource::Fixed);
        assert_eq!(out.reply_text, COOLDOWN_SCRIPT);
        assert_eq!(out.reply_audio, Some(COOLDOWN_SCRIPT.as_bytes().to_vec()));
    }

    #[tokio::test]
    async fn at_ingress_08_raw_clip_is_stored_on_request_and_failure_is_skipped() {
        let clips = Arc::new(MemoryClips {
            result: Ok(()),
            kept: Mutex::new(Vec::new()),
        });
        let rt = runtime_with_clips(
            Ok("I feel kind of stressed".into()),
            Ok(()),
            Ok(()),
            clips.clone(),
        );
        let out = rt.run_voice_turn(voice_request("webm"), at(1)).await.unwrap();
        assert_eq!(out.stored_audio_url, None);

        let mut request = voice_request("webm");
        request.store_raw = true;
        let out = rt.run_voice_turn(request, at(2)).await.unwrap();
        assert_eq!(out.stored_audio_url.as_deref(), Some("mem://user_a/1.webm"));
        assert_eq!(*clips.kept.lock().unwrap(), vec![("user_a".to_string(), 3)]);

        let rt = runtime_with_clips(
            Ok("I feel kind of stressed".into()),
            Ok(()),
            Ok(()),
            Arc::new(MemoryClips {
                result: Err(CollaboratorError::Unavailable),
                kept: Mutex::new(Vec::new()),
            }),
        );
        let mut request = voice_request("webm");
        request.store_raw = true;
        let out = rt.run_voice_turn(request, at(1)).await.unwrap();
        assert_eq!(out.stored_audio_url, None);
        assert_eq!(out.transcript.as_deref(), Some("I feel kind of stressed"));
    }
}
