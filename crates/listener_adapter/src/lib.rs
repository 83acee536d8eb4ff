#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use listener_engines::ph1auth::SignedTokenVerifier;
use listener_engines::ph1cool::Ph1CoolConfig;
use listener_engines::ph1harm::{Ph1HarmConfig, Ph1HarmRuntime};
use listener_engines::ph1loop::{Ph1LoopConfig, Ph1LoopRuntime};
use listener_engines::provider::OpenAiProviderConfig;
use listener_kernel_contracts::ph1harm::{HarmReason, SafetyLevel};
use listener_kernel_contracts::ph1mode::Mode;
use listener_kernel_contracts::ph1sess::{SessionId, UserId};
use listener_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};
use listener_os::app_ingress::{
    AppServerIngressRuntime, AppTurnResponse, AppVoiceIngressRequest, IngressError, ReplySource,
    MAX_VOICE_NOTE_BYTES,
};
use listener_os::collab::{
    ClipStore, HarmScoreSource, IdentityVerifier, NoClipStore, NoScoreSource, ReplyGenerator,
    Speaker, Transcriber,
};
use listener_os::ph1cool::CooldownManager;
use listener_os::ph1harm::{Ph1HarmWiring, Ph1HarmWiringConfig};
use listener_os::ph1sess::{SessionEngine, SessionEngineConfig, TurnError};
use listener_storage::ph1f::ListenerStore;
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod collaborators;

use collaborators::{
    DirectoryClipStore, EchoSpeaker, OpenAiHarmScoreSource, OpenAiReplyGenerator, OpenAiSpeaker, OpenAiTranscriber,
    PlaceholderReplyGenerator, PlaceholderTranscriber,
};

pub mod reason_codes {
    use listener_kernel_contracts::ReasonCodeId;

    pub const ADAPTER_UNAUTHENTICATED: ReasonCodeId = ReasonCodeId(0xAD70_0001);
    pub const ADAPTER_BAD_REQUEST: ReasonCodeId = ReasonCodeId(0xAD70_0002);
    pub const ADAPTER_TURN_FAILED: ReasonCodeId = ReasonCodeId(0xAD70_0003);
}

/// Request body cap for `/v1/voice-note`: the base64 form of the largest accepted clip plus
/// room for the JSON envelope.
pub const VOICE_NOTE_BODY_LIMIT_BYTES: usize = (MAX_VOICE_NOTE_BYTES + 2) / 3 * 4 + 64 * 1024;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TurnAdapterRequest {
    pub session_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VoiceNoteAdapterRequest {
    pub session_id: Option<String>,
    pub audio_b64: String,
    pub format: String,
    #[serde(default)]
    pub store_raw: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Default)]
pub struct TurnAdapterResponse {
    pub status: String,
    pub outcome: String,
    /// User-facing text for rejections. Never carries collaborator detail.
    pub reason: Option<String>,
    pub reason_code: Option<u32>,
    pub retryable: bool,
    pub session_id: Option<String>,
    pub mode: Option<Mode>,
    pub allowed: bool,
    pub safety_level: Option<SafetyLevel>,
    pub reasons: Vec<HarmReason>,
    pub degraded: bool,
    pub cooldown_seconds: u32,
    pub retry_after_seconds: u32,
    pub guidance: Option<String>,
    pub reply_text: Option<String>,
    pub reply_source: Option<String>,
    pub transcript: Option<String>,
    pub stored_audio_url: Option<String>,
    pub audio_b64: Option<String>,
    pub session_reset: bool,
}

impl TurnAdapterResponse {
    fn rejected(reason: &str, reason_code: ReasonCodeId, retryable: bool) -> Self {
        Self {
            status: "error".to_string(),
            outcome: "REJECTED".to_string(),
            reason: Some(reason.to_string()),
            reason_code: Some(reason_code.0),
            retryable,
            ..Self::default()
        }
    }

    fn from_turn(response: AppTurnResponse) -> Self {
        let outcome = response.outcome;
        let allowed = outcome.allowed;
        let reply_source = match response.reply_source {
            ReplySource::Fixed => "fixed",
            ReplySource::Generated => "generated",
            ReplySource::SafetyFallback => "safety_fallback",
        };
        Self {
            status: "ok".to_string(),
            outcome: if allowed { "ALLOWED" } else { "COOLDOWN" }.to_string(),
            reason: (!allowed).then(|| format!("Please wait {} seconds.", outcome.retry_after_seconds)),
            reason_code: Some(outcome.reason_code.0),
            retryable: !allowed,
            session_id: Some(outcome.session_id.to_hex()),
            mode: Some(outcome.mode),
            allowed,
            safety_level: Some(outcome.safety_level),
            reasons: outcome.reasons,
            degraded: outcome.degraded,
            cooldown_seconds: outcome.cooldown_seconds,
            retry_after_seconds: outcome.retry_after_seconds,
            guidance: Some(outcome.directive.guidance),
            reply_text: Some(response.reply_text),
            reply_source: Some(reply_source.to_string()),
            transcript: response.transcript,
            stored_audio_url: response.stored_audio_url,
            audio_b64: response.reply_audio.map(|audio| BASE64.encode(audio)),
            session_reset: outcome.session_reset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub live_sessions: usize,
}

/// HTTP status plus body for a rejected request.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterFailure {
    pub http_status: u16,
    pub body: TurnAdapterResponse,
}

impl AdapterFailure {
    fn new(http_status: u16, body: TurnAdapterResponse) -> Self {
        Self { http_status, body }
    }

    fn unauthenticated() -> Self {
        Self::new(
            401,
            TurnAdapterResponse::rejected(
                "Please sign in again.",
                reason_codes::ADAPTER_UNAUTHENTICATED,
                false,
            ),
        )
    }

    fn bad_request(reason: &str) -> Self {
        Self::new(
            400,
            TurnAdapterResponse::rejected(reason, reason_codes::ADAPTER_BAD_REQUEST, false),
        )
    }
}

/// Maps a turn failure onto the HTTP status the adapter answers with.
pub fn http_status_for(err: &IngressError) -> u16 {
    match err {
        IngressError::Contract(_) => 400,
        IngressError::TranscriptionUnavailable(_) => 503,
        IngressError::Turn(turn) => match turn {
            TurnError::EmptyUtterance | TurnError::Contract(_) => 400,
            TurnError::SessionOwnerMismatch => 403,
            TurnError::SessionArchived => 410,
            TurnError::ConcurrentTurnConflict => 409,
            TurnError::GenerationUnavailable | TurnError::Storage(_) => 503,
        },
    }
}

impl From<IngressError> for AdapterFailure {
    fn from(err: IngressError) -> Self {
        let status = http_status_for(&err);
        if status >= 500 {
            warn!(error = %err, http_status = status, "turn failed");
        }
        Self::new(
            status,
            TurnAdapterResponse::rejected(
                err.user_message(),
                reason_codes::ADAPTER_TURN_FAILED,
                err.retryable(),
            ),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    pub bind: String,
    pub cool: Ph1CoolConfig,
    pub harm_wiring: Ph1HarmWiringConfig,
    pub session: SessionEngineConfig,
    pub sweep_interval_ms: u64,
    pub store_path: Option<PathBuf>,
    pub clip_dir: Option<PathBuf>,
    pub token_secret: Option<String>,
    pub log_json: bool,
}

impl AdapterConfig {
    pub fn from_env() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    /// Invalid or out-of-range numbers fall back to the default for that setting.
    pub fn from_env_var_map<F>(mut env_getter: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let cool_default = Ph1CoolConfig::mvp_v1();
        let mut cool = Ph1CoolConfig {
            cooldown_base_s: parse_in_range(
                env_getter("LISTENER_COOLDOWN_SECONDS"),
                1..=3_600,
                cool_default.cooldown_base_s,
            ),
            cooldown_max_s: parse_in_range(
                env_getter("LISTENER_COOLDOWN_MAX_SECONDS"),
                1..=86_400,
                cool_default.cooldown_max_s,
            ),
            rate_max_requests: parse_in_range(
                env_getter("LISTENER_RATE_MAX_REQUESTS"),
                1..=10_000,
                cool_default.rate_max_requests,
            ),
            rate_window_s: parse_in_range(
                env_getter("LISTENER_RATE_WINDOW_SECONDS"),
                1..=86_400,
                cool_default.rate_window_s,
            ),
            ..cool_default
        };
        cool.cooldown_max_s = cool.cooldown_max_s.max(cool.cooldown_base_s);

        let harm_wiring = Ph1HarmWiringConfig {
            classifier_timeout_ms: parse_in_range(
                env_getter("LISTENER_CLASSIFIER_TIMEOUT_MS"),
                1..=60_000,
                Ph1HarmWiringConfig::mvp_v1().classifier_timeout_ms,
            ),
        };
        let session = SessionEngineConfig {
            idle_archive_s: parse_in_range(
                env_getter("LISTENER_SESSION_IDLE_SECONDS"),
                60..=7 * 86_400,
                SessionEngineConfig::mvp_v1().idle_archive_s,
            ),
            ..SessionEngineConfig::mvp_v1()
        };

        Self {
            bind: non_empty(env_getter("LISTENER_HTTP_BIND"))
                .unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            cool,
            harm_wiring,
            session,
            sweep_interval_ms: parse_in_range(
                env_getter("LISTENER_SWEEP_INTERVAL_MS"),
                100..=3_600_000,
                30_000,
            ),
            store_path: non_empty(env_getter("LISTENER_STORE_PATH")).map(PathBuf::from),
            clip_dir: non_empty(env_getter("LISTENER_CLIP_DIR")).map(PathBuf::from),
            token_secret: non_empty(env_getter("LISTENER_TOKEN_SECRET")),
            log_json: env_getter("LISTENER_LOG_JSON").is_some_and(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "on" | "yes"
                )
            }),
        }
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_in_range<T>(raw: Option<String>, range: std::ops::RangeInclusive<T>, default: T) -> T
where
    T: std::str::FromStr + PartialOrd,
{
    raw.and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| range.contains(v))
        .unwrap_or(default)
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`), text or JSON lines.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Wall-clock nanoseconds since the epoch, so persisted cooldowns stay meaningful across
/// restarts.
pub fn wall_clock_now() -> MonotonicTimeNs {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    MonotonicTimeNs(u64::try_from(ns).unwrap_or(u64::MAX))
}

/// Parses a client-supplied session id, or opens a fresh one when absent.
pub fn resolve_session_id(raw: Option<&str>) -> Result<SessionId, AdapterFailure> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => SessionId::parse_hex(raw)
            .map_err(|_| AdapterFailure::bad_request("That conversation id is not valid.")),
        None => Ok(SessionId(rand::thread_rng().gen_range(1..=u128::MAX))),
    }
}

pub fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// The external services a runtime talks to.
pub struct AdapterCollaborators {
    pub scores: Arc<dyn HarmScoreSource>,
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub speaker: Arc<dyn Speaker>,
    pub clips: Arc<dyn ClipStore>,
}

impl AdapterCollaborators {
    /// Keyword-only classification, placeholder transcript and reply, echo speech, no clip
    /// storage.
    pub fn offline() -> Self {
        Self {
            scores: Arc::new(NoScoreSource),
            transcriber: Arc::new(PlaceholderTranscriber),
            generator: Arc::new(PlaceholderReplyGenerator),
            speaker: Arc::new(EchoSpeaker),
            clips: Arc::new(NoClipStore),
        }
    }

    fn with_clip_dir(mut self, clip_dir: Option<&PathBuf>) -> Self {
        if let Some(dir) = clip_dir {
            info!(clip_dir = %dir.display(), "raw clip storage enabled");
            self.clips = Arc::new(DirectoryClipStore::new(dir.clone()));
        }
        self
    }
}

pub struct AdapterRuntime {
    ingress: AppServerIngressRuntime<ListenerStore>,
    verifier: Arc<dyn IdentityVerifier>,
    store: Arc<Mutex<ListenerStore>>,
}

impl AdapterRuntime {
    pub fn new(
        config: &AdapterConfig,
        store: ListenerStore,
        verifier: Arc<dyn IdentityVerifier>,
        collaborators: AdapterCollaborators,
    ) -> Result<Self, String> {
        let AdapterCollaborators {
            scores,
            transcriber,
            generator,
            speaker,
            clips,
        } = collaborators;
        let harm = Ph1HarmWiring::new(
            config.harm_wiring,
            Ph1HarmRuntime::new(Ph1HarmConfig::mvp_v1()),
            scores,
        )
        .map_err(|err| format!("invalid classifier config: {err}"))?;
        let cooldowns = CooldownManager::new(config.cool)
            .map_err(|err| format!("invalid cooldown config: {err}"))?;
        let store = Arc::new(Mutex::new(store));
        let engine = SessionEngine::new(
            config.session,
            harm,
            Ph1LoopRuntime::new(Ph1LoopConfig::mvp_v1()),
            Arc::new(cooldowns),
            Arc::clone(&store),
        )
        .map_err(|err| format!("invalid session config: {err}"))?;
        let ingress = AppServerIngressRuntime::new(
            Arc::new(engine),
            transcriber,
            generator,
            speaker,
            clips,
        );
        Ok(Self {
            ingress,
            verifier,
            store,
        })
    }

    pub fn new_offline(
        config: &AdapterConfig,
        store: ListenerStore,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self, String> {
        Self::new(
            config,
            store,
            verifier,
            AdapterCollaborators::offline().with_clip_dir(config.clip_dir.as_ref()),
        )
    }

    pub fn default_from_env(config: &AdapterConfig) -> Result<Self, String> {
        let secret = config
            .token_secret
            .clone()
            .ok_or_else(|| "LISTENER_TOKEN_SECRET must be set".to_string())?;
        let verifier = SignedTokenVerifier::new(secret)
            .map_err(|_| "LISTENER_TOKEN_SECRET must be at least 16 bytes".to_string())?;
        let store = match &config.store_path {
            Some(path) => ListenerStore::open_snapshot(path.clone()).map_err(|err| {
                format!("failed to open store snapshot '{}': {err}", path.display())
            })?,
            None => ListenerStore::new_in_memory(),
        };

        let provider = OpenAiProviderConfig::from_env();
        if !provider.is_configured() {
            info!("OPENAI_API_KEY not set; running with offline collaborators");
            return Self::new_offline(config, store, Arc::new(verifier));
        }
        let provider = Arc::new(provider);
        let collaborators = AdapterCollaborators {
            scores: Arc::new(OpenAiHarmScoreSource::new(
                Arc::clone(&provider),
                config.harm_wiring.classifier_timeout_ms,
            )),
            transcriber: Arc::new(OpenAiTranscriber::new(Arc::clone(&provider))),
            generator: Arc::new(OpenAiReplyGenerator::new(Arc::clone(&provider))),
            speaker: Arc::new(OpenAiSpeaker::new(provider)),
            clips: Arc::new(NoClipStore),
        };
        Self::new(
            config,
            store,
            Arc::new(verifier),
            collaborators.with_clip_dir(config.clip_dir.as_ref()),
        )
    }

    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<UserId, AdapterFailure> {
        let token = bearer_token(authorization).ok_or_else(AdapterFailure::unauthenticated)?;
        self.verifier
            .verify(token)
            .await
            .map_err(|_| AdapterFailure::unauthenticated())
    }

    pub async fn run_text_turn(
        &self,
        user_id: &UserId,
        request: TurnAdapterRequest,
        now: MonotonicTimeNs,
    ) -> Result<TurnAdapterResponse, AdapterFailure> {
        let session_id = resolve_session_id(request.session_id.as_deref())?;
        let response = self
            .ingress
            .run_text_turn(session_id, user_id, &request.text, now)
            .await?;
        Ok(TurnAdapterResponse::from_turn(response))
    }

    pub async fn run_voice_note(
        &self,
        user_id: &UserId,
        request: VoiceNoteAdapterRequest,
        now: MonotonicTimeNs,
    ) -> Result<TurnAdapterResponse, AdapterFailure> {
        let session_id = resolve_session_id(request.session_id.as_deref())?;
        let audio = BASE64
            .decode(request.audio_b64.trim())
            .map_err(|_| AdapterFailure::bad_request("That recording couldn't be read."))?;
        let voice = AppVoiceIngressRequest::v1(
            session_id,
            user_id.clone(),
            audio,
            request.format,
            request.store_raw,
        )
        .map_err(|_| AdapterFailure::bad_request("That recording couldn't be processed."))?;
        let response = self.ingress.run_voice_turn(voice, now).await?;
        Ok(TurnAdapterResponse::from_turn(response))
    }

    /// HTTP status for a successful turn: gated turns answer 429 with the pause script.
    pub fn http_status_for_response(response: &TurnAdapterResponse) -> u16 {
        if response.allowed {
            200
        } else {
            429
        }
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        AdapterHealthResponse {
            status: "ok".to_string(),
            live_sessions: self.ingress.engine().live_sessions(),
        }
    }

    /// Archives idle sessions, then writes the store snapshot when one is configured. The
    /// snapshot is copied under the store lock and written on the blocking pool.
    pub async fn run_maintenance_pass(&self, now: MonotonicTimeNs) -> Result<usize, String> {
        let archived = self.ingress.engine().sweep_idle(now);
        let job = self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot_job();
        if let Some(job) = job {
            tokio::task::spawn_blocking(move || job.write())
                .await
                .map_err(|err| format!("store snapshot task failed: {err}"))?
                .map_err(|err| format!("store snapshot flush failed: {err}"))?;
        }
        Ok(archived)
    }
}
