#![forbid(unsafe_code)]

//! Blocking clients for an OpenAI-compatible HTTP API: moderation scores, chat replies,
//! transcription and speech synthesis. Errors never carry response bodies or key material.

use std::env;
use std::fmt;
use std::io::Read;
use std::time::Duration;

use listener_kernel_contracts::ph1harm::{HarmReason, HarmScores};
use serde_json::Value;

const MAX_AUDIO_RESPONSE_BYTES: u64 = 8 * 1024 * 1024;
const MAX_REPLY_CHARS: usize = 1_200;

pub const SUPPORTED_AUDIO_FORMATS: &[(&str, &str)] = &[
    ("webm", "audio/webm"),
    ("wav", "audio/wav"),
    ("mp3", "audio/mpeg"),
    ("m4a", "audio/mp4"),
    ("mp4", "audio/mp4"),
    ("ogg", "audio/ogg"),
    ("flac", "audio/flac"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCallError {
    pub provider: &'static str,
    pub http_status: Option<u16>,
    pub error_kind: &'static str,
}

impl ProviderCallError {
    pub fn new(provider: &'static str, error_kind: &'static str, http_status: Option<u16>) -> Self {
        Self {
            provider,
            http_status,
            error_kind,
        }
    }

    pub fn safe_detail(&self) -> String {
        match self.http_status {
            Some(status) => format!(
                "provider={} error={} status={}",
                self.provider, self.error_kind, status
            ),
            None => format!("provider={} error={}", self.provider, self.error_kind),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind == "timeout"
    }
}

impl fmt::Display for ProviderCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.safe_detail())
    }
}

impl std::error::Error for ProviderCallError {}

#[derive(Clone, PartialEq, Eq)]
pub struct OpenAiProviderConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub chat_model: String,
    pub moderation_model: String,
    pub transcribe_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub timeout_ms: u32,
    pub user_agent: String,
}

impl fmt::Debug for OpenAiProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .field("moderation_model", &self.moderation_model)
            .field("transcribe_model", &self.transcribe_model)
            .field("tts_model", &self.tts_model)
            .field("tts_voice", &self.tts_voice)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl OpenAiProviderConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env::var("OPENAI_API_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            base_url: env::var("OPENAI_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            chat_model: env::var("OPENAI_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            moderation_model: env::var("OPENAI_MODERATION_MODEL")
                .unwrap_or_else(|_| "omni-moderation-latest".to_string()),
            transcribe_model: env::var("OPENAI_TRANSCRIBE_MODEL")
                .unwrap_or_else(|_| "whisper-1".to_string()),
            tts_model: env::var("OPENAI_TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string()),
            tts_voice: env::var("OPENAI_TTS_VOICE").unwrap_or_else(|_| "alloy".to_string()),
            timeout_ms: 10_000,
            user_agent: "listener/1.0".to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn key(&self, provider: &'static str) -> Result<&str, ProviderCallError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderCallError::new(provider, "missing_config", None))
    }
}

/// One prior exchange handed to the chat model as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLine {
    pub from_user: bool,
    pub text: String,
}

pub fn moderation_scores(
    config: &OpenAiProviderConfig,
    timeout_ms: u32,
    text: &str,
) -> Result<HarmScores, ProviderCallError> {
    let key = config.key("moderation")?;
    let agent = build_http_agent(timeout_ms, &config.user_agent)
        .map_err(|_| ProviderCallError::new("moderation", "config_invalid", None))?;
    let payload = serde_json::json!({
        "model": config.moderation_model,
        "input": text,
    });
    let body = post_json(agent, "moderation", &config.url("moderations"), key, &payload)?;
    parse_moderation_scores(&body)
        .ok_or_else(|| ProviderCallError::new("moderation", "json_shape", None))
}

pub fn chat_reply(
    config: &OpenAiProviderConfig,
    guidance: &str,
    context: &[ContextLine],
    user_text: &str,
) -> Result<String, ProviderCallError> {
    let key = config.key("chat")?;
    let agent = build_http_agent(config.timeout_ms, &config.user_agent)
        .map_err(|_| ProviderCallError::new("chat", "config_invalid", None))?;
    let mut messages = vec![serde_json::json!({"role": "system", "content": guidance})];
    for line in context {
        let role = if line.from_user { "user" } else { "assistant" };
        messages.push(serde_json::json!({"role": role, "content": line.text}));
    }
    messages.push(serde_json::json!({"role": "user", "content": user_text}));
    let payload = serde_json::json!({
        "model": config.chat_model,
        "messages": messages,
        "temperature": 0.6,
        "max_tokens": 220,
    });
    let body = post_json(agent, "chat", &config.url("chat/completions"), key, &payload)?;
    parse_chat_reply(&body).ok_or_else(|| ProviderCallError::new("chat", "empty_results", None))
}

pub fn transcribe(
    config: &OpenAiProviderConfig,
    audio: &[u8],
    format: &str,
) -> Result<String, ProviderCallError> {
    let key = config.key("transcribe")?;
    let ext = format.trim().to_ascii_lowercase();
    let mime = mime_for_format(&ext)
        .ok_or_else(|| ProviderCallError::new("transcribe", "unsupported_format", None))?;
    let agent = build_http_agent(config.timeout_ms, &config.user_agent)
        .map_err(|_| ProviderCallError::new("transcribe", "config_invalid", None))?;
    let boundary = format!("----listener{:016x}", rand::random::<u64>());
    let body = multipart_body(
        &boundary,
        &[("model", config.transcribe_model.as_str())],
        ("file", &format!("voice-note.{ext}"), mime, audio),
    );
    let response = agent
        .post(&config.url("audio/transcriptions"))
        .set("Authorization", &format!("Bearer {key}"))
        .set(
            "Content-Type",
            &format!("multipart/form-data; boundary={boundary}"),
        )
        .send_bytes(&body)
        .map_err(|e| provider_error_from_ureq("transcribe", e))?;
    let value: Value = serde_json::from_reader(response.into_reader())
        .map_err(|_| ProviderCallError::new("transcribe", "json_parse", None))?;
    Ok(value
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string())
}

pub fn speak(config: &OpenAiProviderConfig, text: &str) -> Result<Vec<u8>, ProviderCallError> {
    let key = config.key("tts")?;
    let agent = build_http_agent(config.timeout_ms, &config.user_agent)
        .map_err(|_| ProviderCallError::new("tts", "config_invalid", None))?;
    let payload = serde_json::json!({
        "model": config.tts_model,
        "voice": config.tts_voice,
        "input": text,
        "response_format": "mp3",
    });
    let response = agent
        .post(&config.url("audio/speech"))
        .set("Content-Type", "application/json")
        .set("Authorization", &format!("Bearer {key}"))
        .send_json(payload)
        .map_err(|e| provider_error_from_ureq("tts", e))?;
    let mut audio = Vec::new();
    response
        .into_reader()
        .take(MAX_AUDIO_RESPONSE_BYTES)
        .read_to_end(&mut audio)
        .map_err(|_| ProviderCallError::new("tts", "body_read", None))?;
    if audio.is_empty() {
        return Err(ProviderCallError::new("tts", "empty_results", None));
    }
    Ok(audio)
}

pub fn mime_for_format(format: &str) -> Option<&'static str> {
    let format = format.trim().to_ascii_lowercase();
    SUPPORTED_AUDIO_FORMATS
        .iter()
        .find(|(f, _)| *f == format)
        .map(|(_, mime)| *mime)
}

/// Maps moderation category scores onto reason tags, keeping the max per tag.
pub fn parse_moderation_scores(body: &Value) -> Option<HarmScores> {
    let scores = body
        .get("results")?
        .as_array()?
        .first()?
        .get("category_scores")?
        .as_object()?;
    let mut pairs = Vec::new();
    for (category, score) in scores {
        let Some(score) = score.as_f64() else {
            continue;
        };
        let reason = match category.as_str() {
            "self-harm" | "self-harm/intent" | "self-harm/instructions" | "self_harm"
            | "self_harm_intent" => HarmReason::SelfHarm,
            "violence" | "violence/graphic" | "hate/threatening" | "illicit/violent" => {
                HarmReason::Violence
            }
            "harassment" | "harassment/threatening" => HarmReason::Harassment,
            _ => continue,
        };
        pairs.push((reason, (score as f32).clamp(0.0, 1.0)));
    }
    Some(HarmScores::from_pairs(pairs))
}

pub fn parse_chat_reply(body: &Value) -> Option<String> {
    let text = body
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()?
        .trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(MAX_REPLY_CHARS).collect())
}

fn multipart_body(
    boundary: &str,
    fields: &[(&str, &str)],
    file: (&str, &str, &str, &[u8]),
) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    let (name, filename, mime, bytes) = file;
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {mime}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn post_json(
    agent: ureq::Agent,
    provider: &'static str,
    endpoint: &str,
    api_key: &str,
    payload: &Value,
) -> Result<Value, ProviderCallError> {
    let response = agent
        .post(endpoint)
        .set("Content-Type", "application/json")
        .set("Authorization", &format!("Bearer {api_key}"))
        .set("Accept", "application/json")
        .send_json(payload.clone())
        .map_err(|e| provider_error_from_ureq(provider, e))?;
    serde_json::from_reader(response.into_reader())
        .map_err(|_| ProviderCallError::new(provider, "json_parse", None))
}

fn build_http_agent(timeout_ms: u32, user_agent: &str) -> Result<ureq::Agent, String> {
    if timeout_ms == 0 {
        return Err("timeout must be > 0".to_string());
    }
    let timeout = Duration::from_millis(u64::from(timeout_ms).max(100));
    Ok(ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .timeout_write(timeout)
        .user_agent(user_agent)
        .build())
}

fn provider_error_from_ureq(provider: &'static str, err: ureq::Error) -> ProviderCallError {
    match err {
        ureq::Error::Status(status, _) => {
            ProviderCallError::new(provider, "http_non_200", Some(status))
        }
        ureq::Error::Transport(transport) => {
            let combined = format!("{:?} {}", transport.kind(), transport);
            ProviderCallError::new(provider, classify_transport_error_kind(&combined), None)
        }
    }
}

fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("tls") || lower.contains("ssl") {
        "tls"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connect") {
        "connection"
    } else {
        "transport"
    }
}
