//! OpenAI-compatible HTTP adapters (OpenAI, Groq, OpenRouter, local servers).

use super::{env_any, GenerationConfig, ReplyGenerator, SpeechSynthesizer, Transcriber, Transcript};
use crate::audio::{AudioBuffer, SpeechAudio};
use crate::error::{TurnError, TurnResult};
use crate::history::Message;
use crate::sentence::TokenStream;
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_STT_MODEL: &str = "whisper-1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TTS_MODEL: &str = "tts-1";
const DEFAULT_TTS_VOICE: &str = "shimmer";

/// Shared key fallbacks after the service-specific variable.
const SHARED_KEYS: [&str; 3] = ["OPENAI_API_KEY", "GROQ_API_KEY", "OPENROUTER_API_KEY"];

fn api_key(primary: &str) -> TurnResult<String> {
    let mut keys = vec![primary];
    keys.extend(SHARED_KEYS);
    env_any(&keys).ok_or_else(|| {
        TurnError::Config(format!(
            "requires {} (or one of {})",
            primary,
            SHARED_KEYS.join(", ")
        ))
    })
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

fn http_client(timeout: Duration) -> TurnResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TurnError::Config(format!("HTTP client: {}", e)))
}

/// Transcription via `POST {base}/audio/transcriptions` (multipart WAV upload).
///
/// Env: `STT_API_URL`, `STT_API_KEY`, `STT_MODEL` (default whisper-1).
#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    pub base_url: String,
    pub model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn from_env() -> TurnResult<Self> {
        let base_url = env_any(&["STT_API_URL"]).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = env_any(&["STT_MODEL"]).unwrap_or_else(|| DEFAULT_STT_MODEL.to_string());
        Self::new(base_url, api_key("STT_API_KEY")?, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> TurnResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client: http_client(Duration::from_secs(30))?,
        })
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio: &AudioBuffer) -> TurnResult<Transcript> {
        let started = Instant::now();
        if audio.is_empty() {
            return Ok(Transcript::default());
        }
        let wav = audio.to_wav()?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TurnError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");

        let res = self
            .client
            .post(endpoint(&self.base_url, "audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TurnError::Transcription(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(TurnError::Transcription(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        let body: TranscriptionResponse = res
            .json()
            .await
            .map_err(|e| TurnError::Transcription(e.to_string()))?;
        Ok(Transcript {
            text: body.text.trim().to_string(),
            latency: started.elapsed(),
        })
    }
}

/// Streaming chat via `POST {base}/chat/completions` with `stream: true` (SSE).
///
/// Env: `LLM_API_URL`, `LLM_API_KEY`, `LLM_MODEL`.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    pub url: String,
    pub model: String,
    api_key: String,
    params: GenerationConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

/// What one SSE line means for the token stream.
#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

/// Splits a byte stream into lines, decoding each line only once it is complete
/// so a character split across network chunks survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=newline).collect();
        Some(match String::from_utf8(line) {
            Ok(line) => line,
            Err(e) => {
                debug!("Invalid UTF-8 in SSE line: {}", e);
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        })
    }
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(SseLine::Token)
            .unwrap_or(SseLine::Skip),
        Err(e) => {
            debug!("Failed to parse SSE chunk: {} - data: {}", e, data);
            SseLine::Skip
        }
    }
}

impl OpenAiChat {
    pub fn from_env(params: GenerationConfig) -> TurnResult<Self> {
        let base_url = env_any(&["LLM_API_URL"]).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = env_any(&["LLM_MODEL"]).unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string());
        Self::new(base_url, api_key("LLM_API_KEY")?, model, params)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        params: GenerationConfig,
    ) -> TurnResult<Self> {
        Ok(Self {
            url: endpoint(&base_url.into(), "chat/completions"),
            api_key: api_key.into(),
            model: model.into(),
            params: params.with_env_fallback(),
            client: http_client(Duration::from_secs(60))?,
        })
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiChat {
    async fn stream_reply(&self, messages: &[Message]) -> TurnResult<TokenStream> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.params.temperature,
            max_tokens: self.params.max_tokens,
            seed: self.params.seed,
            stream: true,
        };
        info!(model = %self.model, messages = messages.len(), "Streaming reply requested");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TurnError::Generation(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, "LLM API error: {}", text);
            return Err(TurnError::Generation(format!(
                "LLM API error {}: {}",
                status, text
            )));
        }

        let (tx, rx) = mpsc::channel(self.params.token_queue.max(1));
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut lines = LineBuffer::default();
            loop {
                let bytes = match stream.try_next().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(TurnError::Generation(e.to_string()))).await;
                        return;
                    }
                };
                lines.extend(&bytes);

                while let Some(line) = lines.next_line() {
                    match parse_sse_line(&line) {
                        SseLine::Token(token) => {
                            // Receiver dropped: the turn abandoned this reply
                            if tx.send(Ok(token)).await.is_err() {
                                debug!("Reply stream abandoned");
                                return;
                            }
                        }
                        SseLine::Done => return,
                        SseLine::Skip => {}
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Synthesis via `POST {base}/audio/speech`.
///
/// Env: `TTS_API_URL`, `TTS_API_KEY`, `TTS_MODEL` (default tts-1), `TTS_VOICE`.
#[derive(Debug, Clone)]
pub struct OpenAiSpeech {
    pub base_url: String,
    pub model: String,
    pub voice: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    pub fn from_env() -> TurnResult<Self> {
        let base_url = env_any(&["TTS_API_URL"]).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = env_any(&["TTS_MODEL"]).unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string());
        let voice = env_any(&["TTS_VOICE"]).unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string());
        Ok(Self::new(base_url, api_key("TTS_API_KEY")?, model)?.with_voice(voice))
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> TurnResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: DEFAULT_TTS_VOICE.to_string(),
            client: http_client(Duration::from_secs(60))?,
        })
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> TurnResult<SpeechAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SpeechAudio::default());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "wav",
        });
        let res = self
            .client
            .post(endpoint(&self.base_url, "audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TurnError::Synthesis(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(TurnError::Synthesis(format!(
                "TTS API error {}: {}",
                status, body
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| TurnError::Synthesis(e.to_string()))?;
        Ok(SpeechAudio::new(bytes.to_vec()))
    }
}
