//! External services: transcription, reply generation, speech synthesis.
//!
//! The engine treats all three as opaque async collaborators. Production
//! adapters speak the OpenAI-compatible HTTP API; placeholders keep the loop
//! runnable offline.

mod openai;
mod placeholder;

pub use openai::{OpenAiChat, OpenAiSpeech, OpenAiTranscriber};
pub use placeholder::{EchoGenerator, PlaceholderSynthesizer, PlaceholderTranscriber};

use crate::audio::{AudioBuffer, SpeechAudio};
use crate::error::TurnResult;
use crate::history::Message;
pub use crate::sentence::TokenStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Text recognized from an audio buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub latency: Duration,
}

/// Speech-to-text. Called for partial snapshots and for the final utterance.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &AudioBuffer) -> TurnResult<Transcript>;
}

/// Streaming chat completion.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Start a reply. Dropping the returned stream abandons it.
    async fn stream_reply(&self, messages: &[Message]) -> TurnResult<TokenStream>;
}

/// Text-to-speech, one call per sentence.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> TurnResult<SpeechAudio>;
}

/// Sampling parameters for reply generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Falls back to the `SEED` environment variable when unset
    pub seed: Option<u64>,
    /// Buffered fragments between the HTTP reader and the sentence stage
    pub token_queue: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            max_tokens: 180,
            seed: None,
            token_queue: 64,
        }
    }
}

impl GenerationConfig {
    pub fn with_env_fallback(mut self) -> Self {
        if self.seed.is_none() {
            self.seed = std::env::var("SEED")
                .ok()
                .and_then(|s| s.trim().parse().ok());
        }
        self
    }
}

/// The three collaborators, ready to hand to the orchestrator.
#[derive(Clone)]
pub struct Services {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Pick the best available adapter per service from the environment.
///
/// Each service falls back to its placeholder when no API key is configured.
pub fn from_env(generation: &GenerationConfig) -> Services {
    let transcriber: Arc<dyn Transcriber> = match OpenAiTranscriber::from_env() {
        Ok(stt) => {
            info!("🎧 STT: {} ({})", stt.model, stt.base_url);
            Arc::new(stt)
        }
        Err(e) => {
            warn!("STT not configured ({}), using placeholder", e);
            Arc::new(PlaceholderTranscriber::new())
        }
    };

    let generator: Arc<dyn ReplyGenerator> = match OpenAiChat::from_env(generation.clone()) {
        Ok(llm) => {
            info!("🧠 LLM: {} ({})", llm.model, llm.url);
            Arc::new(llm)
        }
        Err(e) => {
            warn!("LLM not configured ({}), echoing the user instead", e);
            Arc::new(EchoGenerator::new())
        }
    };

    let synthesizer: Arc<dyn SpeechSynthesizer> = match OpenAiSpeech::from_env() {
        Ok(tts) => {
            info!("🔊 TTS: {} voice={} ({})", tts.model, tts.voice, tts.base_url);
            Arc::new(tts)
        }
        Err(e) => {
            warn!("TTS not configured ({}), replies will be silent", e);
            Arc::new(PlaceholderSynthesizer::default())
        }
    };

    Services {
        transcriber,
        generator,
        synthesizer,
    }
}

/// Read the first set, non-empty variable of `keys`.
pub(crate) fn env_any(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_defaults() {
        let config = GenerationConfig::default();
        assert!((config.temperature - 0.4).abs() < f32::EPSILON);
        assert_eq!(config.max_tokens, 180);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn explicit_seed_wins_over_env() {
        let config = GenerationConfig {
            seed: Some(7),
            ..Default::default()
        }
        .with_env_fallback();
        assert_eq!(config.seed, Some(7));
    }
}
