//! Offline stand-ins so the loop runs without API keys.

use super::{ReplyGenerator, SpeechSynthesizer, Transcriber, Transcript};
use crate::audio::{AudioBuffer, SpeechAudio};
use crate::error::TurnResult;
use crate::history::{Message, Role};
use crate::sentence::TokenStream;
use async_trait::async_trait;
use std::io::Cursor;
use std::time::Duration;
use tokio::sync::mpsc;

/// Returns a fixed string, or a description of the buffer.
#[derive(Debug, Default)]
pub struct PlaceholderTranscriber {
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl Transcriber for PlaceholderTranscriber {
    async fn transcribe(&self, audio: &AudioBuffer) -> TurnResult<Transcript> {
        let text = match &self.response {
            Some(r) => r.clone(),
            None => format!(
                "[STT placeholder: {} samples, {:.1}s]",
                audio.samples.len(),
                audio.duration().as_secs_f32()
            ),
        };
        Ok(Transcript {
            text,
            latency: Duration::ZERO,
        })
    }
}

/// Streams "You said: ..." back word by word.
#[derive(Debug, Clone)]
pub struct EchoGenerator {
    delay: Duration,
}

impl EchoGenerator {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(50),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplyGenerator for EchoGenerator {
    async fn stream_reply(&self, messages: &[Message]) -> TurnResult<TokenStream> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        let reply = format!("You said: {}.", last_user.trim_end_matches(['.', '!', '?']));

        let (tx, rx) = mpsc::channel(16);
        let delay = self.delay;
        tokio::spawn(async move {
            for word in reply.split_inclusive(' ') {
                if tx.send(Ok(word.to_string())).await.is_err() {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        });
        Ok(rx)
    }
}

/// Silent 16-bit mono WAV whose length follows the text length.
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    pub sample_rate: u32,
    pub ms_per_char: u64,
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            ms_per_char: 10,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, text: &str) -> TurnResult<SpeechAudio> {
        let ms = text.chars().count() as u64 * self.ms_per_char;
        let samples = (self.sample_rate as u64 * ms / 1000) as usize;
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::with_capacity(44 + samples * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for _ in 0..samples {
                writer.write_sample(0i16)?;
            }
            writer.finalize()?;
        }
        Ok(SpeechAudio::new(cursor.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_with_response() {
        let stt = PlaceholderTranscriber::with_response("hello world");
        let t = stt.transcribe(&AudioBuffer::default()).await.unwrap();
        assert_eq!(t.text, "hello world");
    }

    #[tokio::test]
    async fn placeholder_describes_buffer() {
        let stt = PlaceholderTranscriber::new();
        let buffer = AudioBuffer {
            samples: vec![0.0; 480],
            sample_rate: 16000,
        };
        let t = stt.transcribe(&buffer).await.unwrap();
        assert!(t.text.contains("480"));
    }

    #[tokio::test]
    async fn echo_streams_the_last_user_message() {
        let echo = EchoGenerator::with_delay(Duration::ZERO);
        let messages = [
            Message::new(Role::System, "sys"),
            Message::new(Role::User, "What is my balance?"),
        ];
        let mut rx = echo.stream_reply(&messages).await.unwrap();
        let mut reply = String::new();
        while let Some(token) = rx.recv().await {
            reply.push_str(&token.unwrap());
        }
        assert_eq!(reply, "You said: What is my balance.");
    }

    #[tokio::test]
    async fn placeholder_audio_is_valid_wav() {
        let tts = PlaceholderSynthesizer::default();
        let audio = tts.synthesize("Hi.").await.unwrap();
        let reader = hound::WavReader::new(Cursor::new(audio.into_bytes())).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.len(), 480);
    }
}
