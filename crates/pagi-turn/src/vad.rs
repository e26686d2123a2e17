//! Voice Activity Detection
//!
//! Per-frame speech/silence classification. WebRTC VAD is the default backend;
//! the RMS energy gate needs no native state and is handy for synthetic audio.

use crate::audio::AudioConfig;
use crate::error::{TurnError, TurnResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Classifies a single frame as speech or silence.
pub trait VoiceActivityDetector {
    /// `true` when the frame contains speech.
    fn is_speech(&mut self, frame: &[f32]) -> TurnResult<bool>;
}

/// Which detector the capture thread runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadBackend {
    WebRtc,
    Energy,
}

/// Configuration for VAD detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub backend: VadBackend,

    /// WebRTC aggressiveness (0-3, where 3 is most aggressive)
    pub mode: u8,

    /// RMS level above which the energy backend reports speech
    pub energy_threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            backend: VadBackend::WebRtc,
            mode: 2,
            energy_threshold: 0.02,
        }
    }
}

impl VadConfig {
    pub fn validate(&self, audio: &AudioConfig) -> TurnResult<()> {
        if self.mode > 3 {
            return Err(TurnError::Config(format!(
                "VAD mode must be 0-3, got {}",
                self.mode
            )));
        }
        if self.backend == VadBackend::WebRtc {
            webrtc_sample_rate(audio.sample_rate)?;
            if !matches!(audio.frame_ms, 10 | 20 | 30) {
                return Err(TurnError::Config(format!(
                    "WebRTC VAD requires 10, 20 or 30ms frames, got {}ms",
                    audio.frame_ms
                )));
            }
        }
        if !(self.energy_threshold > 0.0) {
            return Err(TurnError::Config(
                "energy_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Construct the configured detector for frames shaped by `audio`.
    pub fn build(&self, audio: &AudioConfig) -> TurnResult<Box<dyn VoiceActivityDetector>> {
        self.validate(audio)?;
        match self.backend {
            VadBackend::WebRtc => Ok(Box::new(WebRtcVad::new(
                audio.sample_rate,
                audio.frame_samples(),
                self.mode,
            )?)),
            VadBackend::Energy => Ok(Box::new(EnergyVad::new(self.energy_threshold))),
        }
    }
}

fn webrtc_sample_rate(rate: u32) -> TurnResult<SampleRate> {
    match rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(TurnError::Config(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

fn webrtc_mode(mode: u8) -> VadMode {
    match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

/// Voice Activity Detector using WebRTC VAD
///
/// Not `Send`: construct it on the thread that uses it.
pub struct WebRtcVad {
    vad: Vad,
    frame_samples: usize,
}

impl WebRtcVad {
    pub fn new(sample_rate: u32, frame_samples: usize, mode: u8) -> TurnResult<Self> {
        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
            sample_rate, mode
        );
        let mut vad = Vad::new();
        vad.set_mode(webrtc_mode(mode));
        vad.set_sample_rate(webrtc_sample_rate(sample_rate)?);
        Ok(Self { vad, frame_samples })
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

impl VoiceActivityDetector for WebRtcVad {
    fn is_speech(&mut self, frame: &[f32]) -> TurnResult<bool> {
        if frame.len() != self.frame_samples {
            return Err(TurnError::Vad(format!(
                "Expected {} samples, got {}",
                self.frame_samples,
                frame.len()
            )));
        }

        let pcm: Vec<i16> = frame
            .iter()
            .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        let is_speech = self
            .vad
            .is_voice_segment(&pcm)
            .map_err(|e| TurnError::Vad(format!("VAD processing failed: {:?}", e)))?;

        debug!("VAD result: {}", if is_speech { "SPEECH" } else { "SILENCE" });
        Ok(is_speech)
    }
}

/// Root-mean-square gate.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

/// RMS level of a frame.
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&mut self, frame: &[f32]) -> TurnResult<bool> {
        Ok(rms(frame) >= self.threshold)
    }
}
