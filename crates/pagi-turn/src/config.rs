//! Engine configuration.
//!
//! Layered: built-in defaults, then an optional TOML file, then environment
//! variables of the form `PAGI_TURN__SECTION__FIELD` (e.g.
//! `PAGI_TURN__SEGMENTER__MAX_SILENCE_MS=800`).

use crate::audio::AudioConfig;
use crate::barge_in::BargeInConfig;
use crate::error::{TurnError, TurnResult};
use crate::history::HistoryConfig;
use crate::metrics::CostConfig;
use crate::segmenter::SegmenterConfig;
use crate::services::GenerationConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful voice assistant. Keep replies short and conversational: one to three sentences.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub segmenter: SegmenterConfig,
    pub barge_in: BargeInConfig,
    pub history: HistoryConfig,
    pub generation: GenerationConfig,
    pub cost: CostConfig,
    pub system_prompt: String,
    /// Session length; `None` runs until stopped
    pub max_turns: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            segmenter: SegmenterConfig::default(),
            barge_in: BargeInConfig::default(),
            history: HistoryConfig::default(),
            generation: GenerationConfig::default(),
            cost: CostConfig::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_turns: None,
        }
    }
}

impl EngineConfig {
    /// Load from `path` (if given and present) and the environment, then validate.
    pub fn load(path: Option<&Path>) -> TurnResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if path.exists() {
                info!("Loading config from {}", path.display());
                builder = builder.add_source(config::File::from(path));
            } else {
                return Err(TurnError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
        }
        let built = builder
            .add_source(
                config::Environment::with_prefix("PAGI_TURN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: EngineConfig = built.try_deserialize()?;
        config.cost = config.cost.with_env_fallback();
        config.generation = config.generation.with_env_fallback();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TurnResult<()> {
        if self.audio.sample_rate == 0 || self.audio.frame_ms == 0 {
            return Err(TurnError::Config(
                "sample_rate and frame_ms must be positive".to_string(),
            ));
        }
        if self.audio.queue_capacity == 0 {
            return Err(TurnError::Config("queue_capacity must be positive".to_string()));
        }
        self.vad.validate(&self.audio)?;
        if self.history.window == 0 {
            return Err(TurnError::Config("history window must be positive".to_string()));
        }
        if self.barge_in.enabled && self.barge_in.threshold_frames == 0 {
            return Err(TurnError::Config(
                "barge_in threshold_frames must be positive".to_string(),
            ));
        }
        if self.segmenter.max_silence_ms == 0 {
            return Err(TurnError::Config("max_silence_ms must be positive".to_string()));
        }
        if self.system_prompt.trim().is_empty() {
            return Err(TurnError::Config("system_prompt is empty".to_string()));
        }
        Ok(())
    }
}
