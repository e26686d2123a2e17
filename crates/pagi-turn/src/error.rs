//! Error types for the turn engine

use thiserror::Error;

/// Result type alias for turn-engine operations
pub type TurnResult<T> = Result<T, TurnError>;

/// How the orchestrator reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No usable user input. Ends the turn early, benign.
    Input,
    /// A collaborator call failed. Aborts the current turn.
    Service,
    /// One sentence could not be synthesized. Skipped, the reply continues.
    PartialSynthesis,
    /// Capture or playback hardware failed. Fatal to the session.
    Device,
    /// Misconfiguration or broken internal plumbing.
    Internal,
}

/// Errors that can occur while running a dialogue turn
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("Transcript was empty")]
    EmptyTranscript,

    #[error("Turn cancelled before an utterance was captured")]
    Cancelled,

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Sentence skipped, synthesis failed for {sentence:?}: {reason}")]
    PartialSynthesis { sentence: String, reason: String },

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Frame source closed")]
    SourceClosed,

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid turn: {0}")]
    InvalidTurn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnError {
    /// Classify this error for the orchestrator's continue/skip/abort decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnError::EmptyTranscript | TurnError::Cancelled => ErrorKind::Input,
            TurnError::Transcription(_) | TurnError::Generation(_) | TurnError::Synthesis(_) => {
                ErrorKind::Service
            }
            TurnError::PartialSynthesis { .. } => ErrorKind::PartialSynthesis,
            TurnError::AudioDevice(_)
            | TurnError::AudioStream(_)
            | TurnError::Playback(_)
            | TurnError::SourceClosed
            | TurnError::Vad(_) => ErrorKind::Device,
            TurnError::Config(_)
            | TurnError::ChannelClosed(_)
            | TurnError::InvalidTurn(_)
            | TurnError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the session must stop after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Device | ErrorKind::Internal)
    }
}

impl From<cpal::DevicesError> for TurnError {
    fn from(err: cpal::DevicesError) -> Self {
        TurnError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for TurnError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        TurnError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for TurnError {
    fn from(err: cpal::BuildStreamError) -> Self {
        TurnError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for TurnError {
    fn from(err: cpal::PlayStreamError) -> Self {
        TurnError::AudioStream(err.to_string())
    }
}

impl From<hound::Error> for TurnError {
    fn from(err: hound::Error) -> Self {
        TurnError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    }
}

impl From<config::ConfigError> for TurnError {
    fn from(err: config::ConfigError) -> Self {
        TurnError::Config(err.to_string())
    }
}
