//! # PAGI Turn - Real-time Spoken Dialogue
//!
//! Listens on the microphone, detects when the user has finished speaking,
//! transcribes the utterance, streams a reply from a language model, and speaks
//! it back sentence by sentence while the reply is still being generated. If
//! the user talks over the assistant, playback stops within ~150ms (barge-in).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Turn Orchestrator                          │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────┐  │
//! │  │  Audio In  │→ │ WebRTC VAD │→ │ Segmenter  │→ │    STT     │  │
//! │  │   (cpal)   │  │ (per frame)│  │ (gap logic)│  │  (HTTP)    │  │
//! │  └────────────┘  └────────────┘  └────────────┘  └────────────┘  │
//! │        │                                               ↓         │
//! │        ↓                                         ┌────────────┐  │
//! │  ┌────────────┐   CancellationSignal             │ LLM stream │  │
//! │  │  Barge-in  │ ─────────────────┐               └────────────┘  │
//! │  │  Monitor   │                  ↓                     ↓         │
//! │  └────────────┘  ┌────────────┐  ┌────────────┐  ┌────────────┐  │
//! │                  │ Audio Out  │← │    TTS     │← │ Sentences  │  │
//! │                  │  (rodio)   │  │ (per sent.)│  │            │  │
//! │                  └────────────┘  └────────────┘  └────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod barge_in;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod feedback;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod playback;
pub mod segmenter;
pub mod sentence;
pub mod services;
pub mod vad;

pub use audio::{
    shared_source, AudioBuffer, AudioConfig, ChannelFrameSource, ClassifiedFrame, Frame,
    FrameSource, MicrophoneSource, SharedFrameSource, SpeechAudio,
};
pub use barge_in::{BargeInConfig, BargeInDetector, BargeInMonitor};
pub use cancel::{CancelReason, CancellationSignal};
pub use config::EngineConfig;
pub use error::{ErrorKind, TurnError, TurnResult};
pub use events::{EngineEvent, EventBus, StopHandle, TurnPhase};
pub use feedback::{evaluate, FeedbackReport};
pub use history::{ConversationHistory, HistoryConfig, Message, Role, Turn};
pub use metrics::{MemoryMetricsSink, MetricsSink, TracingMetricsSink, TurnMetrics};
pub use orchestrator::{SessionSummary, TurnOrchestrator, TurnReport};
pub use playback::{AudioSink, PlaybackOutcome, RodioPlayback};
pub use segmenter::{SegmenterConfig, SpeechSegmenter, Utterance};
pub use sentence::{SentenceSplitter, TokenStream};
pub use services::{
    ReplyGenerator, Services, SpeechSynthesizer, Transcriber, Transcript,
};
pub use vad::{VadBackend, VadConfig, VoiceActivityDetector};
