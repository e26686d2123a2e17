//! Per-turn latency and size accounting.
//!
//! One `TurnMetrics` record is produced per completed or aborted turn and
//! handed to a `MetricsSink` (the logging collaborator). Records are never
//! mutated after that.

use crate::cancel::CancelReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Rough token estimate used for logging and cost: four characters per token, at least one.
pub fn approx_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Optional price table (USD per 1K tokens) for a per-turn cost estimate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub price_in_per_1k: Option<f64>,
    pub price_out_per_1k: Option<f64>,
}

impl CostConfig {
    /// Fill unset prices from `LLM_PRICE_IN_PER_1K` / `LLM_PRICE_OUT_PER_1K`.
    pub fn with_env_fallback(mut self) -> Self {
        if self.price_in_per_1k.is_none() {
            self.price_in_per_1k = env_f64("LLM_PRICE_IN_PER_1K");
        }
        if self.price_out_per_1k.is_none() {
            self.price_out_per_1k = env_f64("LLM_PRICE_OUT_PER_1K");
        }
        self
    }

    pub fn estimate(&self, tokens_in: usize, tokens_out: usize) -> Option<f64> {
        if self.price_in_per_1k.is_none() && self.price_out_per_1k.is_none() {
            return None;
        }
        let price_in = self.price_in_per_1k.unwrap_or(0.0);
        let price_out = self.price_out_per_1k.unwrap_or(0.0);
        Some(tokens_in as f64 / 1000.0 * price_in + tokens_out as f64 / 1000.0 * price_out)
    }
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
}

/// Latency and size record for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnMetrics {
    pub turn: usize,
    pub timestamp: Option<DateTime<Utc>>,
    /// Listening start to utterance finalization.
    pub detection_ms: f64,
    pub transcription_ms: f64,
    /// Generation request to the last token (or to abandonment).
    pub generation_ms: f64,
    /// Sum of synthesis calls.
    pub synthesis_ms: f64,
    /// Whole GENERATING+SPEAKING phase.
    pub speaking_ms: f64,
    /// Generation request to the first sentence starting playback.
    pub first_playback_ms: Option<f64>,
    /// Utterance finalization to commit.
    pub total_ms: f64,
    pub utterance_secs: f64,
    pub input_chars: usize,
    pub output_chars: usize,
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub sentences_spoken: usize,
    pub sentences_skipped: usize,
    pub cancelled: Option<CancelReason>,
    pub cost_estimate_usd: Option<f64>,
    pub error: Option<String>,
}

/// Milliseconds as f64, the unit every metric is reported in.
pub fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Logging collaborator: accepts one record per turn, append-only.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metrics: &TurnMetrics);
}

/// Emits one structured `info!` line per turn.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, m: &TurnMetrics) {
        info!(
            target: "pagi_turn::metrics",
            turn = m.turn,
            detection_ms = m.detection_ms,
            transcription_ms = m.transcription_ms,
            generation_ms = m.generation_ms,
            synthesis_ms = m.synthesis_ms,
            speaking_ms = m.speaking_ms,
            first_playback_ms = ?m.first_playback_ms,
            total_ms = m.total_ms,
            input_chars = m.input_chars,
            output_chars = m.output_chars,
            tokens_in = m.tokens_in,
            tokens_out = m.tokens_out,
            sentences_spoken = m.sentences_spoken,
            sentences_skipped = m.sentences_skipped,
            cancelled = ?m.cancelled,
            cost_estimate_usd = ?m.cost_estimate_usd,
            error = ?m.error,
            "📊 Turn {} metrics: STT={:.0}ms LLM={:.0}ms TTS={:.0}ms total={:.0}ms",
            m.turn,
            m.transcription_ms,
            m.generation_ms,
            m.synthesis_ms,
            m.total_ms
        );
    }
}

/// Keeps every record in memory (summaries, tests).
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    records: Mutex<Vec<TurnMetrics>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TurnMetrics> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&self, metrics: &TurnMetrics) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push(metrics.clone());
    }
}

/// Forward to several sinks.
pub struct FanoutMetricsSink {
    sinks: Vec<std::sync::Arc<dyn MetricsSink>>,
}

impl FanoutMetricsSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for FanoutMetricsSink {
    fn record(&self, metrics: &TurnMetrics) {
        for sink in &self.sinks {
            sink.record(metrics);
        }
    }
}
