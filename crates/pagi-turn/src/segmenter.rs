//! Utterance segmentation over classified frames
//!
//! Debounced "gap logic": speech must be sustained for `min_speech_ms` before
//! an utterance starts, and silence must last `max_silence_ms` before it is
//! finalized. Once started, every frame (speech or silence) belongs to the
//! utterance.

use crate::audio::{AudioBuffer, ClassifiedFrame, Frame};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configuration for utterance detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Sustained speech needed to start an utterance (default: 200ms)
    pub min_speech_ms: u64,

    /// Trailing silence that ends an utterance (default: 600ms)
    pub max_silence_ms: u64,

    /// Hard cap on one utterance; 0 disables it (default: 30s)
    pub max_utterance_ms: u64,

    /// Wall-clock interval between partial transcripts; 0 disables them (default: 800ms)
    pub partial_interval_ms: u64,

    /// Audio required before the first partial is attempted (default: 500ms)
    pub min_partial_audio_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_speech_ms: 200,
            max_silence_ms: 600,
            max_utterance_ms: 30_000,
            partial_interval_ms: 800,
            min_partial_audio_ms: 500,
        }
    }
}

/// Why an utterance was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    Silence,
    MaxDuration,
}

/// Frames collected between a speech start and a speech end.
#[derive(Debug, Clone)]
pub struct Utterance {
    frames: Vec<Frame>,
    sample_rate: u32,
    reason: FinalizeReason,
}

impl Utterance {
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Sum of frame durations.
    pub fn duration(&self) -> Duration {
        self.frames.iter().map(Frame::duration).sum()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn reason(&self) -> FinalizeReason {
        self.reason
    }

    /// Concatenate the frames into one buffer for the transcriber.
    pub fn to_buffer(&self) -> AudioBuffer {
        AudioBuffer::from_frames(&self.frames, self.sample_rate)
    }
}

/// Result of feeding one frame.
#[derive(Debug)]
pub enum SegmentEvent {
    /// No utterance in progress.
    Idle,
    /// Voicing, but not yet long enough to count.
    Voicing,
    /// An utterance just started with this frame.
    Started,
    /// Frame appended to the running utterance.
    Continuing,
    /// The utterance is complete; the segmenter is back to idle.
    Finalized(Utterance),
}

/// Stateful aggregator turning frame classifications into utterances
pub struct SpeechSegmenter {
    min_speech: Duration,
    max_silence: Duration,
    max_utterance: Option<Duration>,
    partial_interval: Option<Duration>,
    min_partial_audio: Duration,

    started: bool,
    voiced: Duration,
    unvoiced: Duration,
    collected: Duration,
    frames: Vec<Frame>,
    sample_rate: u32,
    last_partial: Option<Instant>,
}

impl SpeechSegmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        let non_zero = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Self {
            min_speech: Duration::from_millis(config.min_speech_ms),
            max_silence: Duration::from_millis(config.max_silence_ms),
            max_utterance: non_zero(config.max_utterance_ms),
            partial_interval: non_zero(config.partial_interval_ms),
            min_partial_audio: Duration::from_millis(config.min_partial_audio_ms),
            started: false,
            voiced: Duration::ZERO,
            unvoiced: Duration::ZERO,
            collected: Duration::ZERO,
            frames: Vec::new(),
            sample_rate: 0,
            last_partial: None,
        }
    }

    /// Feed one classified frame.
    pub fn push(&mut self, input: ClassifiedFrame) -> SegmentEvent {
        let ClassifiedFrame { frame, is_speech } = input;
        let d = frame.duration();
        self.sample_rate = frame.sample_rate();

        if !self.started {
            if !is_speech {
                self.voiced = Duration::ZERO;
                self.frames.clear();
                self.collected = Duration::ZERO;
                return SegmentEvent::Idle;
            }

            self.voiced += d;
            self.collected += d;
            let captured_at = frame.captured_at();
            self.frames.push(frame);
            if self.voiced < self.min_speech {
                return SegmentEvent::Voicing;
            }

            info!("🎤 Speech started ({:?} voiced)", self.voiced);
            self.started = true;
            self.unvoiced = Duration::ZERO;
            self.last_partial = Some(captured_at);
            return SegmentEvent::Started;
        }

        self.collected += d;
        self.frames.push(frame);
        if is_speech {
            self.unvoiced = Duration::ZERO;
        } else {
            self.unvoiced += d;
        }

        if self.unvoiced >= self.max_silence {
            debug!("🤫 {:?} of silence, finalizing", self.unvoiced);
            return SegmentEvent::Finalized(self.finalize(FinalizeReason::Silence));
        }
        if let Some(cap) = self.max_utterance {
            if self.collected >= cap {
                warn!("⏱️ Max utterance duration reached, finalizing");
                return SegmentEvent::Finalized(self.finalize(FinalizeReason::MaxDuration));
            }
        }
        SegmentEvent::Continuing
    }

    /// Snapshot of the run-so-far buffer when a partial transcript is due.
    ///
    /// At most one snapshot per interval, and only once enough audio is buffered.
    pub fn partial_due(&mut self, now: Instant) -> Option<AudioBuffer> {
        let interval = self.partial_interval?;
        if !self.started || self.collected < self.min_partial_audio {
            return None;
        }
        let last = self.last_partial.unwrap_or(now);
        if now.saturating_duration_since(last) < interval {
            return None;
        }
        self.last_partial = Some(now);
        Some(AudioBuffer::from_frames(&self.frames, self.sample_rate))
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Audio held by the segmenter right now.
    pub fn buffered(&self) -> Duration {
        self.collected
    }

    /// Back to the initial state, dropping any buffered audio.
    pub fn reset(&mut self) {
        self.started = false;
        self.voiced = Duration::ZERO;
        self.unvoiced = Duration::ZERO;
        self.collected = Duration::ZERO;
        self.frames.clear();
        self.last_partial = None;
    }

    fn finalize(&mut self, reason: FinalizeReason) -> Utterance {
        let frames = std::mem::take(&mut self.frames);
        let utterance = Utterance {
            frames,
            sample_rate: self.sample_rate,
            reason,
        };
        info!(
            "🎯 Utterance finalized: {:?} ({} frames, {:?})",
            utterance.duration(),
            utterance.frame_count(),
            reason
        );
        self.reset();
        utterance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(speech: bool) -> ClassifiedFrame {
        let level = if speech { 0.3 } else { 0.0 };
        ClassifiedFrame::new(Frame::new(vec![level; 480], 16000), speech)
    }

    fn feed(segmenter: &mut SpeechSegmenter, pattern: &[(bool, usize)]) -> Vec<Utterance> {
        let mut out = Vec::new();
        for &(speech, count) in pattern {
            for _ in 0..count {
                if let SegmentEvent::Finalized(u) = segmenter.push(frame(speech)) {
                    out.push(u);
                }
            }
        }
        out
    }

    fn uncapped() -> SegmenterConfig {
        SegmenterConfig {
            max_utterance_ms: 0,
            ..Default::default()
        }
    }

    #[test]
    fn short_blips_never_start() {
        let mut seg = SpeechSegmenter::new(&uncapped());
        // 6 frames = 180ms < 200ms, interrupted by silence
        let out = feed(&mut seg, &[(true, 6), (false, 1), (true, 6), (false, 40)]);
        assert!(out.is_empty());
        assert!(!seg.is_started());
    }

    #[test]
    fn starts_after_min_speech_and_keeps_leading_frames() {
        let mut seg = SpeechSegmenter::new(&uncapped());
        for _ in 0..6 {
            assert!(matches!(seg.push(frame(true)), SegmentEvent::Voicing));
        }
        // 7th frame reaches 210ms
        assert!(matches!(seg.push(frame(true)), SegmentEvent::Started));
        assert_eq!(seg.buffered(), Duration::from_millis(210));
    }

    #[test]
    fn finalizes_after_max_silence_with_every_frame_collected() {
        let mut seg = SpeechSegmenter::new(&uncapped());
        // 10 speech + 3 silence (resume) + 5 speech + 20 silence (600ms)
        let out = feed(&mut seg, &[(true, 10), (false, 3), (true, 5), (false, 20)]);
        assert_eq!(out.len(), 1);
        let u = &out[0];
        assert_eq!(u.frame_count(), 38);
        assert_eq!(u.duration(), Duration::from_millis(38 * 30));
        assert_eq!(u.reason(), FinalizeReason::Silence);
        assert_eq!(u.to_buffer().samples.len(), 38 * 480);
        assert!(!seg.is_started());
    }

    #[test]
    fn silence_shorter_than_threshold_does_not_finalize() {
        let mut seg = SpeechSegmenter::new(&uncapped());
        let out = feed(&mut seg, &[(true, 10), (false, 19), (true, 1), (false, 19)]);
        assert!(out.is_empty());
        assert!(seg.is_started());
    }

    #[test]
    fn resets_between_utterances() {
        let mut seg = SpeechSegmenter::new(&uncapped());
        let out = feed(
            &mut seg,
            &[(true, 7), (false, 20), (false, 5), (true, 8), (false, 20)],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].frame_count(), 27);
        assert_eq!(out[1].frame_count(), 28);
    }

    #[test]
    fn iff_property_over_generated_patterns() {
        // Exhaustive over run lengths: voiced run v then silent run s
        let config = uncapped();
        for v in 0..12usize {
            for s in 0..25usize {
                let mut seg = SpeechSegmenter::new(&config);
                let out = feed(&mut seg, &[(false, 2), (true, v), (false, s)]);
                let expect = v * 30 >= 200 && s * 30 >= 600;
                assert_eq!(!out.is_empty(), expect, "v={} s={}", v, s);
                if let Some(u) = out.first() {
                    assert_eq!(u.duration(), Duration::from_millis(30) * u.frame_count() as u32);
                }
            }
        }
    }

    #[test]
    fn max_duration_forces_finalization() {
        let config = SegmenterConfig {
            max_utterance_ms: 900,
            ..Default::default()
        };
        let mut seg = SpeechSegmenter::new(&config);
        let out = feed(&mut seg, &[(true, 40)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reason(), FinalizeReason::MaxDuration);
        assert_eq!(out[0].duration(), Duration::from_millis(900));
    }

    #[test]
    fn partial_due_respects_interval_and_minimum_audio() {
        let mut seg = SpeechSegmenter::new(&uncapped());
        let t0 = Instant::now();
        feed(&mut seg, &[(true, 7)]);
        // Started, but only 210ms buffered
        assert!(seg.partial_due(t0 + Duration::from_secs(2)).is_none());

        feed(&mut seg, &[(true, 10)]);
        let now = Instant::now() + Duration::from_millis(900);
        let snapshot = seg.partial_due(now).expect("partial should be due");
        assert_eq!(snapshot.samples.len(), 17 * 480);
        // Not again within the interval
        assert!(seg.partial_due(now + Duration::from_millis(100)).is_none());
        assert!(seg.partial_due(now + Duration::from_millis(800)).is_some());
    }

    #[test]
    fn partials_can_be_disabled() {
        let config = SegmenterConfig {
            partial_interval_ms: 0,
            ..uncapped()
        };
        let mut seg = SpeechSegmenter::new(&config);
        feed(&mut seg, &[(true, 30)]);
        assert!(seg.partial_due(Instant::now() + Duration::from_secs(5)).is_none());
    }
}
