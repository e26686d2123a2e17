//! Barge-in: user speech during assistant playback.
//!
//! While the assistant is speaking, the monitor owns the frame source and
//! counts consecutive speech frames. A streak of `threshold_frames` raises the
//! turn's cancellation signal; a single silent frame resets the streak.

use crate::audio::SharedFrameSource;
use crate::cancel::{CancelReason, CancellationSignal};
use crate::events::{EngineEvent, EventBus};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Barge-in tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Monitor user speech during playback (default: true)
    pub enabled: bool,

    /// Consecutive speech frames that count as an interruption (default: 5, 150ms at 30ms frames)
    pub threshold_frames: u32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_frames: 5,
        }
    }
}

/// Streak counter, separate from the task so it can be driven frame by frame.
#[derive(Debug, Clone)]
pub struct BargeInDetector {
    streak: u32,
    threshold: u32,
}

impl BargeInDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            streak: 0,
            threshold: threshold.max(1),
        }
    }

    /// Feed one classification. `true` once the streak reaches the threshold.
    pub fn observe(&mut self, is_speech: bool) -> bool {
        if is_speech {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        self.streak >= self.threshold
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

/// What the monitor saw before it was stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub triggered: bool,
    pub frames_observed: usize,
    pub frames_discarded: usize,
}

/// Spawns the monitoring task for one SPEAKING phase.
pub struct BargeInMonitor;

impl BargeInMonitor {
    /// Start watching `source`. Frames queued before this call are stale and dropped.
    pub fn start(
        source: SharedFrameSource,
        config: &BargeInConfig,
        signal: CancellationSignal,
        events: EventBus,
    ) -> BargeInHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let threshold = config.threshold_frames;
        let task = tokio::spawn(monitor(source, threshold, signal, events, stop_rx));
        BargeInHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }
}

async fn monitor(
    source: SharedFrameSource,
    threshold: u32,
    signal: CancellationSignal,
    events: EventBus,
    mut stop_rx: oneshot::Receiver<()>,
) -> MonitorReport {
    let mut source = source.lock().await;
    let mut report = MonitorReport {
        frames_discarded: source.discard_pending(),
        ..Default::default()
    };
    let mut detector = BargeInDetector::new(threshold);
    debug!(
        "👂 Barge-in monitor armed ({} stale frames dropped)",
        report.frames_discarded
    );

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = signal.cancelled() => break,
            frame = source.next_frame() => {
                let Some(frame) = frame else {
                    warn!("Frame source closed during playback");
                    break;
                };
                report.frames_observed += 1;
                if detector.observe(frame.is_speech) {
                    if signal.cancel(CancelReason::BargeIn) {
                        info!("🗣️ Barge-in after {} speech frames", detector.streak());
                        events.publish(EngineEvent::BargeIn);
                        report.triggered = true;
                    }
                    break;
                }
            }
        }
    }
    report
}

/// Handle to a running monitor; stopping it releases the frame source.
pub struct BargeInHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<MonitorReport>,
}

impl BargeInHandle {
    pub async fn stop(mut self) -> MonitorReport {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.task).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Barge-in monitor task failed: {}", e);
                MonitorReport::default()
            }
        }
    }
}

impl Drop for BargeInHandle {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{shared_source, ChannelFrameSource, ClassifiedFrame, Frame};
    use std::time::Duration;

    fn frame(is_speech: bool) -> ClassifiedFrame {
        ClassifiedFrame::new(Frame::new(vec![0.0; 480], 16000), is_speech)
    }

    #[test]
    fn streak_resets_on_silence() {
        let mut detector = BargeInDetector::new(3);
        assert!(!detector.observe(true));
        assert!(!detector.observe(true));
        assert!(!detector.observe(false));
        assert!(!detector.observe(true));
        assert!(!detector.observe(true));
        assert!(detector.observe(true));
    }

    #[tokio::test]
    async fn fires_on_exactly_the_threshold_frame() {
        let (tx, source) = ChannelFrameSource::channel(16);
        let source = shared_source(source);
        let signal = CancellationSignal::new();
        let events = EventBus::new(8);
        let mut rx = events.subscribe();
        let handle = BargeInMonitor::start(
            source,
            &BargeInConfig::default(),
            signal.clone(),
            events,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..4 {
            tx.send(frame(true)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!signal.is_cancelled());

        tx.send(frame(true)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
        assert_eq!(signal.reason(), Some(CancelReason::BargeIn));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::BargeIn));

        let report = handle.stop().await;
        assert!(report.triggered);
        assert_eq!(report.frames_observed, 5);
    }

    #[tokio::test]
    async fn broken_streak_does_not_fire() {
        let (tx, source) = ChannelFrameSource::channel(16);
        let source = shared_source(source);
        let signal = CancellationSignal::new();
        let handle = BargeInMonitor::start(
            source,
            &BargeInConfig::default(),
            signal.clone(),
            EventBus::new(8),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        for is_speech in [true, true, true, true, false, true, true, true, true] {
            tx.send(frame(is_speech)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!signal.is_cancelled());

        let report = handle.stop().await;
        assert!(!report.triggered);
        assert_eq!(report.frames_observed, 9);
    }

    #[tokio::test]
    async fn stale_frames_are_discarded_on_start() {
        let (tx, source) = ChannelFrameSource::channel(16);
        for _ in 0..6 {
            tx.send(frame(true)).await.unwrap();
        }
        let signal = CancellationSignal::new();
        let handle = BargeInMonitor::start(
            shared_source(source),
            &BargeInConfig::default(),
            signal.clone(),
            EventBus::new(8),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!signal.is_cancelled());

        let report = handle.stop().await;
        assert_eq!(report.frames_discarded, 6);
        assert_eq!(report.frames_observed, 0);
    }
}
