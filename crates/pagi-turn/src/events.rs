//! Presentation events and the stop handle.
//!
//! The orchestrator publishes `EngineEvent`s on a broadcast channel; a CLI or
//! GUI subscribes without touching orchestrator internals. The same layer may
//! stop the engine at any time through a cloneable `StopHandle`.

use crate::cancel::{CancelReason, CancellationSignal};
use crate::error::ErrorKind;
use crate::metrics::TurnMetrics;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Orchestrator state, published on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Listening,
    Transcribing,
    Speaking,
    Cancelled,
    Committed,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Listening => "listening",
            TurnPhase::Transcribing => "transcribing",
            TurnPhase::Speaking => "speaking",
            TurnPhase::Cancelled => "cancelled",
            TurnPhase::Committed => "committed",
        }
    }
}

/// Events for the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    ListeningStarted { turn: usize },
    PartialTranscript(String),
    FinalTranscript(String),
    /// Raw generation fragment, for live display.
    AssistantFragment(String),
    /// A sentence about to be played.
    AssistantSentence(String),
    /// Everything that was actually spoken this turn.
    AssistantFinal(String),
    StatusChanged(TurnPhase),
    BargeIn,
    TurnMetrics(TurnMetrics),
    Error { kind: ErrorKind, message: String },
}

/// Broadcast publisher shared by every stage.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Lets the presentation layer interrupt a turn or end the session.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    session_stop: Arc<AtomicBool>,
    current: Arc<Mutex<Option<CancellationSignal>>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the current turn only; the session continues with the next turn.
    pub fn interrupt(&self) {
        if let Some(signal) = self.current_signal() {
            if signal.cancel(CancelReason::StopRequest) {
                info!("⏹️ Stop requested, cancelling current turn");
            }
        }
    }

    /// Cancel the current turn and end the session after it.
    pub fn request_stop(&self) {
        self.session_stop.store(true, Ordering::SeqCst);
        self.interrupt();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.session_stop.load(Ordering::SeqCst)
    }

    /// Install the signal for a new turn. Honours a stop that raced ahead of it.
    pub(crate) fn begin_turn(&self, signal: CancellationSignal) {
        *self.slot() = Some(signal.clone());
        if self.is_stop_requested() {
            signal.cancel(CancelReason::StopRequest);
        }
    }

    pub(crate) fn end_turn(&self) {
        *self.slot() = None;
    }

    fn current_signal(&self) -> Option<CancellationSignal> {
        self.slot().clone()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationSignal>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::BargeIn);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::StatusChanged(TurnPhase::Listening));
        bus.publish(EngineEvent::FinalTranscript("hi".into()));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::StatusChanged(TurnPhase::Listening)
        ));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::FinalTranscript(t) if t == "hi"));
    }

    #[test]
    fn interrupt_cancels_only_the_current_turn() {
        let handle = StopHandle::new();
        handle.interrupt(); // no turn yet, nothing to do

        let signal = CancellationSignal::new();
        handle.begin_turn(signal.clone());
        handle.interrupt();
        assert_eq!(signal.reason(), Some(CancelReason::StopRequest));
        assert!(!handle.is_stop_requested());

        handle.end_turn();
        let next = CancellationSignal::new();
        handle.begin_turn(next.clone());
        assert!(!next.is_cancelled());
    }

    #[test]
    fn stop_before_turn_cancels_it_on_begin() {
        let handle = StopHandle::new();
        handle.request_stop();
        let signal = CancellationSignal::new();
        handle.begin_turn(signal.clone());
        assert!(signal.is_cancelled());
        assert!(handle.is_stop_requested());
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_value(EngineEvent::StatusChanged(TurnPhase::Speaking)).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["data"], "speaking");
    }
}
