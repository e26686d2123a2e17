//! Turn Orchestrator - the main coordination layer
//!
//! One turn is `LISTENING → TRANSCRIBING → SPEAKING → COMMITTED`. Speaking is
//! a pipeline of tasks joined by bounded queues:
//!
//! ```text
//! token stream ─► sentence stage ─► [8] ─► synthesis stage ─► [1] ─► playback loop
//!                                                                      ▲
//!                       barge-in monitor ── CancellationSignal ────────┘
//! ```
//!
//! Every stage races its waits against the turn's cancellation signal, so a
//! barge-in or stop request tears the pipeline down within one poll interval.

use crate::audio::{AudioBuffer, SharedFrameSource, SpeechAudio};
use crate::barge_in::{BargeInMonitor, MonitorReport};
use crate::cancel::{CancelReason, CancellationSignal};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, TurnError, TurnResult};
use crate::events::{EngineEvent, EventBus, StopHandle, TurnPhase};
use crate::history::{ConversationHistory, Message, Role, Turn};
use crate::metrics::{approx_tokens, millis, MetricsSink, TracingMetricsSink, TurnMetrics};
use crate::playback::{AudioSink, PlaybackOutcome};
use crate::segmenter::{SegmentEvent, SpeechSegmenter, Utterance};
use crate::sentence::{spawn_sentence_stage, GenerationReport};
use crate::services::{Services, SpeechSynthesizer};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sentences buffered between the sentence stage and synthesis.
const SENTENCE_QUEUE: usize = 8;
/// Synthesized sentences waiting for the speaker: one plays while the next is prepared.
const AUDIO_QUEUE: usize = 1;

/// Result of a committed turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub user_text: String,
    /// Sentences whose playback started, space-joined.
    pub assistant_text: String,
    pub cancelled: Option<CancelReason>,
    pub metrics: TurnMetrics,
}

/// Counters for a whole session.
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    pub turns_attempted: usize,
    pub turns_committed: usize,
    pub turns_cancelled: usize,
    /// Turns that ended without user input.
    pub turns_skipped: usize,
    /// Turns aborted by a service failure.
    pub turns_failed: usize,
}

/// A synthesized sentence, or why it could not be.
enum Synthesized {
    Ready {
        sentence: String,
        audio: SpeechAudio,
        elapsed: Duration,
    },
    Failed {
        sentence: String,
        error: TurnError,
        elapsed: Duration,
    },
}

/// Bookkeeping for one SPEAKING phase.
#[derive(Debug, Default)]
struct SpeakingReport {
    spoken: Vec<String>,
    skipped: usize,
    synthesis: Duration,
    first_playback: Option<Duration>,
    generation: Option<Duration>,
    barge_in: MonitorReport,
}

/// Coordinates listening, transcription, streamed generation, synthesis,
/// playback and barge-in for one conversation.
pub struct TurnOrchestrator {
    config: EngineConfig,
    source: SharedFrameSource,
    sink: Box<dyn AudioSink>,
    services: Services,
    history: ConversationHistory,
    events: EventBus,
    metrics: Arc<dyn MetricsSink>,
    stop: StopHandle,
    turn_index: usize,
    /// Frames captured before this instant belong to the previous turn.
    stale_before: Option<Instant>,
}

impl TurnOrchestrator {
    /// Create a new orchestrator. Configuration is validated here.
    pub fn new(
        config: EngineConfig,
        source: SharedFrameSource,
        sink: Box<dyn AudioSink>,
        services: Services,
    ) -> TurnResult<Self> {
        config.validate()?;
        info!("🎭 Initializing Turn Orchestrator");
        Ok(Self {
            history: ConversationHistory::new(config.history.window),
            config,
            source,
            sink,
            services,
            events: EventBus::default(),
            metrics: Arc::new(TracingMetricsSink),
            stop: StopHandle::new(),
            turn_index: 0,
            stale_before: None,
        })
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Use a stop handle created before the orchestrator (e.g. by a UI).
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Run turns until `max_turns` is reached or a stop is requested.
    ///
    /// Input and service errors end only the current turn; device and
    /// internal errors end the session and are returned.
    pub async fn run(&mut self, max_turns: Option<usize>) -> TurnResult<SessionSummary> {
        let mut summary = SessionSummary::default();
        info!("🚀 Session started (max_turns: {:?})", max_turns);

        loop {
            if self.stop.is_stop_requested() {
                info!("Stop requested, ending session");
                break;
            }
            if max_turns.is_some_and(|max| summary.turns_attempted >= max) {
                break;
            }
            summary.turns_attempted += 1;

            match self.run_turn().await {
                Ok(report) => {
                    summary.turns_committed += 1;
                    if report.cancelled.is_some() {
                        summary.turns_cancelled += 1;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!("Session aborted: {}", e);
                    self.set_phase(TurnPhase::Idle);
                    return Err(e);
                }
                Err(e) if e.kind() == ErrorKind::Input => summary.turns_skipped += 1,
                Err(_) => summary.turns_failed += 1,
            }
        }

        self.set_phase(TurnPhase::Idle);
        info!(
            "⏹️ Session ended: {} committed, {} skipped, {} failed",
            summary.turns_committed, summary.turns_skipped, summary.turns_failed
        );
        Ok(summary)
    }

    /// Run one complete turn.
    ///
    /// History is only modified when the turn reaches COMMITTED.
    pub async fn run_turn(&mut self) -> TurnResult<TurnReport> {
        self.turn_index += 1;
        let turn = self.turn_index;
        let signal = CancellationSignal::new();
        self.stop.begin_turn(signal.clone());

        let mut metrics = TurnMetrics {
            turn,
            timestamp: Some(Utc::now()),
            ..Default::default()
        };
        let result = self.drive_turn(&signal, &mut metrics).await;
        self.stop.end_turn();

        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::Input => info!("Turn {} ended early: {}", turn, e),
                _ => {
                    warn!("Turn {} aborted: {}", turn, e);
                    self.events.publish(EngineEvent::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
            if e.kind() != ErrorKind::Input {
                self.stale_before = Some(Instant::now());
            }
            metrics.error = Some(e.to_string());
            metrics.cancelled = signal.reason();
            self.publish_metrics(&metrics);
            self.set_phase(TurnPhase::Idle);
        }
        result
    }

    async fn drive_turn(
        &mut self,
        signal: &CancellationSignal,
        metrics: &mut TurnMetrics,
    ) -> TurnResult<TurnReport> {
        // LISTENING
        self.set_phase(TurnPhase::Listening);
        self.events.publish(EngineEvent::ListeningStarted {
            turn: metrics.turn,
        });
        let listen_start = Instant::now();
        let utterance = self.listen(signal).await?;
        let finalized_at = Instant::now();
        metrics.detection_ms = millis(finalized_at - listen_start);
        metrics.utterance_secs = utterance.duration().as_secs_f64();

        // TRANSCRIBING
        self.set_phase(TurnPhase::Transcribing);
        let transcribe_start = Instant::now();
        let transcript = self
            .services
            .transcriber
            .transcribe(&utterance.to_buffer())
            .await?;
        metrics.transcription_ms = millis(transcribe_start.elapsed());
        let user_text = transcript.text.trim().to_string();
        if user_text.is_empty() {
            return Err(TurnError::EmptyTranscript);
        }
        info!("🗣️ User: {}", user_text);
        self.events
            .publish(EngineEvent::FinalTranscript(user_text.clone()));

        // GENERATING + SPEAKING
        self.set_phase(TurnPhase::Speaking);
        let speak_start = Instant::now();
        let pending = Turn::new(Role::User, user_text.clone());
        let messages = self
            .history
            .as_message_list_with(&self.config.system_prompt, &pending);
        let speaking = if signal.is_cancelled() {
            debug!("Turn cancelled before generation, skipping reply");
            SpeakingReport::default()
        } else {
            self.speak(messages, signal).await?
        };
        metrics.speaking_ms = millis(speak_start.elapsed());

        self.stale_before = match signal.reason() {
            // Frames after a barge-in are the user's next utterance
            Some(CancelReason::BargeIn) => None,
            _ => Some(Instant::now()),
        };

        // COMMITTED
        let assistant_text = speaking.spoken.join(" ");
        self.history.append_turn(Role::User, user_text.clone())?;
        self.history.append_turn(Role::Assistant, assistant_text.clone())?;
        if !assistant_text.is_empty() {
            info!("🤖 Assistant: {}", assistant_text);
            self.events
                .publish(EngineEvent::AssistantFinal(assistant_text.clone()));
        }
        let cancelled = signal.reason();
        if let Some(reason) = cancelled {
            info!("Turn {} cancelled ({:?})", metrics.turn, reason);
            self.set_phase(TurnPhase::Cancelled);
        }
        self.set_phase(TurnPhase::Committed);

        metrics.generation_ms = speaking.generation.map(millis).unwrap_or(0.0);
        metrics.synthesis_ms = millis(speaking.synthesis);
        metrics.first_playback_ms = speaking.first_playback.map(millis);
        metrics.total_ms = millis(finalized_at.elapsed());
        metrics.input_chars = user_text.chars().count();
        metrics.output_chars = assistant_text.chars().count();
        metrics.tokens_in =
            approx_tokens(&format!("{}\n{}", user_text, self.config.system_prompt));
        metrics.tokens_out = approx_tokens(&assistant_text);
        metrics.sentences_spoken = speaking.spoken.len();
        metrics.sentences_skipped = speaking.skipped;
        metrics.cancelled = cancelled;
        metrics.cost_estimate_usd = self
            .config
            .cost
            .estimate(metrics.tokens_in, metrics.tokens_out);
        debug!(
            "Barge-in monitor observed {} frames (triggered: {})",
            speaking.barge_in.frames_observed, speaking.barge_in.triggered
        );
        self.publish_metrics(metrics);

        Ok(TurnReport {
            user_text,
            assistant_text,
            cancelled,
            metrics: metrics.clone(),
        })
    }

    /// Drive the segmenter until an utterance is finalized.
    async fn listen(&mut self, signal: &CancellationSignal) -> TurnResult<Utterance> {
        let mut segmenter = SpeechSegmenter::new(&self.config.segmenter);
        let stale_before = self.stale_before.take();
        let partial_busy = Arc::new(AtomicBool::new(false));
        let listening = Arc::new(AtomicBool::new(true));

        let source = Arc::clone(&self.source);
        let mut source = source.lock().await;
        let mut skipped = 0usize;

        let utterance = loop {
            let frame = tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    listening.store(false, Ordering::SeqCst);
                    return Err(TurnError::Cancelled);
                }
                frame = source.next_frame() => frame,
            };
            let Some(frame) = frame else {
                return Err(TurnError::SourceClosed);
            };
            if stale_before.is_some_and(|cutoff| frame.frame.captured_at() < cutoff) {
                skipped += 1;
                continue;
            }

            if let SegmentEvent::Finalized(utterance) = segmenter.push(frame) {
                break utterance;
            }
            if let Some(buffer) = segmenter.partial_due(Instant::now()) {
                self.spawn_partial(buffer, &partial_busy, &listening);
            }
        };

        listening.store(false, Ordering::SeqCst);
        debug!(
            "Listening done: {:.2}s utterance, {} stale frames skipped",
            utterance.duration().as_secs_f64(),
            skipped
        );
        Ok(utterance)
    }

    /// Best-effort partial transcript, at most one in flight.
    fn spawn_partial(
        &self,
        buffer: AudioBuffer,
        busy: &Arc<AtomicBool>,
        listening: &Arc<AtomicBool>,
    ) {
        if busy.swap(true, Ordering::SeqCst) {
            return;
        }
        let transcriber = Arc::clone(&self.services.transcriber);
        let events = self.events.clone();
        let busy = Arc::clone(busy);
        let listening = Arc::clone(listening);
        tokio::spawn(async move {
            match transcriber.transcribe(&buffer).await {
                Ok(t) => {
                    let text = t.text.trim();
                    if !text.is_empty() && listening.load(Ordering::SeqCst) {
                        events.publish(EngineEvent::PartialTranscript(text.to_string()));
                    }
                }
                Err(e) => debug!("Partial transcription failed: {}", e),
            }
            busy.store(false, Ordering::SeqCst);
        });
    }

    /// Stream the reply and speak it sentence by sentence.
    async fn speak(
        &mut self,
        messages: Vec<Message>,
        signal: &CancellationSignal,
    ) -> TurnResult<SpeakingReport> {
        let requested_at = Instant::now();
        let monitor = self.config.barge_in.enabled.then(|| {
            BargeInMonitor::start(
                Arc::clone(&self.source),
                &self.config.barge_in,
                signal.clone(),
                self.events.clone(),
            )
        });
        let mut report = SpeakingReport::default();

        let requested = tokio::select! {
            biased;
            _ = signal.cancelled() => None,
            tokens = self.services.generator.stream_reply(&messages) => Some(tokens),
        };
        let tokens = match requested {
            Some(Ok(tokens)) => tokens,
            Some(Err(e)) => {
                if let Some(monitor) = monitor {
                    monitor.stop().await;
                }
                return Err(e);
            }
            None => {
                debug!("Turn cancelled while the reply was requested");
                report.generation = Some(requested_at.elapsed());
                if let Some(monitor) = monitor {
                    report.barge_in = monitor.stop().await;
                }
                return Ok(report);
            }
        };

        let (sentences, generation) =
            spawn_sentence_stage(tokens, signal.clone(), self.events.clone(), SENTENCE_QUEUE);
        let (mut audio_rx, synthesis) = spawn_synthesis_stage(
            sentences,
            Arc::clone(&self.services.synthesizer),
            signal.clone(),
        );

        let played = self
            .playback_loop(&mut audio_rx, signal, requested_at, &mut report)
            .await;

        drop(audio_rx);
        synthesis.abort();
        if let Some(monitor) = monitor {
            report.barge_in = monitor.stop().await;
        }
        if let Err(e) = played {
            generation.abort();
            return Err(e);
        }

        let generation = generation.await.unwrap_or_else(|e| GenerationReport {
            error: Some(TurnError::ChannelClosed(format!("sentence stage: {}", e))),
            ended_at: Some(Instant::now()),
            ..Default::default()
        });
        let generation_end = if generation.finished {
            generation.last_token_at.or(generation.ended_at)
        } else {
            generation.ended_at
        };
        report.generation = Some(
            generation_end
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(requested_at),
        );

        if let Some(e) = generation.error {
            if report.spoken.is_empty() {
                return Err(e);
            }
            warn!("Reply stream failed after speaking began: {}", e);
            self.events.publish(EngineEvent::Error {
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        Ok(report)
    }

    /// Play synthesized sentences in order until the queue closes or the turn is cancelled.
    async fn playback_loop(
        &mut self,
        audio_rx: &mut mpsc::Receiver<Synthesized>,
        signal: &CancellationSignal,
        requested_at: Instant,
        report: &mut SpeakingReport,
    ) -> TurnResult<()> {
        loop {
            let item = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                item = audio_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let (sentence, audio) = match item {
                Synthesized::Failed {
                    sentence,
                    error,
                    elapsed,
                } => {
                    report.synthesis += elapsed;
                    self.skip_sentence(sentence, error.to_string(), report);
                    continue;
                }
                Synthesized::Ready {
                    sentence,
                    audio,
                    elapsed,
                } => {
                    report.synthesis += elapsed;
                    (sentence, audio)
                }
            };
            if signal.is_cancelled() {
                break;
            }

            self.events
                .publish(EngineEvent::AssistantSentence(sentence.clone()));
            let started = requested_at.elapsed();
            match self.sink.play(&audio, signal).await {
                Ok(PlaybackOutcome::NotStarted) => {
                    debug!("Cancelled before playback of: {}", sentence);
                    break;
                }
                Ok(outcome) => {
                    report.first_playback.get_or_insert(started);
                    report.spoken.push(sentence);
                    if outcome == PlaybackOutcome::Interrupted {
                        break;
                    }
                }
                Err(TurnError::PartialSynthesis { reason, .. }) => {
                    self.skip_sentence(sentence, reason, report);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn skip_sentence(&self, sentence: String, reason: String, report: &mut SpeakingReport) {
        let error = TurnError::PartialSynthesis { sentence, reason };
        warn!("{}", error);
        report.skipped += 1;
        self.events.publish(EngineEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn set_phase(&self, phase: TurnPhase) {
        debug!("Turn phase: {}", phase.as_str());
        self.events.publish(EngineEvent::StatusChanged(phase));
    }

    fn publish_metrics(&self, metrics: &TurnMetrics) {
        self.metrics.record(metrics);
        self.events
            .publish(EngineEvent::TurnMetrics(metrics.clone()));
    }
}

/// Synthesize sentences one at a time, ahead of playback by at most `AUDIO_QUEUE`.
fn spawn_synthesis_stage(
    mut sentences: mpsc::Receiver<String>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    signal: CancellationSignal,
) -> (mpsc::Receiver<Synthesized>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(AUDIO_QUEUE);
    let task = tokio::spawn(async move {
        loop {
            let sentence = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                sentence = sentences.recv() => match sentence {
                    Some(s) => s,
                    None => break,
                },
            };
            if signal.is_cancelled() {
                break;
            }

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                result = synthesizer.synthesize(&sentence) => result,
            };
            let elapsed = started.elapsed();
            let item = match result {
                Ok(audio) => Synthesized::Ready {
                    sentence,
                    audio,
                    elapsed,
                },
                Err(error) => Synthesized::Failed {
                    sentence,
                    error,
                    elapsed,
                },
            };

            let sent = tokio::select! {
                biased;
                _ = signal.cancelled() => false,
                sent = tx.send(item) => sent.is_ok(),
            };
            if !sent {
                break;
            }
        }
        debug!("Synthesis stage done");
    });
    (rx, task)
}
