//! Sentence segmentation over a streamed reply.
//!
//! Fragments arrive token by token; a sentence is emitted as soon as a
//! terminator (`.`, `!`, `?`) followed by whitespace appears in the buffer, so
//! synthesis can start before generation finishes. Whatever is left when the
//! stream ends is flushed as a final sentence, unless the turn was cancelled.

use crate::cancel::CancellationSignal;
use crate::error::{TurnError, TurnResult};
use crate::events::{EngineEvent, EventBus};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Streamed reply fragments. Closing the channel ends the reply.
pub type TokenStream = mpsc::Receiver<TurnResult<String>>;

/// Incremental splitter; pure, no I/O.
#[derive(Debug, Default, Clone)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every sentence it completed, in order.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let mut sentences = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let sentence = self.buffer[..end].trim().to_string();
            self.buffer = self.buffer[end..].trim_start().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Take the unterminated remainder, if it holds anything but whitespace.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Byte index just past the first terminator that is followed by whitespace.
fn find_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    return Some(i + c.len_utf8());
                }
            }
        }
    }
    None
}

/// How the generation stream ended.
#[derive(Debug, Default)]
pub struct GenerationReport {
    pub fragments: usize,
    /// Characters of reply text received.
    pub chars: usize,
    pub last_token_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    /// The stream closed on its own (not abandoned).
    pub finished: bool,
    pub cancelled: bool,
    pub error: Option<TurnError>,
}

/// Spawn the stage that turns a token stream into a sentence queue.
///
/// The sentence channel closes when the stream ends, errors, or the turn is
/// cancelled. Dropping `tokens` on cancellation abandons the generation request.
pub fn spawn_sentence_stage(
    tokens: TokenStream,
    signal: CancellationSignal,
    events: EventBus,
    capacity: usize,
) -> (mpsc::Receiver<String>, JoinHandle<GenerationReport>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(sentence_stage(tokens, signal, events, tx));
    (rx, task)
}

async fn sentence_stage(
    mut tokens: TokenStream,
    signal: CancellationSignal,
    events: EventBus,
    tx: mpsc::Sender<String>,
) -> GenerationReport {
    let mut splitter = SentenceSplitter::new();
    let mut report = GenerationReport::default();

    loop {
        if signal.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let next = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                report.cancelled = true;
                break;
            }
            next = tokens.recv() => next,
        };

        let fragment = match next {
            None => {
                report.finished = true;
                break;
            }
            Some(Ok(fragment)) => fragment,
            Some(Err(e)) => {
                warn!("Generation stream failed: {}", e);
                report.error = Some(e);
                break;
            }
        };

        report.fragments += 1;
        report.chars += fragment.chars().count();
        report.last_token_at = Some(Instant::now());
        events.publish(EngineEvent::AssistantFragment(fragment.clone()));

        for sentence in splitter.push(&fragment) {
            if !forward(&tx, &signal, sentence).await {
                report.cancelled = signal.is_cancelled();
                report.ended_at = Some(Instant::now());
                return report;
            }
        }
    }

    if report.finished && !signal.is_cancelled() {
        if let Some(rest) = splitter.finish() {
            forward(&tx, &signal, rest).await;
        }
    }
    report.cancelled |= signal.is_cancelled();
    report.ended_at = Some(Instant::now());
    debug!(
        "Sentence stage done: {} fragments, finished={}, cancelled={}",
        report.fragments, report.finished, report.cancelled
    );
    report
}

/// Queue one sentence, giving up if the turn is cancelled or the consumer left.
async fn forward(tx: &mpsc::Sender<String>, signal: &CancellationSignal, sentence: String) -> bool {
    tokio::select! {
        biased;
        _ = signal.cancelled() => false,
        sent = tx.send(sentence) => sent.is_ok(),
    }
}
