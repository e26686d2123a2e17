//! Interruptible speech playback (Rodio)
//!
//! One `Sink` per sentence. While a sentence plays, the cancellation signal is
//! polled every 20ms; when it is raised the sink is stopped mid-sentence.

use crate::audio::SpeechAudio;
use crate::cancel::CancellationSignal;
use crate::error::{TurnError, TurnResult};
use async_trait::async_trait;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Cancellation poll interval during playback.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    /// Stopped part way through the sentence.
    Interrupted,
    /// Cancelled before any audio reached the device.
    NotStarted,
}

/// Speaker output. Plays one sentence at a time.
#[async_trait]
pub trait AudioSink: Send {
    async fn play(
        &mut self,
        audio: &SpeechAudio,
        signal: &CancellationSignal,
    ) -> TurnResult<PlaybackOutcome>;
}

/// Default output device via Rodio.
///
/// `OutputStream` is not `Send`, so a small thread keeps it alive and hands
/// back the (sendable) handle used to create per-sentence sinks.
pub struct RodioPlayback {
    handle: OutputStreamHandle,
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RodioPlayback {
    pub fn new() -> TurnResult<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("pagi-playback".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // Blocks until shutdown is sent or the sender is dropped
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(TurnError::Playback(e.to_string())));
                }
            })?;

        let handle = handle_rx.recv().map_err(|_| {
            TurnError::Playback("output thread exited during startup".to_string())
        })??;
        info!("🔈 Audio playback initialized");

        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

#[async_trait]
impl AudioSink for RodioPlayback {
    async fn play(
        &mut self,
        audio: &SpeechAudio,
        signal: &CancellationSignal,
    ) -> TurnResult<PlaybackOutcome> {
        if signal.is_cancelled() {
            return Ok(PlaybackOutcome::NotStarted);
        }
        if audio.is_empty() {
            return Ok(PlaybackOutcome::Completed);
        }

        let source = rodio::Decoder::new(Cursor::new(audio.as_bytes().to_vec())).map_err(|e| {
            TurnError::PartialSynthesis {
                sentence: String::new(),
                reason: format!("decode failed: {}", e),
            }
        })?;
        let sink = Sink::try_new(&self.handle).map_err(|e| TurnError::Playback(e.to_string()))?;
        sink.append(source.convert_samples::<f32>());

        loop {
            if signal.is_cancelled() {
                sink.stop();
                debug!("⏹️ Playback interrupted");
                return Ok(PlaybackOutcome::Interrupted);
            }
            if sink.empty() {
                return Ok(PlaybackOutcome::Completed);
            }
            tokio::select! {
                _ = signal.cancelled() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

impl Drop for RodioPlayback {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;

    #[tokio::test]
    #[ignore = "requires an audio output device"]
    async fn silent_wav_plays_to_completion() {
        use crate::services::{PlaceholderSynthesizer, SpeechSynthesizer};
        let audio = PlaceholderSynthesizer::default()
            .synthesize("Hello.")
            .await
            .unwrap();
        let mut playback = RodioPlayback::new().unwrap();
        let outcome = playback
            .play(&audio, &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(outcome, PlaybackOutcome::Completed);
    }

    #[tokio::test]
    #[ignore = "requires an audio output device"]
    async fn cancelled_signal_skips_playback() {
        let mut playback = RodioPlayback::new().unwrap();
        let signal = CancellationSignal::new();
        signal.cancel(CancelReason::BargeIn);
        let outcome = playback
            .play(&SpeechAudio::new(vec![1, 2, 3]), &signal)
            .await
            .unwrap();
        assert_eq!(outcome, PlaybackOutcome::NotStarted);
    }
}
