//! Audio frames and the microphone frame source (CPAL)
//!
//! The capture thread owns the input stream and the VAD. Every fixed-duration
//! frame is classified there and pushed into a bounded queue, so consumers
//! (the segmenter while listening, the barge-in monitor while speaking) only
//! ever see `ClassifiedFrame`s.

use crate::error::{TurnError, TurnResult};
use crate::vad::{VadConfig, VoiceActivityDetector};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of device channels; frames are always downmixed to mono (default: 1)
    pub channels: u16,

    /// Frame duration in milliseconds (default: 30, i.e. 480 samples at 16kHz)
    pub frame_ms: u32,

    /// Classified frames buffered between the capture thread and the consumer
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_ms: 30,
            queue_capacity: 256,
        }
    }
}

impl AudioConfig {
    /// Mono samples per frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }
}

/// One fixed-length block of mono PCM. Immutable once captured.
#[derive(Debug, Clone)]
pub struct Frame {
    samples: Arc<[f32]>,
    sample_rate: u32,
    duration: Duration,
    captured_at: Instant,
}

impl Frame {
    /// Wrap mono f32 samples (-1.0..1.0) captured now.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::captured(samples, sample_rate, Instant::now())
    }

    pub fn captured(samples: Vec<f32>, sample_rate: u32, captured_at: Instant) -> Self {
        let duration = if sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(samples.len() as u64 * 1_000_000 / sample_rate as u64)
        };
        Self {
            samples: samples.into(),
            sample_rate,
            duration,
            captured_at,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

/// A frame together with the VAD verdict for it.
#[derive(Debug, Clone)]
pub struct ClassifiedFrame {
    pub frame: Frame,
    pub is_speech: bool,
}

impl ClassifiedFrame {
    pub fn new(frame: Frame, is_speech: bool) -> Self {
        Self { frame, is_speech }
    }
}

/// Contiguous mono PCM handed to the transcriber (final utterance or partial snapshot).
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn from_frames<'a>(frames: impl IntoIterator<Item = &'a Frame>, sample_rate: u32) -> Self {
        let mut samples = Vec::new();
        for frame in frames {
            samples.extend_from_slice(frame.samples());
        }
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Encode as 16-bit mono WAV for API upload.
    pub fn to_wav(&self) -> TurnResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::with_capacity(44 + self.samples.len() * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &s in &self.samples {
                writer.write_sample((s.clamp(-1.0, 1.0) * 32767.0).round() as i16)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}

/// Encoded speech (WAV/MP3/...) returned by a synthesizer and decoded at playback.
#[derive(Debug, Clone, Default)]
pub struct SpeechAudio {
    bytes: Vec<u8>,
}

impl SpeechAudio {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Source of classified frames. Exactly one stage consumes it at a time.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the source is closed.
    async fn next_frame(&mut self) -> Option<ClassifiedFrame>;

    /// Drop every frame already queued. Returns how many were dropped.
    fn discard_pending(&mut self) -> usize;
}

/// A frame source behind an async mutex: whoever holds the lock owns the input.
pub type SharedFrameSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Box and share a frame source.
pub fn shared_source(source: impl FrameSource + 'static) -> SharedFrameSource {
    Arc::new(Mutex::new(Box::new(source)))
}

/// Frame source fed from a bounded channel (the capture thread, or a test script).
pub struct ChannelFrameSource {
    rx: mpsc::Receiver<ClassifiedFrame>,
}

impl ChannelFrameSource {
    pub fn new(rx: mpsc::Receiver<ClassifiedFrame>) -> Self {
        Self { rx }
    }

    /// Create a connected sender/source pair.
    pub fn channel(capacity: usize) -> (mpsc::Sender<ClassifiedFrame>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    async fn next_frame(&mut self) -> Option<ClassifiedFrame> {
        self.rx.recv().await
    }

    fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Microphone capture: default input device, VAD on a dedicated thread.
pub struct MicrophoneSource {
    frames: ChannelFrameSource,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneSource {
    /// Open the default input device and start capturing.
    ///
    /// Returns once the stream is playing; device errors surface here.
    pub fn start(audio: AudioConfig, vad: VadConfig) -> TurnResult<Self> {
        let (frame_tx, frames) = ChannelFrameSource::channel(audio.queue_capacity);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<TurnResult<()>>();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        // cpal Stream is !Send on some platforms, so it lives and dies on this thread
        let thread = thread::Builder::new()
            .name("pagi-capture".to_string())
            .spawn(move || capture_thread(audio, vad, frame_tx, thread_stop, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                frames,
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(TurnError::AudioDevice(
                    "capture thread exited during startup".to_string(),
                ))
            }
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> TurnResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }

    /// Stop capturing and join the capture thread.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            info!("⏹️ Audio capture stopped");
        }
    }
}

#[async_trait]
impl FrameSource for MicrophoneSource {
    async fn next_frame(&mut self) -> Option<ClassifiedFrame> {
        self.frames.next_frame().await
    }

    fn discard_pending(&mut self) -> usize {
        self.frames.discard_pending()
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_thread(
    audio: AudioConfig,
    vad_config: VadConfig,
    frame_tx: mpsc::Sender<ClassifiedFrame>,
    stop: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<TurnResult<()>>,
) {
    let mut detector = match vad_config.build(&audio) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let (raw_tx, raw_rx) = std::sync::mpsc::channel::<Vec<f32>>();
    let stream = match open_input_stream(&audio, raw_tx) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    info!(
        "🎤 Capture thread running ({}Hz, {}ms frames)",
        audio.sample_rate, audio.frame_ms
    );

    let mut dropped: u64 = 0;
    while !stop.load(Ordering::SeqCst) {
        let samples = match raw_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(s) => s,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                warn!("Audio callback channel closed");
                break;
            }
        };
        let frame = Frame::new(samples, audio.sample_rate);
        if !forward_frame(detector.as_mut(), frame, &frame_tx, &mut dropped) {
            break;
        }
    }

    drop(stream);
    debug!("Capture thread exiting ({} frames dropped)", dropped);
}

/// Classify a frame and push it downstream. Returns false once the consumer is gone.
fn forward_frame(
    detector: &mut dyn VoiceActivityDetector,
    frame: Frame,
    frame_tx: &mpsc::Sender<ClassifiedFrame>,
    dropped: &mut u64,
) -> bool {
    let is_speech = match detector.is_speech(frame.samples()) {
        Ok(s) => s,
        Err(e) => {
            debug!("VAD rejected frame: {}", e);
            return true;
        }
    };
    match frame_tx.try_send(ClassifiedFrame::new(frame, is_speech)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            *dropped += 1;
            if *dropped % 100 == 1 {
                warn!("Frame queue full, dropping frames ({} so far)", dropped);
            }
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn open_input_stream(
    audio: &AudioConfig,
    raw_tx: std::sync::mpsc::Sender<Vec<f32>>,
) -> TurnResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| TurnError::AudioDevice("No input device available".to_string()))?;

    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    debug!("Default input config: {:?}", device.default_input_config()?);

    let channels = audio.channels.max(1) as usize;
    let frame_samples = audio.frame_samples();
    let stream_config = StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(audio.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending = Vec::with_capacity(frame_samples);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for chunk in data.chunks(channels) {
                // Downmix interleaved channels to mono
                let mono = chunk.iter().sum::<f32>() / chunk.len() as f32;
                pending.push(mono);
                if pending.len() >= frame_samples {
                    let frame = std::mem::replace(&mut pending, Vec::with_capacity(frame_samples));
                    if raw_tx.send(frame).is_err() {
                        return;
                    }
                }
            }
        },
        move |err| {
            error!("Audio stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    info!("✅ Audio capture started");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frame_samples(), 480);
        assert_eq!(config.frame_duration(), Duration::from_millis(30));
    }

    #[test]
    fn frame_duration_follows_sample_count() {
        let frame = Frame::new(vec![0.0; 480], 16000);
        assert_eq!(frame.duration(), Duration::from_millis(30));
        let frame = Frame::new(vec![0.0; 160], 8000);
        assert_eq!(frame.duration(), Duration::from_millis(20));
    }

    #[test]
    fn wav_encoding_has_riff_header_and_samples() {
        let buffer = AudioBuffer {
            samples: vec![0.0, 0.5, -0.5, 1.0],
            sample_rate: 16000,
        };
        let wav = buffer.to_wav().unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 4 * 2);

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
    }

    #[tokio::test]
    async fn channel_source_discards_pending_frames() {
        let (tx, mut source) = ChannelFrameSource::channel(8);
        for _ in 0..3 {
            tx.send(ClassifiedFrame::new(Frame::new(vec![0.0; 480], 16000), false))
                .await
                .unwrap();
        }
        assert_eq!(source.discard_pending(), 3);

        tx.send(ClassifiedFrame::new(Frame::new(vec![0.1; 480], 16000), true))
            .await
            .unwrap();
        let frame = source.next_frame().await.unwrap();
        assert!(frame.is_speech);

        drop(tx);
        assert!(source.next_frame().await.is_none());
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        let result = MicrophoneSource::list_input_devices();
        if let Ok(devices) = result {
            println!("Available input devices: {:?}", devices);
        }
    }
}
