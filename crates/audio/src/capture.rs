//! Microphone capture, volume metering and wire encoding
//!
//! Capture never pauses. While a response is playing the reported volume is
//! forced to zero so the far end's activity detector ignores loudspeaker
//! bleed, but the encoded blocks keep flowing.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use voice_session_config::constants::audio::CAPTURE_GAIN;
use voice_session_core::{AudioFrame, Channels, MediaBlob, SampleRate};

use crate::device::CaptureStream;

/// Capture-side counters
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Blocks encoded and handed to the transport channel
    pub blocks: u64,
    /// Blocks sent with the volume metric forced to zero
    pub silenced_blocks: u64,
}

/// Tuning for the capture pipeline
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate blocks are resampled to before encoding
    pub wire_rate: SampleRate,
    /// Multiplier applied to block RMS before clamping to [0, 1]
    pub gain: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            wire_rate: SampleRate::Hz16000,
            gain: CAPTURE_GAIN,
        }
    }
}

/// Pulls fixed-size blocks off a capture stream, encodes them for the wire
/// and reports a volume metric per block
pub struct CaptureEncoder {
    config: CaptureConfig,
    playing: Arc<AtomicBool>,
    media_tx: mpsc::Sender<MediaBlob>,
    on_volume: Arc<dyn Fn(f32) + Send + Sync>,
    stats: Arc<RwLock<CaptureStats>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureEncoder {
    pub fn new(
        config: CaptureConfig,
        playing: Arc<AtomicBool>,
        media_tx: mpsc::Sender<MediaBlob>,
        on_volume: Arc<dyn Fn(f32) + Send + Sync>,
    ) -> Self {
        Self {
            config,
            playing,
            media_tx,
            on_volume,
            stats: Arc::new(RwLock::new(CaptureStats::default())),
            task: Mutex::new(None),
        }
    }

    /// Start encoding from `stream`. Replaces any previous stream.
    pub fn start(&self, stream: CaptureStream) {
        let wire_rate = self.config.wire_rate;
        let gain = self.config.gain;
        let playing = Arc::clone(&self.playing);
        let media_tx = self.media_tx.clone();
        let on_volume = Arc::clone(&self.on_volume);
        let stats = Arc::clone(&self.stats);

        let task = tokio::spawn(async move {
            let mut stream = stream;
            let mut sequence: u64 = 0;
            loop {
                let Some(block) = stream.blocks.recv().await else {
                    tracing::debug!("capture stream ended");
                    break;
                };

                let mut frame =
                    AudioFrame::new(block, stream.sample_rate, stream.channels, sequence);
                sequence += 1;

                if frame.channels == Channels::Stereo {
                    frame = frame.to_mono();
                }
                if frame.sample_rate != wire_rate {
                    frame = frame.resample(wire_rate);
                }

                let muted = playing.load(Ordering::SeqCst);
                let volume = if muted {
                    0.0
                } else {
                    (frame.rms() * gain).clamp(0.0, 1.0)
                };
                on_volume(volume);

                {
                    let mut stats = stats.write();
                    stats.blocks += 1;
                    if muted {
                        stats.silenced_blocks += 1;
                    }
                }

                let blob = MediaBlob::from_frame(&frame);
                if media_tx.send(blob).await.is_err() {
                    tracing::debug!("media channel closed, capture loop exiting");
                    break;
                }
            }
        });

        let mut slot = self.task.lock();
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Snapshot of the capture counters
    pub fn stats(&self) -> CaptureStats {
        self.stats.read().clone()
    }

    /// Abort the capture loop. Dropping the stream stops the device.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn encoder_parts(
        playing: bool,
    ) -> (
        CaptureEncoder,
        mpsc::Receiver<MediaBlob>,
        Arc<parking_lot::Mutex<Vec<f32>>>,
        Arc<AtomicBool>,
    ) {
        let playing = Arc::new(AtomicBool::new(playing));
        let (media_tx, media_rx) = mpsc::channel(16);
        let volumes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&volumes);
        let on_volume: Arc<dyn Fn(f32) + Send + Sync> =
            Arc::new(move |v| sink.lock().push(v));
        let encoder = CaptureEncoder::new(
            CaptureConfig::default(),
            Arc::clone(&playing),
            media_tx,
            on_volume,
        );
        (encoder, media_rx, volumes, playing)
    }

    #[tokio::test]
    async fn test_blocks_flow_and_volume_tracks_level() {
        let (encoder, mut media_rx, volumes, _) = encoder_parts(false);
        let (tx, rx) = mpsc::channel(4);
        encoder.start(CaptureStream::new(SampleRate::Hz16000, Channels::Mono, rx));

        tx.send(vec![0.5f32; 320]).await.unwrap();
        let blob = media_rx.recv().await.unwrap();

        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        let raw = voice_session_core::decode_base64(&blob.data).unwrap();
        assert_eq!(raw.len(), 640);
        let volume = volumes.lock()[0];
        assert!(volume > 0.5 && volume <= 1.0, "volume was {volume}");
        assert_eq!(encoder.stats().blocks, 1);
    }

    #[tokio::test]
    async fn test_capture_continues_while_response_plays() {
        let (encoder, mut media_rx, volumes, _) = encoder_parts(true);
        let (tx, rx) = mpsc::channel(4);
        encoder.start(CaptureStream::new(SampleRate::Hz16000, Channels::Mono, rx));

        tx.send(vec![0.5f32; 320]).await.unwrap();
        tx.send(vec![0.5f32; 320]).await.unwrap();

        // Blocks still reach the transport channel
        assert!(media_rx.recv().await.is_some());
        assert!(media_rx.recv().await.is_some());
        // But the volume metric is suppressed
        assert_eq!(volumes.lock().as_slice(), &[0.0, 0.0]);
        assert_eq!(encoder.stats().silenced_blocks, 2);
    }

    #[tokio::test]
    async fn test_stereo_input_downmixed_before_encoding() {
        let (encoder, mut media_rx, _, _) = encoder_parts(false);
        let (tx, rx) = mpsc::channel(4);
        encoder.start(CaptureStream::new(SampleRate::Hz16000, Channels::Stereo, rx));

        // 320 interleaved stereo samples -> 160 mono frames -> 320 bytes
        tx.send(vec![0.25f32; 320]).await.unwrap();
        let blob = media_rx.recv().await.unwrap();
        let raw = voice_session_core::decode_base64(&blob.data).unwrap();
        assert_eq!(raw.len(), 320);
    }

    #[tokio::test]
    async fn test_mismatched_rate_resampled_to_wire_rate() {
        let (encoder, mut media_rx, _, _) = encoder_parts(false);
        let (tx, rx) = mpsc::channel(4);
        encoder.start(CaptureStream::new(SampleRate::Hz48000, Channels::Mono, rx));

        tx.send(vec![0.25f32; 4800]).await.unwrap();
        let blob = media_rx.recv().await.unwrap();
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        assert!(!blob.data.is_empty());
    }

    #[tokio::test]
    async fn test_stop_releases_the_stream() {
        let (encoder, _media_rx, _, _) = encoder_parts(false);
        let stop = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = mpsc::channel::<Vec<f32>>(4);
        let stream = CaptureStream::with_stop(
            SampleRate::Hz16000,
            Channels::Mono,
            rx,
            Arc::clone(&stop),
        );
        encoder.start(stream);

        encoder.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stop.load(Ordering::Acquire), "dropping the stream flags the device to stop");
    }
}
