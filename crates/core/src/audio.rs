//! Audio frame types and utilities

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Supported audio sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - Telephony
    Hz8000,
    /// 16kHz - Standard speech capture rate
    #[default]
    Hz16000,
    /// 22.05kHz - Legacy TTS output
    Hz22050,
    /// 24kHz - Conversational AI playback rate
    Hz24000,
    /// 44.1kHz - CD quality
    Hz44100,
    /// 48kHz - Professional audio
    Hz48000,
}

impl SampleRate {
    /// Get sample rate as u32
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz22050 => 22050,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Map a raw device rate onto a supported rate
    pub fn from_u32(rate: u32) -> Option<Self> {
        match rate {
            8000 => Some(SampleRate::Hz8000),
            16000 => Some(SampleRate::Hz16000),
            22050 => Some(SampleRate::Hz22050),
            24000 => Some(SampleRate::Hz24000),
            44100 => Some(SampleRate::Hz44100),
            48000 => Some(SampleRate::Hz48000),
            _ => None,
        }
    }

    /// Get samples per millisecond
    pub fn samples_per_ms(&self) -> usize {
        self.as_u32() as usize / 1000
    }
}

/// Audio channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Channels {
    #[default]
    Mono,
    Stereo,
}

impl Channels {
    pub fn count(&self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }
}

/// Audio frame with metadata
///
/// Internally stores samples as f32 for processing efficiency.
#[derive(Clone)]
pub struct AudioFrame {
    /// Raw audio samples (f32, normalized to [-1.0, 1.0])
    pub samples: Arc<[f32]>,
    /// Sample rate
    pub sample_rate: SampleRate,
    /// Number of channels
    pub channels: Channels,
    /// Frame sequence number for ordering
    pub sequence: u64,
    /// Timestamp when frame was captured/generated
    pub timestamp: Instant,
    /// Duration of this frame
    pub duration: Duration,
    /// Energy level in dB
    pub energy_db: f32,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .field("duration", &self.duration)
            .field("energy_db", &self.energy_db)
            .finish()
    }
}

impl AudioFrame {
    /// Create a new audio frame from f32 samples
    pub fn new(
        samples: Vec<f32>,
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
    ) -> Self {
        let duration = Duration::from_secs_f64(
            samples.len() as f64 / (sample_rate.as_u32() as f64 * channels.count() as f64),
        );
        let energy_db = Self::calculate_energy_db(&samples);

        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            sequence,
            timestamp: Instant::now(),
            duration,
            energy_db,
        }
    }

    /// Calculate RMS energy in decibels
    fn calculate_energy_db(samples: &[f32]) -> f32 {
        // Mirror value in voice_session_config::constants::audio::SILENCE_FLOOR_DB
        const SILENCE_FLOOR_DB: f32 = -96.0;

        if samples.is_empty() {
            return SILENCE_FLOOR_DB;
        }

        let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum_squares / samples.len() as f32).sqrt();

        if rms > 0.0 {
            20.0 * rms.log10()
        } else {
            SILENCE_FLOOR_DB
        }
    }

    /// Linear RMS of the frame's samples, in [0.0, 1.0]
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum_squares / self.samples.len() as f32).sqrt()
    }

    /// Convert from PCM16 bytes (little-endian)
    ///
    /// Trailing odd bytes are ignored.
    pub fn from_pcm16(
        bytes: &[u8],
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
    ) -> Self {
        // Defined here to avoid a circular dependency (core can't depend on config).
        // Mirror value in voice_session_config::constants::audio::PCM16_NORMALIZE
        const PCM16_NORMALIZE: f32 = 32768.0;

        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|chunk| {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                sample as f32 / PCM16_NORMALIZE
            })
            .collect();

        Self::new(samples, sample_rate, channels, sequence)
    }

    /// Convert to PCM16 bytes (little-endian)
    ///
    /// Samples are clamped to [-1.0, 1.0] before quantizing.
    pub fn to_pcm16(&self) -> Vec<u8> {
        // Mirror value in voice_session_config::constants::audio::PCM16_SCALE
        const PCM16_SCALE: f32 = 32767.0;

        self.samples
            .iter()
            .flat_map(|&sample| {
                let clamped = sample.clamp(-1.0, 1.0);
                let pcm16 = (clamped * PCM16_SCALE) as i16;
                pcm16.to_le_bytes()
            })
            .collect()
    }

    /// High-quality resampling using Rubato (FFT based)
    ///
    /// Falls back to linear interpolation for very short frames where the
    /// FFT resampler cannot be constructed.
    pub fn resample(&self, target_rate: SampleRate) -> Self {
        use rubato::{FftFixedIn, Resampler};

        if self.sample_rate == target_rate {
            return self.clone();
        }

        let from_rate = self.sample_rate.as_u32() as usize;
        let to_rate = target_rate.as_u32() as usize;

        // For very short frames or edge cases, use linear fallback
        if self.samples.len() < 64 {
            return self.resample_linear(target_rate);
        }

        // Convert f32 samples to f64 for Rubato (higher precision)
        let samples_f64: Vec<f64> = self.samples.iter().map(|&s| s as f64).collect();

        let chunk_size = self.samples.len().min(1024);

        match FftFixedIn::<f64>::new(from_rate, to_rate, chunk_size, 2, 1) {
            Ok(mut resampler) => {
                // Rubato expects Vec<Vec<f64>> for multi-channel, we have mono
                let input_frames = vec![samples_f64];

                match resampler.process(&input_frames, None) {
                    Ok(output_frames) => {
                        let resampled: Vec<f32> =
                            output_frames[0].iter().map(|&s| s as f32).collect();

                        Self::new(resampled, target_rate, self.channels, self.sequence)
                    },
                    Err(e) => {
                        tracing::warn!("Rubato processing failed, using linear fallback: {}", e);
                        self.resample_linear(target_rate)
                    },
                }
            },
            Err(e) => {
                tracing::warn!("Rubato init failed, using linear fallback: {}", e);
                self.resample_linear(target_rate)
            },
        }
    }

    /// Linear interpolation fallback for edge cases
    fn resample_linear(&self, target_rate: SampleRate) -> Self {
        let ratio = target_rate.as_u32() as f64 / self.sample_rate.as_u32() as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;

        let mut resampled = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = src_idx.floor() as usize;
            let idx_ceil = (idx_floor + 1).min(self.samples.len().saturating_sub(1));
            let frac = src_idx - idx_floor as f64;

            let sample = self.samples[idx_floor] * (1.0 - frac as f32)
                + self.samples[idx_ceil] * frac as f32;
            resampled.push(sample);
        }

        Self::new(resampled, target_rate, self.channels, self.sequence)
    }

    /// Convert stereo to mono by averaging channels
    pub fn to_mono(&self) -> Self {
        if self.channels == Channels::Mono {
            return self.clone();
        }

        let mono_samples: Vec<f32> = self
            .samples
            .chunks_exact(2)
            .map(|chunk| (chunk[0] + chunk[1]) / 2.0)
            .collect();

        Self::new(
            mono_samples,
            self.sample_rate,
            Channels::Mono,
            self.sequence,
        )
    }

    /// Get duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Accumulates raw device callback buffers and drains exact fixed-size blocks
///
/// Device callbacks deliver whatever buffer size the driver picked; the
/// capture path needs constant-size blocks. Oldest samples are dropped once
/// the backlog cap is exceeded so a stalled consumer cannot grow the buffer
/// without bound.
#[derive(Debug)]
pub struct BlockAssembler {
    samples: Vec<f32>,
    block_frames: usize,
    max_backlog: usize,
}

impl BlockAssembler {
    /// Create an assembler producing blocks of `block_frames` samples,
    /// buffering at most `max_blocks` blocks of backlog.
    pub fn new(block_frames: usize, max_blocks: usize) -> Self {
        Self {
            samples: Vec::with_capacity(block_frames * 2),
            block_frames,
            max_backlog: block_frames * max_blocks.max(1),
        }
    }

    /// Append samples from a device callback
    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);

        if self.samples.len() > self.max_backlog {
            let excess = self.samples.len() - self.max_backlog;
            self.samples.drain(0..excess);
            tracing::trace!(dropped = excess, "capture backlog trimmed");
        }
    }

    /// Drain the next full block, if one is available
    pub fn next_block(&mut self) -> Option<Vec<f32>> {
        if self.samples.len() < self.block_frames {
            return None;
        }
        Some(self.samples.drain(0..self.block_frames).collect())
    }

    /// Number of buffered samples not yet drained
    pub fn buffered(&self) -> usize {
        self.samples.len()
    }

    /// Discard all buffered samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_conversions() {
        assert_eq!(SampleRate::Hz16000.as_u32(), 16000);
        assert_eq!(SampleRate::Hz24000.samples_per_ms(), 24);
        assert_eq!(SampleRate::from_u32(48000), Some(SampleRate::Hz48000));
        assert_eq!(SampleRate::from_u32(12345), None);
    }

    #[test]
    fn test_audio_frame_from_pcm16() {
        let pcm16: Vec<u8> = vec![0x00, 0x40, 0x00, 0xC0]; // Two samples
        let frame = AudioFrame::from_pcm16(&pcm16, SampleRate::Hz16000, Channels::Mono, 0);

        assert_eq!(frame.samples.len(), 2);
        assert!(frame.samples[0] > 0.0); // Positive sample
        assert!(frame.samples[1] < 0.0); // Negative sample
    }

    #[test]
    fn test_pcm16_clamps_out_of_range() {
        let frame = AudioFrame::new(
            vec![2.0, -2.0, 0.5],
            SampleRate::Hz16000,
            Channels::Mono,
            0,
        );
        let bytes = frame.to_pcm16();

        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32767);
    }

    #[test]
    fn test_pcm16_round_trip() {
        let original = vec![0.0f32, 0.25, -0.25, 0.99, -0.99];
        let frame = AudioFrame::new(original.clone(), SampleRate::Hz24000, Channels::Mono, 7);
        let decoded = AudioFrame::from_pcm16(
            &frame.to_pcm16(),
            SampleRate::Hz24000,
            Channels::Mono,
            7,
        );

        assert_eq!(decoded.samples.len(), original.len());
        for (a, b) in original.iter().zip(decoded.samples.iter()) {
            assert!((a - b).abs() < 1.0 / 32000.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        let pcm16: Vec<u8> = vec![0x00, 0x40, 0x7F];
        let frame = AudioFrame::from_pcm16(&pcm16, SampleRate::Hz16000, Channels::Mono, 0);
        assert_eq!(frame.samples.len(), 1);
    }

    #[test]
    fn test_audio_frame_resample() {
        let samples = vec![0.0f32; 160]; // 10ms at 16kHz
        let frame = AudioFrame::new(samples, SampleRate::Hz16000, Channels::Mono, 0);

        let resampled = frame.resample(SampleRate::Hz8000);
        assert_eq!(resampled.samples.len(), 80); // 10ms at 8kHz
    }

    #[test]
    fn test_energy_calculation() {
        // Silence
        let silent = AudioFrame::new(vec![0.0; 160], SampleRate::Hz16000, Channels::Mono, 0);
        assert!(silent.energy_db < -90.0);

        // Constant half scale
        let loud = AudioFrame::new(vec![0.5; 160], SampleRate::Hz16000, Channels::Mono, 0);
        assert!(loud.energy_db > -10.0);
        assert!((loud.rms() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_block_assembler_exact_blocks() {
        let mut assembler = BlockAssembler::new(4, 8);
        assembler.push(&[0.1, 0.2, 0.3]);
        assert!(assembler.next_block().is_none());

        assembler.push(&[0.4, 0.5]);
        let block = assembler.next_block().unwrap();
        assert_eq!(block, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(assembler.buffered(), 1);
    }

    #[test]
    fn test_block_assembler_backlog_cap() {
        let mut assembler = BlockAssembler::new(4, 2);
        assembler.push(&[0.0; 32]);
        assert!(assembler.buffered() <= 8);
        assert!(assembler.next_block().is_some());
    }
}
