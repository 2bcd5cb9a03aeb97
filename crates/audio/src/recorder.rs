//! WAV capture of scheduled response audio
//!
//! Wraps any output device and writes every scheduled buffer to a mono
//! 16-bit WAV file before delegating. The file reflects what was scheduled,
//! so audio cancelled by an interruption still appears in it.

use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;
use std::sync::Arc;
use tokio::sync::broadcast;

use voice_session_config::constants::audio::PCM16_SCALE;
use voice_session_core::{AudioFrame, Channels, SampleRate};

use crate::device::{BufferId, DeviceState, OutputDevice, OutputEvent};
use crate::error::AudioError;

type WavFileWriter = hound::WavWriter<std::io::BufWriter<std::fs::File>>;

pub struct RecordingOutput {
    inner: Arc<dyn OutputDevice>,
    writer: Mutex<Option<WavFileWriter>>,
    sample_rate: SampleRate,
}

impl RecordingOutput {
    /// Create the WAV file at `path` and wrap `inner`
    pub fn create(
        inner: Arc<dyn OutputDevice>,
        path: impl AsRef<Path>,
        sample_rate: SampleRate,
    ) -> Result<Self, AudioError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sample_rate.as_u32(),
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)
            .map_err(|err| AudioError::Recorder(err.to_string()))?;
        tracing::info!(path = %path.as_ref().display(), "recording response audio");

        Ok(Self {
            inner,
            writer: Mutex::new(Some(writer)),
            sample_rate,
        })
    }

    /// Flush and close the WAV file. Scheduling continues to delegate after
    /// this; it just stops being recorded.
    pub fn finalize(&self) -> Result<(), AudioError> {
        if let Some(writer) = self.writer.lock().take() {
            writer
                .finalize()
                .map_err(|err| AudioError::Recorder(err.to_string()))?;
        }
        Ok(())
    }

    fn record(&self, frame: &AudioFrame) {
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return;
        };

        let mut copy = frame.clone();
        if copy.channels == Channels::Stereo {
            copy = copy.to_mono();
        }
        if copy.sample_rate != self.sample_rate {
            copy = copy.resample(self.sample_rate);
        }

        for sample in copy.samples.iter() {
            let value = (sample.clamp(-1.0, 1.0) * PCM16_SCALE) as i16;
            if let Err(err) = writer.write_sample(value) {
                tracing::warn!(error = %err, "wav write failed, disabling recorder");
                *guard = None;
                return;
            }
        }
    }
}

impl OutputDevice for RecordingOutput {
    fn clock(&self) -> Duration {
        self.inner.clock()
    }

    fn state(&self) -> DeviceState {
        self.inner.state()
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.inner.resume()
    }

    fn schedule(&self, frame: AudioFrame, start: Duration) -> Result<BufferId, AudioError> {
        self.record(&frame);
        self.inner.schedule(frame, start)
    }

    fn cancel(&self, id: BufferId) {
        self.inner.cancel(id);
    }

    fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.inner.subscribe()
    }
}

impl Drop for RecordingOutput {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.finalize();
        }
    }
}
