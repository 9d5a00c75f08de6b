use std::{fs::File, io::BufWriter, path::Path};

use crate::Result;

type Writer = hound::WavWriter<BufWriter<File>>;

/// Mono 16-bit WAV sink for the generated frames.
///
/// Samples are clamped to `[-1, 1]` before being scaled to `i16`.
pub struct WavRecorder {
    writer: Option<Writer>,
    frames_written: u64,
}

impl WavRecorder {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: &Path, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)?;
        tracing::info!(path = %path.display(), sample_rate, "recording to wav");
        Ok(Self {
            writer: Some(writer),
            frames_written: 0,
        })
    }

    /// Appends one frame of mono samples.
    pub fn write_frame(&mut self, samples: &[f32]) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        for &sample in samples {
            writer.write_sample(to_pcm16(sample))?;
        }
        self.frames_written += samples.len() as u64;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Flushes the header and closes the file. Further writes are ignored.
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            tracing::warn!(%err, "failed to finalize wav recording");
        }
    }
}

impl std::fmt::Debug for WavRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavRecorder")
            .field("open", &self.is_open())
            .field("frames_written", &self.frames_written)
            .finish()
    }
}

/// Clamps to `[-1, 1]` and scales to a signed 16-bit sample.
pub fn to_pcm16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    (clamped * 32767.0).round() as i16
}
