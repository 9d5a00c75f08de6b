//! Frame sources feeding the analysis loop.
//!
//! The reference source is a swept sine tone whose parameters can be changed
//! from any thread. [`CaptureSource`] replaces it with samples pushed by an
//! external capture backend; downstream code cannot tell the two apart.

use std::{
    collections::VecDeque,
    f64::consts::TAU,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ringbuf::{Consumer, HeapRb, Producer};

/// Lower bound of the reference sweep.
pub const SWEEP_MIN_HZ: f64 = 110.0;
/// Upper bound of the reference sweep.
pub const SWEEP_MAX_HZ: f64 = 1760.0;
/// Frequency change applied to the tone on every tick while sweeping.
pub const SWEEP_STEP_HZ: f64 = 0.5;

const DEFAULT_TONE_HZ: f64 = 220.0;
const DEFAULT_AMPLITUDE: f64 = 0.2;

/// Produces exactly one frame of mono samples per analysis tick.
pub trait FrameSource: Send {
    /// Fills `frame` with the next block of samples. The slice length is the
    /// configured FFT size.
    fn fill_frame(&mut self, frame: &mut [f32], sample_rate: u32);

    /// Human readable name used in log output.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ToneParams {
    tone_hz: f64,
    amplitude: f64,
    sweep: bool,
}

/// Thread-safe handle for retuning a [`SweepGenerator`].
///
/// Writes are last-write-wins and are picked up at the start of the next
/// tick.
#[derive(Debug, Clone)]
pub struct ToneControls {
    params: Arc<Mutex<ToneParams>>,
}

impl ToneControls {
    fn lock(&self) -> MutexGuard<'_, ToneParams> {
        self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the tone to `hz`. Non-finite or negative values are ignored.
    pub fn set_tone_hz(&self, hz: f64) {
        if hz.is_finite() && hz >= 0.0 {
            self.lock().tone_hz = hz;
        }
    }

    /// Sets the peak amplitude, clamped to `[0, 1]`.
    pub fn set_amplitude(&self, amplitude: f64) {
        if amplitude.is_finite() {
            self.lock().amplitude = amplitude.clamp(0.0, 1.0);
        }
    }

    /// Enables or disables the automatic sweep.
    pub fn set_sweep(&self, enabled: bool) {
        self.lock().sweep = enabled;
    }

    pub fn tone_hz(&self) -> f64 {
        self.lock().tone_hz
    }

    pub fn amplitude(&self) -> f64 {
        self.lock().amplitude
    }

    pub fn is_sweeping(&self) -> bool {
        self.lock().sweep
    }
}

/// Sine tone that sweeps linearly between [`SWEEP_MIN_HZ`] and
/// [`SWEEP_MAX_HZ`], reversing at each bound.
#[derive(Debug)]
pub struct SweepGenerator {
    controls: ToneControls,
    direction: f64,
    phase: f64,
}

impl Default for SweepGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepGenerator {
    pub fn new() -> Self {
        Self::with_tone(DEFAULT_TONE_HZ, DEFAULT_AMPLITUDE)
    }

    pub fn with_tone(tone_hz: f64, amplitude: f64) -> Self {
        Self {
            controls: ToneControls {
                params: Arc::new(Mutex::new(ToneParams {
                    tone_hz,
                    amplitude: amplitude.clamp(0.0, 1.0),
                    sweep: true,
                })),
            },
            direction: 1.0,
            phase: 0.0,
        }
    }

    /// Handle that other threads can use to retune the generator.
    pub fn controls(&self) -> ToneControls {
        self.controls.clone()
    }

    /// Reads the parameters for this tick and advances the sweep. The lock is
    /// released before any samples are synthesised.
    fn next_params(&mut self) -> ToneParams {
        let mut params = self.controls.lock();
        if params.sweep {
            let mut hz = params.tone_hz + self.direction * SWEEP_STEP_HZ;
            if hz > SWEEP_MAX_HZ {
                hz = SWEEP_MAX_HZ;
                self.direction = -1.0;
            }
            if hz < SWEEP_MIN_HZ {
                hz = SWEEP_MIN_HZ;
                self.direction = 1.0;
            }
            params.tone_hz = hz;
        }
        *params
    }
}

impl FrameSource for SweepGenerator {
    fn fill_frame(&mut self, frame: &mut [f32], sample_rate: u32) {
        let params = self.next_params();
        let increment = TAU * params.tone_hz / sample_rate.max(1) as f64;

        for sample in frame.iter_mut() {
            *sample = (params.amplitude * self.phase.sin()) as f32;
            self.phase += increment;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
        }
    }

    fn name(&self) -> &'static str {
        "sweep"
    }
}

/// Frame source backed by samples pushed from an external capture callback.
///
/// The feed and the source share a lock-free single-producer ring buffer
/// holding four frames. Each tick drains it into a window of the latest
/// `frame_size` samples, which starts out as silence.
pub struct CaptureSource {
    consumer: Consumer<f32, Arc<HeapRb<f32>>>,
    window: VecDeque<f32>,
}

/// Producer side of a [`CaptureSource`], meant to live inside an audio
/// callback. Pushing never blocks: samples that do not fit while the ring is
/// full are dropped.
pub struct CaptureFeed {
    producer: Producer<f32, Arc<HeapRb<f32>>>,
}

impl CaptureSource {
    /// Creates a source and the feed that fills it.
    pub fn new(frame_size: usize) -> (Self, CaptureFeed) {
        let frame_size = frame_size.max(1);
        let (producer, consumer) = HeapRb::<f32>::new(frame_size * 4).split();
        (
            Self {
                consumer,
                window: VecDeque::from(vec![0.0; frame_size]),
            },
            CaptureFeed { producer },
        )
    }

    fn drain(&mut self) {
        while let Some(sample) = self.consumer.pop() {
            self.window.pop_front();
            self.window.push_back(sample);
        }
    }
}

impl FrameSource for CaptureSource {
    fn fill_frame(&mut self, frame: &mut [f32], _sample_rate: u32) {
        self.drain();

        let available = self.window.len().min(frame.len());
        let padding = frame.len() - available;
        frame[..padding].fill(0.0);
        for (slot, sample) in frame[padding..]
            .iter_mut()
            .zip(self.window.iter().skip(self.window.len() - available))
        {
            *slot = *sample;
        }
    }

    fn name(&self) -> &'static str {
        "capture"
    }
}

impl std::fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSource")
            .field("pending", &self.consumer.len())
            .field("window", &self.window.len())
            .finish()
    }
}

impl CaptureFeed {
    /// Appends an interleaved block, downmixing to mono. Stereo input is
    /// averaged; wider layouts keep only the first channel. Returns the
    /// number of mono samples accepted.
    pub fn push_interleaved(&mut self, data: &[f32], channels: usize) -> usize {
        match channels.max(1) {
            1 => self.producer.push_slice(data),
            2 => self.push_mono(data.chunks_exact(2).map(|pair| (pair[0] + pair[1]) * 0.5)),
            channels => self.push_mono(data.chunks_exact(channels).map(|chunk| chunk[0])),
        }
    }

    /// Appends mono samples.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.push_interleaved(samples, 1)
    }

    /// Number of samples waiting for the next tick.
    pub fn buffered(&self) -> usize {
        self.producer.len()
    }

    /// Total number of samples the ring can hold.
    pub fn capacity(&self) -> usize {
        self.producer.capacity()
    }

    fn push_mono(&mut self, samples: impl Iterator<Item = f32>) -> usize {
        let mut accepted = 0;
        for sample in samples {
            if self.producer.push(sample).is_err() {
                break;
            }
            accepted += 1;
        }
        accepted
    }
}

impl std::fmt::Debug for CaptureFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureFeed")
            .field("buffered", &self.buffered())
            .field("capacity", &self.capacity())
            .finish()
    }
}
