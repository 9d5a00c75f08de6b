//! Windowing, FFT and log-band reduction of a single frame.

pub mod fft;

use std::fmt;

use num_complex::Complex32;

use crate::{bands::LogBinMapper, config::EngineConfig, Result, SpectrumError};

pub use fft::{apply_hann_window, fft_in_place, ifft_in_place};

/// Lowest level represented on the meter scale.
pub const METER_FLOOR_DB: f32 = -80.0;

/// Turns one frame of samples into normalised band meters.
///
/// All buffers are allocated once and reused on every call, so the analysis
/// loop does not allocate per tick apart from the published snapshot.
pub struct FrameAnalyzer {
    fft_size: usize,
    windowed: Vec<f32>,
    spectrum: Vec<Complex32>,
    magnitudes: Vec<f32>,
    band_levels: Vec<f32>,
    mapper: LogBinMapper,
}

impl FrameAnalyzer {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let mapper = LogBinMapper::from_config(config)?;
        Self::with_mapper(config.fft_size, mapper)
    }

    /// Builds an analyzer around an existing band layout.
    pub fn with_mapper(fft_size: usize, mapper: LogBinMapper) -> Result<Self> {
        if !fft_size.is_power_of_two() {
            return Err(SpectrumError::invalid(format!(
                "fft size must be a positive power of two, got {fft_size}"
            )));
        }

        Ok(Self {
            fft_size,
            windowed: vec![0.0; fft_size],
            spectrum: vec![Complex32::new(0.0, 0.0); fft_size],
            magnitudes: vec![0.0; fft_size / 2 + 1],
            band_levels: vec![0.0; mapper.band_count()],
            mapper,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn mapper(&self) -> &LogBinMapper {
        &self.mapper
    }

    /// Windows the frame, transforms it and returns `|X[k]| / N` for bins
    /// `0..=N/2`.
    ///
    /// # Panics
    ///
    /// Panics if `frame.len()` differs from the configured FFT size.
    pub fn magnitudes(&mut self, frame: &[f32]) -> &[f32] {
        assert_eq!(
            frame.len(),
            self.fft_size,
            "frame length must equal the fft size"
        );

        write_magnitudes(
            frame,
            &mut self.windowed,
            &mut self.spectrum,
            &mut self.magnitudes,
        );
        &self.magnitudes
    }

    /// Raw (linear) band magnitudes for a frame.
    pub fn band_magnitudes(&mut self, frame: &[f32]) -> &[f32] {
        self.magnitudes(frame);
        self.mapper.map_into(&self.magnitudes, &mut self.band_levels);
        &self.band_levels
    }

    /// Band levels converted to the `[0, 1]` meter scale.
    pub fn analyze(&mut self, frame: &[f32]) -> Vec<f32> {
        self.band_magnitudes(frame)
            .iter()
            .map(|&magnitude| magnitude_to_meter(magnitude))
            .collect()
    }
}

impl fmt::Debug for FrameAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameAnalyzer")
            .field("fft_size", &self.fft_size)
            .field("bands", &self.mapper.band_count())
            .finish()
    }
}

/// One-shot helper: magnitudes for bins `0..=N/2` of a frame.
pub fn magnitude_spectrum(frame: &[f32]) -> Result<Vec<f32>> {
    let n = frame.len();
    if !n.is_power_of_two() {
        return Err(SpectrumError::invalid(format!(
            "frame length must be a positive power of two, got {n}"
        )));
    }

    let mut windowed = vec![0.0; n];
    let mut spectrum = vec![Complex32::new(0.0, 0.0); n];
    let mut magnitudes = vec![0.0; n / 2 + 1];
    write_magnitudes(frame, &mut windowed, &mut spectrum, &mut magnitudes);
    Ok(magnitudes)
}

/// Hann-windows `frame`, transforms it and writes `|X[k]|/N` into
/// `magnitudes`. All buffers except `magnitudes` have the frame's
/// power-of-two length.
fn write_magnitudes(
    frame: &[f32],
    windowed: &mut [f32],
    spectrum: &mut [Complex32],
    magnitudes: &mut [f32],
) {
    windowed.copy_from_slice(frame);
    apply_hann_window(windowed);

    for (slot, sample) in spectrum.iter_mut().zip(windowed.iter()) {
        *slot = Complex32::new(*sample, 0.0);
    }
    fft::radix2(spectrum);

    let norm = 1.0 / frame.len() as f32;
    for (magnitude, bin) in magnitudes.iter_mut().zip(spectrum.iter()) {
        *magnitude = bin.norm() * norm;
    }
}

/// Maps a linear magnitude onto `[0, 1]` using a dB scale floored at
/// [`METER_FLOOR_DB`].
pub fn magnitude_to_meter(magnitude: f32) -> f32 {
    let db = 20.0 * magnitude.max(1.0e-9).log10();
    let clamped = db.clamp(METER_FLOOR_DB, 0.0);
    (clamped - METER_FLOOR_DB) / -METER_FLOOR_DB
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    fn analyzer() -> FrameAnalyzer {
        FrameAnalyzer::new(&EngineConfig::new(44_100, 1024, 64)).unwrap()
    }

    #[test]
    fn rejects_invalid_fft_size() {
        let err = FrameAnalyzer::new(&EngineConfig::new(44_100, 1000, 64)).unwrap_err();
        assert!(matches!(err, SpectrumError::InvalidConfiguration(_)));
        assert!(magnitude_spectrum(&[0.0; 6]).is_err());
    }

    #[test]
    #[should_panic(expected = "frame length")]
    fn frame_length_mismatch_panics() {
        let mut analyzer = analyzer();
        analyzer.magnitudes(&[0.0; 512]);
    }

    #[test]
    fn silent_frame_is_silent() {
        let mut analyzer = analyzer();
        let magnitudes = analyzer.magnitudes(&[0.0; 1024]).to_vec();
        assert_eq!(magnitudes.len(), 513);
        assert!(magnitudes.iter().all(|m| *m == 0.0));

        let meters = analyzer.analyze(&[0.0; 1024]);
        assert!(meters.iter().all(|m| *m == 0.0));
    }

    #[test]
    fn tone_peaks_at_its_bin() {
        let mut analyzer = analyzer();
        // Bin 40 sits exactly on 40 * 44100 / 1024 Hz.
        let freq = 40.0 * 44_100.0 / 1024.0;
        let frame = sine(freq, 44_100, 1024, 1.0);

        let magnitudes = analyzer.magnitudes(&frame);
        let (peak, value) = magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert_eq!(peak, 40);
        // Hann coherent gain is 0.5 and a real tone splits into two bins.
        assert!((value - 0.25).abs() < 0.01, "peak magnitude {value}");
    }

    #[test]
    fn magnitude_scale_is_independent_of_fft_size() {
        let small_frame = sine(64.0 * 48_000.0 / 512.0, 48_000, 512, 1.0);
        let large_frame = sine(128.0 * 48_000.0 / 1024.0, 48_000, 1024, 1.0);
        let small = magnitude_spectrum(&small_frame).unwrap();
        let large = magnitude_spectrum(&large_frame).unwrap();
        let small_peak = small.iter().cloned().fold(0.0_f32, f32::max);
        let large_peak = large.iter().cloned().fold(0.0_f32, f32::max);
        assert!((small_peak - large_peak).abs() < 0.01);
    }

    #[test]
    fn helper_matches_analyzer() {
        let mut analyzer = analyzer();
        let frame = sine(1000.0, 44_100, 1024, 0.3);
        let expected = magnitude_spectrum(&frame).unwrap();
        assert_eq!(analyzer.magnitudes(&frame), expected.as_slice());
    }

    #[test]
    fn meters_cover_the_db_range() {
        assert_eq!(magnitude_to_meter(0.0), 0.0);
        assert_eq!(magnitude_to_meter(1.0), 1.0);
        assert_eq!(magnitude_to_meter(4.0), 1.0);
        assert!((magnitude_to_meter(0.01) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn tone_lights_up_meters() {
        let mut analyzer = analyzer();
        let meters = analyzer.analyze(&sine(1000.0, 44_100, 1024, 0.5));
        assert_eq!(meters.len(), 64);
        assert!(meters.iter().all(|m| (0.0..=1.0).contains(m)));
        assert!(meters.iter().any(|m| *m > 0.5));
    }
}
