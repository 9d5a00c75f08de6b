//! Logarithmically spaced frequency bands over a linear FFT magnitude
//! spectrum.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{config::EngineConfig, Result, SpectrumError};

/// One half-open frequency interval `[lo_hz, hi_hz)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogBand {
    pub lo_hz: f32,
    pub hi_hz: f32,
}

impl LogBand {
    /// Geometric mean of the edges, the natural center of a log-spaced band.
    pub fn center_hz(&self) -> f32 {
        (self.lo_hz.max(1.0e-6) * self.hi_hz.max(1.0e-6)).sqrt()
    }

    pub fn is_collapsed(&self) -> bool {
        self.hi_hz <= self.lo_hz
    }
}

/// Maps magnitudes for FFT bins `0..=N/2` onto a fixed number of log bands.
///
/// Band edges are computed once at construction and shared read-only.
#[derive(Debug, Clone)]
pub struct LogBinMapper {
    sample_rate: u32,
    fft_size: usize,
    bands: Arc<[LogBand]>,
    centers: Arc<[f32]>,
}

impl LogBinMapper {
    /// Builds the band layout. `min_hz` is clamped into `[1, nyquist]`.
    pub fn new(sample_rate: u32, fft_size: usize, band_count: usize, min_hz: f32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(SpectrumError::invalid("sample rate must be positive"));
        }
        if fft_size == 0 {
            return Err(SpectrumError::invalid("fft size must be positive"));
        }
        if band_count == 0 {
            return Err(SpectrumError::invalid("band count must be positive"));
        }
        if !(min_hz > 0.0) {
            return Err(SpectrumError::invalid("minimum frequency must be positive"));
        }

        let bands: Arc<[LogBand]> = compute_edges(sample_rate, band_count, min_hz).into();
        let centers: Arc<[f32]> = bands.iter().map(LogBand::center_hz).collect();

        Ok(Self {
            sample_rate,
            fft_size,
            bands,
            centers,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(
            config.sample_rate,
            config.fft_size,
            config.band_count,
            config.min_hz,
        )
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn bands(&self) -> &[LogBand] {
        &self.bands
    }

    /// Shared handle to the band edges.
    pub fn shared_bands(&self) -> Arc<[LogBand]> {
        Arc::clone(&self.bands)
    }

    pub fn centers(&self) -> &[f32] {
        &self.centers
    }

    /// Shared handle to the band centers.
    pub fn shared_centers(&self) -> Arc<[f32]> {
        Arc::clone(&self.centers)
    }

    /// Inclusive FFT bin range covered by a band, clamped to a spectrum of
    /// `magnitude_len` bins. `None` when the band maps to no bins.
    pub fn bin_range(&self, band: &LogBand, magnitude_len: usize) -> Option<(usize, usize)> {
        if magnitude_len == 0 {
            return None;
        }

        let hz_per_bin = self.sample_rate as f32 / self.fft_size as f32;
        let last = magnitude_len as i64 - 1;
        let lo = ((band.lo_hz / hz_per_bin).floor() as i64).max(0);
        let hi = ((band.hi_hz / hz_per_bin).ceil() as i64).min(last);
        (hi >= lo).then(|| (lo as usize, hi as usize))
    }

    /// Averages the magnitudes that fall into each band.
    pub fn map(&self, magnitudes: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.bands.len()];
        self.map_into(magnitudes, &mut out);
        out
    }

    /// Same as [`LogBinMapper::map`] but writes into a caller-owned buffer of
    /// exactly [`LogBinMapper::band_count`] values.
    pub fn map_into(&self, magnitudes: &[f32], out: &mut [f32]) {
        assert_eq!(out.len(), self.bands.len(), "output length must match band count");

        for (band, slot) in self.bands.iter().zip(out.iter_mut()) {
            *slot = match self.bin_range(band, magnitudes.len()) {
                Some((lo, hi)) => {
                    let range = &magnitudes[lo..=hi];
                    range.iter().sum::<f32>() / range.len() as f32
                }
                None => 0.0,
            };
        }
    }
}

fn compute_edges(sample_rate: u32, band_count: usize, min_hz: f32) -> Vec<LogBand> {
    let nyquist = sample_rate as f32 * 0.5;
    let min_hz = min_hz.max(1.0).min(nyquist);
    let max_hz = min_hz.max(nyquist);
    let ratio = max_hz / min_hz;

    let edge = |i: usize| min_hz * ratio.powf(i as f32 / band_count as f32);

    (0..band_count)
        .map(|i| {
            let lo = edge(i);
            let hi = edge(i + 1).min(nyquist);
            LogBand {
                lo_hz: lo,
                hi_hz: hi.max(lo),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: u32 = 44_100;
    const FFT_SIZE: usize = 1024;

    fn mapper(bands: usize) -> LogBinMapper {
        LogBinMapper::new(SAMPLE_RATE, FFT_SIZE, bands, 20.0).unwrap()
    }

    #[test]
    fn rejects_degenerate_configuration() {
        assert!(LogBinMapper::new(0, FFT_SIZE, 64, 20.0).is_err());
        assert!(LogBinMapper::new(SAMPLE_RATE, 0, 64, 20.0).is_err());
        assert!(LogBinMapper::new(SAMPLE_RATE, FFT_SIZE, 0, 20.0).is_err());
        assert!(LogBinMapper::new(SAMPLE_RATE, FFT_SIZE, 64, 0.0).is_err());
        assert!(LogBinMapper::new(SAMPLE_RATE, FFT_SIZE, 64, f32::NAN).is_err());
    }

    #[test]
    fn edges_are_contiguous_and_cover_range() {
        let nyquist = SAMPLE_RATE as f32 * 0.5;
        for count in [1, 7, 64, 300] {
            let mapper = mapper(count);
            let bands = mapper.bands();
            assert_eq!(bands.len(), count);
            assert!((bands[0].lo_hz - 20.0).abs() < 1e-3);
            assert!((bands[count - 1].hi_hz - nyquist).abs() < 0.5);

            for band in bands {
                assert!(band.hi_hz >= band.lo_hz);
                assert!(band.hi_hz <= nyquist);
            }
            for pair in bands.windows(2) {
                assert!(pair[1].lo_hz >= pair[0].lo_hz);
                assert!((pair[1].lo_hz - pair[0].hi_hz).abs() <= pair[0].hi_hz * 1e-4);
            }
        }
    }

    #[test]
    fn centers_are_geometric_and_increasing() {
        let mapper = mapper(64);
        let centers = mapper.centers();
        assert_eq!(centers.len(), 64);

        for (band, center) in mapper.bands().iter().zip(centers) {
            let expected = (band.lo_hz * band.hi_hz).sqrt();
            assert!((center - expected).abs() <= expected * 1e-6);
        }
        assert!(centers.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn centers_match_closed_form() {
        let mapper = mapper(64);
        let f_min = 20.0_f32;
        let f_max = SAMPLE_RATE as f32 * 0.5;

        for (i, center) in mapper.centers().iter().enumerate() {
            let lo = f_min * (f_max / f_min).powf(i as f32 / 64.0);
            let hi = f_min * (f_max / f_min).powf((i + 1) as f32 / 64.0);
            let expected = (lo * hi).sqrt();
            assert!((center - expected).abs() <= expected * 1e-5, "band {i}");
        }
    }

    #[test]
    fn min_hz_above_nyquist_collapses_bands() {
        let mapper = LogBinMapper::new(1000, 64, 4, 5000.0).unwrap();
        for band in mapper.bands() {
            assert_eq!(band.lo_hz, 500.0);
            assert!(band.is_collapsed());
        }
    }

    #[test]
    fn output_has_band_count_and_is_non_negative() {
        let mapper = mapper(64);
        let mut magnitudes = vec![0.0_f32; FFT_SIZE / 2 + 1];
        magnitudes[10] = 1.0;

        let out = mapper.map(&magnitudes);
        assert_eq!(out.len(), 64);
        assert!(out.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn single_bin_energy_only_reaches_covering_bands() {
        let mapper = mapper(64);
        let len = FFT_SIZE / 2 + 1;
        let k = (1000.0 * FFT_SIZE as f32 / SAMPLE_RATE as f32).floor() as usize;
        let mut magnitudes = vec![0.0_f32; len];
        magnitudes[k] = 1.0;

        let out = mapper.map(&magnitudes);

        let mut covering = 0;
        for (band, value) in mapper.bands().iter().zip(&out) {
            let covers = mapper
                .bin_range(band, len)
                .map(|(lo, hi)| lo <= k && k <= hi)
                .unwrap_or(false);
            if covers {
                covering += 1;
                assert!(*value > 0.0);
            } else {
                assert_eq!(*value, 0.0);
            }
        }
        assert!(covering >= 1);
    }

    #[test]
    fn low_bands_may_share_a_bin() {
        let mapper = mapper(64);
        let len = FFT_SIZE / 2 + 1;
        let mut magnitudes = vec![0.0_f32; len];
        magnitudes[1] = 1.0;

        let out = mapper.map(&magnitudes);
        let lit = out.iter().filter(|v| **v > 0.0).count();
        assert!(lit > 1, "overlapping low bands should all register energy");
    }

    #[test]
    fn empty_spectrum_maps_to_zero() {
        let mapper = mapper(8);
        assert_eq!(mapper.map(&[]), vec![0.0; 8]);
    }
}
