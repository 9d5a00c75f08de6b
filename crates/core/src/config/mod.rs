use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{Result, SpectrumError};

/// Smallest fan-out interval the broadcast server accepts.
pub const MIN_BROADCAST_INTERVAL_MS: u64 = 10;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub recording: Option<RecordingSettings>,
}

impl AppConfig {
    /// Reads a TOML file and validates the engine section.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.engine.validate()?;
        Ok(config)
    }
}

/// Configuration of the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_band_count")]
    pub band_count: usize,
    #[serde(default = "default_min_hz")]
    pub min_hz: f32,
    /// Fixed polling cadence for capture-driven sources. When unset the
    /// analysis loop ticks once per frame duration.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            fft_size: default_fft_size(),
            band_count: default_band_count(),
            min_hz: default_min_hz(),
            poll_interval_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn new(sample_rate: u32, fft_size: usize, band_count: usize) -> Self {
        Self {
            sample_rate,
            fft_size,
            band_count,
            ..Self::default()
        }
    }

    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 * 0.5
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SpectrumError::invalid("sample rate must be positive"));
        }
        if !self.fft_size.is_power_of_two() {
            return Err(SpectrumError::invalid(format!(
                "fft size must be a positive power of two, got {}",
                self.fft_size
            )));
        }
        if self.band_count == 0 {
            return Err(SpectrumError::invalid("band count must be positive"));
        }
        if !self.min_hz.is_finite() || self.min_hz <= 0.0 {
            return Err(SpectrumError::invalid(format!(
                "minimum frequency must be positive, got {}",
                self.min_hz
            )));
        }
        if self.min_hz >= self.nyquist() {
            return Err(SpectrumError::invalid(format!(
                "minimum frequency {} Hz must be below nyquist ({} Hz)",
                self.min_hz,
                self.nyquist()
            )));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(SpectrumError::invalid("poll interval must be positive"));
        }
        Ok(())
    }

    /// Time between two analysis ticks.
    pub fn frame_duration(&self) -> Duration {
        match self.poll_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs_f64(self.fft_size as f64 / self.sample_rate.max(1) as f64),
        }
    }
}

/// Configuration of the WebSocket broadcast server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            interval_ms: default_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl BroadcastConfig {
    /// Fan-out cadence, never shorter than [`MIN_BROADCAST_INTERVAL_MS`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(MIN_BROADCAST_INTERVAL_MS))
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }
}

/// Configuration options for the recording sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSettings {
    pub output_path: PathBuf,
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_fft_size() -> usize {
    2048
}

fn default_band_count() -> usize {
    64
}

fn default_min_hz() -> f32 {
    20.0
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8787
}

fn default_interval_ms() -> u64 {
    100
}

fn default_handshake_timeout_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_fft() {
        let config = EngineConfig::new(44_100, 1000, 64);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SpectrumError::InvalidConfiguration(_)));
        assert!(format!("{err}").contains("1000"));
    }

    #[test]
    fn rejects_zero_values() {
        assert!(EngineConfig::new(0, 1024, 64).validate().is_err());
        assert!(EngineConfig::new(44_100, 0, 64).validate().is_err());
        assert!(EngineConfig::new(44_100, 1024, 0).validate().is_err());

        let mut config = EngineConfig::new(44_100, 1024, 64);
        config.min_hz = 0.0;
        assert!(config.validate().is_err());
        config.min_hz = 30_000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn frame_duration_follows_fft_size() {
        let config = EngineConfig::new(44_100, 1024, 64);
        let ms = config.frame_duration().as_secs_f64() * 1000.0;
        assert!((ms - 23.22).abs() < 0.01);

        let polled = EngineConfig {
            poll_interval_ms: Some(5),
            ..config
        };
        assert_eq!(polled.frame_duration(), Duration::from_millis(5));
    }

    #[test]
    fn broadcast_interval_has_a_floor() {
        let config = BroadcastConfig {
            interval_ms: 1,
            ..BroadcastConfig::default()
        };
        assert_eq!(config.interval(), Duration::from_millis(10));
        assert_eq!(BroadcastConfig::default().interval(), Duration::from_millis(100));
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [engine]
            sample_rate = 44100
            fft_size = 1024

            [broadcast]
            port = 9000

            [recording]
            output_path = "out.wav"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.sample_rate, 44_100);
        assert_eq!(config.engine.band_count, 64);
        assert_eq!(config.broadcast.port, 9000);
        assert_eq!(config.broadcast.interval_ms, 100);
        assert_eq!(
            config.recording.unwrap().output_path,
            PathBuf::from("out.wav")
        );
    }
}
