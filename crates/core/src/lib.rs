//! Core library for the spectrum streaming service.
//!
//! A background thread synthesises (or receives captured) audio, windows it,
//! runs a radix-2 FFT and folds the magnitudes into logarithmically spaced
//! bands. The latest band meters are published behind a lock and streamed to
//! any number of WebSocket viewers by [`BroadcastServer`].

pub mod analysis;
pub mod audio;
pub mod bands;
pub mod config;
pub mod error;
pub mod generator;
pub mod publish;
pub mod record;
pub mod server;

pub use analysis::{magnitude_spectrum, magnitude_to_meter, FrameAnalyzer};
pub use audio::{Analyzer, AnalyzerId, AudioEngine};
pub use bands::{LogBand, LogBinMapper};
pub use config::{AppConfig, BroadcastConfig, EngineConfig, RecordingSettings};
pub use error::{Result, SpectrumError};
pub use generator::{CaptureFeed, CaptureSource, FrameSource, SweepGenerator, ToneControls};
pub use publish::{render_payload, SpectrumPublisher, SpectrumSnapshot};
pub use record::WavRecorder;
pub use server::{BroadcastServer, ConnectionState, PayloadProvider};
