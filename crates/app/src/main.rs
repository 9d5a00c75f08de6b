use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand};
use spectrum_stream_core::{AppConfig, AudioEngine, BroadcastServer, EngineConfig};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const BAR_WIDTH: f32 = 40.0;

fn main() -> spectrum_stream_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            settings,
            port,
            interval_ms,
            seconds,
            record,
            bars,
        } => {
            let mut config = settings.load()?;
            if let Some(port) = port {
                config.broadcast.port = port;
            }
            if let Some(interval_ms) = interval_ms {
                config.broadcast.interval_ms = interval_ms;
            }
            if let Some(path) = record {
                config.recording = Some(spectrum_stream_core::RecordingSettings {
                    output_path: path,
                });
            }
            run(&config, seconds, bars)
        }
        Commands::Centers { settings } => print_centers(&settings.load()?.engine),
    }
}

fn run(config: &AppConfig, seconds: u64, bars: bool) -> spectrum_stream_core::Result<()> {
    let engine = AudioEngine::new(config.engine.clone())?;
    if let Some(recording) = &config.recording {
        engine.record_to(&recording.output_path)?;
    }

    let server = BroadcastServer::new(config.broadcast.clone());
    let addr = server.start(engine.payload_provider())?;
    engine.start();

    tracing::info!(%addr, "streaming spectrum, connect with ws://{addr}");
    println!("Log-bin centers (Hz): {}", format_centers(engine.band_centers()));

    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    let mut frame = 0_u64;
    while deadline.map_or(true, |deadline| Instant::now() < deadline) {
        if bars {
            print_bars(frame, &engine.spectrum_snapshot());
        }
        frame += 1;
        thread::sleep(POLL_INTERVAL);
    }

    server.stop();
    engine.stop();
    engine.finish_recording()
}

fn print_centers(config: &EngineConfig) -> spectrum_stream_core::Result<()> {
    let engine = AudioEngine::new(config.clone())?;
    for (band, center) in engine.band_edges().iter().zip(engine.band_centers()) {
        println!("{:>9.1} Hz  [{:>9.1}, {:>9.1})", center, band.lo_hz, band.hi_hz);
    }
    Ok(())
}

fn format_centers(centers: &[f32]) -> String {
    centers
        .iter()
        .map(|center| format!("{center:.1}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_bars(frame: u64, bins: &[f32]) {
    println!("Frame {frame} (0..1 meter per bin)");
    for value in bins {
        let width = (value.clamp(0.0, 1.0) * BAR_WIDTH) as usize;
        println!("{}", "#".repeat(width));
    }
    println!("----");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time log-bin spectrum streamer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the analysis engine and stream the spectrum over WebSocket.
    Run {
        #[command(flatten)]
        settings: EngineArgs,
        /// Port for the broadcast server.
        #[arg(short, long)]
        port: Option<u16>,
        /// Milliseconds between two broadcast frames (minimum 10).
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Stop after this many seconds; 0 runs until interrupted.
        #[arg(long, default_value_t = 0)]
        seconds: u64,
        /// Record the generated signal to a WAV file.
        #[arg(long)]
        record: Option<PathBuf>,
        /// Print the meters as ASCII bars every 200 ms.
        #[arg(long)]
        bars: bool,
    },
    /// Print the band centers and edges for a configuration.
    Centers {
        #[command(flatten)]
        settings: EngineArgs,
    },
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Sample rate in Hz.
    #[arg(long)]
    sample_rate: Option<u32>,
    /// FFT size (power of two).
    #[arg(long)]
    fft_size: Option<usize>,
    /// Number of log-spaced bands.
    #[arg(long)]
    bands: Option<usize>,
    /// Lowest analysed frequency in Hz.
    #[arg(long)]
    min_hz: Option<f32>,
}

impl EngineArgs {
    /// Loads the configuration file (if any) and applies flag overrides.
    fn load(&self) -> spectrum_stream_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };

        let engine = &mut config.engine;
        if let Some(sample_rate) = self.sample_rate {
            engine.sample_rate = sample_rate;
        }
        if let Some(fft_size) = self.fft_size {
            engine.fft_size = fft_size;
        }
        if let Some(bands) = self.bands {
            engine.band_count = bands;
        }
        if let Some(min_hz) = self.min_hz {
            engine.min_hz = min_hz;
        }
        engine.validate()?;
        Ok(config)
    }
}
