use std::{
    panic::{self, AssertUnwindSafe},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use crate::{
    analysis::FrameAnalyzer,
    bands::{LogBand, LogBinMapper},
    config::EngineConfig,
    generator::{FrameSource, SweepGenerator, ToneControls},
    publish::{render_payload, SpectrumPublisher, SpectrumSnapshot},
    record::WavRecorder,
    server::PayloadProvider,
    Result,
};

/// Callback invoked once per generated frame with
/// `(samples, frames, channels, sample_rate)`. Must not block.
pub type Analyzer = Arc<dyn Fn(&[f32], usize, usize, u32) + Send + Sync>;

/// Handle returned by [`AudioEngine::add_analyzer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalyzerId(u64);

#[derive(Default)]
struct AnalyzerRegistry {
    next_id: u64,
    entries: Vec<(AnalyzerId, Analyzer)>,
}

type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;
type SharedRecorder = Arc<Mutex<Option<WavRecorder>>>;

/// Background analysis pipeline: source -> Hann window -> FFT -> log bands
/// -> published snapshot.
///
/// One worker thread is the sole writer of the snapshot. Every accessor
/// returns a copy, so readers never block the worker beyond a short
/// critical section.
pub struct AudioEngine {
    config: EngineConfig,
    mapper: LogBinMapper,
    publisher: SpectrumPublisher,
    source: SharedSource,
    tone: Option<ToneControls>,
    analyzers: Arc<Mutex<AnalyzerRegistry>>,
    recorder: SharedRecorder,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioEngine {
    /// Creates an engine driven by the reference sweep generator.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let generator = SweepGenerator::new();
        let tone = generator.controls();
        let mut engine = Self::with_source(config, Box::new(generator))?;
        engine.tone = Some(tone);
        Ok(engine)
    }

    /// Creates an engine pulling frames from an arbitrary source, such as a
    /// [`crate::generator::CaptureSource`].
    pub fn with_source(config: EngineConfig, source: Box<dyn FrameSource>) -> Result<Self> {
        config.validate()?;
        let mapper = LogBinMapper::from_config(&config)?;
        let publisher = SpectrumPublisher::new(mapper.band_count());

        Ok(Self {
            config,
            mapper,
            publisher,
            source: Arc::new(Mutex::new(source)),
            tone: None,
            analyzers: Arc::new(Mutex::new(AnalyzerRegistry::default())),
            recorder: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawns the analysis thread. Calling it while running is a no-op.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(stale) = worker.take() {
            if stale.join().is_err() {
                tracing::warn!("previous analysis thread panicked");
            }
        }

        let analyzer = match FrameAnalyzer::with_mapper(self.config.fft_size, self.mapper.clone()) {
            Ok(analyzer) => analyzer,
            Err(err) => {
                tracing::error!(%err, "cannot build frame analyzer");
                self.running.store(false, Ordering::Release);
                return;
            }
        };

        let job = AnalysisLoop {
            config: self.config.clone(),
            running: Arc::clone(&self.running),
            source: Arc::clone(&self.source),
            analyzer,
            publisher: self.publisher.clone(),
            analyzers: Arc::clone(&self.analyzers),
            recorder: Arc::clone(&self.recorder),
        };

        match thread::Builder::new()
            .name("spectrum-analysis".into())
            .spawn(move || job.run())
        {
            Ok(handle) => {
                *worker = Some(handle);
                tracing::info!(
                    sample_rate = self.config.sample_rate,
                    fft_size = self.config.fft_size,
                    bands = self.config.band_count,
                    "audio engine started"
                );
            }
            Err(err) => {
                tracing::error!(%err, "failed to spawn analysis thread");
                self.running.store(false, Ordering::Release);
            }
        }
    }

    /// Stops the analysis thread and waits for it to exit. Safe to call
    /// repeatedly and before [`AudioEngine::start`].
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        let was_running = self.running.swap(false, Ordering::AcqRel);

        // A worker that died on its own has already cleared `running` but
        // still needs to be reaped.
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::warn!("analysis thread panicked");
            }
        }
        if was_running {
            tracing::info!("audio engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Copy of the latest normalised band meters.
    pub fn spectrum_snapshot(&self) -> Vec<f32> {
        self.publisher.current()
    }

    /// Latest meters together with their publish sequence number.
    pub fn spectrum(&self) -> SpectrumSnapshot {
        self.publisher.snapshot()
    }

    pub fn publisher(&self) -> SpectrumPublisher {
        self.publisher.clone()
    }

    /// Geometric center of every band, in Hz.
    pub fn band_centers(&self) -> &[f32] {
        self.mapper.centers()
    }

    /// Edges of every band, in Hz.
    pub fn band_edges(&self) -> &[LogBand] {
        self.mapper.bands()
    }

    /// Tone controls of the reference generator. `None` when the engine runs
    /// on another source.
    pub fn tone_controls(&self) -> Option<&ToneControls> {
        self.tone.as_ref()
    }

    pub fn set_tone_hz(&self, hz: f64) {
        match &self.tone {
            Some(tone) => tone.set_tone_hz(hz),
            None => tracing::debug!(hz, "ignoring tone change for non-synthetic source"),
        }
    }

    pub fn set_amplitude(&self, amplitude: f64) {
        match &self.tone {
            Some(tone) => tone.set_amplitude(amplitude),
            None => {
                tracing::debug!(amplitude, "ignoring amplitude change for non-synthetic source")
            }
        }
    }

    /// Registers a callback that sees every generated frame.
    pub fn add_analyzer<F>(&self, analyzer: F) -> AnalyzerId
    where
        F: Fn(&[f32], usize, usize, u32) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.analyzers);
        let id = AnalyzerId(registry.next_id);
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(analyzer)));
        id
    }

    /// Removes a callback. Returns `false` if the id was unknown.
    pub fn remove_analyzer(&self, id: AnalyzerId) -> bool {
        let mut registry = lock(&self.analyzers);
        let before = registry.entries.len();
        registry.entries.retain(|(entry, _)| *entry != id);
        registry.entries.len() != before
    }

    pub fn clear_analyzers(&self) {
        lock(&self.analyzers).entries.clear();
    }

    /// Starts writing every generated frame to a mono 16-bit WAV file,
    /// replacing (and finalising) any previous recording.
    pub fn record_to(&self, path: &Path) -> Result<()> {
        let recorder = WavRecorder::create(path, self.config.sample_rate)?;
        let previous = lock(&self.recorder).replace(recorder);
        if let Some(mut previous) = previous {
            previous.finalize()?;
        }
        Ok(())
    }

    /// Finalises the current recording, if any.
    pub fn finish_recording(&self) -> Result<()> {
        let current = lock(&self.recorder).take();
        if let Some(mut recorder) = current {
            recorder.finalize()?;
        }
        Ok(())
    }

    /// Provider that renders the current snapshot as the broadcast payload.
    pub fn payload_provider(&self) -> PayloadProvider {
        let centers = self.mapper.shared_centers();
        let publisher = self.publisher.clone();
        Arc::new(move || {
            let bins = publisher.current();
            render_payload(&centers, &bins).unwrap_or_else(|err| {
                tracing::warn!(%err, "failed to render spectrum payload");
                String::new()
            })
        })
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("synthetic", &self.tone.is_some())
            .finish()
    }
}

/// State moved into the analysis thread.
struct AnalysisLoop {
    config: EngineConfig,
    running: Arc<AtomicBool>,
    source: SharedSource,
    analyzer: FrameAnalyzer,
    publisher: SpectrumPublisher,
    analyzers: Arc<Mutex<AnalyzerRegistry>>,
    recorder: SharedRecorder,
}

impl AnalysisLoop {
    fn run(mut self) {
        let _guard = ClearOnExit(Arc::clone(&self.running));
        let tick = self.config.frame_duration();
        let mut frame = vec![0.0_f32; self.config.fft_size];
        let mut next_tick = Instant::now();

        while self.running.load(Ordering::Acquire) {
            next_tick += tick;

            lock(&self.source).fill_frame(&mut frame, self.config.sample_rate);
            self.record(&frame);
            self.notify_analyzers(&frame);

            let meters = self.analyzer.analyze(&frame);
            self.publisher.publish(meters);

            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            } else {
                // Fell behind; resynchronise instead of bursting.
                next_tick = now;
            }
        }
    }

    fn record(&self, frame: &[f32]) {
        let mut slot = lock(&self.recorder);
        let Some(recorder) = slot.as_mut() else {
            return;
        };
        if let Err(err) = recorder.write_frame(frame) {
            tracing::warn!(%err, "recording disabled after write failure");
            *slot = None;
        }
    }

    /// Calls every registered analyzer outside the registry lock. An
    /// analyzer that panics is unregistered; the loop keeps running.
    fn notify_analyzers(&self, frame: &[f32]) {
        let snapshot: Vec<(AnalyzerId, Analyzer)> = lock(&self.analyzers)
            .entries
            .iter()
            .map(|(id, analyzer)| (*id, Arc::clone(analyzer)))
            .collect();

        for (id, analyzer) in snapshot {
            let call = panic::catch_unwind(AssertUnwindSafe(|| {
                analyzer(frame, frame.len(), 1, self.config.sample_rate)
            }));
            if call.is_err() {
                tracing::warn!(?id, "analyzer panicked and was removed");
                lock(&self.analyzers).entries.retain(|(entry, _)| *entry != id);
            }
        }
    }
}

/// Clears the running flag however the analysis loop exits, so a worker
/// that dies on a panic is not reported as running.
struct ClearOnExit(Arc<AtomicBool>);

impl Drop for ClearOnExit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
