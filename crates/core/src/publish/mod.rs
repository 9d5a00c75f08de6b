use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Consistent copy of the published spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSnapshot {
    /// Number of publishes that happened before this copy was taken.
    pub sequence: u64,
    /// Normalised meter value per band, each in `[0, 1]`.
    pub bins: Vec<f32>,
}

/// Latest spectrum shared between the analysis loop (sole writer) and any
/// number of readers.
///
/// The whole sequence is swapped and copied under one lock, so a reader sees
/// either the previous or the new snapshot and never a mix of both.
#[derive(Debug, Clone)]
pub struct SpectrumPublisher {
    shared: Arc<Mutex<SpectrumSnapshot>>,
}

impl SpectrumPublisher {
    /// Creates a publisher holding an all-zero snapshot of `band_count` bins.
    pub fn new(band_count: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SpectrumSnapshot {
                sequence: 0,
                bins: vec![0.0; band_count],
            })),
        }
    }

    /// Replaces the visible snapshot.
    pub fn publish(&self, bins: Vec<f32>) {
        let mut slot = self.lock();
        slot.bins = bins;
        slot.sequence += 1;
    }

    /// Copy of the current bins.
    pub fn current(&self) -> Vec<f32> {
        self.lock().bins.clone()
    }

    /// Copy of the current bins together with their sequence number.
    pub fn snapshot(&self) -> SpectrumSnapshot {
        self.lock().clone()
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    fn lock(&self) -> MutexGuard<'_, SpectrumSnapshot> {
        // The critical sections never panic mid-update, so a poisoned value
        // is still a complete snapshot.
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wire payload pushed to broadcast clients.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpectrumPayload<'a> {
    pub centers: &'a [f32],
    pub bins: &'a [f32],
}

/// Renders `{"centers":[...],"bins":[...]}`.
pub fn render_payload(centers: &[f32], bins: &[f32]) -> Result<String> {
    Ok(serde_json::to_string(&SpectrumPayload { centers, bins })?)
}
