//! Replayed location sources.
//!
//! A [`ReplaySource`] plays a recorded track of samples in a loop. Each
//! emitted sample is restamped with the current time so consumers see a
//! live, monotonic stream.

use crate::metrics;
use anyhow::{Context, Result};
use locus_core::{
    Clock, LocationSample, LocationSource, SampleSink, SourceError, StreamParams, SystemClock,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest replay period; a zero interval would never yield to the runtime.
const MIN_REPLAY_PERIOD: Duration = Duration::from_millis(1);

/// Parse a newline-delimited JSON track. Blank lines are skipped.
///
/// # Errors
///
/// Returns an error naming the first line that is not a valid sample.
pub fn parse_track(contents: &str) -> Result<Vec<LocationSample>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let sample: LocationSample = serde_json::from_str(line)
                .with_context(|| format!("Invalid sample on line {}", index + 1))?;
            anyhow::ensure!(sample.is_valid(), "Out of range sample on line {}", index + 1);
            Ok(sample)
        })
        .collect()
}

/// A location source replaying a recorded track.
pub struct ReplaySource {
    track: Arc<[LocationSample]>,
    min_period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplaySource {
    /// Create a source replaying `track`.
    ///
    /// # Errors
    ///
    /// Returns an error if the track is empty.
    pub fn new(track: Vec<LocationSample>, min_period: Duration) -> Result<Self> {
        anyhow::ensure!(!track.is_empty(), "Track has no samples");
        Ok(Self {
            track: track.into(),
            min_period,
            task: Mutex::new(None),
        })
    }

    /// Load a track from a newline-delimited JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or holds no valid track.
    pub fn from_file(path: impl AsRef<Path>, min_period: Duration) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read track file: {}", path.display()))?;
        let track = parse_track(&contents)
            .with_context(|| format!("Failed to parse track file: {}", path.display()))?;
        Self::new(track, min_period)
    }

    /// Whether the replay task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl LocationSource for ReplaySource {
    fn start(&self, params: StreamParams, sink: SampleSink) -> Result<(), SourceError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SourceError::StartFailed(e.to_string()))?;

        let period = Duration::from_millis(params.interval_ms)
            .max(self.min_period)
            .max(MIN_REPLAY_PERIOD);
        let track = Arc::clone(&self.track);
        let provider = sink.provider().to_string();
        let log_name = provider.clone();

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            for recorded in track.iter().cycle() {
                ticker.tick().await;
                let sample = LocationSample {
                    timestamp_ms: SystemClock.now_ms(),
                    ..*recorded
                };
                match sink.push(sample) {
                    Some(report) => metrics::record_dispatch(&provider, &report),
                    None => {
                        debug!(provider = %provider, "Engine gone, replay finished");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            warn!(provider = %log_name, "Replay restarted without stop");
            previous.abort();
        }
        debug!(provider = %log_name, period_ms = period.as_millis() as u64, "Replay started");
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
