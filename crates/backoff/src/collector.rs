//! Periodic polling of upstream streams, each behind its own [`FailureBackoff`].

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use redline_core::{CoreError, CoreResult, Slug};

use crate::breaker::{BackoffConfig, BackoffSnapshot, FailureBackoff};
use crate::dedup::TrackingStats;
use crate::error::UpstreamError;

/// What a successful poll produced.
///
/// `items` counts everything in the response; only `new` items were emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CollectReport {
    pub items: usize,
    pub new: usize,
    pub duplicates: usize,
    pub missing_ids: usize,
}

impl CollectReport {
    /// Report of a source that does not track ids: every item is new.
    pub fn untracked(items: usize) -> Self {
        Self {
            items,
            new: items,
            ..Self::default()
        }
    }
}

/// An upstream endpoint polled by the [`Collector`].
pub trait StreamSource: Send + Sync {
    fn name(&self) -> &Slug;

    /// Fetch once. Must not block longer than its own request timeout.
    fn collect(&self) -> Result<CollectReport, UpstreamError>;

    /// Duplicate-tracking counters, for sources that remember emitted ids.
    fn tracking(&self) -> Option<TrackingStats> {
        None
    }

    /// Forget every remembered id. Returns how many were forgotten.
    fn clear_tracking(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StreamOutcome {
    Collected {
        items: usize,
        new: usize,
        duplicates: usize,
        missing_ids: usize,
    },
    Skipped { resume_at: Option<DateTime<Utc>> },
    Failed { error: String, consecutive_failures: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamCycle {
    pub stream: Slug,
    #[serde(flatten)]
    pub outcome: StreamOutcome,
}

/// Result of one pass over every stream.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub streams: Vec<StreamCycle>,
}

impl CycleSummary {
    fn count(&self, pred: impl Fn(&StreamOutcome) -> bool) -> usize {
        self.streams.iter().filter(|s| pred(&s.outcome)).count()
    }

    pub fn collected(&self) -> usize {
        self.count(|o| matches!(o, StreamOutcome::Collected { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, StreamOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, StreamOutcome::Failed { .. }))
    }

    /// Items emitted during the cycle, across every stream.
    pub fn new_items(&self) -> usize {
        self.streams
            .iter()
            .map(|s| match s.outcome {
                StreamOutcome::Collected { new, .. } => new,
                _ => 0,
            })
            .sum()
    }
}

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Pause between the end of one background cycle and the start of the next
    pub interval: Duration,
    /// Backoff applied to every stream
    pub backoff: BackoffConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            backoff: BackoffConfig::default(),
        }
    }
}

impl CollectorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub interval_secs: u64,
    pub cycles: u64,
    pub streams: Vec<BackoffSnapshot>,
    /// Only streams that track item ids appear here.
    pub duplicate_tracking: Vec<StreamTracking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamTracking {
    pub stream: Slug,
    #[serde(flatten)]
    pub stats: TrackingStats,
}

struct Stream {
    source: Box<dyn StreamSource>,
    backoff: FailureBackoff,
}

/// Polls a fixed set of streams.
///
/// Cycles never overlap: a manual [`collect_once`](Self::collect_once) waits
/// for a background cycle in progress and vice versa.
pub struct Collector {
    config: CollectorConfig,
    streams: Vec<Stream>,
    cycle_lock: Mutex<()>,
    cycles: AtomicU64,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&Slug> = self.streams.iter().map(|s| s.backoff.stream()).collect();
        f.debug_struct("Collector")
            .field("config", &self.config)
            .field("streams", &names)
            .finish_non_exhaustive()
    }
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            streams: Vec::new(),
            cycle_lock: Mutex::new(()),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn add_stream(&mut self, source: impl StreamSource + 'static) -> CoreResult<()> {
        let name = source.name().clone();
        if self.streams.iter().any(|s| s.backoff.stream() == &name) {
            return Err(CoreError::duplicate(name.as_str()));
        }
        self.streams.push(Stream {
            backoff: FailureBackoff::new(name, self.config.backoff),
            source: Box::new(source),
        });
        Ok(())
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Run one cycle now.
    pub fn collect_once(&self) -> CycleSummary {
        let _cycle = self.cycle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let started_at = Utc::now();
        let streams = self.streams.iter().map(collect_stream).collect();
        let summary = CycleSummary { started_at, streams };
        self.cycles.fetch_add(1, Ordering::Relaxed);

        info!(
            collected = summary.collected(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            new_items = summary.new_items(),
            "collection cycle finished"
        );
        summary
    }

    pub fn status(&self) -> CollectorStatus {
        CollectorStatus {
            interval_secs: self.config.interval.as_secs(),
            cycles: self.cycles.load(Ordering::Relaxed),
            streams: self.streams.iter().map(|s| s.backoff.snapshot()).collect(),
            duplicate_tracking: self
                .streams
                .iter()
                .filter_map(|s| {
                    s.source.tracking().map(|stats| StreamTracking {
                        stream: s.backoff.stream().clone(),
                        stats,
                    })
                })
                .collect(),
        }
    }

    /// Forget the ids remembered by every stream. Returns the total forgotten.
    pub fn clear_tracking(&self) -> usize {
        let forgotten: usize = self.streams.iter().map(|s| s.source.clear_tracking()).sum();
        info!(forgotten, "duplicate tracking cleared");
        forgotten
    }

    pub fn reset_failures(&self) {
        for stream in &self.streams {
            stream.backoff.reset();
        }
    }

    /// Reset a single stream. Returns `false` if no stream has that name.
    pub fn reset_stream(&self, name: &str) -> bool {
        match self.streams.iter().find(|s| s.backoff.stream().as_str() == name) {
            Some(stream) => {
                stream.backoff.reset();
                true
            }
            None => false,
        }
    }

    /// Run cycles on a background thread, first one immediately.
    pub fn spawn(self: Arc<Self>) -> io::Result<CollectorHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || collector_loop(&self, &shutdown_rx))?;

        Ok(CollectorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn collect_stream(stream: &Stream) -> StreamCycle {
    let name = stream.backoff.stream().clone();

    if stream.backoff.is_open() {
        let resume_at = stream.backoff.snapshot().paused_until;
        debug!(stream = %name, resume_at = ?resume_at, "stream paused, skipping");
        return StreamCycle {
            stream: name,
            outcome: StreamOutcome::Skipped { resume_at },
        };
    }

    let outcome = match stream.source.collect() {
        Ok(report) => {
            stream.backoff.record_success();
            debug!(
                stream = %name,
                items = report.items,
                new = report.new,
                duplicates = report.duplicates,
                missing_ids = report.missing_ids,
                "stream collected"
            );
            StreamOutcome::Collected {
                items: report.items,
                new: report.new,
                duplicates: report.duplicates,
                missing_ids: report.missing_ids,
            }
        }
        Err(e) => {
            let consecutive_failures = stream.backoff.record_failure();
            error!(stream = %name, error = %e, "collection failed");
            StreamOutcome::Failed {
                error: e.to_string(),
                consecutive_failures,
            }
        }
    };
    StreamCycle {
        stream: name,
        outcome,
    }
}

fn collector_loop(collector: &Collector, shutdown_rx: &mpsc::Receiver<()>) {
    let interval = collector.config.interval;
    info!(
        streams = collector.streams.len(),
        interval_secs = interval.as_secs(),
        "collector started"
    );

    loop {
        collector.collect_once();
        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("collector stopped");
}

/// Handle to a running background collector.
#[derive(Debug)]
pub struct CollectorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl CollectorHandle {
    /// Stop after the current cycle and wait for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!("collector thread panicked");
            }
        }
    }
}
