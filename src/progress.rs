//! Download progress reporting.
//!
//! Downloads move through fetching, reconstructing, verifying and done.
//! Reporters receive [`ProgressEvent`]s for each phase; a [`ProgressTracker`]
//! throttles the high-frequency fetching events so UIs are not flooded.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default minimum spacing between two fetching events.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Fetching,
    Reconstructing,
    Verifying,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Fetching => "fetching",
            Phase::Reconstructing => "reconstructing",
            Phase::Verifying => "verifying",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub chunks_found: u64,
    pub chunks_expected: u64,
    pub bytes: u64,
    pub pages: u64,
}

impl ProgressEvent {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            chunks_found: 0,
            chunks_expected: 0,
            bytes: 0,
            pages: 0,
        }
    }

    /// Completion ratio in `0.0..=1.0`, if the expected total is known.
    pub fn ratio(&self) -> Option<f64> {
        (self.chunks_expected > 0)
            .then(|| (self.chunks_found as f64 / self.chunks_expected as f64).min(1.0))
    }
}

/// Receives progress for one download.
///
/// Called from the download task, so implementations should return quickly.
///
/// # Example
///
/// ```rust,ignore
/// use cartridge_ledger::progress::{ProgressEvent, ProgressReporter};
///
/// struct Printer;
///
/// impl ProgressReporter for Printer {
///     fn on_progress(&self, event: &ProgressEvent) {
///         println!("{} {}/{}", event.phase, event.chunks_found, event.chunks_expected);
///     }
/// }
/// ```
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReporter;

impl ProgressReporter for LoggingReporter {
    fn on_progress(&self, event: &ProgressEvent) {
        match event.phase {
            Phase::Fetching => tracing::debug!(
                "fetching: {}/{} chunks, {} bytes, {} pages",
                event.chunks_found,
                event.chunks_expected,
                event.bytes,
                event.pages
            ),
            phase => tracing::info!("{}: {} bytes", phase, event.bytes),
        }
    }
}

/// Keeps every delivered event. Mostly useful in tests.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn phases(&self) -> Vec<Phase> {
        let mut phases: Vec<Phase> = Vec::new();
        for event in self.events() {
            if phases.last() != Some(&event.phase) {
                phases.push(event.phase);
            }
        }
        phases
    }
}

impl ProgressReporter for CollectingReporter {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Adapts a closure into a reporter.
pub struct FnReporter<F>(pub F);

impl<F> ProgressReporter for FnReporter<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        (self.0)(event)
    }
}

/// Rate limits events, always letting the first one through.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Delivers events to a reporter, throttling repeats within a phase.
///
/// The first event of each phase and every [`ProgressTracker::finish`] event
/// are always delivered.
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    throttle: Throttle,
    last_phase: Option<Phase>,
}

impl ProgressTracker {
    pub fn new(reporter: Arc<dyn ProgressReporter>, interval: Duration) -> Self {
        Self {
            reporter,
            throttle: Throttle::new(interval),
            last_phase: None,
        }
    }

    pub fn report(&mut self, event: ProgressEvent) {
        let phase_changed = self.last_phase != Some(event.phase);
        if phase_changed {
            self.throttle = Throttle::new(self.throttle.interval);
        }
        if self.throttle.ready() || phase_changed {
            self.deliver(event);
        }
    }

    pub fn finish(&mut self, event: ProgressEvent) {
        self.deliver(event);
    }

    fn deliver(&mut self, event: ProgressEvent) {
        self.last_phase = Some(event.phase);
        self.reporter.on_progress(&event);
    }
}
