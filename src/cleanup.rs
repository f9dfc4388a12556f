//! Age-threshold cleanup of the temp directory.
//!
//! Nobody tells us when a consumer is done with a file, so files are simply
//! deleted once they are older than a fixed threshold. Sweeps are triggered
//! by host signals:
//!
//! - **Device idle**: subscribed lazily when the first file is created, and
//!   unsubscribed again once a sweep leaves the directory empty.
//! - **Memory pressure** at or above the configured level: sweep right away
//!   and drop the idle subscription, since the process may be torn down.
//!
//! Sweeps do blocking I/O, so they run on a worker thread. The decision to
//! unsubscribe is posted back to the signal control thread.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::CleanupConfig;
use crate::error::StashError;
use crate::signal::{Handler, PressureLevel, Signal, SignalKind, SignalSource, SubscriptionId};
use crate::store::temp::TempFileStore;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Files removed.
    pub deleted: usize,
    /// Files younger than the threshold, left in place.
    pub kept_young: usize,
    /// Files old enough to go whose deletion failed.
    pub failed: usize,
    /// Bytes released by the deleted files.
    pub bytes_freed: u64,
}

impl SweepReport {
    /// `true` if every file was eligible and every deletion succeeded.
    pub fn all_deleted(&self) -> bool {
        self.kept_young == 0 && self.failed == 0
    }
}

/// Delete every file in `store` older than `threshold`.
pub fn sweep(store: &TempFileStore, threshold: Duration) -> SweepReport {
    sweep_at(store, threshold, SystemTime::now())
}

/// [`sweep`] with an explicit "now".
pub fn sweep_at(store: &TempFileStore, threshold: Duration, now: SystemTime) -> SweepReport {
    let deletion_threshold = now.checked_sub(threshold).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut report = SweepReport::default();

    for file in store.list_files() {
        let modified = match file.modified() {
            Ok(modified) => modified,
            // Vanished between listing and stat: someone else cleaned it up.
            Err(StashError::NotFound(_)) => continue,
            Err(e) => {
                error!(error = %e, "Cannot stat temp file, leaving it");
                report.failed += 1;
                continue;
            }
        };

        if modified < deletion_threshold {
            let size = file.len().unwrap_or(0);
            match store.remove(&file) {
                Ok(()) => {
                    debug!(file = file.name(), "Deleted temp file");
                    report.deleted += 1;
                    report.bytes_freed += size;
                }
                // A concurrent sweep got there first.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    error!(
                        path = %file.path().display(),
                        error = %e,
                        "Failed to delete temp file"
                    );
                    report.failed += 1;
                }
            }
        } else {
            let left = modified
                .duration_since(deletion_threshold)
                .unwrap_or_default();
            debug!(
                file = file.name(),
                minutes_left = %format!("{:.2}", left.as_secs_f64() / 60.0),
                "Not deleting temp file yet"
            );
            report.kept_young += 1;
        }
    }

    report
}

/// Whether the idle listener is currently installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Idle,
    Pressure,
}

/// Counts sweeps whose outcome has been applied.
#[derive(Default)]
struct SweepLedger {
    completed: Mutex<u64>,
    changed: Condvar,
}

impl SweepLedger {
    fn record(&self) {
        let mut completed = lock(&self.completed);
        *completed += 1;
        self.changed.notify_all();
    }

    fn count(&self) -> u64 {
        *lock(&self.completed)
    }

    fn wait_for(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completed = lock(&self.completed);
        while *completed < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            completed = self
                .changed
                .wait_timeout(completed, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }
}

struct SchedulerInner {
    store: TempFileStore,
    signals: Arc<dyn SignalSource>,
    threshold: Duration,
    pressure_threshold: PressureLevel,
    /// The idle subscription. Inspected and changed only while locked.
    registration: Mutex<Option<SubscriptionId>>,
    pressure_subscription: Mutex<Option<SubscriptionId>>,
    /// Bumped on every file creation.
    epoch: AtomicU64,
    /// Set while an idle-triggered sweep is in flight.
    idle_sweep_running: AtomicBool,
    ledger: SweepLedger,
}

/// Owns the idle-listener registration and runs sweeps.
#[derive(Clone)]
pub struct CleanupScheduler {
    inner: Arc<SchedulerInner>,
}

impl CleanupScheduler {
    /// Create a scheduler and subscribe to memory pressure signals.
    pub fn attach(
        store: TempFileStore,
        signals: Arc<dyn SignalSource>,
        config: &CleanupConfig,
    ) -> Self {
        let inner = Arc::new(SchedulerInner {
            store,
            signals,
            threshold: config.delete_threshold(),
            pressure_threshold: config.pressure_threshold,
            registration: Mutex::new(None),
            pressure_subscription: Mutex::new(None),
            epoch: AtomicU64::new(0),
            idle_sweep_running: AtomicBool::new(false),
            ledger: SweepLedger::default(),
        });

        let weak = Arc::downgrade(&inner);
        let handler: Handler = Arc::new(move |signal: &Signal| {
            if let (Some(inner), Signal::MemoryPressure(level)) = (weak.upgrade(), signal) {
                inner.on_memory_pressure(*level);
            }
        });
        let id = inner
            .signals
            .subscribe(SignalKind::MemoryPressure, handler);
        *lock(&inner.pressure_subscription) = Some(id);

        Self { inner }
    }

    /// Note that a file is about to be created, installing the idle listener
    /// if it is not already there.
    pub fn on_file_created(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let mut registration = lock(&self.inner.registration);
        if registration.is_some() {
            return;
        }
        debug!("Registering temp file cleanup listener");
        let weak = Arc::downgrade(&self.inner);
        let handler: Handler = Arc::new(move |signal: &Signal| {
            if let (Some(inner), Signal::DeviceIdle) = (weak.upgrade(), signal) {
                inner.on_device_idle();
            }
        });
        *registration = Some(
            self.inner
                .signals
                .subscribe(SignalKind::DeviceIdle, handler),
        );
    }

    pub fn state(&self) -> RegistrationState {
        if lock(&self.inner.registration).is_some() {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        }
    }

    /// Run a sweep on the calling thread, without touching the registration.
    pub fn sweep_now(&self) -> SweepReport {
        sweep(&self.inner.store, self.inner.threshold)
    }

    pub fn threshold(&self) -> Duration {
        self.inner.threshold
    }

    /// Number of signal-triggered sweeps whose outcome has been applied.
    pub fn sweeps_completed(&self) -> u64 {
        self.inner.ledger.count()
    }

    /// Wait until at least `count` signal-triggered sweeps have completed.
    /// Returns `false` on timeout.
    pub fn wait_for_sweeps(&self, count: u64, timeout: Duration) -> bool {
        self.inner.ledger.wait_for(count, timeout)
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        for slot in [&self.registration, &self.pressure_subscription] {
            if let Some(id) = lock(slot).take() {
                self.signals.unsubscribe(id);
            }
        }
    }
}

impl SchedulerInner {
    /// Control thread: device went idle.
    fn on_device_idle(self: Arc<Self>) {
        if self.idle_sweep_running.swap(true, Ordering::SeqCst) {
            debug!("Idle sweep already running, skipping");
            return;
        }
        debug!("Cleaning up temp files");
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.spawn_sweep(Trigger::Idle, epoch);
    }

    /// Control thread: memory pressure.
    fn on_memory_pressure(self: Arc<Self>, level: PressureLevel) {
        if level < self.pressure_threshold {
            return;
        }
        info!(%level, "Memory pressure, sweeping temp files");
        let epoch = self.epoch.load(Ordering::SeqCst);
        Arc::clone(&self).spawn_sweep(Trigger::Pressure, epoch);

        if let Some(id) = lock(&self.registration).take() {
            debug!("Unregistering temp file cleanup listener");
            self.signals.unsubscribe(id);
        }
    }

    fn spawn_sweep(self: Arc<Self>, trigger: Trigger, epoch: u64) {
        let worker = Arc::clone(&self);
        let spawned = thread::Builder::new()
            .name("mailstash-sweep".to_string())
            .spawn(move || {
                let report = sweep(&worker.store, worker.threshold);
                info!(
                    ?trigger,
                    deleted = report.deleted,
                    kept = report.kept_young,
                    failed = report.failed,
                    "Temp file sweep finished"
                );
                let apply = Arc::clone(&worker);
                worker
                    .signals
                    .post(Box::new(move || apply.finish_sweep(trigger, epoch, &report)));
            });
        if let Err(e) = spawned {
            // Stay registered; the next idle signal retries.
            error!(error = %e, "Failed to start sweep worker");
            if trigger == Trigger::Idle {
                self.idle_sweep_running.store(false, Ordering::SeqCst);
            }
            self.ledger.record();
        }
    }

    /// Control thread: apply a finished sweep.
    fn finish_sweep(&self, trigger: Trigger, epoch: u64, report: &SweepReport) {
        if trigger == Trigger::Idle {
            self.idle_sweep_running.store(false, Ordering::SeqCst);
        }
        if trigger == Trigger::Idle && report.all_deleted() {
            let mut registration = lock(&self.registration);
            if self.epoch.load(Ordering::SeqCst) != epoch {
                debug!("File created during sweep, keeping cleanup listener");
            } else if let Some(id) = registration.take() {
                debug!("Unregistering temp file cleanup listener");
                self.signals.unsubscribe(id);
            }
        }
        self.ledger.record();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
