//! Host signals: device idling and memory pressure.
//!
//! The cleanup scheduler never talks to a concrete event system. It depends on
//! the [`SignalSource`] capability, which the host implements. [`SignalBus`]
//! is the in-process implementation: one named control thread dispatches
//! signals to subscribers one at a time, in delivery order, and also runs
//! closures posted back to it by worker threads.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Name of the control thread spawned by [`SignalBus`].
pub const CONTROL_THREAD_NAME: &str = "mailstash-signals";

/// Severity carried by a memory pressure signal. Ordered from mildest to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    /// Running normally but the system is getting low.
    Moderate,
    /// The system is low on memory; shed caches.
    Low,
    /// The process is likely to be torn down soon.
    Critical,
}

impl PressureLevel {
    /// Map an Android-style numeric trim level onto a severity.
    pub fn from_trim_level(level: u32) -> Self {
        match level {
            80.. => Self::Critical,
            15.. => Self::Low,
            _ => Self::Moderate,
        }
    }
}

impl FromStr for PressureLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(level) = trimmed.parse::<u32>() {
            return Ok(Self::from_trim_level(level));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "moderate" => Ok(Self::Moderate),
            "low" => Ok(Self::Low),
            "critical" | "complete" => Ok(Self::Critical),
            other => Err(format!("unknown memory pressure level '{other}'")),
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Moderate => "moderate",
            Self::Low => "low",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Discriminator used when subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    DeviceIdle,
    MemoryPressure,
}

/// A signal delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The device has gone inactive (screen off).
    DeviceIdle,
    /// The process should shed non-essential resources.
    MemoryPressure(PressureLevel),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::DeviceIdle => SignalKind::DeviceIdle,
            Self::MemoryPressure(_) => SignalKind::MemoryPressure,
        }
    }
}

/// Handle returned by [`SignalSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Wrap a host-assigned id. Hosts implementing [`SignalSource`] must keep
    /// ids unique among live subscriptions.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Callback invoked on the control thread.
pub type Handler = Arc<dyn Fn(&Signal) + Send + Sync>;

/// Closure posted to run on the control thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Event-subscription capability supplied by the host environment.
pub trait SignalSource: Send + Sync {
    /// Install `handler` for every future signal of `kind`.
    fn subscribe(&self, kind: SignalKind, handler: Handler) -> SubscriptionId;

    /// Remove a subscription. Returns `false` if it was not installed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Run `task` on the control thread, after everything already queued.
    fn post(&self, task: Task);
}

enum Command {
    Deliver(Signal),
    Run(Task),
    Flush(Sender<()>),
}

struct Subscription {
    id: SubscriptionId,
    kind: SignalKind,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Registry {
    fn handlers_for(&self, kind: SignalKind) -> Vec<Handler> {
        let subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }
}

/// In-process [`SignalSource`] backed by a dedicated control thread.
pub struct SignalBus {
    registry: Arc<Registry>,
    commands: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
    control_thread: ThreadId,
}

impl SignalBus {
    /// Spawn the control thread.
    pub fn spawn() -> std::io::Result<Arc<Self>> {
        let registry = Arc::new(Registry::default());
        let (tx, rx) = mpsc::channel();
        let loop_registry = Arc::clone(&registry);
        let thread = thread::Builder::new()
            .name(CONTROL_THREAD_NAME.to_string())
            .spawn(move || control_loop(rx, loop_registry))?;
        let control_thread = thread.thread().id();
        Ok(Arc::new(Self {
            registry,
            commands: Some(tx),
            thread: Some(thread),
            control_thread,
        }))
    }

    /// Queue a signal for dispatch on the control thread.
    pub fn deliver(&self, signal: Signal) {
        debug!(?signal, "Delivering host signal");
        self.send(Command::Deliver(signal));
    }

    /// Block until everything queued before this call has been dispatched.
    ///
    /// Returns immediately when called from the control thread itself.
    pub fn flush(&self) {
        if self.is_control_thread() {
            return;
        }
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(Command::Flush(ack_tx));
        let _ = ack_rx.recv();
    }

    /// `true` when called from the bus's control thread.
    pub fn is_control_thread(&self) -> bool {
        thread::current().id() == self.control_thread
    }

    /// Number of live subscriptions of `kind`.
    pub fn subscriber_count(&self, kind: SignalKind) -> usize {
        self.registry.handlers_for(kind).len()
    }

    fn send(&self, command: Command) {
        let Some(tx) = &self.commands else {
            return;
        };
        if tx.send(command).is_err() {
            warn!("Signal control thread is gone, dropping command");
        }
    }
}

impl SignalSource for SignalBus {
    fn subscribe(&self, kind: SignalKind, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId::new(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self
            .registry
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.push(Subscription { id, kind, handler });
        debug!(?kind, id = id.0, "Subscribed to host signal");
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .registry
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        debug!(id = id.0, removed, "Unsubscribed from host signal");
        removed
    }

    fn post(&self, task: Task) {
        self.send(Command::Run(task));
    }
}

impl Drop for SignalBus {
    fn drop(&mut self) {
        // Closing the channel ends the control loop.
        self.commands.take();
        if let Some(handle) = self.thread.take() {
            if self.is_control_thread() {
                return;
            }
            if handle.join().is_err() {
                warn!("Signal control thread panicked");
            }
        }
    }
}

fn control_loop(commands: Receiver<Command>, registry: Arc<Registry>) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::Deliver(signal) => {
                // Snapshot so handlers can (un)subscribe from inside a callback.
                for handler in registry.handlers_for(signal.kind()) {
                    handler(&signal);
                }
            }
            Command::Run(task) => task(),
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Signal control loop stopped");
}
