//! The state shared between the poller and the exporter threads.
//!
//! [`SharedState`] is created once by the binary and passed to every worker
//! by `Arc`. It bundles the metrics snapshot, the cooperative shutdown flag
//! and the scrape listener handle the signal handler uses to unblock the
//! HTTP accept loop.

use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use socket2::Socket;

/// One decoded register value, keyed by its exporter-visible metric name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub name: &'static str,
    pub value: f64,
}

/// A consistent copy of the latest poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Readings in the order they were taken within the cycle.
    pub readings: Vec<Reading>,
    /// Registers read successfully this cycle (synthetic counters excluded).
    pub succeeded: u64,
    /// Registers that failed this cycle and were omitted from `readings`.
    pub failed: u64,
}

/// The latest readings with their per-cycle counters. Single writer (the
/// poller), any number of readers. The mutex is held for the publication
/// swap and for the copy only, so readers always observe a full cycle and
/// never a partially written one.
#[derive(Debug, Default)]
pub struct MetricsStore {
    inner: Mutex<Snapshot>,
}

impl MetricsStore {
    /// Atomically replaces the previous cycle. The old readings are
    /// discarded, nothing is carried over.
    pub fn replace(&self, readings: Vec<Reading>, succeeded: u64, failed: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Snapshot {
            readings,
            succeeded,
            failed,
        };
    }

    /// A consistent copy of the latest cycle.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().unwrap().clone()
    }
}

/// Everything the workers share, with ownership established at startup.
pub struct SharedState {
    pub metrics: MetricsStore,
    keep_running: AtomicBool,
    scrape_listener: Mutex<Option<Socket>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            metrics: MetricsStore::default(),
            keep_running: AtomicBool::new(true),
            scrape_listener: Mutex::new(None),
        }
    }

    /// Whether the workers should keep going. Checked at least once a second
    /// by every worker loop.
    pub fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::Acquire)
    }

    /// Requests cooperative shutdown. Any worker (or the signal handler) may
    /// call this; it also unblocks the scrape server's `accept`.
    pub fn shutdown(&self) {
        self.keep_running.store(false, Ordering::Release);
        if let Some(listener) = self.scrape_listener.lock().unwrap().take() {
            let _ = listener.shutdown(Shutdown::Both);
        }
    }

    /// Hands the scrape listener to the shutdown path. If shutdown was
    /// already requested the listener is shut down on the spot, so the
    /// server's first `accept` returns immediately.
    pub fn register_scrape_listener(&self, listener: Socket) {
        let mut slot = self.scrape_listener.lock().unwrap();
        if self.keep_running() {
            *slot = Some(listener);
        } else {
            let _ = listener.shutdown(Shutdown::Both);
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
