//! Concurrency-safe reconfiguration boundary.
//!
//! Parameter updates arrive on their own execution path while the main
//! loop is tracking. The gate wraps the engine in a reentrant mutex so
//! an update and a tracking step never interleave: the engine observes
//! either the old or the new snapshot in full. The mutex is reentrant
//! because the main thread re-acquires it during nested validation
//! steps; the engine borrow itself is taken only at the leaf of
//! `with_lock`, and nested code receives the already-borrowed engine
//! reference instead of re-borrowing.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use tracing::{debug, info};

use crate::config::TrackerSettings;
use crate::engine::TrackingEngine;
use crate::transport::Subscriber;

/// Poll period of the background update listener; bounds its shutdown
/// latency.
const LISTENER_POLL: Duration = Duration::from_millis(50);

pub struct ReconfigurationGate<E> {
    engine: Arc<ReentrantMutex<RefCell<E>>>,
    applied_version: Arc<AtomicU64>,
}

impl<E> Clone for ReconfigurationGate<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            applied_version: Arc::clone(&self.applied_version),
        }
    }
}

impl<E: TrackingEngine> ReconfigurationGate<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(ReentrantMutex::new(RefCell::new(engine))),
            applied_version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `f` with exclusive access to the engine. This is the
    /// primitive the main loop wraps around every engine invocation.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        let guard = self.engine.lock();
        let mut engine = guard.borrow_mut();
        f(&mut engine)
    }

    /// Apply a settings snapshot from the reconfiguration path. The
    /// snapshot is sanitized (out-of-range values clamped) and stamped
    /// with the next version before it reaches the engine.
    pub fn apply_update(&self, settings: TrackerSettings) {
        let mut clean = settings.sanitized();
        clean.version = self.applied_version.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = self.engine.lock();
        guard.borrow_mut().apply_settings(&clean);
        info!(version = clean.version, "tracker settings applied");
    }

    /// Version of the last applied snapshot (0 until the first update).
    pub fn applied_version(&self) -> u64 {
        self.applied_version.load(Ordering::SeqCst)
    }

    /// Drain a settings subscription on a background thread, applying
    /// each update through the gate. Exits when the flag is set or the
    /// channel closes.
    pub fn spawn_listener(
        &self,
        updates: Subscriber<TrackerSettings>,
        exiting: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let gate = self.clone();
        std::thread::spawn(move || {
            loop {
                if exiting.load(Ordering::SeqCst) {
                    break;
                }
                match updates.recv_timeout(LISTENER_POLL) {
                    Some(settings) => gate.apply_update(settings),
                    None => {
                        if !updates.is_advertised() && updates.is_empty() {
                            debug!("settings channel closed; listener exiting");
                            break;
                        }
                    }
                }
            }
        })
    }
}
