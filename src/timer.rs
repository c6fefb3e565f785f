//! Background reconciliation of stored session state against the wall
//! clock. Display freshness only: every rule that decides whether a
//! redemption counts re-checks the deadline itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::db::Store;
use crate::session;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Recurring tick over whichever workspace is currently attached. Starts
/// detached from any store; `workspace.select` attaches one. Dropping the
/// timer stops the thread.
pub struct ExpiryTimer {
    store_slot: Arc<Mutex<Option<Store>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ExpiryTimer {
    pub fn spawn(interval: Duration) -> Self {
        let store_slot: Arc<Mutex<Option<Store>>> = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let slot = Arc::clone(&store_slot);
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || loop {
            thread::sleep(interval);
            if stop_flag.load(Ordering::Relaxed) {
                break;
            }
            let store = slot.lock().ok().and_then(|s| s.clone());
            if let Some(store) = store {
                if let Err(e) = session::tick(&store, chrono::Utc::now()) {
                    warn!(error = %e, "expiry tick failed");
                }
            }
        });

        ExpiryTimer {
            store_slot,
            stop,
            handle: Some(handle),
        }
    }

    /// Point the ticks at a freshly opened workspace, replacing any
    /// previous one.
    pub fn attach(&self, store: Store) {
        if let Ok(mut slot) = self.store_slot.lock() {
            *slot = Some(store);
        }
    }

    /// Release the current store, e.g. before the workspace database file
    /// is swapped out by an import.
    pub fn detach(&self) {
        if let Ok(mut slot) = self.store_slot.lock() {
            *slot = None;
        }
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
