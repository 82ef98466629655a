//! Watch dispatch.
//!
//! Watch callbacks run on a dedicated thread per client so a slow or
//! panicking callback can never block a committer or poison a commit.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Type-erased watch callback: `(old_bytes, new_bytes)`.
pub(crate) type ErasedWatch = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct WatcherHub {
    // mpsc senders are not Sync; the mutex makes the hub shareable
    tx: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherHub {
    pub fn new() -> Self {
        let (tx, rx) = channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("stm-watcher".to_string())
            .spawn(move || {
                for job in rx {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::warn!("watch callback panicked; callback isolated and dropped");
                    }
                }
            })
            .ok();
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }

    /// Enqueue the current watcher set of one ref or atom against a
    /// committed `(old, new)` pair. Best-effort: delivery failures are
    /// logged, never surfaced.
    pub fn notify(&self, watchers: Vec<ErasedWatch>, old: Vec<u8>, new: Vec<u8>) {
        if watchers.is_empty() {
            return;
        }
        let job: Job = Box::new(move || {
            for w in &watchers {
                w(&old, &new);
            }
        });
        if let Some(tx) = &*self.tx.lock() {
            if tx.send(job).is_err() {
                tracing::warn!("watcher thread gone, notification dropped");
            }
        }
    }
}

impl Drop for WatcherHub {
    fn drop(&mut self) {
        // hang up the channel, then let the worker drain and exit
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// Snapshot a watcher registry for dispatch.
pub(crate) fn snapshot(watchers: &HashMap<String, ErasedWatch>) -> Vec<ErasedWatch> {
    watchers.values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn callbacks_run_off_thread() {
        let hub = WatcherHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let w: ErasedWatch = Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        hub.notify(vec![w], b"a".to_vec(), b"b".to_vec());
        drop(hub); // drains the queue
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_kill_the_hub() {
        let hub = WatcherHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let bad: ErasedWatch = Arc::new(|_, _| panic!("boom"));
        let good: ErasedWatch = {
            let h = hits.clone();
            Arc::new(move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
            })
        };
        hub.notify(vec![bad], Vec::new(), Vec::new());
        std::thread::sleep(Duration::from_millis(20));
        hub.notify(vec![good], Vec::new(), Vec::new());
        drop(hub);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
