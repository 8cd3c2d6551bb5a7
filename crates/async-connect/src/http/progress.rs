//! Upload progress correlation.
//!
//! The transport assigns every upload a [`TaskId`] and reports body-sent
//! notifications against it. [`ProgressTracker`] maps those identifiers to the
//! callbacks supplied by callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Caller-supplied progress callback, invoked with a completion fraction in `0.0..=1.0`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Transport-assigned identifier of an upload task.
///
/// Unique among in-flight uploads of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A registered callback.
///
/// `retired` is checked before every invocation without holding any tracker
/// lock, so once [`ProgressTracker::remove`] returns no new invocation of this
/// entry starts.
struct Registration {
    callback: ProgressCallback,
    retired: AtomicBool,
}

impl Registration {
    fn new(callback: ProgressCallback) -> Self {
        Self {
            callback,
            retired: AtomicBool::new(false),
        }
    }

    fn invoke(&self, fraction: f64) {
        if !self.retired.load(Ordering::SeqCst) {
            (self.callback)(fraction);
        }
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }
}

/// Concurrency-safe registry of upload progress callbacks.
///
/// No tracker lock is held while a callback runs, so callbacks may lock
/// caller state or call back into the tracker. Callbacks for different tasks
/// run independently.
#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<HashMap<TaskId, Arc<Registration>>>,
}

impl ProgressTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback` for `task_id`, replacing any previous one.
    ///
    /// Does nothing when `task_id` is `None`.
    pub fn register(&self, task_id: Option<TaskId>, callback: ProgressCallback) {
        let Some(task_id) = task_id else {
            return;
        };
        tracing::trace!(target: "async_connect::progress", task = task_id.0, "Registered progress callback");
        let mut entries = self.entries.lock();
        if let Some(previous) = entries.insert(task_id, Arc::new(Registration::new(callback))) {
            previous.retire();
        }
    }

    /// Get the callback registered for `task_id`.
    pub fn get(&self, task_id: TaskId) -> Option<ProgressCallback> {
        self.entries
            .lock()
            .get(&task_id)
            .map(|entry| entry.callback.clone())
    }

    /// Remove the callback for `task_id`. Does nothing if none is registered.
    ///
    /// After this returns no new invocation of the removed callback starts.
    /// One already running on another thread is left to finish.
    pub fn remove(&self, task_id: Option<TaskId>) {
        let Some(task_id) = task_id else {
            return;
        };
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&task_id) {
            entry.retire();
            entries.remove(&task_id);
            tracing::trace!(target: "async_connect::progress", task = task_id.0, "Removed progress callback");
        }
    }

    /// Invoke the callback for `task_id` with `fraction`, if one is registered.
    pub fn update_progress(&self, task_id: TaskId, fraction: f64) {
        let entry = self.entries.lock().get(&task_id).cloned();
        if let Some(entry) = entry {
            entry.invoke(fraction);
        }
    }

    /// Check if a callback is registered for `task_id`.
    pub fn contains(&self, task_id: TaskId) -> bool {
        self.entries.lock().contains_key(&task_id)
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("registered", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::<f64>::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |fraction: f64| sink.lock().push(fraction));
        (callback, seen)
    }

    #[test]
    fn test_update_invokes_once() {
        let tracker = ProgressTracker::new();
        let (callback, seen) = recorder();

        tracker.register(Some(TaskId::from(5)), callback);
        tracker.update_progress(TaskId::from(5), 0.5);

        assert_eq!(*seen.lock(), vec![0.5]);
    }

    #[test]
    fn test_no_callback_after_remove() {
        let tracker = ProgressTracker::new();
        let (callback, seen) = recorder();

        tracker.register(Some(TaskId::from(5)), callback);
        tracker.remove(Some(TaskId::from(5)));
        tracker.update_progress(TaskId::from(5), 0.9);

        assert!(seen.lock().is_empty());
        assert!(tracker.get(TaskId::from(5)).is_none());
    }

    #[test]
    fn test_register_without_id_is_noop() {
        let tracker = ProgressTracker::new();
        let (callback, _) = recorder();
        tracker.register(None, callback);
        assert!(tracker.is_empty());

        // Removing something absent is fine too
        tracker.remove(None);
        tracker.remove(Some(TaskId::from(99)));
    }

    #[test]
    fn test_register_overwrites() {
        let tracker = ProgressTracker::new();
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();

        tracker.register(Some(TaskId::from(1)), first);
        tracker.register(Some(TaskId::from(1)), second);
        tracker.update_progress(TaskId::from(1), 0.25);

        assert!(first_seen.lock().is_empty());
        assert_eq!(*second_seen.lock(), vec![0.25]);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_callback_may_reenter_tracker() {
        let tracker = Arc::new(ProgressTracker::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = tracker.clone();
        let counter = calls.clone();
        let callback: ProgressCallback = Arc::new(move |fraction| {
            counter.fetch_add(1, Ordering::SeqCst);
            if fraction >= 1.0 {
                inner.remove(Some(TaskId::from(7)));
            }
        });

        tracker.register(Some(TaskId::from(7)), callback);
        tracker.update_progress(TaskId::from(7), 1.0);
        tracker.update_progress(TaskId::from(7), 1.0);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!tracker.contains(TaskId::from(7)));
    }

    #[test]
    fn test_remove_while_callback_waits_on_caller_lock() {
        use std::sync::mpsc;
        use std::time::Duration;

        let tracker = Arc::new(ProgressTracker::new());
        let state = Arc::new(Mutex::new(0u32));
        let (entered_tx, entered_rx) = mpsc::channel();

        let callback_state = state.clone();
        let callback: ProgressCallback = Arc::new(move |_: f64| {
            let _ = entered_tx.send(());
            std::thread::sleep(Duration::from_millis(100));
            *callback_state.lock() += 1;
        });
        tracker.register(Some(TaskId::from(5)), callback);

        let reporter = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.update_progress(TaskId::from(5), 0.5))
        };
        entered_rx.recv().unwrap();

        // The callback is now running and will block on `state`
        let (done_tx, done_rx) = mpsc::channel();
        let remover = {
            let tracker = tracker.clone();
            let state = state.clone();
            std::thread::spawn(move || {
                let _held = state.lock();
                tracker.remove(Some(TaskId::from(5)));
                let _ = done_tx.send(());
            })
        };

        assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
        remover.join().unwrap();
        reporter.join().unwrap();
        assert_eq!(*state.lock(), 1);

        tracker.update_progress(TaskId::from(5), 0.9);
        assert_eq!(*state.lock(), 1);
    }

    #[test]
    fn test_concurrent_tasks() {
        let tracker = Arc::new(ProgressTracker::new());
        let mut handles = Vec::new();

        for task in 0..8u64 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                let (callback, seen) = recorder();
                let id = TaskId::from(1000 + task);
                tracker.register(Some(id), callback);
                for step in 1..=100 {
                    tracker.update_progress(id, step as f64 / 100.0);
                }
                tracker.remove(Some(id));
                tracker.update_progress(id, 1.0);
                let seen = seen.lock();
                assert_eq!(seen.len(), 100);
                assert!(seen.windows(2).all(|w| w[0] <= w[1]));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_task_ids_are_distinct() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
    }
}
