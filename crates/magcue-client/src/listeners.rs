//! Callback registry with isolated invocation and hard unsubscribe.
//!
//! Each entry has an `active` flag and a `running` lock held for the whole
//! callback.  [`Unsubscribe`] clears the flag, then waits on `running` so a
//! call already in flight on another thread finishes first.  A thread that is
//! itself inside a listener callback never waits: that is what lets a
//! callback unsubscribe itself, and lets two callbacks on different threads
//! unsubscribe each other.

use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::error;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

thread_local! {
    /// Listener callbacks currently on this thread's stack.
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

fn in_callback() -> bool {
    CALLBACK_DEPTH.with(|depth| depth.get() > 0)
}

struct EntryState {
    active: AtomicBool,
    running: Mutex<()>,
}

struct Entry<T> {
    id: u64,
    state: Arc<EntryState>,
    callback: Callback<T>,
}

pub(crate) struct Listeners<T> {
    kind: &'static str,
    next_id: AtomicU64,
    entries: Arc<Mutex<Vec<Entry<T>>>>,
}

impl<T> Listeners<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next_id: AtomicU64::new(0),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn add<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(EntryState {
            active: AtomicBool::new(true),
            running: Mutex::new(()),
        });
        self.entries.lock().push(Entry {
            id,
            state: Arc::clone(&state),
            callback: Arc::new(callback),
        });

        let entries = Arc::downgrade(&self.entries);
        Unsubscribe(Box::new(move || {
            state.active.store(false, Ordering::SeqCst);
            if !in_callback() {
                drop(state.running.lock());
            }
            if let Some(entries) = entries.upgrade() {
                entries.lock().retain(|entry| entry.id != id);
            }
        }))
    }

    /// Invoke every live callback with `value`.  A panicking callback is
    /// logged and skipped.
    pub(crate) fn notify(&self, value: T) {
        // Snapshot so callbacks can (un)subscribe without deadlocking.
        let snapshot: Vec<(Arc<EntryState>, Callback<T>)> = self
            .entries
            .lock()
            .iter()
            .map(|entry| (Arc::clone(&entry.state), Arc::clone(&entry.callback)))
            .collect();

        for (state, callback) in snapshot {
            let _running = state.running.lock();
            if !state.active.load(Ordering::SeqCst) {
                continue;
            }
            let value = value.clone();
            CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
            let outcome = catch_unwind(AssertUnwindSafe(|| (*callback)(value)));
            CALLBACK_DEPTH.with(|depth| depth.set(depth.get() - 1));
            if outcome.is_err() {
                error!(kind = self.kind, "listener panicked; continuing with the rest");
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Removes exactly one listener.
///
/// Dropping the token without calling [`Unsubscribe::unsubscribe`] leaves
/// the listener registered.
#[must_use = "dropping an Unsubscribe keeps the listener registered"]
pub struct Unsubscribe(Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    /// Deregister the listener.  It will not be entered again.
    ///
    /// Called outside any listener callback, this also waits for an
    /// invocation in progress on another thread to return.  Called from
    /// inside a callback it returns without waiting.
    pub fn unsubscribe(self) {
        (self.0)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsubscribe")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(u32) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        (hits, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn notifies_every_listener() {
        let listeners = Listeners::new("test");
        let (a, cb_a) = counter();
        let (b, cb_b) = counter();
        let _ua = listeners.add(cb_a);
        let _ub = listeners.add(cb_b);

        listeners.notify(1);
        listeners.notify(2);
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let listeners = Listeners::new("test");
        let (a, cb_a) = counter();
        let (b, cb_b) = counter();
        let ua = listeners.add(cb_a);
        let _ub = listeners.add(cb_b);

        ua.unsubscribe();
        listeners.notify(1);
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let listeners = Listeners::new("test");
        let _bad = listeners.add(|_: u32| panic!("listener bug"));
        let (good, cb) = counter();
        let _ok = listeners.add(cb);

        listeners.notify(7);
        listeners.notify(8);
        assert_eq!(good.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listener_may_unsubscribe_itself() {
        let listeners = Listeners::new("test");
        let token: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicUsize::new(0));

        let slot = Arc::clone(&token);
        let seen = Arc::clone(&hits);
        let unsubscribe = listeners.add(move |_: u32| {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = slot.lock().take() {
                token.unsubscribe();
            }
        });
        *token.lock() = Some(unsubscribe);

        listeners.notify(1);
        listeners.notify(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn callbacks_on_two_threads_may_unsubscribe_each_other() {
        use std::sync::Barrier;
        use std::sync::mpsc;
        use std::time::Duration;

        let left: Arc<Listeners<u32>> = Arc::new(Listeners::new("left"));
        let right: Arc<Listeners<u32>> = Arc::new(Listeners::new("right"));
        let left_token: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));
        let right_token: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));
        let both_running = Arc::new(Barrier::new(2));

        let (barrier, other) = (Arc::clone(&both_running), Arc::clone(&right_token));
        *left_token.lock() = Some(left.add(move |_| {
            barrier.wait();
            if let Some(token) = other.lock().take() {
                token.unsubscribe();
            }
        }));
        let (barrier, other) = (Arc::clone(&both_running), Arc::clone(&left_token));
        *right_token.lock() = Some(right.add(move |_| {
            barrier.wait();
            if let Some(token) = other.lock().take() {
                token.unsubscribe();
            }
        }));

        let (done_tx, done_rx) = mpsc::channel();
        for listeners in [Arc::clone(&left), Arc::clone(&right)] {
            let done = done_tx.clone();
            std::thread::spawn(move || {
                listeners.notify(1);
                let _ = done.send(());
            });
        }
        for _ in 0..2 {
            done_rx
                .recv_timeout(Duration::from_secs(2))
                .expect("cross-unsubscribing callbacks deadlocked");
        }
        assert_eq!(left.len(), 0);
        assert_eq!(right.len(), 0);
    }

    #[test]
    fn unsubscribe_waits_for_a_running_callback() {
        use std::sync::mpsc;
        use std::time::Duration;

        let listeners: Arc<Listeners<u32>> = Arc::new(Listeners::new("test"));
        let (entered_tx, entered_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&finished);
        let token = listeners.add(move |_| {
            let _ = entered_tx.send(());
            std::thread::sleep(Duration::from_millis(100));
            done.store(true, Ordering::SeqCst);
        });

        let notifier = Arc::clone(&listeners);
        let worker = std::thread::spawn(move || notifier.notify(1));
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        token.unsubscribe();
        assert!(finished.load(Ordering::SeqCst));
        worker.join().unwrap();
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_harmless() {
        let listeners = Listeners::new("test");
        let (_hits, cb) = counter();
        let token = listeners.add(cb);
        drop(listeners);
        token.unsubscribe();
    }
}
