//! Request coalescing
//!
//! Deduplicates concurrent requests for the same identifier. The first
//! waiter registered for an identifier is told to start the work; later
//! waiters queue behind it. When the work finishes, every queued waiter
//! receives the result once, in registration order. Cancelling an
//! identifier (or every identifier started under a group) aborts the
//! in-flight work and drops its waiters without delivering anything.
//!
//! The waiter type `T` is opaque: it can be a channel sender, a boxed
//! callback, or anything else the caller knows how to resolve.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

/// Handle to in-flight work that can be aborted
pub trait Cancellable: Send + 'static {
    fn cancel(&self);
}

impl Cancellable for tokio::task::AbortHandle {
    fn cancel(&self) {
        self.abort();
    }
}

struct InFlight {
    group: Option<String>,
    handle: Box<dyn Cancellable>,
}

struct State<T> {
    waiters: HashMap<String, Vec<T>>,
    in_flight: HashMap<String, InFlight>,
}

/// Waiter lists and in-flight handles keyed by identifier
pub struct Coalescer<T> {
    state: Mutex<State<T>>,
}

impl<T> Coalescer<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                waiters: HashMap::new(),
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Queue `waiter` for `identifier`.
    ///
    /// Returns `true` when this is the first waiter, in which case the caller
    /// must start the work (and register its handle with [`Self::add_handle`]).
    pub fn add(&self, waiter: T, identifier: &str) -> bool {
        let mut state = self.state.lock();
        let waiters = state.waiters.entry(identifier.to_string()).or_default();
        waiters.push(waiter);
        let is_first = waiters.len() == 1;
        trace!(identifier, waiters = waiters.len(), is_first, "Queued waiter");
        is_first
    }

    /// Record the handle of the work started for `identifier`.
    ///
    /// If nobody is waiting any more the request was cancelled before the
    /// handle arrived, so the work is cancelled right away.
    pub fn add_handle<H: Cancellable>(&self, handle: H, group: Option<&str>, identifier: &str) {
        let mut state = self.state.lock();
        if !state.waiters.contains_key(identifier) {
            drop(state);
            debug!(identifier, "No waiters left, cancelling work");
            handle.cancel();
            return;
        }

        state.in_flight.insert(
            identifier.to_string(),
            InFlight {
                group: group.map(str::to_string),
                handle: Box::new(handle),
            },
        );
    }

    /// Abort the work for `identifier` and drop its waiters silently
    pub fn cancel(&self, identifier: &str) {
        let (waiters, in_flight) = {
            let mut state = self.state.lock();
            (
                state.waiters.remove(identifier),
                state.in_flight.remove(identifier),
            )
        };

        if let Some(in_flight) = in_flight {
            in_flight.handle.cancel();
        }
        let dropped = waiters.map(|w| w.len()).unwrap_or(0);
        debug!(identifier, dropped, "Cancelled request");
    }

    /// Abort all work started under `group` and drop its waiters silently
    pub fn cancel_group(&self, group: &str) {
        let cancelled: Vec<(String, InFlight, Option<Vec<T>>)> = {
            let mut state = self.state.lock();
            let identifiers: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, in_flight)| in_flight.group.as_deref() == Some(group))
                .map(|(identifier, _)| identifier.clone())
                .collect();

            identifiers
                .into_iter()
                .filter_map(|identifier| {
                    let in_flight = state.in_flight.remove(&identifier)?;
                    let waiters = state.waiters.remove(&identifier);
                    Some((identifier, in_flight, waiters))
                })
                .collect()
        };

        for (identifier, in_flight, _waiters) in &cancelled {
            in_flight.handle.cancel();
            trace!(group, identifier = %identifier, "Cancelled grouped request");
        }
        debug!(group, cancelled = cancelled.len(), "Cancelled group");
    }

    /// Hand every queued waiter for `identifier` to `deliver`, in the order
    /// they were added, then forget the identifier.
    ///
    /// Waiters are taken out under the lock and delivered outside it, so
    /// `deliver` may call back into the coalescer.
    pub fn complete<F>(&self, group: Option<&str>, identifier: &str, mut deliver: F)
    where
        F: FnMut(T),
    {
        let waiters = {
            let mut state = self.state.lock();
            state.in_flight.remove(identifier);
            state.waiters.remove(identifier).unwrap_or_default()
        };

        trace!(group, identifier, waiters = waiters.len(), "Completing request");
        for waiter in waiters {
            deliver(waiter);
        }
    }

    /// Whether any waiter is queued for `identifier`
    pub fn is_pending(&self, identifier: &str) -> bool {
        self.state.lock().waiters.contains_key(identifier)
    }

    /// Number of identifiers with queued waiters
    pub fn pending_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Coalescer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Coalescer")
            .field("pending", &state.waiters.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Flag(Arc<AtomicBool>);

    impl Flag {
        fn is_set(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Cancellable for Flag {
        fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_only_first_waiter_starts_work() {
        let coalescer = Coalescer::new();
        let firsts: Vec<bool> = (0..5).map(|i| coalescer.add(i, "a||0")).collect();
        assert_eq!(firsts, vec![true, false, false, false, false]);
    }

    #[test]
    fn test_complete_delivers_each_waiter_once_in_order() {
        let coalescer = Coalescer::new();
        for i in 0..4 {
            coalescer.add(i, "a||0");
        }

        let mut delivered = Vec::new();
        coalescer.complete(None, "a||0", |waiter| delivered.push(waiter));
        assert_eq!(delivered, vec![0, 1, 2, 3]);

        // A second completion finds nothing left to deliver
        coalescer.complete(None, "a||0", |waiter| delivered.push(waiter));
        assert_eq!(delivered.len(), 4);
        assert!(!coalescer.is_pending("a||0"));
    }

    #[test]
    fn test_identifier_restarts_after_completion() {
        let coalescer = Coalescer::new();
        assert!(coalescer.add(1, "a||0"));
        coalescer.complete(None, "a||0", |_| {});
        assert!(coalescer.add(2, "a||0"));
    }

    #[test]
    fn test_identifiers_are_independent() {
        let coalescer = Coalescer::new();
        assert!(coalescer.add("x", "a||0"));
        assert!(coalescer.add("y", "a||220"));

        let mut delivered = Vec::new();
        coalescer.complete(None, "a||220", |w| delivered.push(w));
        assert_eq!(delivered, vec!["y"]);
        assert!(coalescer.is_pending("a||0"));
    }

    #[test]
    fn test_cancel_drops_waiters_without_delivery() {
        let coalescer = Coalescer::new();
        let handle = Flag::default();
        coalescer.add(1, "a||0");
        coalescer.add(2, "a||0");
        coalescer.add_handle(handle.clone(), None, "a||0");

        coalescer.cancel("a||0");
        assert!(handle.is_set());

        let mut delivered = Vec::new();
        coalescer.complete(None, "a||0", |w| delivered.push(w));
        assert!(delivered.is_empty());
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[test]
    fn test_cancel_group_only_touches_that_group() {
        let coalescer = Coalescer::new();
        let article_a = Flag::default();
        let article_b = Flag::default();

        coalescer.add(1, "img1||0");
        coalescer.add_handle(article_a.clone(), Some("article-a"), "img1||0");
        coalescer.add(2, "img2||0");
        coalescer.add_handle(article_b.clone(), Some("article-b"), "img2||0");

        coalescer.cancel_group("article-a");

        assert!(article_a.is_set());
        assert!(!article_b.is_set());
        assert!(!coalescer.is_pending("img1||0"));
        assert!(coalescer.is_pending("img2||0"));
    }

    #[test]
    fn test_handle_for_cancelled_request_is_cancelled() {
        let coalescer = Coalescer::new();
        coalescer.add(1, "a||0");
        coalescer.cancel("a||0");

        let late = Flag::default();
        coalescer.add_handle(late.clone(), None, "a||0");
        assert!(late.is_set());
    }

    #[test]
    fn test_complete_may_reenter() {
        let coalescer = Arc::new(Coalescer::new());
        coalescer.add(1, "a||0");

        let inner = Arc::clone(&coalescer);
        coalescer.complete(None, "a||0", |_| {
            assert!(inner.add(2, "a||0"));
        });
        assert!(coalescer.is_pending("a||0"));
    }

    #[tokio::test]
    async fn test_abort_handle_cancels_task() {
        let coalescer: Coalescer<u8> = Coalescer::new();
        coalescer.add(1, "a||0");

        let task = tokio::spawn(std::future::pending::<()>());
        coalescer.add_handle(task.abort_handle(), Some("group"), "a||0");
        coalescer.cancel_group("group");

        let err = task.await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
