//! Replica Signals
//!
//! Multi-subscriber notification channels used by every replicated node.
//!
//! # Core Concepts
//!
//! - [`Signal<A>`]: shared handle; `fire` invokes subscribers synchronously in
//!   connection order
//! - [`Connection`]: handle returned by [`Signal::connect`], disconnects one
//!   subscriber
//! - [`Signal::wait`]: one-shot future completing on the next fire, or with
//!   `None` once the signal is destroyed
//!
//! # Example
//!
//! ```rust
//! use replica_signal::Signal;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let signal: Signal<bool> = Signal::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&hits);
//! let connection = signal.connect(move |_is_local| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! signal.fire(true);
//! connection.disconnect();
//! signal.fire(false);
//!
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

use futures::channel::oneshot;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct SignalState<A> {
    subscribers: Vec<(u64, Callback<A>)>,
    waiters: Vec<oneshot::Sender<A>>,
    next_id: u64,
    destroyed: bool,
}

impl<A> Default for SignalState<A> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            waiters: Vec::new(),
            next_id: 0,
            destroyed: false,
        }
    }
}

/// Type-erased view used by [`Connection`]
trait Subscriptions: Send + Sync {
    fn unsubscribe(&self, id: u64);
    fn is_subscribed(&self, id: u64) -> bool;
}

impl<A: Send> Subscriptions for Mutex<SignalState<A>> {
    fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|(sub, _)| *sub != id);
    }

    fn is_subscribed(&self, id: u64) -> bool {
        self.lock().subscribers.iter().any(|(sub, _)| *sub == id)
    }
}

/// Multi-subscriber notification channel
///
/// Cloning yields another handle to the same channel. All firing happens on the
/// caller's thread; no subscriber runs while the internal lock is held, so a
/// subscriber may freely connect, disconnect or fire again.
pub struct Signal<A> {
    state: Arc<Mutex<SignalState<A>>>,
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Signal")
            .field("subscribers", &state.subscribers.len())
            .field("waiters", &state.waiters.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

impl<A: Clone + Send + 'static> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Clone + Send + 'static> Signal<A> {
    /// Create a signal with no subscribers
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SignalState::default())),
        }
    }

    /// Subscribe `callback`; it runs on every subsequent [`fire`](Self::fire)
    ///
    /// Connecting to a destroyed signal returns an already-disconnected handle.
    pub fn connect<F>(&self, callback: F) -> Connection
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if !state.destroyed {
            state.subscribers.push((id, Arc::new(callback)));
        }
        drop(state);

        let target: Arc<dyn Subscriptions> = self.state.clone();
        Connection {
            target: Arc::downgrade(&target),
            id,
        }
    }

    /// Invoke every live subscriber in connection order, then complete
    /// pending waits
    pub fn fire(&self, args: A) {
        let (subscribers, waiters) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            let subscribers: Vec<_> = state.subscribers.clone();
            (subscribers, std::mem::take(&mut state.waiters))
        };

        tracing::trace!(
            subscribers = subscribers.len(),
            waiters = waiters.len(),
            "signal fired"
        );

        for (id, callback) in subscribers {
            // A subscriber disconnected by an earlier one in this pass is skipped
            if self.state.is_subscribed(id) {
                callback(&args);
            }
        }

        for waiter in waiters {
            let _ = waiter.send(args.clone());
        }
    }

    /// Future resolving with the arguments of the next fire
    ///
    /// The waiter is registered when this method is called, not when the
    /// future is first polled, so a fire between the two is not missed.
    /// Resolves to `None` if the signal is destroyed first.
    pub fn wait(&self) -> impl Future<Output = Option<A>> + Send + 'static {
        let receiver = {
            let mut state = self.state.lock();
            if state.destroyed {
                None
            } else {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push(sender);
                Some(receiver)
            }
        };

        async move {
            match receiver {
                Some(receiver) => receiver.await.ok(),
                None => None,
            }
        }
    }

    /// Disconnect all subscribers and cancel all pending waits
    ///
    /// Idempotent. Later fires are ignored.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.subscribers.clear();
        state.waiters.clear();
    }

    /// Whether [`destroy`](Self::destroy) has been called
    #[inline]
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Number of connected subscribers
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

/// Subscription handle returned by [`Signal::connect`]
///
/// Dropping the handle does not disconnect; call
/// [`disconnect`](Self::disconnect).
pub struct Connection {
    target: Weak<dyn Subscriptions>,
    id: u64,
}

impl Connection {
    /// Remove this subscriber. Idempotent.
    pub fn disconnect(&self) {
        if let Some(target) = self.target.upgrade() {
            target.unsubscribe(self.id);
        }
    }

    /// Whether the subscriber is still attached to a live signal
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.target
            .upgrade()
            .is_some_and(|target| target.is_subscribed(self.id))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&u32) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &str| -> Box<dyn Fn(&u32) + Send + Sync> {
            let sink = Arc::clone(&sink);
            let name = name.to_string();
            Box::new(move |value: &u32| sink.lock().push(format!("{name}:{value}")))
        };
        (log, make)
    }

    #[test]
    fn fire_runs_subscribers_in_connection_order() {
        let signal = Signal::<u32>::new();
        let (log, make) = recorder();

        let first = make("first");
        let second = make("second");
        signal.connect(move |v| first(v));
        signal.connect(move |v| second(v));

        signal.fire(7);

        assert_eq!(*log.lock(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn disconnect_stops_delivery() {
        let signal = Signal::<u32>::new();
        let (log, make) = recorder();

        let callback = make("a");
        let connection = signal.connect(move |v| callback(v));
        assert!(connection.is_connected());

        connection.disconnect();
        connection.disconnect();
        signal.fire(1);

        assert!(!connection.is_connected());
        assert!(log.lock().is_empty());
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_disconnected_mid_fire_is_skipped() {
        let signal = Signal::<u32>::new();
        let (log, make) = recorder();

        let victim_slot: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&victim_slot);
        signal.connect(move |_| {
            if let Some(conn) = slot.lock().as_ref() {
                conn.disconnect();
            }
        });
        let victim = make("victim");
        *victim_slot.lock() = Some(signal.connect(move |v| victim(v)));

        signal.fire(3);

        assert!(log.lock().is_empty());
    }

    #[test]
    fn subscriber_may_fire_reentrantly() {
        let signal = Signal::<u32>::new();
        let (log, make) = recorder();

        let inner = signal.clone();
        signal.connect(move |v| {
            if *v == 0 {
                inner.fire(1);
            }
        });
        let callback = make("seen");
        signal.connect(move |v| callback(v));

        signal.fire(0);

        assert_eq!(*log.lock(), vec!["seen:1", "seen:0"]);
    }

    #[test]
    fn destroy_disconnects_everything() {
        let signal = Signal::<u32>::new();
        let (log, make) = recorder();
        let callback = make("a");
        let connection = signal.connect(move |v| callback(v));

        signal.destroy();
        signal.destroy();
        signal.fire(9);

        assert!(signal.is_destroyed());
        assert!(!connection.is_connected());
        assert!(log.lock().is_empty());

        let late = signal.connect(|_| panic!("destroyed signal must not deliver"));
        assert!(!late.is_connected());
        signal.fire(10);
    }

    #[tokio::test]
    async fn wait_resolves_on_next_fire() {
        let signal = Signal::<u32>::new();
        let pending = signal.wait();

        signal.fire(42);
        signal.fire(43);

        assert_eq!(pending.await, Some(42));
    }

    #[tokio::test]
    async fn wait_is_cancelled_by_destroy() {
        let signal = Signal::<u32>::new();
        let pending = signal.wait();

        signal.destroy();

        assert_eq!(pending.await, None);
        assert_eq!(signal.wait().await, None);
    }
}
