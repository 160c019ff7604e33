use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;

use crate::{Disconnected, UnsubscribeError};

/// A broadcast source of values of type `T` that can be shared between
/// threads.
///
/// Behaves like [`Observable`](crate::Observable), but its callbacks must be
/// `Send + Sync` so that the observable and its subscriptions can be moved to
/// and used from other threads.
///
/// Delivery happens synchronously on the thread calling `next()`. Concurrent
/// `next()` calls from different threads are not ordered with respect to each
/// other. Callers needing a global emission order must serialize their calls
/// to `next()` themselves.
///
/// ## Cloning behavior
///
/// Cloning an observable produces another handle to the same subscriber set.
/// Emitting through either handle reaches every subscriber.
pub struct SharedObservable<T> {
    data: Arc<Data<T>>,
}

impl<T> Clone for SharedObservable<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T> Default for SharedObservable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SharedObservable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedObservable")
            .field("subscribers", &self.subscribers())
            .finish()
    }
}

impl<T> SharedObservable<T> {
    /// Returns a new instance with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(Data {
                subscriptions: Mutex::new(Arc::new(Vec::new())),
            }),
        }
    }

    /// Delivers `value` to every subscribed callback, in the order the
    /// callbacks were subscribed.
    ///
    /// The set of callbacks invoked is fixed when this call begins, with the
    /// same semantics as [`Observable::next()`](crate::Observable::next). No
    /// lock is held while callbacks run.
    ///
    /// With no subscribers, this acquires the subscriber lock once to see
    /// that the list is empty and does nothing else.
    ///
    /// # Panics
    ///
    /// A panic raised by a callback is not caught. It propagates out of this
    /// function and the remaining callbacks do not receive `value`. The
    /// observable is not poisoned and can be used again afterwards.
    pub fn next(&self, value: T) {
        let snapshot = match self.data.snapshot() {
            Some(snapshot) => snapshot,
            None => return,
        };
        tracing::trace!(subscribers = snapshot.len(), "delivering value");
        for registration in snapshot.iter() {
            (registration.callback)(&value);
        }
    }

    /// Registers `callback` to receive every value emitted after this call
    /// returns. The returned [`SharedSubscription`] can be used to stop
    /// receiving values.
    ///
    /// Dropping the returned [`SharedSubscription`] does not unsubscribe the
    /// callback.
    pub fn subscribe<F>(&self, callback: F) -> SharedSubscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let registration = Arc::new(Registration {
            callback: Box::new(callback),
            valid: AtomicBool::new(true),
        });
        let mut subscriptions = self.data.subscriptions.lock();
        Arc::make_mut(&mut *subscriptions).push(registration.clone());
        tracing::debug!(subscribers = subscriptions.len(), "subscription added");
        SharedSubscription {
            registration,
            owner: Arc::downgrade(&self.data),
        }
    }

    /// Stops delivering values to `subscription` and marks it invalid.
    ///
    /// If `subscription` was already unsubscribed, or was created by a
    /// different observable, this function does nothing.
    pub fn unsubscribe(&self, subscription: &SharedSubscription<T>) {
        self.data.remove(&subscription.registration);
    }

    /// Unsubscribes every current subscription, marking each of them
    /// invalid.
    pub fn unsubscribe_all(&self) {
        let mut subscriptions = self.data.subscriptions.lock();
        let removed = std::mem::take(Arc::make_mut(&mut *subscriptions));
        for registration in &removed {
            registration.valid.store(false, Ordering::Release);
        }
        tracing::debug!(removed = removed.len(), "all subscriptions removed");
    }

    /// Returns the number of active subscriptions.
    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.data.subscriptions.lock().len()
    }

    /// Returns true if there are any active subscriptions.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscribers() > 0
    }
}

/// The validity flag is only cleared while the owning subscriber list is
/// locked.
struct Registration<T> {
    callback: Box<dyn Fn(&T) + Send + Sync>,
    valid: AtomicBool,
}

type Registrations<T> = Vec<Arc<Registration<T>>>;

/// Copy-on-write subscriber list. Emissions clone the outer `Arc` as their
/// snapshot; mutations copy the list only while a snapshot is alive.
struct Data<T> {
    subscriptions: Mutex<Arc<Registrations<T>>>,
}

impl<T> Data<T> {
    fn snapshot(&self) -> Option<Arc<Registrations<T>>> {
        let subscriptions = self.subscriptions.lock();
        if subscriptions.is_empty() {
            None
        } else {
            Some(subscriptions.clone())
        }
    }

    /// Removes `registration` and clears its validity flag while the list is
    /// locked, so that list membership and the flag never disagree. Returns
    /// false if `registration` was not present.
    fn remove(&self, registration: &Arc<Registration<T>>) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let index = match subscriptions
            .iter()
            .position(|existing| Arc::ptr_eq(existing, registration))
        {
            Some(index) => index,
            None => return false,
        };

        Arc::make_mut(&mut *subscriptions).remove(index);
        registration.valid.store(false, Ordering::Release);
        tracing::debug!(subscribers = subscriptions.len(), "subscription removed");
        true
    }
}

/// A handle to a callback registered with [`SharedObservable::subscribe()`].
///
/// Behaves like [`Subscription`](crate::Subscription), and can be sent to or
/// shared with other threads.
///
/// ## Cloning behavior
///
/// Clones refer to the same registration. Unsubscribing through any clone
/// invalidates all of them.
#[must_use = "dropping a SharedSubscription leaves its callback subscribed with no handle to remove it"]
pub struct SharedSubscription<T> {
    registration: Arc<Registration<T>>,
    owner: Weak<Data<T>>,
}

impl<T> Clone for SharedSubscription<T> {
    fn clone(&self) -> Self {
        Self {
            registration: self.registration.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl<T> fmt::Debug for SharedSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSubscription")
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl<T> SharedSubscription<T> {
    /// Stops the callback from receiving any further values and marks this
    /// subscription invalid.
    ///
    /// Calling this more than once has no additional effect.
    pub fn unsubscribe(&self) {
        let _ = self.try_unsubscribe();
    }

    /// Stops the callback from receiving any further values and marks this
    /// subscription invalid, reporting why nothing was done if the
    /// subscription was not active.
    ///
    /// # Errors
    ///
    /// - [`UnsubscribeError::AlreadyUnsubscribed`]: this subscription was
    ///   already unsubscribed.
    /// - [`UnsubscribeError::Disconnected`]: the [`SharedObservable`] has
    ///   been dropped. The subscription is invalid after this call.
    pub fn try_unsubscribe(&self) -> Result<(), UnsubscribeError> {
        if !self.is_valid() {
            return Err(UnsubscribeError::AlreadyUnsubscribed);
        }

        let data = match self.owner.upgrade() {
            Some(data) => data,
            None => {
                self.registration.valid.store(false, Ordering::Release);
                return Err(UnsubscribeError::Disconnected);
            }
        };

        // Another clone of this handle may have won the race since the check
        // above.
        if data.remove(&self.registration) {
            Ok(())
        } else {
            Err(UnsubscribeError::AlreadyUnsubscribed)
        }
    }

    /// Returns true until this subscription has been unsubscribed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.registration.valid.load(Ordering::Acquire)
    }

    /// Returns true if this subscription is valid and was created by
    /// `observable` or one of its clones.
    #[must_use]
    pub fn is_subscribed_to(&self, observable: &SharedObservable<T>) -> bool {
        self.is_valid() && std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(&observable.data))
    }

    /// Returns a handle to the [`SharedObservable`] this subscription was
    /// created by.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if every handle to the observable has been
    /// dropped.
    pub fn observable(&self) -> Result<SharedObservable<T>, Disconnected> {
        self.owner
            .upgrade()
            .map(|data| SharedObservable { data })
            .ok_or(Disconnected)
    }
}

#[cfg(test)]
use std::sync::atomic::AtomicUsize;

#[test]
fn empty_next_is_a_no_op() {
    let observable = SharedObservable::<u32>::new();
    assert!(observable.data.snapshot().is_none());
    observable.next(1);

    let subscription = observable.subscribe(|_| {});
    assert!(observable.data.snapshot().is_some());
    observable.unsubscribe(&subscription);
    assert!(observable.data.snapshot().is_none());
    assert!(!observable.has_subscribers());
}

#[test]
fn delivery_and_unsubscribe() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let observable = SharedObservable::new();
    let values = log.clone();
    let first = observable.subscribe(move |value: &u32| values.lock().push(*value));
    let squares = log.clone();
    let second =
        observable.subscribe(move |value: &u32| squares.lock().push(value * value));

    observable.next(10);
    observable.unsubscribe(&second);
    observable.next(20);

    assert_eq!(&*log.lock(), &[10, 100, 20]);
    assert!(first.is_valid());
    assert!(!second.is_valid());
    assert_eq!(
        second.try_unsubscribe(),
        Err(UnsubscribeError::AlreadyUnsubscribed)
    );
}

#[test]
fn reentrant_unsubscribe_of_later_subscription() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let observable = SharedObservable::new();
    let later: Arc<Mutex<Option<SharedSubscription<u32>>>> = Arc::default();
    let target = later.clone();
    let first_log = log.clone();
    let _first = observable.subscribe(move |value: &u32| {
        first_log.lock().push(("first", *value));
        if let Some(subscription) = target.lock().as_ref() {
            subscription.unsubscribe();
        }
    });
    let second_log = log.clone();
    let second =
        observable.subscribe(move |value: &u32| second_log.lock().push(("second", *value)));
    *later.lock() = Some(second.clone());

    observable.next(1);
    assert!(!second.is_valid());
    observable.next(2);

    assert_eq!(&*log.lock(), &[("first", 1), ("second", 1), ("first", 2)]);
}

#[test]
fn outlives_observable() {
    let observable = SharedObservable::<u32>::new();
    let subscription = observable.subscribe(|_| {});
    assert!(subscription.is_subscribed_to(&observable));

    drop(observable);
    assert_eq!(subscription.observable().unwrap_err(), Disconnected);
    assert_eq!(
        subscription.try_unsubscribe(),
        Err(UnsubscribeError::Disconnected)
    );
    assert!(!subscription.is_valid());
}

#[test]
fn debug_output() {
    let observable = SharedObservable::<u32>::default();
    let subscription = observable.subscribe(|_| {});
    assert_eq!(
        format!("{observable:?}"),
        "SharedObservable { subscribers: 1 }"
    );
    observable.unsubscribe_all();
    assert_eq!(
        format!("{subscription:?}"),
        "SharedSubscription { valid: false }"
    );
}

#[test]
fn multi_threaded_delivery() {
    let observable = SharedObservable::new();
    let total = Arc::new(AtomicUsize::new(0));
    let counter = total.clone();
    let subscription = observable.subscribe(move |value: &usize| {
        counter.fetch_add(*value, Ordering::Relaxed);
    });

    let mut workers = Vec::new();
    for _ in 1..=8 {
        let observable = observable.clone();
        workers.push(std::thread::spawn(move || {
            for _ in 0..1000 {
                observable.next(1);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(total.load(Ordering::Relaxed), 8000);

    let unsubscriber = std::thread::spawn(move || subscription.unsubscribe());
    unsubscriber.join().unwrap();
    observable.next(1);
    assert_eq!(total.load(Ordering::Relaxed), 8000);
}
