use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use crate::{Disconnected, UnsubscribeError};

/// A broadcast source of values of type `T`.
///
/// Every value passed to [`Observable::next()`] is delivered to each
/// callback registered through [`Observable::subscribe()`], in the order the
/// callbacks were subscribed. Values emitted before a callback subscribed
/// are never replayed to it.
///
/// This type is meant to be used from a single thread and places no bounds
/// on its callbacks. Use [`SharedObservable`](crate::SharedObservable) when
/// the observable needs to be shared between threads.
///
/// ## Cloning behavior
///
/// Cloning an observable produces another handle to the same subscriber set.
/// Emitting through either handle reaches every subscriber.
pub struct Observable<T> {
    data: Rc<Data<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("subscribers", &self.subscribers())
            .finish()
    }
}

impl<T> Observable<T> {
    /// Returns a new instance with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Rc::new(Data {
                subscriptions: RefCell::new(Rc::new(Vec::new())),
            }),
        }
    }

    /// Delivers `value` to every subscribed callback, in the order the
    /// callbacks were subscribed.
    ///
    /// The set of callbacks invoked is fixed when this call begins.
    /// Subscriptions added or removed by a callback while the value is being
    /// delivered only take effect for subsequent calls. A subscription that
    /// is removed mid-delivery still receives the value currently being
    /// delivered if its turn hadn't come yet.
    ///
    /// With no subscribers, this only checks that the list is empty.
    ///
    /// # Panics
    ///
    /// A panic raised by a callback is not caught. It propagates out of this
    /// function and the remaining callbacks do not receive `value`. The
    /// observable can be used again afterwards.
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
    /// returns. The returned [`Subscription`] can be used to stop receiving
    /// values.
    ///
    /// Dropping the returned [`Subscription`] does not unsubscribe the
    /// callback.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: Fn(&T) + 'static,
    {
        let registration = Rc::new(Registration {
            callback: Box::new(callback),
            valid: Cell::new(true),
        });
        let mut subscriptions = self.data.subscriptions.borrow_mut();
        Rc::make_mut(&mut *subscriptions).push(registration.clone());
        tracing::debug!(subscribers = subscriptions.len(), "subscription added");
        Subscription {
            registration,
            owner: Rc::downgrade(&self.data),
        }
    }

    /// Stops delivering values to `subscription` and marks it invalid.
    ///
    /// If `subscription` was already unsubscribed, or was created by a
    /// different observable, this function does nothing.
    pub fn unsubscribe(&self, subscription: &Subscription<T>) {
        self.data.remove(&subscription.registration);
    }

    /// Unsubscribes every current subscription, marking each of them
    /// invalid.
    pub fn unsubscribe_all(&self) {
        let mut subscriptions = self.data.subscriptions.borrow_mut();
        let removed = std::mem::take(Rc::make_mut(&mut *subscriptions));
        for registration in &removed {
            registration.valid.set(false);
        }
        tracing::debug!(removed = removed.len(), "all subscriptions removed");
    }

    /// Returns the number of active subscriptions.
    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.data.subscriptions.borrow().len()
    }

    /// Returns true if there are any active subscriptions.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscribers() > 0
    }
}

struct Registration<T> {
    callback: Box<dyn Fn(&T)>,
    valid: Cell<bool>,
}

type Registrations<T> = Vec<Rc<Registration<T>>>;

/// Copy-on-write subscriber list. Emissions clone the outer `Rc` as their
/// snapshot; mutations copy the list only while a snapshot is alive.
struct Data<T> {
    subscriptions: RefCell<Rc<Registrations<T>>>,
}

impl<T> Data<T> {
    fn snapshot(&self) -> Option<Rc<Registrations<T>>> {
        let subscriptions = self.subscriptions.borrow();
        if subscriptions.is_empty() {
            None
        } else {
            Some(subscriptions.clone())
        }
    }

    /// Removes `registration` and clears its validity flag. Returns false if
    /// `registration` was not present.
    fn remove(&self, registration: &Rc<Registration<T>>) -> bool {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let index = match subscriptions
            .iter()
            .position(|existing| Rc::ptr_eq(existing, registration))
        {
            Some(index) => index,
            None => return false,
        };

        Rc::make_mut(&mut *subscriptions).remove(index);
        registration.valid.set(false);
        tracing::debug!(subscribers = subscriptions.len(), "subscription removed");
        true
    }
}

/// A handle to a callback registered with [`Observable::subscribe()`].
///
/// A subscription is valid from the moment it is created until it is
/// unsubscribed, either through [`Subscription::unsubscribe()`] or
/// [`Observable::unsubscribe()`]. Once invalid, it stays invalid.
///
/// A subscription does not keep its [`Observable`] alive.
///
/// ## Cloning behavior
///
/// Clones refer to the same registration. Unsubscribing through any clone
/// invalidates all of them.
#[must_use = "dropping a Subscription leaves its callback subscribed with no handle to remove it"]
pub struct Subscription<T> {
    registration: Rc<Registration<T>>,
    owner: Weak<Data<T>>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            registration: self.registration.clone(),
            owner: self.owner.clone(),
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl<T> Subscription<T> {
    /// Stops the callback from receiving any further values and marks this
    /// subscription invalid.
    ///
    /// Calling this more than once has no additional effect.
    pub fn unsubscribe(&self) {
        // Either error means there is nothing left to remove.
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
    /// - [`UnsubscribeError::Disconnected`]: the [`Observable`] has been
    ///   dropped. The subscription is invalid after this call.
    pub fn try_unsubscribe(&self) -> Result<(), UnsubscribeError> {
        if !self.is_valid() {
            return Err(UnsubscribeError::AlreadyUnsubscribed);
        }

        match self.owner.upgrade() {
            Some(data) => {
                data.remove(&self.registration);
                Ok(())
            }
            None => {
                self.registration.valid.set(false);
                Err(UnsubscribeError::Disconnected)
            }
        }
    }

    /// Returns true until this subscription has been unsubscribed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.registration.valid.get()
    }

    /// Returns true if this subscription is valid and was created by
    /// `observable` or one of its clones.
    #[must_use]
    pub fn is_subscribed_to(&self, observable: &Observable<T>) -> bool {
        self.is_valid() && std::ptr::eq(self.owner.as_ptr(), Rc::as_ptr(&observable.data))
    }

    /// Returns a handle to the [`Observable`] this subscription was created
    /// by.
    ///
    /// # Errors
    ///
    /// Returns [`Disconnected`] if every handle to the observable has been
    /// dropped.
    pub fn observable(&self) -> Result<Observable<T>, Disconnected> {
        self.owner
            .upgrade()
            .map(|data| Observable { data })
            .ok_or(Disconnected)
    }
}

#[cfg(test)]
type Log = Rc<RefCell<Vec<(&'static str, u32)>>>;

/// Returns a shared log and a factory for callbacks that append
/// `(name, value)` to it.
#[cfg(test)]
fn recorder() -> (Log, impl Fn(&'static str) -> Box<dyn Fn(&u32)>) {
    let log = Log::default();
    let for_callbacks = log.clone();
    let make = move |name: &'static str| -> Box<dyn Fn(&u32)> {
        let log = for_callbacks.clone();
        Box::new(move |value: &u32| log.borrow_mut().push((name, *value)))
    };
    (log, make)
}

#[test]
fn empty_next_is_a_no_op() {
    let observable = Observable::<u32>::new();
    assert!(!observable.has_subscribers());
    assert!(observable.data.snapshot().is_none());
    observable.next(1);
    observable.next(2);
    assert_eq!(observable.subscribers(), 0);

    let subscription = observable.subscribe(|_| {});
    assert!(observable.data.snapshot().is_some());
    subscription.unsubscribe();
    assert!(observable.data.snapshot().is_none());
}

#[test]
fn delivery_order() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let _a = observable.subscribe(callback("a"));
    let _b = observable.subscribe(callback("b"));
    let _c = observable.subscribe(callback("c"));
    assert_eq!(observable.subscribers(), 3);

    observable.next(7);
    assert_eq!(&*log.borrow(), &[("a", 7), ("b", 7), ("c", 7)]);
}

#[test]
fn single_threaded_callbacks() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let calls = Rc::new(Cell::new(0_u32));
    let observable = Observable::new();
    let log = seen.clone();
    let _values = observable.subscribe(move |value: &u32| log.borrow_mut().push(*value));
    let counter = calls.clone();
    let _count = observable.subscribe(move |_: &u32| counter.set(counter.get() + 1));

    observable.next(1);
    observable.next(2);
    assert_eq!(&*seen.borrow(), &[1, 2]);
    assert_eq!(calls.get(), 2);
}

#[test]
fn no_replay() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    observable.next(1);
    let _late = observable.subscribe(callback("late"));
    observable.next(2);
    assert_eq!(&*log.borrow(), &[("late", 2)]);
}

#[test]
fn squares_scenario() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let first = observable.subscribe(callback("value"));
    let squares = log.clone();
    let second = observable
        .subscribe(move |value: &u32| squares.borrow_mut().push(("square", value * value)));

    observable.next(10);
    observable.next(20);
    second.unsubscribe();
    observable.next(30);
    observable.next(40);

    assert_eq!(
        &*log.borrow(),
        &[
            ("value", 10),
            ("square", 100),
            ("value", 20),
            ("square", 400),
            ("value", 30),
            ("value", 40),
        ]
    );
    assert!(!second.is_valid());
    assert!(first.is_valid());
}

#[test]
fn idempotent_unsubscribe() {
    let observable = Observable::<u32>::new();
    let subscription = observable.subscribe(|_| {});
    let other = observable.subscribe(|_| {});

    assert_eq!(subscription.try_unsubscribe(), Ok(()));
    assert!(!subscription.is_valid());
    assert_eq!(
        subscription.try_unsubscribe(),
        Err(UnsubscribeError::AlreadyUnsubscribed)
    );
    subscription.unsubscribe();
    assert!(!subscription.is_valid());

    assert!(other.is_valid());
    assert_eq!(observable.subscribers(), 1);
}

#[test]
fn observable_side_unsubscribe_invalidates() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let subscription = observable.subscribe(callback("a"));
    let other = observable.subscribe(callback("b"));

    observable.unsubscribe(&subscription);
    assert!(!subscription.is_valid());
    assert!(other.is_valid());
    // Both paths converge, so this is a second, ignored removal.
    subscription.unsubscribe();
    observable.unsubscribe(&subscription);

    observable.next(1);
    assert_eq!(&*log.borrow(), &[("b", 1)]);
    assert_eq!(observable.subscribers(), 1);
}

#[test]
fn foreign_unsubscribe_is_ignored() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let stranger = Observable::new();
    let subscription = observable.subscribe(callback("a"));

    stranger.unsubscribe(&subscription);
    assert!(subscription.is_valid());
    assert!(subscription.is_subscribed_to(&observable));
    assert!(!subscription.is_subscribed_to(&stranger));

    observable.next(3);
    assert_eq!(&*log.borrow(), &[("a", 3)]);
}

#[test]
fn reentrant_unsubscribe_of_later_subscription() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let later: Rc<RefCell<Option<Subscription<u32>>>> = Rc::default();
    let target = later.clone();
    let first_log = log.clone();
    let _first = observable.subscribe(move |value: &u32| {
        first_log.borrow_mut().push(("first", *value));
        if let Some(subscription) = target.borrow().as_ref() {
            subscription.unsubscribe();
        }
    });
    let second = observable.subscribe(callback("second"));
    *later.borrow_mut() = Some(second.clone());

    // The snapshot taken at the start of this call still includes `second`.
    observable.next(1);
    assert!(!second.is_valid());
    observable.next(2);

    assert_eq!(
        &*log.borrow(),
        &[("first", 1), ("second", 1), ("first", 2)]
    );
}

#[test]
fn reentrant_self_unsubscribe() {
    let observable = Observable::new();
    let calls = Rc::new(Cell::new(0_usize));
    let own: Rc<RefCell<Option<Subscription<u32>>>> = Rc::default();
    let counter = calls.clone();
    let handle = own.clone();
    let subscription = observable.subscribe(move |_: &u32| {
        counter.set(counter.get() + 1);
        let own = handle.borrow_mut().take();
        if let Some(subscription) = own {
            subscription.unsubscribe();
        }
    });
    *own.borrow_mut() = Some(subscription.clone());

    observable.next(1);
    observable.next(2);
    assert_eq!(calls.get(), 1);
    assert!(!subscription.is_valid());
}

#[test]
fn reentrant_subscribe_waits_for_next_value() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let spawner = observable.clone();
    let added: Rc<RefCell<Vec<Subscription<u32>>>> = Rc::default();
    let keep = added.clone();
    let subscription = observable.subscribe(move |_: &u32| {
        if keep.borrow().is_empty() {
            let subscription = spawner.subscribe(callback("added"));
            keep.borrow_mut().push(subscription);
        }
    });

    observable.next(1);
    assert!(log.borrow().is_empty());
    observable.next(2);
    assert_eq!(&*log.borrow(), &[("added", 2)]);

    // The first callback holds a clone of the observable.
    subscription.unsubscribe();
    observable.unsubscribe_all();
    assert!(added.borrow().iter().all(|added| !added.is_valid()));
}

#[test]
fn panicking_callback_fails_fast() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let _before = observable.subscribe(callback("before"));
    let _panics = observable.subscribe(|value: &u32| assert_ne!(*value, 1, "refusing 1"));
    let _after = observable.subscribe(callback("after"));

    let result =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observable.next(1)));
    assert!(result.is_err());
    assert_eq!(&*log.borrow(), &[("before", 1)]);

    observable.next(2);
    assert_eq!(
        &*log.borrow(),
        &[("before", 1), ("before", 2), ("after", 2)]
    );
}

#[test]
fn unsubscribe_all() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let a = observable.subscribe(callback("a"));
    let b = observable.subscribe(callback("b"));

    observable.unsubscribe_all();
    assert!(!a.is_valid());
    assert!(!b.is_valid());
    assert!(!observable.has_subscribers());

    observable.next(1);
    assert!(log.borrow().is_empty());
}

#[test]
fn clones_share_subscribers() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let cloned = observable.clone();
    let subscription = cloned.subscribe(callback("a"));
    let handle = subscription.clone();

    observable.next(1);
    assert!(subscription.is_subscribed_to(&observable));
    handle.unsubscribe();
    assert!(!subscription.is_valid());
    cloned.next(2);
    assert_eq!(&*log.borrow(), &[("a", 1)]);
}

#[test]
fn outlives_observable() {
    let observable = Observable::<u32>::new();
    let subscription = observable.subscribe(|_| {});
    assert!(subscription.observable().is_ok());

    drop(observable);
    assert!(subscription.is_valid());
    assert_eq!(subscription.observable().unwrap_err(), Disconnected);
    assert_eq!(
        subscription.try_unsubscribe(),
        Err(UnsubscribeError::Disconnected)
    );
    assert!(!subscription.is_valid());
    assert_eq!(
        subscription.try_unsubscribe(),
        Err(UnsubscribeError::AlreadyUnsubscribed)
    );
}

#[test]
fn observable_from_subscription() {
    let (log, callback) = recorder();
    let observable = Observable::new();
    let subscription = observable.subscribe(callback("a"));

    let recovered = subscription.observable().unwrap();
    recovered.next(5);
    assert!(subscription.is_subscribed_to(&recovered));

    recovered.unsubscribe(&subscription);
    assert!(!subscription.is_subscribed_to(&observable));
    observable.next(6);
    assert_eq!(&*log.borrow(), &[("a", 5)]);
}

#[test]
fn debug_output() {
    let observable = Observable::<u32>::default();
    let subscription = observable.subscribe(|_| {});
    assert_eq!(format!("{observable:?}"), "Observable { subscribers: 1 }");
    subscription.unsubscribe();
    assert_eq!(format!("{subscription:?}"), "Subscription { valid: false }");
}
