#![doc = include_str!(".crate-docs.md")]
#![forbid(unsafe_code)]
#![warn(
    clippy::cargo,
    missing_docs,
    // clippy::missing_docs_in_private_items,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms,
)]
#![allow(clippy::option_if_let_else, clippy::module_name_repetitions)]

mod local;
mod shared;

pub use local::{Observable, Subscription};
pub use shared::{SharedObservable, SharedSubscription};

/// An operation failed because the observable a subscription belongs to has
/// been dropped.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("the observable has been dropped")]
pub struct Disconnected;

/// An error returned from [`Subscription::try_unsubscribe()`] and
/// [`SharedSubscription::try_unsubscribe()`].
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum UnsubscribeError {
    /// The subscription had already been unsubscribed.
    #[error("the subscription was already unsubscribed")]
    AlreadyUnsubscribed,
    /// The observable the subscription belonged to has been dropped. The
    /// subscription is now invalid.
    #[error("the observable has been dropped")]
    Disconnected,
}

impl From<Disconnected> for UnsubscribeError {
    fn from(_: Disconnected) -> Self {
        Self::Disconnected
    }
}

#[test]
fn error_messages() {
    assert_eq!(Disconnected.to_string(), "the observable has been dropped");
    assert_eq!(
        UnsubscribeError::AlreadyUnsubscribed.to_string(),
        "the subscription was already unsubscribed"
    );
    assert_eq!(
        UnsubscribeError::from(Disconnected),
        UnsubscribeError::Disconnected
    );
}
