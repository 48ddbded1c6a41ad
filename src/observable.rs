//! Observable Records
//!
//! Whole-value observable cells built on `tokio::sync::watch`. Every write
//! replaces the stored value in one step, so a reader either sees the previous
//! record or the new one, never a mix of both. Subscribers are woken on every
//! replacement.
//!
//! # Example
//!
//! ```rust
//! use pnp_core::observable::Observable;
//!
//! let position = Observable::new("position", (0.0_f64, 0.0_f64));
//! let rx = position.subscribe();
//!
//! position.set((1.5, -2.25));
//! assert_eq!(*rx.borrow(), (1.5, -2.25));
//! ```

use std::fmt::Debug;
use tokio::sync::watch;

/// A thread-safe record with change notifications.
///
/// Cloning an `Observable` shares the same underlying channel.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    name: &'static str,
}

impl<T: Clone + Send + Sync + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            name: self.name,
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: &'static str, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self { sender, name }
    }

    /// Record name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Read the current value in place without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.sender.borrow())
    }

    /// Replace the whole value, notifying all subscribers.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Build a new value from the current one and replace it.
    ///
    /// The closure runs under the write lock and must return a complete record.
    pub fn replace_with(&self, f: impl FnOnce(&T) -> T) {
        self.sender.send_modify(|value| *value = f(value));
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
