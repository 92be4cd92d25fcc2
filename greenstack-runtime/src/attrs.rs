//! Per-Greenlet Attributes
//!
//! Every greenlet carries a small typed key/value bag that callers can use
//! to hang their own data off a coroutine (a request id, a name for
//! diagnostics, a result slot). Values must be `Send` because the handle
//! owning them is.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Typed key/value storage attached to one greenlet.
#[derive(Default)]
pub struct Attributes {
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl Attributes {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the value under `key` as a `T`.
    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    /// Mutably borrow the value under `key` as a `T`.
    pub fn get_mut<T: Any + Send>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key)?.downcast_mut::<T>()
    }

    /// Store `value` under `key`, returning whether a value was replaced.
    pub fn insert<T: Any + Send>(&mut self, key: impl Into<String>, value: T) -> bool {
        self.values.insert(key.into(), Box::new(value)).is_some()
    }

    /// Remove and return the value under `key` if it is a `T`.
    ///
    /// A value of another type is left in place.
    pub fn take<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        if !self.values.get(key)?.is::<T>() {
            return None;
        }
        self.values.remove(key)?.downcast::<T>().ok().map(|b| *b)
    }

    /// Remove the value under `key`.
    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Whether a value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Stored keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop every value.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("Attributes").field("keys", &keys).finish()
    }
}
