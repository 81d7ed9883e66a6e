//! Identity-preserving binding of a function to a receiver.
//!
//! Binding the same function to the same receiver twice must yield the *same* bound value, not
//! merely an equivalent one.  Listener registries rely on this to find and remove a registration
//! later, and the handle converter relies on it so that a bound method converts to the same
//! handle every time.
//!
//! [`Binder`] is a cache keyed by [`BindKey`], the pair of addresses of the function and the
//! receiver.  A bound value is expected to own clones of both inputs, which keeps them alive (and
//! their addresses unique) for as long as the binding stays cached.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::sync::MutexExt;

/// Composite key identifying a (function, receiver) pair by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindKey {
    function: usize,
    receiver: usize,
}

impl BindKey {
    pub fn new(function: usize, receiver: usize) -> Self {
        Self { function, receiver }
    }

    /// Key for a function and receiver that are both reference counted.
    pub fn of<F: ?Sized, R: ?Sized>(function: &Arc<F>, receiver: &Arc<R>) -> Self {
        Self::new(addr_of(function), addr_of(receiver))
    }
}

/// Address of the value behind an `Arc`, with any pointer metadata discarded.
pub fn addr_of<T: ?Sized>(value: &Arc<T>) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

/// Cache of bound values.
pub struct Binder<B: ?Sized> {
    bound: Mutex<HashMap<BindKey, Arc<B>>>,
}

impl<B: ?Sized> Binder<B> {
    pub fn new() -> Self {
        Self {
            bound: Mutex::new(HashMap::new()),
        }
    }

    /// Return the value bound under `key`, building it with `bind` on first use.
    pub fn bind_with(&self, key: BindKey, bind: impl FnOnce() -> Arc<B>) -> Arc<B> {
        self.bound.lock_unpoisoned().entry(key).or_insert_with(bind).clone()
    }

    pub fn get(&self, key: BindKey) -> Option<Arc<B>> {
        self.bound.lock_unpoisoned().get(&key).cloned()
    }

    /// Drop the cached binding, so a later bind of the same pair builds a fresh value.
    pub fn forget(&self, key: BindKey) -> Option<Arc<B>> {
        self.bound.lock_unpoisoned().remove(&key)
    }

    /// Find the key a bound value is cached under, by identity.
    pub fn key_of(&self, bound: &Arc<B>) -> Option<BindKey> {
        self.bound
            .lock_unpoisoned()
            .iter()
            .find(|(_, candidate)| addr_of(candidate) == addr_of(bound))
            .map(|(key, _)| *key)
    }

    pub fn clear(&self) {
        self.bound.lock_unpoisoned().clear();
    }

    pub fn len(&self) -> usize {
        self.bound.lock_unpoisoned().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: ?Sized> Default for Binder<B> {
    fn default() -> Self {
        Self::new()
    }
}
