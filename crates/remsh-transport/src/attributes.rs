//! Typed, per-session attribute bag.
//!
//! Components that need to hang open-ended state off a session (timeout
//! handles, the login key, the security token, stream inboxes) bind it here
//! under a key namespaced by the owning component.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Result, TransportError};

/// Key of a session attribute: the owning component plus a purpose string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeKey {
    owner: &'static str,
    purpose: &'static str,
}

impl AttributeKey {
    /// Key owned by `owner` for the given `purpose`.
    pub const fn new(owner: &'static str, purpose: &'static str) -> Self {
        Self { owner, purpose }
    }

    /// Key owned by the component type `T`.
    pub fn of<T: ?Sized>(purpose: &'static str) -> Self {
        Self::new(std::any::type_name::<T>(), purpose)
    }

    /// Owning component name.
    pub fn owner(&self) -> &'static str {
        self.owner
    }

    /// What the key is used for.
    pub fn purpose(&self) -> &'static str {
        self.purpose
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.purpose)
    }
}

type Value = Arc<dyn Any + Send + Sync>;

/// Concurrent attribute map owned by one session.
#[derive(Default)]
pub struct AttributeStore {
    entries: DashMap<AttributeKey, Value>,
}

impl fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().to_string()).collect();
        f.debug_struct("AttributeStore").field("keys", &keys).finish()
    }
}

fn downcast<T: Any + Send + Sync>(key: &AttributeKey, value: Value) -> Result<Arc<T>> {
    value
        .downcast::<T>()
        .map_err(|_| TransportError::AttributeType {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

impl AttributeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` under `key`. Fails if the key is already bound.
    pub fn bind<T: Any + Send + Sync>(&self, key: AttributeKey, value: T) -> Result<Arc<T>> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(TransportError::AlreadyBound {
                key: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                let value = Arc::new(value);
                slot.insert(value.clone());
                Ok(value)
            }
        }
    }

    /// Binds `value` under `key` unconditionally and returns what it replaced.
    pub fn rebind<T: Any + Send + Sync>(&self, key: AttributeKey, value: T) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries.insert(key, Arc::new(value))
    }

    /// Returns the value bound under `key`.
    pub fn lookup<T: Any + Send + Sync>(&self, key: AttributeKey) -> Result<Arc<T>> {
        let value = self
            .entries
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::NotBound {
                key: key.to_string(),
            })?;
        downcast(&key, value)
    }

    /// Returns the value bound under `key`, or `default` if none is bound.
    pub fn lookup_or<T: Any + Send + Sync>(&self, key: AttributeKey, default: T) -> Result<Arc<T>> {
        match self.lookup(key) {
            Err(TransportError::NotBound { .. }) => Ok(Arc::new(default)),
            other => other,
        }
    }

    /// Removes `key` and returns the previous value, if any.
    pub fn unbind(&self, key: AttributeKey) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries.remove(&key).map(|(_, value)| value)
    }

    /// Removes `key` and returns the previous value as `T`.
    pub fn unbind_as<T: Any + Send + Sync>(&self, key: AttributeKey) -> Result<Option<Arc<T>>> {
        match self.unbind(key) {
            Some(value) => downcast(&key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Removes `key` only if its current value is a `T` satisfying `predicate`.
    pub fn unbind_if<T, F>(&self, key: AttributeKey, predicate: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce(&T) -> bool,
    {
        self.entries
            .remove_if(&key, |_, value| {
                value.downcast_ref::<T>().is_some_and(predicate)
            })
            .and_then(|(_, value)| value.downcast::<T>().ok())
    }

    /// Returns the value under `key`, binding `init()` first if none is bound.
    pub fn get_or_bind<T, F>(&self, key: AttributeKey, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let value = self
            .entries
            .entry(key)
            .or_insert_with(|| Arc::new(init()))
            .value()
            .clone();
        downcast(&key, value)
    }

    /// Whether `key` currently holds a value.
    pub fn contains(&self, key: AttributeKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Number of bound keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is bound.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
