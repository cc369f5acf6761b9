//! Keyed table of pending single-shot completions
//!
//! Each key holds at most one outstanding completion. Registering under a
//! key that is already pending fails the previous completion with
//! [`WorkerError::Replaced`] before the new one takes its place, so no
//! waiter is ever dropped without hearing back.

use crate::worker::schema::WorkerError;
use thiserror::Error;
use tokio::sync::oneshot;

/// Completion channel handed to a registry entry
pub type Completion<T> = oneshot::Sender<Result<T, WorkerError>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No pending request for key '{key}'")]
    NotPending { key: String },
}

struct PendingEntry<T, M> {
    key: String,
    /// Settled exactly once, by resolve, reject or replacement
    completion: Completion<T>,
    metadata: M,
}

/// Pending completions in registration order
pub struct PendingRequestRegistry<T, M> {
    entries: Vec<PendingEntry<T, M>>,
}

impl<T, M> Default for PendingRequestRegistry<T, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, M> PendingRequestRegistry<T, M> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a completion under `key`, displacing any entry already there
    ///
    /// The new entry is queued behind every other pending key.
    pub fn register(&mut self, key: impl Into<String>, completion: Completion<T>, metadata: M) {
        let key = key.into();

        if let Some(index) = self.position(&key) {
            let prior = self.entries.remove(index);
            tracing::debug!(key = %key, "Replacing pending request");
            let _ = prior.completion.send(Err(WorkerError::Replaced { key: key.clone() }));
        }

        self.entries.push(PendingEntry {
            key,
            completion,
            metadata,
        });
    }

    pub fn has(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn metadata(&self, key: &str) -> Option<&M> {
        self.position(key).map(|index| &self.entries[index].metadata)
    }

    /// Complete the entry under `key` with `value` and remove it
    ///
    /// Returns `Ok(Some(value))` when the waiter had already gone away and
    /// the value could not be delivered.
    pub fn resolve(&mut self, key: &str, value: T) -> Result<Option<T>, RegistryError> {
        self.resolve_with(key, || value)
    }

    /// Like [`resolve`](Self::resolve), but only builds the value once the
    /// entry is known to exist
    pub fn resolve_with(
        &mut self,
        key: &str,
        value: impl FnOnce() -> T,
    ) -> Result<Option<T>, RegistryError> {
        let entry = self.take(key)?;
        match entry.completion.send(Ok(value())) {
            Ok(()) => Ok(None),
            Err(Ok(value)) => Ok(Some(value)),
            Err(Err(_)) => Ok(None),
        }
    }

    /// Fail the entry under `key` with `error` and remove it
    pub fn reject(&mut self, key: &str, error: WorkerError) -> Result<(), RegistryError> {
        let entry = self.take(key)?;
        let _ = entry.completion.send(Err(error));
        Ok(())
    }

    /// Pending keys, oldest registration first
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|entry| entry.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }

    fn take(&mut self, key: &str) -> Result<PendingEntry<T, M>, RegistryError> {
        let index = self.position(key).ok_or_else(|| RegistryError::NotPending {
            key: key.to_string(),
        })?;
        Ok(self.entries.remove(index))
    }
}
