//! Subscription registry
//!
//! Holds, for every active subscription of one client, its delivery engine,
//! the queue feeding its dispatch stream, and the stream task itself.
//! Callers synchronize access (the client keeps it behind a mutex) and never
//! hold that lock while awaiting.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::options::SubscriptionKey;
use crate::delivery::engine::{DeliveryEngine, Inbound};

#[derive(Debug)]
pub(crate) struct RegistryEntry {
    pub engine: Arc<DeliveryEngine>,
    pub inbound: UnboundedSender<Inbound>,
    pub stream: JoinHandle<()>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<SubscriptionKey, RegistryEntry>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. Returns it back if the key is already registered.
    pub(crate) fn insert(&mut self, entry: RegistryEntry) -> Result<(), RegistryEntry> {
        let key = entry.engine.key().clone();
        if self.entries.contains_key(&key) {
            return Err(entry);
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub(crate) fn get(&self, key: &SubscriptionKey) -> Option<&RegistryEntry> {
        self.entries.get(key)
    }

    /// Removes the entry for `key` only if it still holds `engine`.
    pub(crate) fn remove_engine(
        &mut self,
        key: &SubscriptionKey,
        engine: &Arc<DeliveryEngine>,
    ) -> Option<RegistryEntry> {
        match self.entries.get(key) {
            Some(entry) if Arc::ptr_eq(&entry.engine, engine) => self.entries.remove(key),
            _ => None,
        }
    }

    pub(crate) fn holds(&self, engine: &Arc<DeliveryEngine>) -> bool {
        self.entries
            .get(engine.key())
            .is_some_and(|entry| Arc::ptr_eq(&entry.engine, engine))
    }

    pub(crate) fn engines(&self) -> Vec<Arc<DeliveryEngine>> {
        self.entries.values().map(|e| e.engine.clone()).collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<RegistryEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
