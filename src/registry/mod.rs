//! In-memory hostname → mapping registry.
//!
//! The registry is the single owner of mapping state. Producers (container
//! watcher, admin API) mutate it through [`MappingRegistry::create`] and
//! [`MappingRegistry::delete_by_host`]; consumers either look mappings up at
//! request time or subscribe to the event stream with
//! [`MappingRegistry::listen_event`].
//!
//! Mutations are serialized through one write gate that is held across the
//! state change and the emission of its event. That gives per-hostname
//! linearizability and guarantees subscribers observe events in the order
//! the state changed, while lookups only ever take the read side of the map
//! lock and are never blocked by a slow subscriber.

pub mod events;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::addr::Address;
use crate::error::{RegistryError, Result};
use crate::types::{Mapping, MappingEvent};

pub use events::{EventBus, Subscription};

/// Default per-subscriber channel capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 1;

pub struct MappingRegistry {
    mappings: RwLock<HashMap<String, Mapping>>,
    write_gate: Mutex<()>,
    bus: Arc<EventBus>,
}

impl Default for MappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(buffer: usize) -> Self {
        Self {
            mappings: RwLock::new(HashMap::new()),
            write_gate: Mutex::new(()),
            bus: EventBus::new(buffer),
        }
    }

    /// Snapshot of every mapping, in no particular order.
    pub async fn list(&self) -> Vec<Mapping> {
        self.mappings.read().await.values().cloned().collect()
    }

    pub async fn has_host(&self, host: &str) -> bool {
        self.mappings
            .read()
            .await
            .contains_key(&normalize_host(host))
    }

    /// Backend address for `host` on the exposed `port`.
    pub async fn map_addr(&self, host: &str, port: u16) -> Option<Address> {
        self.mappings
            .read()
            .await
            .get(&normalize_host(host))
            .and_then(|m| m.backend(port))
            .cloned()
    }

    /// Every `(host, backend)` pair that exposes `port`, sorted by host.
    pub async fn backends_for_port(&self, port: u16) -> Vec<(String, Address)> {
        let mut backends: Vec<_> = self
            .mappings
            .read()
            .await
            .values()
            .filter_map(|m| m.backend(port).map(|a| (m.host.clone(), a.clone())))
            .collect();
        backends.sort();
        backends
    }

    /// Registers a new mapping and emits [`MappingEvent::Created`].
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] when the hostname already has a
    /// mapping; [`RegistryError::EmptyMapping`] or
    /// [`RegistryError::InvalidMapping`] when the mapping is unusable.
    pub async fn create(&self, mapping: Mapping) -> Result<()> {
        let mapping = validate(mapping)?;

        let _gate = self.write_gate.lock().await;
        match self.mappings.write().await.entry(mapping.host.clone()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::AlreadyRegistered { host: mapping.host });
            }
            Entry::Vacant(slot) => {
                slot.insert(mapping.clone());
            }
        }

        debug!("mapping created: {} {:?}", mapping.host, mapping.map);
        self.bus.emit(MappingEvent::Created(mapping)).await;
        Ok(())
    }

    /// Removes the mapping for `host` and emits [`MappingEvent::Destroyed`].
    ///
    /// Deleting an unknown host is a no-op; the removed mapping is returned
    /// when there was one.
    pub async fn delete_by_host(&self, host: &str) -> Option<Mapping> {
        let host = normalize_host(host);

        let _gate = self.write_gate.lock().await;
        let removed = self.mappings.write().await.remove(&host)?;

        debug!("mapping destroyed: {}", removed.host);
        self.bus
            .emit(MappingEvent::Destroyed(removed.clone()))
            .await;
        Some(removed)
    }

    /// Subscribes to every event emitted from now until `token` is canceled.
    pub async fn listen_event(&self, token: CancellationToken) -> Subscription {
        self.bus.subscribe(token).await
    }
}

/// Hostnames are compared case-insensitively and without a trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn validate(mut mapping: Mapping) -> Result<Mapping> {
    mapping.host = normalize_host(&mapping.host);

    if mapping.host.is_empty()
        || mapping
            .host
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == ':')
    {
        return Err(RegistryError::InvalidMapping(format!(
            "invalid hostname {:?}",
            mapping.host
        )));
    }
    if mapping.map.is_empty() {
        return Err(RegistryError::EmptyMapping { host: mapping.host });
    }
    if let Some((port, addr)) = mapping
        .map
        .iter()
        .find(|(port, addr)| **port == 0 || !addr.is_valid())
    {
        return Err(RegistryError::InvalidMapping(format!(
            "{}: {} -> {}",
            mapping.host, port, addr
        )));
    }

    Ok(mapping)
}
