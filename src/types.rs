//! Data structures shared by the registry and its producers and consumers.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and are
//! what the admin API sends and receives.  The registry owns the canonical
//! [`Mapping`] records; everything else works on clones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::addr::Address;

/// Exposed port → backend address.
pub type PortMap = BTreeMap<u16, Address>;

/// A virtual hostname and the backends behind each of its exposed ports.
///
/// On the wire this is `{"host": "...", "map": {"80": ":9001"}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub host: String,
    #[serde(default)]
    pub map: PortMap,
}

impl Mapping {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            map: PortMap::new(),
        }
    }

    /// Adds one exposed port → backend pair.
    #[must_use]
    pub fn with_port(mut self, exposed: u16, backend: Address) -> Self {
        self.map.insert(exposed, backend);
        self
    }

    /// Backend address for `exposed`, if this mapping serves that port.
    pub fn backend(&self, exposed: u16) -> Option<&Address> {
        self.map.get(&exposed).filter(|a| a.is_valid())
    }

    /// Exposed ports this mapping references.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.map.keys().copied()
    }
}

/// A registry mutation, carrying a snapshot of the affected mapping.
///
/// Every `create` emits exactly one `Created`, every effective
/// `delete_by_host` exactly one `Destroyed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "mapping", rename_all = "snake_case")]
pub enum MappingEvent {
    Created(Mapping),
    Destroyed(Mapping),
}

impl MappingEvent {
    pub fn mapping(&self) -> &Mapping {
        match self {
            Self::Created(m) | Self::Destroyed(m) => m,
        }
    }
}
