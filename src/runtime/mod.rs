use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod docker;
pub use docker::DockerRuntime;

/// Snapshot of a running container, as far as hostname derivation needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    /// Runtime name used as a hostname label, e.g. `docker`.
    pub platform: &'static str,
    pub labels: HashMap<String, String>,
    pub networks: Vec<String>,
    /// Container port -> published host ports.
    pub port_bindings: BTreeMap<u16, Vec<u16>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Started(Container),
    Stopped { id: String },
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Start monitoring the runtime for container changes.
    /// Containers already running are reported as `Started` first.
    /// Returns when the receiving side of `event_tx` is gone.
    async fn monitor(&self, event_tx: mpsc::Sender<ContainerEvent>) -> Result<()>;
}
