//! Keeps the registry in sync with running containers.
//!
//! Every container gets one hostname per attached network,
//! `<name>.<network>.<platform>.<tld>`, plus the value of the hostname label
//! when present. Each hostname maps every published container port to the
//! first local host port bound to it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::addr::Address;
use crate::config::DockerConfig;
use crate::registry::MappingRegistry;
use crate::runtime::{Container, ContainerEvent, ContainerRuntime};
use crate::types::{Mapping, PortMap};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct ContainerWatcher {
    registry: Arc<MappingRegistry>,
    runtimes: Vec<Arc<dyn ContainerRuntime>>,
    tld: String,
    hostname_label: String,
}

impl ContainerWatcher {
    pub fn new(
        registry: Arc<MappingRegistry>,
        runtimes: Vec<Arc<dyn ContainerRuntime>>,
        config: &DockerConfig,
    ) -> Self {
        Self {
            registry,
            runtimes,
            tld: config.tld.clone(),
            hostname_label: config.hostname_label.clone(),
        }
    }

    pub fn hostnames(&self, container: &Container) -> Vec<String> {
        let mut hostnames: Vec<String> = container
            .networks
            .iter()
            .map(|network| {
                format!(
                    "{}.{}.{}.{}",
                    container.name, network, container.platform, self.tld
                )
            })
            .collect();
        if let Some(label) = container.labels.get(&self.hostname_label) {
            if !label.trim().is_empty() {
                hostnames.push(label.trim().to_string());
            }
        }
        hostnames
    }

    /// Mappings to register for `container`; empty when it publishes no port.
    pub fn container_mappings(&self, container: &Container) -> Vec<Mapping> {
        let map: PortMap = container
            .port_bindings
            .iter()
            .filter_map(|(container_port, host_ports)| {
                host_ports
                    .first()
                    .map(|host_port| (*container_port, Address::local(*host_port)))
            })
            .collect();
        if map.is_empty() {
            return Vec::new();
        }

        self.hostnames(container)
            .into_iter()
            .map(|host| Mapping {
                host,
                map: map.clone(),
            })
            .collect()
    }

    /// Runs every runtime monitor and applies their events until `token` is
    /// canceled or a runtime fails. Mappings created here are removed on
    /// the way out.
    pub async fn watch(&self, token: CancellationToken) -> anyhow::Result<()> {
        debug!("start watching container events");
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut collectors = JoinSet::new();
        for runtime in &self.runtimes {
            let runtime = Arc::clone(runtime);
            let event_tx = event_tx.clone();
            collectors.spawn(async move {
                let platform = runtime.platform();
                runtime
                    .monitor(event_tx)
                    .await
                    .with_context(|| format!("{} runtime failed", platform))
            });
        }
        drop(event_tx);

        let mut hosts_by_id: HashMap<String, Vec<String>> = HashMap::new();
        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                Some(joined) = collectors.join_next(), if !collectors.is_empty() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(anyhow!("container runtime task failed: {}", e)),
                },
                event = event_rx.recv() => match event {
                    Some(ContainerEvent::Started(container)) => {
                        self.handle_started(container, &mut hosts_by_id).await;
                    }
                    Some(ContainerEvent::Stopped { id }) => {
                        self.handle_stopped(&id, &mut hosts_by_id).await;
                    }
                    None => break Ok(()),
                },
            }
        };

        collectors.shutdown().await;
        for (id, hosts) in hosts_by_id {
            self.remove_hosts(&id, hosts).await;
        }
        debug!("stop watching container events");
        result
    }

    async fn handle_started(
        &self,
        container: Container,
        hosts_by_id: &mut HashMap<String, Vec<String>>,
    ) {
        if hosts_by_id.contains_key(&container.id) {
            debug!("container {} is already registered", container.id);
            return;
        }

        let mut created = Vec::new();
        for mapping in self.container_mappings(&container) {
            let host = mapping.host.clone();
            match self.registry.create(mapping).await {
                Ok(()) => created.push(host),
                Err(e) if e.is_already_registered() => {
                    warn!("{} (container {})", e, container.id);
                }
                Err(e) => warn!(
                    "failed to create a mapping for container {}: {}",
                    container.id, e
                ),
            }
        }

        if !created.is_empty() {
            info!("container {} reachable as {}", container.name, created.join(", "));
            hosts_by_id.insert(container.id, created);
        }
    }

    async fn handle_stopped(&self, id: &str, hosts_by_id: &mut HashMap<String, Vec<String>>) {
        if let Some(hosts) = hosts_by_id.remove(id) {
            self.remove_hosts(id, hosts).await;
        }
    }

    async fn remove_hosts(&self, id: &str, hosts: Vec<String>) {
        for host in hosts {
            if self.registry.delete_by_host(&host).await.is_none() {
                debug!("mapping {} of container {} was already gone", host, id);
            }
        }
    }
}
