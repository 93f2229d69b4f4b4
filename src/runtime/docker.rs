use super::{Container, ContainerEvent, ContainerRuntime};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub const PLATFORM: &str = "docker";

#[derive(Default)]
pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }

    async fn connect() -> Result<Docker> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        Ok(docker)
    }

    async fn inspect(docker: &Docker, id: &str) -> Option<Container> {
        match docker.inspect_container(id, None).await {
            Ok(detail) => container_from_inspect(&detail),
            Err(e) => {
                warn!("Failed to inspect container {}: {}", id, e);
                None
            }
        }
    }

    async fn get_initial_state(docker: &Docker) -> Result<Vec<Container>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = docker.list_containers(Some(opts)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|c| c.id) {
            if let Some(container) = Self::inspect(docker, &id).await {
                containers.push(container);
            }
        }
        Ok(containers)
    }
}

/// Sends on the channel, mapping a closed receiver to an error.
async fn send(tx: &mpsc::Sender<ContainerEvent>, event: ContainerEvent) -> Result<()> {
    tx.send(event)
        .await
        .map_err(|_| anyhow!("container event channel closed"))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn monitor(&self, event_tx: mpsc::Sender<ContainerEvent>) -> Result<()> {
        // Ids reported as started, so a rescan after reconnecting can report
        // the ones that died meanwhile.
        let mut running: HashSet<String> = HashSet::new();

        loop {
            if event_tx.is_closed() {
                return Ok(());
            }

            let docker = match Self::connect().await {
                Ok(d) => d,
                Err(e) => {
                    error!("Failed to connect to Docker: {}. Retrying in 5s...", e);
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            // Initial scan
            let containers = match Self::get_initial_state(&docker).await {
                Ok(containers) => containers,
                Err(e) => {
                    error!("Failed initial scan: {}. Retrying...", e);
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            info!("Initial scan found {} containers", containers.len());

            let alive: HashSet<String> = containers.iter().map(|c| c.id.clone()).collect();
            let gone: Vec<String> = running.difference(&alive).cloned().collect();
            for id in gone {
                running.remove(&id);
                if send(&event_tx, ContainerEvent::Stopped { id }).await.is_err() {
                    return Ok(());
                }
            }
            for container in containers {
                running.insert(container.id.clone());
                if send(&event_tx, ContainerEvent::Started(container)).await.is_err() {
                    return Ok(());
                }
            }

            // Event stream
            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["container"].as_slice()),
                    ("event", ["start", "die"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            let mut stream = docker.events(Some(opts));

            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(event) => event,
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to reconnect
                    }
                };

                let Some(id) = event.actor.and_then(|actor| actor.id) else {
                    continue;
                };
                let action = event.action.unwrap_or_default();
                debug!("Container event: {} for {}", action, id);

                let update = match action.as_str() {
                    "start" => match Self::inspect(&docker, &id).await {
                        Some(container) => {
                            info!("Container started: {} ({})", container.name, id);
                            running.insert(id);
                            ContainerEvent::Started(container)
                        }
                        None => continue,
                    },
                    "die" => {
                        if !running.remove(&id) {
                            continue;
                        }
                        info!("Container stopped: {}", id);
                        ContainerEvent::Stopped { id }
                    }
                    _ => continue,
                };

                if send(&event_tx, update).await.is_err() {
                    return Ok(());
                }
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Extracts what the watcher needs from `docker inspect` output.
///
/// Returns `None` for responses without an id.
pub fn container_from_inspect(detail: &ContainerInspectResponse) -> Option<Container> {
    let id = detail.id.clone().filter(|id| !id.is_empty())?;
    let name = detail
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());

    let labels = detail
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();

    let mut networks = Vec::new();
    let mut port_bindings: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
    if let Some(settings) = &detail.network_settings {
        if let Some(attached) = &settings.networks {
            networks.extend(attached.keys().cloned());
            networks.sort();
        }
        for (key, bindings) in settings.ports.iter().flatten() {
            // Keys look like "80/tcp".
            let Some(Ok(container_port)) = key.split('/').next().map(str::parse::<u16>) else {
                warn!("Unexpected port key {:?} on container {}", key, id);
                continue;
            };
            for binding in bindings.iter().flatten() {
                match binding.host_port.as_deref().map(str::parse::<u16>) {
                    Some(Ok(host_port)) if host_port != 0 => {
                        let ports = port_bindings.entry(container_port).or_default();
                        if !ports.contains(&host_port) {
                            ports.push(host_port);
                        }
                    }
                    _ => debug!("Skipping binding {:?} on container {}", binding, id),
                }
            }
        }
    }

    Some(Container {
        id,
        name,
        platform: PLATFORM,
        labels,
        networks,
        port_bindings,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bollard::models::{ContainerConfig, EndpointSettings, NetworkSettings, PortBinding};

    use super::*;

    fn binding(host_ip: &str, host_port: &str) -> PortBinding {
        PortBinding {
            host_ip: Some(host_ip.into()),
            host_port: Some(host_port.into()),
        }
    }

    #[test]
    fn extracts_container_details() {
        let detail = ContainerInspectResponse {
            id: Some("abc123".into()),
            name: Some("/web".into()),
            config: Some(ContainerConfig {
                labels: Some(HashMap::from([(
                    "svcd.hostname".to_string(),
                    "web.dev.local".to_string(),
                )])),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(HashMap::from([
                    ("proj_default".to_string(), EndpointSettings::default()),
                    ("bridge".to_string(), EndpointSettings::default()),
                ])),
                ports: Some(HashMap::from([
                    (
                        "80/tcp".to_string(),
                        Some(vec![binding("0.0.0.0", "32768"), binding("::", "32768")]),
                    ),
                    ("443/tcp".to_string(), None),
                    ("5432/tcp".to_string(), Some(vec![binding("0.0.0.0", "")])),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = container_from_inspect(&detail).unwrap();
        assert_eq!(container.id, "abc123");
        assert_eq!(container.name, "web");
        assert_eq!(container.platform, "docker");
        assert_eq!(container.networks, vec!["bridge", "proj_default"]);
        assert_eq!(
            container.labels.get("svcd.hostname").map(String::as_str),
            Some("web.dev.local")
        );
        assert_eq!(container.port_bindings, BTreeMap::from([(80, vec![32768])]));
    }

    #[test]
    fn requires_an_id() {
        assert_eq!(container_from_inspect(&ContainerInspectResponse::default()), None);
    }
}
