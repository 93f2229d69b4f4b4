//! Wires every subsystem around one registry.

use std::sync::Arc;

use anyhow::anyhow;
use log::{error, info};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::run_api_server;
use crate::config::Config;
use crate::dns_server::run_dns_server;
use crate::proxy::{ProxyManager, ProxyServerFactory};
use crate::registry::MappingRegistry;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::watcher::ContainerWatcher;

/// Runs the daemon until `token` is canceled or a subsystem fails.
pub async fn run(config: Config, token: CancellationToken) -> anyhow::Result<()> {
    let registry = Arc::new(MappingRegistry::with_event_buffer(
        config.registry.event_buffer,
    ));
    start(config, registry, token).await.wait().await
}

/// Running subsystems sharing one registry.
///
/// Subsystems share a child token: the first failure cancels the others and
/// is returned by [`Subsystems::wait`] once they have all stopped.
pub struct Subsystems {
    tasks: JoinSet<(&'static str, anyhow::Result<()>)>,
    group: CancellationToken,
}

/// Starts every subsystem around `registry`.
///
/// The proxy manager is subscribed before this returns, so mappings the
/// caller creates afterwards always reach it.
pub async fn start(
    config: Config,
    registry: Arc<MappingRegistry>,
    token: CancellationToken,
) -> Subsystems {
    let group = token.child_token();
    let mut tasks: JoinSet<(&'static str, anyhow::Result<()>)> = JoinSet::new();

    // Subscribe before any producer runs.
    let factory = Arc::new(ProxyServerFactory::new(Arc::clone(&registry), &config.proxy));
    let manager = ProxyManager::new(Arc::clone(&registry), factory);
    let subscription = registry.listen_event(group.child_token()).await;
    {
        let token = group.clone();
        tasks.spawn(async move {
            let res = manager.run(subscription, token).await;
            ("proxy manager", res.map_err(Into::into))
        });
    }

    {
        let registry = Arc::clone(&registry);
        let token = group.clone();
        let dns = config.dns.clone();
        tasks.spawn(async move { ("DNS server", run_dns_server(dns, registry, token).await) });
    }

    {
        let registry = Arc::clone(&registry);
        let token = group.clone();
        let api = config.api.clone();
        tasks.spawn(async move { ("admin API", run_api_server(api, registry, token).await) });
    }

    if config.docker.enabled {
        let runtimes: Vec<Arc<dyn ContainerRuntime>> = vec![Arc::new(DockerRuntime::new())];
        let watcher = ContainerWatcher::new(Arc::clone(&registry), runtimes, &config.docker);
        let token = group.clone();
        tasks.spawn(async move { ("container watcher", watcher.watch(token).await) });
    }

    info!("svcd started");
    Subsystems { tasks, group }
}

impl Subsystems {
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let (name, res) = match joined {
                Ok(done) => done,
                Err(e) => ("subsystem", Err(anyhow!("task failed: {}", e))),
            };
            match res {
                Ok(()) => info!("{} stopped", name),
                Err(e) => {
                    error!("{} failed: {:#}", name, e);
                    self.group.cancel();
                    if first_error.is_none() {
                        first_error = Some(e.context(format!("{} failed", name)));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
