//! Starts and stops per-port listeners in response to mapping events.
//!
//! The manager drains its registry subscription from a single loop, so the
//! port table is only ever mutated from that loop and every
//! increment/decrement/cancel for a port happens in one critical section.
//! Listener tasks themselves run detached and report fatal errors back to
//! the loop, which then tears every listener down and returns the error.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, SubscriptionClosed};
use crate::registry::{MappingRegistry, Subscription};
use crate::types::{Mapping, MappingEvent};

use super::ServerFactory;

struct PortListener {
    count: usize,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ProxyManager {
    registry: Arc<MappingRegistry>,
    factory: Arc<dyn ServerFactory>,
    ports: Mutex<HashMap<u16, PortListener>>,
}

impl ProxyManager {
    pub fn new(registry: Arc<MappingRegistry>, factory: Arc<dyn ServerFactory>) -> Self {
        Self {
            registry,
            factory,
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to the registry and serves until `token` is canceled or a
    /// listener fails.
    pub async fn serve(&self, token: CancellationToken) -> Result<(), ProxyError> {
        let subscription = self.registry.listen_event(token.child_token()).await;
        self.run(subscription, token).await
    }

    /// Serves from an existing subscription.
    ///
    /// Lets the caller subscribe before any producer starts, so no event is
    /// missed between spawning the manager and its first poll.
    pub async fn run(
        &self,
        mut subscription: Subscription,
        token: CancellationToken,
    ) -> Result<(), ProxyError> {
        debug!("start listening mapping events");
        let group = token.child_token();
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel::<ProxyError>();
        let mut draining: HashMap<u16, JoinHandle<()>> = HashMap::new();

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                Some(err) = failures_rx.recv() => {
                    error!("proxy listener failed: {}", err);
                    break Err(err);
                }
                event = subscription.events.recv() => match event {
                    Some(MappingEvent::Created(mapping)) => {
                        self.handle_created(&mapping, &group, &failures_tx, &mut draining)
                            .await;
                    }
                    Some(MappingEvent::Destroyed(mapping)) => {
                        self.handle_destroyed(&mapping, &mut draining).await;
                    }
                    None => {
                        if token.is_cancelled() {
                            break Ok(());
                        }
                        let cause = (&mut subscription.closed)
                            .await
                            .unwrap_or(SubscriptionClosed::RegistryDropped);
                        break Err(ProxyError::Subscription(cause));
                    }
                },
            }
            draining.retain(|_, task| !task.is_finished());
        };

        group.cancel();
        self.shutdown(draining).await;
        result
    }

    /// Ports with a live listener and their reference counts.
    pub async fn listening_ports(&self) -> BTreeMap<u16, usize> {
        self.ports
            .lock()
            .await
            .iter()
            .map(|(port, listener)| (*port, listener.count))
            .collect()
    }

    async fn handle_created(
        &self,
        mapping: &Mapping,
        group: &CancellationToken,
        failures: &mpsc::UnboundedSender<ProxyError>,
        draining: &mut HashMap<u16, JoinHandle<()>>,
    ) {
        for port in mapping.ports() {
            if let Some(listener) = self.ports.lock().await.get_mut(&port) {
                listener.count += 1;
                debug!(
                    "port {} now referenced by {} mappings ({} joined)",
                    port, listener.count, mapping.host
                );
                continue;
            }

            // Start only after the previous listener on this port has fully
            // released the socket.
            if let Some(previous) = draining.remove(&port) {
                debug!("waiting for the previous listener on port {} to stop", port);
                let _ = previous.await;
            }

            let listener_token = group.child_token();
            let server = self.factory.create_server(port);
            let failures = failures.clone();
            let serve_token = listener_token.clone();
            let task = tokio::spawn(async move {
                if let Err(err) = server.serve(serve_token).await {
                    let _ = failures.send(err);
                }
            });

            info!("proxy listener for port {} started ({})", port, mapping.host);
            self.ports.lock().await.insert(
                port,
                PortListener {
                    count: 1,
                    token: listener_token,
                    task,
                },
            );
        }
    }

    async fn handle_destroyed(
        &self,
        mapping: &Mapping,
        draining: &mut HashMap<u16, JoinHandle<()>>,
    ) {
        let mut ports = self.ports.lock().await;
        for port in mapping.ports() {
            let Entry::Occupied(mut entry) = ports.entry(port) else {
                warn!(
                    "destroyed mapping {} references port {} without a listener",
                    mapping.host, port
                );
                continue;
            };

            entry.get_mut().count -= 1;
            if entry.get().count > 0 {
                debug!(
                    "port {} still referenced by {} mappings ({} left)",
                    port,
                    entry.get().count,
                    mapping.host
                );
                continue;
            }

            let listener = entry.remove();
            listener.token.cancel();
            draining.insert(port, listener.task);
            info!("proxy listener for port {} stopping ({})", port, mapping.host);
        }
    }

    async fn shutdown(&self, draining: HashMap<u16, JoinHandle<()>>) {
        let live: Vec<_> = self.ports.lock().await.drain().collect();
        for (port, listener) in live {
            listener.token.cancel();
            let _ = listener.task.await;
            debug!("proxy listener for port {} stopped", port);
        }
        for (_, task) in draining {
            let _ = task.await;
        }
        debug!("stop listening mapping events");
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::addr::Address;
    use crate::proxy::Server;

    #[derive(Default)]
    struct Counters {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct RecordingServer {
        port: u16,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Server for RecordingServer {
        fn port(&self) -> u16 {
            self.port
        }

        async fn serve(&self, token: CancellationToken) -> Result<(), ProxyError> {
            if self.port == 1 {
                return Err(ProxyError::Bind {
                    port: 1,
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            token.cancelled().await;
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RecordingFactory(Arc<Counters>);

    impl ServerFactory for RecordingFactory {
        fn create_server(&self, port: u16) -> Box<dyn Server> {
            Box::new(RecordingServer {
                port,
                counters: Arc::clone(&self.0),
            })
        }
    }

    struct Harness {
        registry: Arc<MappingRegistry>,
        manager: Arc<ProxyManager>,
        counters: Arc<Counters>,
        token: CancellationToken,
        task: JoinHandle<Result<(), ProxyError>>,
    }

    async fn start() -> Harness {
        let registry = Arc::new(MappingRegistry::new());
        let counters = Arc::new(Counters::default());
        let manager = Arc::new(ProxyManager::new(
            Arc::clone(&registry),
            Arc::new(RecordingFactory(Arc::clone(&counters))),
        ));
        let token = CancellationToken::new();
        let subscription = registry.listen_event(token.child_token()).await;
        let task = {
            let manager = Arc::clone(&manager);
            let token = token.clone();
            tokio::spawn(async move { manager.run(subscription, token).await })
        };
        Harness {
            registry,
            manager,
            counters,
            token,
            task,
        }
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn ports_eventually(manager: &ProxyManager, want: &[(u16, usize)]) {
        let want: BTreeMap<u16, usize> = want.iter().copied().collect();
        for _ in 0..200 {
            if manager.listening_ports().await == want {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.listening_ports().await, want);
    }

    fn mapping(host: &str, port: u16) -> Mapping {
        Mapping::new(host).with_port(port, Address::local(9000))
    }

    #[tokio::test]
    async fn shared_port_is_refcounted() {
        let h = start().await;

        h.registry.create(mapping("a.local", 8080)).await.unwrap();
        h.registry.create(mapping("b.local", 8080)).await.unwrap();
        ports_eventually(&h.manager, &[(8080, 2)]).await;
        assert_eq!(h.counters.started.load(Ordering::SeqCst), 1);

        h.registry.delete_by_host("a.local").await;
        ports_eventually(&h.manager, &[(8080, 1)]).await;
        assert_eq!(h.counters.stopped.load(Ordering::SeqCst), 0);

        h.registry.delete_by_host("b.local").await;
        ports_eventually(&h.manager, &[]).await;
        let counters = Arc::clone(&h.counters);
        eventually("listener stop", || counters.stopped.load(Ordering::SeqCst) == 1).await;

        h.token.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reused_port_restarts_after_full_stop() {
        let h = start().await;

        h.registry.create(mapping("a.local", 8080)).await.unwrap();
        h.registry.delete_by_host("a.local").await;
        h.registry.create(mapping("b.local", 8080)).await.unwrap();

        ports_eventually(&h.manager, &[(8080, 1)]).await;
        let counters = Arc::clone(&h.counters);
        eventually("second start", || counters.started.load(Ordering::SeqCst) == 2).await;
        assert_eq!(h.counters.stopped.load(Ordering::SeqCst), 1);

        h.token.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn multi_port_mapping_starts_each_port() {
        let h = start().await;

        let m = Mapping::new("db.local")
            .with_port(80, Address::local(9000))
            .with_port(5432, Address::local(15432));
        h.registry.create(m).await.unwrap();
        h.registry.create(mapping("web.local", 80)).await.unwrap();
        ports_eventually(&h.manager, &[(80, 2), (5432, 1)]).await;

        h.registry.delete_by_host("db.local").await;
        ports_eventually(&h.manager, &[(80, 1)]).await;

        h.token.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_every_listener() {
        let h = start().await;

        h.registry.create(mapping("a.local", 8080)).await.unwrap();
        h.registry.create(mapping("b.local", 8081)).await.unwrap();
        ports_eventually(&h.manager, &[(8080, 1), (8081, 1)]).await;

        h.token.cancel();
        timeout(Duration::from_secs(1), h.task)
            .await
            .expect("manager should stop")
            .unwrap()
            .unwrap();
        assert_eq!(h.counters.stopped.load(Ordering::SeqCst), 2);
        assert!(h.manager.listening_ports().await.is_empty());
    }

    #[tokio::test]
    async fn bind_failure_fails_the_manager() {
        let h = start().await;

        h.registry.create(mapping("ok.local", 8080)).await.unwrap();
        h.registry.create(mapping("denied.local", 1)).await.unwrap();

        let err = timeout(Duration::from_secs(1), h.task)
            .await
            .expect("manager should fail")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ProxyError::Bind { port: 1, .. }));
        assert!(h.manager.listening_ports().await.is_empty());
    }
}
