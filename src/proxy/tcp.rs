//! Raw TCP forwarding listener.
//!
//! A TCP connection carries no hostname, so the backend is picked from the
//! mappings exposing this listener's port at accept time; when several
//! hostnames share the port the lexicographically first one wins.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::registry::MappingRegistry;

use super::{accept_backoff, bind, Server};

pub struct TcpProxyServer {
    addr: SocketAddr,
    registry: Arc<MappingRegistry>,
    local_host: String,
}

impl TcpProxyServer {
    pub fn new(addr: SocketAddr, registry: Arc<MappingRegistry>, local_host: String) -> Self {
        Self {
            addr,
            registry,
            local_host,
        }
    }

    async fn backend(&self) -> Option<String> {
        let backends = self.registry.backends_for_port(self.addr.port()).await;
        if backends.len() > 1 {
            debug!(
                "port {} is shared by {} hosts, forwarding to {}",
                self.addr.port(),
                backends.len(),
                backends[0].0
            );
        }
        backends
            .into_iter()
            .next()
            .map(|(_, addr)| addr.dial_target(&self.local_host))
    }
}

#[async_trait]
impl Server for TcpProxyServer {
    fn port(&self) -> u16 {
        self.addr.port()
    }

    async fn serve(&self, token: CancellationToken) -> Result<(), ProxyError> {
        let listener = bind(self.addr).await?;
        info!("TCP proxy listening on {}", self.addr);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (inbound, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("failed to accept tcp connection on {}: {}", self.addr, err);
                            if let Some(pause) = accept_backoff(&err) {
                                tokio::select! {
                                    _ = token.cancelled() => break,
                                    _ = sleep(pause) => {}
                                }
                            }
                            continue;
                        }
                    };
                    let Some(target) = self.backend().await else {
                        warn!("no backend for port {}, dropping {}", self.addr.port(), peer);
                        continue;
                    };
                    connections.spawn(pump(inbound, peer, target, token.clone()));
                }
            }
        }

        drop(listener);
        // Pumps observe the same token and close both halves on their own.
        while connections.join_next().await.is_some() {}
        info!("TCP proxy on {} stopped", self.addr);
        Ok(())
    }
}

async fn pump(mut inbound: TcpStream, peer: SocketAddr, target: String, token: CancellationToken) {
    debug!("start handling the connection from {} to {}", peer, target);

    let mut outbound = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to dial {} for {}: {}", target, peer, err);
            return;
        }
    };

    tokio::select! {
        copied = copy_bidirectional(&mut inbound, &mut outbound) => match copied {
            Ok((up, down)) => debug!("finish handling the connection from {} ({}B up, {}B down)", peer, up, down),
            Err(err) => warn!("failed to copy packets between {} and {}: {}", peer, target, err),
        },
        // Returning drops both streams, which closes the sockets.
        _ = token.cancelled() => debug!("closing the connection from {}", peer),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::addr::Address;
    use crate::types::Mapping;

    async fn echo_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn connect(port: u16) -> TcpStream {
        for _ in 0..100 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                return stream;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("proxy on port {port} never came up");
    }

    #[tokio::test]
    async fn forwards_and_stops_on_cancel() {
        let backend = echo_backend().await;
        let port = free_port().await;
        let registry = Arc::new(MappingRegistry::new());
        registry
            .create(Mapping::new("db.local").with_port(port, Address::local(backend)))
            .await
            .unwrap();

        let server = TcpProxyServer::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            Arc::clone(&registry),
            "127.0.0.1".into(),
        );
        let token = CancellationToken::new();
        let task = {
            let token = token.clone();
            tokio::spawn(async move { server.serve(token).await })
        };

        let mut stream = connect(port).await;
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        token.cancel();
        timeout(Duration::from_secs(1), task)
            .await
            .expect("listener should stop")
            .unwrap()
            .unwrap();

        // The open connection was closed and the port no longer accepts.
        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(1), stream.read_to_end(&mut rest))
            .await
            .expect("connection should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = TcpProxyServer::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            Arc::new(MappingRegistry::new()),
            "127.0.0.1".into(),
        );

        let err = server.serve(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { port: p, .. } if p == port));
    }
}
