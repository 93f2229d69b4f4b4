//! Per-port proxy listeners and the manager that starts and stops them.
//!
//! Every exposed port with at least one live mapping gets exactly one
//! listener. Ports listed in `proxy.tcp_ports` are forwarded as raw TCP;
//! every other port is an HTTP reverse proxy routing on the `Host` header.

pub mod http;
pub mod manager;
pub mod tcp;

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::registry::MappingRegistry;

pub use http::HttpProxyServer;
pub use manager::ProxyManager;
pub use tcp::TcpProxyServer;

/// A listener bound to one exposed port.
#[async_trait]
pub trait Server: Send + Sync {
    fn port(&self) -> u16;

    /// Binds the port and serves until `token` is canceled.
    ///
    /// Must close the listening socket and stop in-flight connections
    /// promptly once `token` fires.
    async fn serve(&self, token: CancellationToken) -> Result<(), ProxyError>;
}

/// Builds the listener for an exposed port.
pub trait ServerFactory: Send + Sync {
    fn create_server(&self, port: u16) -> Box<dyn Server>;
}

/// Default factory: HTTP reverse proxy, or raw TCP for configured ports.
pub struct ProxyServerFactory {
    registry: Arc<MappingRegistry>,
    bind_ip: IpAddr,
    local_host: String,
    tcp_ports: HashSet<u16>,
}

impl ProxyServerFactory {
    pub fn new(registry: Arc<MappingRegistry>, config: &ProxyConfig) -> Self {
        Self {
            registry,
            bind_ip: config.bind_ip,
            local_host: config.local_host.clone(),
            tcp_ports: config.tcp_ports.iter().copied().collect(),
        }
    }
}

impl ServerFactory for ProxyServerFactory {
    fn create_server(&self, port: u16) -> Box<dyn Server> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let registry = Arc::clone(&self.registry);
        if self.tcp_ports.contains(&port) {
            Box::new(TcpProxyServer::new(addr, registry, self.local_host.clone()))
        } else {
            Box::new(HttpProxyServer::new(addr, registry, self.local_host.clone()))
        }
    }
}

pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind {
            port: addr.port(),
            source,
        })
}

/// Pause before accepting again after an error that is not tied to the one
/// connection being accepted, such as running out of file descriptors.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait before the next `accept` after `err`.
///
/// Accept errors never stop a bound listener: per-connection failures retry
/// at once, anything else (EMFILE, ENFILE, ENOBUFS, ENOMEM, ...) backs off.
pub(crate) fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}
