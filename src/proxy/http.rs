//! HTTP reverse proxy listener.
//!
//! Requests are routed on their `Host` header: `(host, port or 80)` is
//! resolved through the registry and the request is forwarded to the mapped
//! backend. Hosts the registry does not know are passed through to the
//! original `Host` value unchanged. Protocol upgrades (WebSocket) are
//! spliced through once the backend answers `101`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, info, warn};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::addr::split_host_header;
use crate::error::ProxyError;
use crate::registry::MappingRegistry;

use super::{accept_backoff, bind, Server};

/// Port assumed when the `Host` header carries none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// How long in-flight requests may take to finish once the listener stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type HttpClient = Client<HttpConnector, Incoming>;

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Authority of the mapped backend.
    Mapped(String),
    /// The original `Host` value, for hosts the registry does not know.
    PassThrough(String),
}

impl Target {
    pub fn authority(&self) -> &str {
        match self {
            Self::Mapped(a) | Self::PassThrough(a) => a,
        }
    }
}

/// Rewrites request targets from registry state.
pub struct Director {
    registry: Arc<MappingRegistry>,
    local_host: String,
}

impl Director {
    pub fn new(registry: Arc<MappingRegistry>, local_host: impl Into<String>) -> Self {
        Self {
            registry,
            local_host: local_host.into(),
        }
    }

    pub async fn target(&self, host_header: &str) -> Target {
        if let Ok((host, port)) = split_host_header(host_header) {
            let port = port.unwrap_or(DEFAULT_HTTP_PORT);
            if let Some(addr) = self.registry.map_addr(host, port).await {
                return Target::Mapped(addr.dial_target(&self.local_host));
            }
        }
        Target::PassThrough(host_header.to_string())
    }
}

pub struct HttpProxyServer {
    addr: SocketAddr,
    director: Arc<Director>,
    client: HttpClient,
}

impl HttpProxyServer {
    pub fn new(addr: SocketAddr, registry: Arc<MappingRegistry>, local_host: String) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            addr,
            director: Arc::new(Director::new(registry, local_host)),
            client,
        }
    }
}

#[async_trait]
impl Server for HttpProxyServer {
    fn port(&self) -> u16 {
        self.addr.port()
    }

    async fn serve(&self, token: CancellationToken) -> Result<(), ProxyError> {
        let listener = bind(self.addr).await?;
        info!("HTTP proxy listening on {}", self.addr);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("failed to accept connection on {}: {}", self.addr, err);
                            if let Some(pause) = accept_backoff(&err) {
                                tokio::select! {
                                    _ = token.cancelled() => break,
                                    _ = sleep(pause) => {}
                                }
                            }
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&self.director),
                        self.client.clone(),
                        token.clone(),
                    ));
                }
            }
        }

        drop(listener);
        debug!(
            "HTTP proxy on {} draining {} connections",
            self.addr,
            connections.len()
        );
        while connections.join_next().await.is_some() {}
        info!("HTTP proxy on {} stopped", self.addr);
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    director: Arc<Director>,
    client: HttpClient,
    token: CancellationToken,
) {
    let tunnel_token = token.clone();
    let service = service_fn(move |req| {
        proxy_request(
            req,
            Arc::clone(&director),
            client.clone(),
            peer,
            tunnel_token.clone(),
        )
    });
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = token.cancelled() => {
            conn.as_mut().graceful_shutdown();
            match timeout(DRAIN_TIMEOUT, conn.as_mut()).await {
                Ok(res) => res,
                Err(_) => {
                    warn!("connection from {} did not drain in time", peer);
                    Ok(())
                }
            }
        }
    };

    if let Err(err) = result {
        warn!("error serving connection from {}: {}", peer, err);
    }
}

async fn proxy_request(
    mut req: Request<Incoming>,
    director: Arc<Director>,
    client: HttpClient,
    peer: SocketAddr,
    token: CancellationToken,
) -> Result<Response<ProxyBody>, Infallible> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));
    let Some(host) = host else {
        return Ok(status_response(StatusCode::BAD_REQUEST, "missing Host header"));
    };

    let target = director.target(&host).await;
    if let Target::PassThrough(_) = target {
        debug!("{} is not mapped, passing through", host);
    }

    let path = req
        .uri()
        .path_and_query()
        .map_or("/", |p| p.as_str());
    let uri: Uri = match format!("http://{}{}", target.authority(), path).parse() {
        Ok(uri) => uri,
        Err(err) => {
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                format!("invalid target for {}: {}", host, err),
            ));
        }
    };

    let protocol = upgrade_protocol(req.headers());
    let client_upgrade = protocol.as_ref().map(|_| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    strip_hop_by_hop(&mut parts.headers);
    if let Some(protocol) = &protocol {
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        parts.headers.insert(header::UPGRADE, protocol.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        parts.headers.append("x-forwarded-for", value);
    }

    match client.request(Request::from_parts(parts, body)).await {
        Ok(mut res) => {
            let switching = res.status() == StatusCode::SWITCHING_PROTOCOLS;
            if let Some(client_upgrade) = client_upgrade.filter(|_| switching) {
                let backend_upgrade = hyper::upgrade::on(&mut res);
                tokio::spawn(tunnel(client_upgrade, backend_upgrade, host, token));
                let (parts, body) = res.into_parts();
                return Ok(Response::from_parts(parts, body.boxed()));
            }
            let (mut parts, body) = res.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Err(err) => {
            warn!("proxy error for {} via {}: {}", host, target.authority(), err);
            Ok(status_response(
                StatusCode::BAD_GATEWAY,
                format!("proxy error: {}", err),
            ))
        }
    }
}

/// The requested `Upgrade` protocol, when `Connection` asks for one.
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

/// Splices an upgraded client connection onto the upgraded backend one.
async fn tunnel(client: OnUpgrade, backend: OnUpgrade, host: String, token: CancellationToken) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(upgraded) => upgraded,
        Err(err) => {
            warn!("upgrade for {} failed: {}", host, err);
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);

    tokio::select! {
        copied = copy_bidirectional(&mut client, &mut backend) => match copied {
            Ok((up, down)) => debug!("upgraded connection to {} closed ({}B up, {}B down)", host, up, down),
            Err(err) => debug!("upgraded connection to {} ended: {}", host, err),
        },
        _ = token.cancelled() => debug!("closing upgraded connection to {}", host),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop = [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::UPGRADE,
    ];
    for name in hop_by_hop {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

fn status_response(status: StatusCode, message: impl Into<Bytes>) -> Response<ProxyBody> {
    let body = Full::new(message.into())
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
