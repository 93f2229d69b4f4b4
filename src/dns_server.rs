//! DNS server subsystem.
//!
//! This module implements a lightweight DNS server using the
//! [hickory-dns](https://crates.io/crates/hickory-server) library.
//! The server listens on a configurable UDP/TCP socket and
//! answers from the mapping registry:
//!
//! * **Registered hostnames**: `A`/`IN` queries get the configured local
//!   address (the proxy listeners live there); other query types get an
//!   empty `NOERROR` answer.
//! * **Anything else**: `NXDOMAIN`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::A;
use hickory_server::proto::rr::{DNSClass, RData, Record, RecordType};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture};
use log::{debug, error, info};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::DnsConfig;
use crate::registry::MappingRegistry;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the DNS server and run it until `token` is canceled.
pub async fn run_dns_server(
    config: DnsConfig,
    registry: Arc<MappingRegistry>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    info!("DNS server starting on {}", config.bind);

    let handler = RegistryDns::new(registry, config.answer_ip, config.ttl);
    let mut server = ServerFuture::new(handler);

    // Register UDP listener.
    let udp = UdpSocket::bind(config.bind).await?;
    server.register_socket(udp);

    // Register TCP listener.
    let tcp = TcpListener::bind(config.bind).await?;
    server.register_listener(tcp, TCP_TIMEOUT);

    tokio::select! {
        res = server.block_until_done() => res?,
        // Dropping the server aborts its socket tasks.
        _ = token.cancelled() => info!("DNS server on {} shutting down", config.bind),
    }
    Ok(())
}

/// What the registry says about a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    A(Ipv4Addr),
    NoRecords,
    NxDomain,
}

pub struct RegistryDns {
    registry: Arc<MappingRegistry>,
    answer_ip: Ipv4Addr,
    ttl: u32,
}

impl RegistryDns {
    pub fn new(registry: Arc<MappingRegistry>, answer_ip: Ipv4Addr, ttl: u32) -> Self {
        Self {
            registry,
            answer_ip,
            ttl,
        }
    }

    pub async fn answer(&self, name: &str, qtype: RecordType, qclass: DNSClass) -> Answer {
        let host = name.trim_end_matches('.');
        if !self.registry.has_host(host).await {
            return Answer::NxDomain;
        }
        match (qtype, qclass) {
            (RecordType::A | RecordType::ANY, DNSClass::IN) => Answer::A(self.answer_ip),
            _ => Answer::NoRecords,
        }
    }
}

#[async_trait]
impl RequestHandler for RegistryDns {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        let qname = query.name().to_string();

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);

        let answer = self
            .answer(&qname, query.query_type(), query.query_class())
            .await;
        debug!("DNS {} {:?} -> {:?}", qname, query.query_type(), answer);

        let builder = MessageResponseBuilder::from_message_request(request);
        let sent = match answer {
            Answer::A(ip) => {
                let records = [Record::from_rdata(
                    query.name().clone().into(),
                    self.ttl,
                    RData::A(A(ip)),
                )];
                let response = builder.build(
                    header,
                    records.iter(),
                    std::iter::empty(),
                    std::iter::empty(),
                    std::iter::empty(),
                );
                response_handle.send_response(response).await
            }
            Answer::NoRecords => {
                header.set_response_code(ResponseCode::NoError);
                response_handle
                    .send_response(builder.build_no_records(header))
                    .await
            }
            Answer::NxDomain => {
                header.set_response_code(ResponseCode::NXDomain);
                response_handle
                    .send_response(builder.build_no_records(header))
                    .await
            }
        };

        sent.unwrap_or_else(|e| {
            error!("Failed to send DNS response for {}: {}", qname, e);
            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        })
    }
}
