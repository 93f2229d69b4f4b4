mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use svcd::config::ProxyConfig;
use svcd::proxy::{ProxyManager, ProxyServerFactory};
use svcd::{Address, Mapping, MappingRegistry};

use common::{can_connect, eventually, free_port};

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

async fn echo_through(port: u16) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn shared_port_listener_follows_last_mapping() {
    let backend = echo_backend().await;
    let port = free_port().await;

    let registry = Arc::new(MappingRegistry::new());
    let config = ProxyConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        tcp_ports: vec![port],
        local_host: "127.0.0.1".into(),
    };
    let factory = Arc::new(ProxyServerFactory::new(Arc::clone(&registry), &config));
    let manager = Arc::new(ProxyManager::new(Arc::clone(&registry), factory));
    let token = CancellationToken::new();
    let subscription = registry.listen_event(token.child_token()).await;
    let task = {
        let manager = Arc::clone(&manager);
        let token = token.clone();
        tokio::spawn(async move { manager.run(subscription, token).await })
    };

    for host in ["a.local", "b.local"] {
        registry
            .create(Mapping::new(host).with_port(port, Address::local(backend)))
            .await
            .unwrap();
    }
    eventually("listener on the shared port", || can_connect(port)).await;
    assert_eq!(manager.listening_ports().await.get(&port), Some(&2));
    echo_through(port).await;

    registry.delete_by_host("a.local").await;
    eventually("refcount drop", || {
        let manager = Arc::clone(&manager);
        async move { manager.listening_ports().await.get(&port) == Some(&1) }
    })
    .await;
    echo_through(port).await;

    registry.delete_by_host("b.local").await;
    eventually("listener stop", || async move { !can_connect(port).await }).await;
    assert!(manager.listening_ports().await.is_empty());

    token.cancel();
    timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
