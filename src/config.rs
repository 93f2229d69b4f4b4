use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_EVENT_BUFFER;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub dns: DnsConfig,
    pub api: ApiConfig,
    pub proxy: ProxyConfig,
    pub docker: DockerConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsConfig {
    pub bind: SocketAddr,
    /// Address every registered hostname resolves to.
    pub answer_ip: Ipv4Addr,
    pub ttl: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 53)),
            answer_ip: Ipv4Addr::LOCALHOST,
            ttl: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: SocketAddr,
    /// Virtual host the API registers for itself; empty disables it.
    pub hostname: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            hostname: "svcd.services.local".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_ip: IpAddr,
    /// Exposed ports forwarded as raw TCP instead of HTTP.
    pub tcp_ports: Vec<u16>,
    /// Host dialed for backends registered without one.
    pub local_host: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_ports: Vec::new(),
            local_host: "127.0.0.1".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enabled: bool,
    pub tld: String,
    /// Container label holding an extra hostname.
    pub hostname_label: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tld: "services.local".into(),
            hostname_label: "svcd.hostname".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-subscriber event channel capacity.
    pub event_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl Config {
    /// Defaults, then `svcd.toml`, `svcd.json`, then `SVCD_*` variables
    /// (`SVCD_DNS__BIND=127.0.0.1:5353`).
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("svcd.toml"))
            .merge(Json::file("svcd.json"))
            .merge(Env::prefixed("SVCD_").split("__"))
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.docker.tld = config.docker.tld.trim_matches('.').to_ascii_lowercase();
        if config.docker.enabled && config.docker.tld.is_empty() {
            anyhow::bail!("docker.tld must not be empty");
        }
        if config.registry.event_buffer == 0 {
            anyhow::bail!("registry.event_buffer must be at least 1");
        }

        Ok(config)
    }
}
