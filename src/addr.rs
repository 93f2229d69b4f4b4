//! Host/port endpoint value type.
//!
//! An [`Address`] with an empty host means "the local machine"; the zero
//! address (`Address::default()`) is the "not found" sentinel and is never
//! produced by parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddrParseError;

/// A `host:port` endpoint. Serialized as its string form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// An address on the local machine.
    pub fn local(port: u16) -> Self {
        Self::new(String::new(), port)
    }

    /// A non-zero port is what makes an address usable.
    pub fn is_valid(&self) -> bool {
        self.port != 0
    }

    pub fn is_local(&self) -> bool {
        self.host.is_empty()
    }

    /// `host:port` suitable for dialing, substituting `local_host` when the
    /// host is empty.
    pub fn dial_target(&self, local_host: &str) -> String {
        let host = if self.host.is_empty() {
            local_host
        } else {
            &self.host
        };
        join_host_port(host, self.port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host, self.port))
    }
}

impl FromStr for Address {
    type Err = AddrParseError;

    /// Accepts `9001`, `:9001`, `host:9001`, `10.0.0.1:9001` and `[::1]:9001`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| AddrParseError::new(input))?;
            (host, port)
        } else {
            match s.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => return Err(AddrParseError::new(input)),
                Some((host, port)) => (host, port),
                None => ("", s),
            }
        };

        let port: u16 = port.parse().map_err(|_| AddrParseError::new(input))?;
        if port == 0 {
            return Err(AddrParseError::new(input));
        }

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Address {
    type Error = AddrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

/// Splits a `Host` header value into host and optional port.
///
/// Returns `None` for the port when it is absent; a malformed port yields
/// `Err` so callers can fall back to pass-through.
pub fn split_host_header(value: &str) -> Result<(&str, Option<u16>), AddrParseError> {
    if let Some(rest) = value.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, "")) => Ok((host, None)),
            Some((host, port)) => {
                let port = port
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| AddrParseError::new(value))?;
                Ok((host, Some(port)))
            }
            None => Err(AddrParseError::new(value)),
        };
    }

    match value.split_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| AddrParseError::new(value))?;
            Ok((host, Some(port)))
        }
        None => Ok((value, None)),
    }
}
