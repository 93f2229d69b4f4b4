//! Error types for the registry, the proxy listeners and address parsing.
//!
//! Application edges (the binary, config loading, the Docker runtime) use
//! `anyhow`; everything callers are expected to match on lives here.

use std::io;

use thiserror::Error;

/// Failure to parse an address from user input or a wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address format: {input:?}")]
pub struct AddrParseError {
    pub input: String,
}

impl AddrParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// Errors returned synchronously by registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The hostname is already owned by another registration.
    #[error("{host} has already been registered")]
    AlreadyRegistered { host: String },

    /// A mapping must carry at least one exposed port.
    #[error("mapping for {host} has no ports")]
    EmptyMapping { host: String },

    /// The mapping holds an unusable hostname or backend address.
    #[error("invalid mapping: {0}")]
    InvalidMapping(String),
}

impl RegistryError {
    /// Returns `true` for the hostname conflict case.
    #[must_use]
    pub fn is_already_registered(&self) -> bool {
        matches!(self, Self::AlreadyRegistered { .. })
    }
}

/// Cause delivered on a subscription's error channel when it is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionClosed {
    /// The subscriber's cancellation token fired.
    #[error("subscription canceled")]
    Canceled,

    /// The event receiver was dropped by the subscriber.
    #[error("event receiver dropped")]
    ReceiverDropped,

    /// The registry went away while the subscription was live.
    #[error("registry dropped")]
    RegistryDropped,
}

/// Errors raised by the proxy listener manager and its listeners.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A listener could not acquire its port.
    #[error("failed to bind proxy listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The manager's event subscription ended underneath it.
    #[error("mapping event subscription closed: {0}")]
    Subscription(#[from] SubscriptionClosed),
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::AlreadyRegistered {
            host: "svc1.local".to_string(),
        };
        assert_eq!(err.to_string(), "svc1.local has already been registered");
        assert!(err.is_already_registered());

        let err = ProxyError::Bind {
            port: 8080,
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert!(err.to_string().contains("8080"));
    }

    #[test]
    fn test_error_from_subscription() {
        let err: ProxyError = SubscriptionClosed::Canceled.into();
        assert!(matches!(
            err,
            ProxyError::Subscription(SubscriptionClosed::Canceled)
        ));
    }
}
