//! # svcd
//!
//! A local service-discovery and reverse-proxy daemon. Developers reach
//! services running on their machine, or in local containers, through stable
//! hostnames such as `myapp.services.local` instead of port numbers.
//!
//! ## Architecture
//!
//! ```text
//!  container watcher ─┐
//!  command runner ────┤                     ┌─> proxy manager ─> per-port listeners
//!  admin API ─────────┼─> MappingRegistry ──┤        (HTTP by Host header, or raw TCP)
//!                     │   (events)          └─> any other subscriber
//!                     │
//!  DNS responder ─────┴── lookups at query time
//! ```
//!
//! * [`registry::MappingRegistry`] owns the hostname → backend mappings and
//!   notifies subscribers of every create and destroy.
//! * [`proxy::ProxyManager`] keeps exactly one listener per exposed port that
//!   some live mapping references.
//! * [`dns_server`] answers `A` queries for registered hostnames.
//! * [`watcher::ContainerWatcher`] registers running containers, and
//!   [`runner::CommandRunner`] registers a local command for as long as it runs.
//! * [`api`] exposes the registry over HTTP.
//! * [`daemon::run`] wires all of the above together.

pub mod addr;
pub mod api;
pub mod config;
pub mod daemon;
pub mod dns_server;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod types;
pub mod watcher;

pub use addr::Address;
pub use config::Config;
pub use error::{ProxyError, RegistryError, SubscriptionClosed};
pub use registry::MappingRegistry;
pub use types::{Mapping, MappingEvent};
