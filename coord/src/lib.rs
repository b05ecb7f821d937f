// Coordination service contract used by the lease layer, plus an in-process
// implementation with sessions, ephemeral nodes and connection events.

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod namespace;

pub use client::{Acl, ConnectionState, CoordinationClient, NodeStat, SessionId};
pub use config::CoordinationConfig;
pub use error::{Error, Result};
pub use memory::{Fault, InMemoryClient, InMemoryCoordinator, Operation};
pub use namespace::{app_namespace, NamespacedClient};
