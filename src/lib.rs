#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod leases;
pub mod pool;

pub mod test_utils;

pub use cli::{Cli, Commands};
pub use cluster::{Cluster, ClusterChanges, ClusterSnapshot, FakeCluster, Member};
pub use config::LeaseManagerConfig;
pub use error::{Error, Result};
pub use leases::{Lease, LeaseManager, LeaseStatus, Lifecycle};
