//! Custom Resource Definitions
//!
//! The declarative surface of the orchestrator:
//! - CephStorageCluster: cluster-wide storage, mon, network, security,
//!   and mirroring declarations
//! - CephBlockPool: per-pool protection scheme and mirroring peers

pub mod cluster;
pub mod conditions;
pub mod pool;

pub use cluster::*;
pub use conditions::*;
pub use pool::*;
