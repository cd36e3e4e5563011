//! Ceph Orchestrator Core
//!
//! A Kubernetes-native orchestrator managing the lifecycle of a Ceph storage
//! cluster: hardware inventory, leader-elected orchestration over a shared
//! state store, OSD provisioning and removal, encryption key management, and
//! pool mirroring plumbing.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         Orchestrator (leader)                      │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌──────────────────────┐  │
//! │  │   Refresh    │  │   Agent Trigger  │  │   Peer Pool Mapper   │  │
//! │  │   Coalescer  │  │   / Completion   │  │   (mirroring)        │  │
//! │  └──────┬───────┘  └────────┬─────────┘  └──────────────────────┘  │
//! │         └───────────────────┤                                      │
//! │                   ┌─────────┴──────────┐                           │
//! │                   │  Orchestration     │                           │
//! │                   │  State Store (KV)  │                           │
//! │                   └─────────┬──────────┘                           │
//! ├─────────────────────────────┼──────────────────────────────────────┤
//! │                     Per-node agents                                │
//! │  ┌──────────────┐  ┌────────┴─────────┐  ┌──────────────────────┐  │
//! │  │  Inventory   │  │  OSD Provision   │  │   OSD Removal /      │  │
//! │  │  Probe       │  │  Engine          │  │   Replacement        │  │
//! │  └──────────────┘  └──────────────────┘  └──────────────────────┘  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`orchestration`]: state store, lease/leader election, event bus,
//!   refresh coalescing, agent triggering
//! - [`inventory`]: node hardware discovery
//! - [`osd`]: OSD provisioning, configuration, and removal
//! - [`kms`]: key management adapters and LUKS key rotation
//! - [`peermap`]: mirror peer pool ID mapping
//! - [`crd`]: declarative custom resources
//! - [`ceph`]: mon command client
//! - [`webhook`]: validating admission endpoint
//! - [`error`]: error types and requeue classification

pub mod ceph;
pub mod crd;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod kms;
pub mod orchestration;
pub mod osd;
pub mod peermap;
pub mod webhook;

// Re-export commonly used types
pub use ceph::{ClusterInfo, MonClient};
pub use crd::{
    CephBlockPool, CephBlockPoolSpec, CephBlockPoolStatus, CephStorageCluster,
    CephStorageClusterSpec, CephStorageClusterStatus, ClusterCondition, ConditionType,
};
pub use error::{Error, ErrorAction, Result};
pub use exec::{CommandExecutor, Executor};
pub use inventory::{DeviceDescriptor, InventoryProbe, NodeConfig, ProbeConfig};
pub use kms::{new_kms, Kms, KmsConfig};
pub use orchestration::{
    ClusterMember, EventBus, KvStore, MemberConfig, MemoryKvStore, OrchestrationStatus,
    RefreshCoalescer,
};
pub use osd::{OsdAgent, OsdAgentConfig, OsdRemover, RemovalOptions, StorageSelection};
pub use peermap::{decode_peer_token, PeerIdMappings, PeerPoolMapper};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
