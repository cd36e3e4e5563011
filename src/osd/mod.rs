//! OSD Lifecycle
//!
//! Provisioning, configuration, and removal of object storage daemons on a
//! node: device selection, `ceph-volume` orchestration, the persisted
//! partition scheme, and the guarded removal sequence.

pub mod agent;
pub mod config;
pub mod mapping;
pub mod remove;
pub mod scheme;
pub mod volume;

pub use agent::{DeviceSource, OsdAgent, OsdAgentConfig};
pub use mapping::{compute_device_mapping, DeviceOsdMapping, StorageSelection};
pub use remove::{KubeDaemonOps, OsdRemover, RemovalOptions};
pub use scheme::{PartitionScheme, StoreType};
