//! Cross-cluster orchestration: state store, leader election, event fan-out.
//!
//! The leader/member state machine holds the cluster lease and drives the
//! refresh coalescer, which loads inventory, reads declared state from the
//! store, and fans per-node work out through the agent trigger. Per-node
//! progress flows back through the same store.

pub mod events;
pub mod lease;
pub mod member;
pub mod refresher;
pub mod status;
pub mod store;
pub mod trigger;

pub use events::{EventBus, OrchestrationEvent};
pub use lease::{Lease, LeaseManager};
pub use member::{ClusterMember, Leader, MemberConfig};
pub use refresher::{InventoryLoader, LeadershipProbe, RefreshCoalescer};
pub use status::{OrchestrationStatus, ProvisioningPhase};
pub use store::{ConfigMapKvStore, KvStore, KvValue, MemoryKvStore};
pub use trigger::{trigger_agents_and_wait, CompletionResult};
