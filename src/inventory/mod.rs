//! Node hardware inventory: device discovery, descriptors, node records.

pub mod device;
pub mod node;
pub mod probe;

pub use device::{DeviceDescriptor, DeviceType};
pub use node::NodeConfig;
pub use probe::{InventoryProbe, ProbeConfig};
