//! Storage daemon integration: cluster runtime info and mon commands.

pub mod client;
pub mod context;

pub use client::{crush_weight, MonClient, OsdDump};
pub use context::ClusterInfo;
