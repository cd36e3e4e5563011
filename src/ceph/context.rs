//! Cluster Runtime Info
//!
//! The derived per-cluster handle: FSID, monitor endpoints, admin
//! credentials, namespace, and a cancellable context. Never persisted;
//! rebuilt at startup from declared state and secrets.

use crate::error::{Error, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Runtime handle for one storage cluster.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// Immutable cluster identifier.
    pub fsid: String,
    /// Cluster name, also the CLI `--cluster` argument.
    pub name: String,
    /// Owning namespace in the control plane.
    pub namespace: String,
    /// Monitor endpoints, e.g. `v2:10.0.0.1:3300`.
    pub mon_endpoints: Vec<String>,
    /// Path to the rendered cluster config file.
    pub conf_path: PathBuf,
    /// Path to the admin keyring.
    pub keyring_path: PathBuf,
    /// Cancelled when the cluster is torn down or leadership is lost.
    pub cancel: CancellationToken,
}

impl ClusterInfo {
    pub fn new(
        fsid: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let conf_path = PathBuf::from(format!("/etc/ceph/{name}.conf"));
        Self {
            fsid: fsid.into(),
            namespace: namespace.into(),
            mon_endpoints: Vec::new(),
            keyring_path: conf_path.with_extension("keyring"),
            conf_path,
            name,
            cancel: CancellationToken::new(),
        }
    }

    /// Mon host string for config files and CLI sessions.
    pub fn mon_host(&self) -> String {
        self.mon_endpoints.join(",")
    }

    /// Arguments identifying this cluster on every CLI invocation.
    pub fn cli_args(&self) -> Vec<String> {
        vec![
            format!("--cluster={}", self.name),
            format!("--conf={}", self.conf_path.display()),
            format!("--keyring={}", self.keyring_path.display()),
        ]
    }

    /// A registered cluster must know who and where it is before any
    /// daemon-facing operation runs.
    pub fn validate(&self) -> Result<()> {
        if self.fsid.is_empty() {
            return Err(Error::Validation("cluster fsid is empty".into()));
        }
        if self.name.is_empty() {
            return Err(Error::Validation("cluster name is empty".into()));
        }
        if self.mon_endpoints.is_empty() {
            return Err(Error::Validation(format!(
                "cluster {} has no monitor endpoints",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        let mut info = ClusterInfo::new("9f52f713", "ceph", "rook-ceph");
        assert!(info.validate().is_err());

        info.mon_endpoints = vec!["v2:10.0.0.1:3300".into(), "v2:10.0.0.2:3300".into()];
        assert!(info.validate().is_ok());
        assert_eq!(info.mon_host(), "v2:10.0.0.1:3300,v2:10.0.0.2:3300");
    }

    #[test]
    fn test_cli_args_identify_cluster() {
        let info = ClusterInfo::new("9f52f713", "ceph", "rook-ceph");
        let args = info.cli_args();
        assert!(args.contains(&"--cluster=ceph".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--conf=")));
    }
}
