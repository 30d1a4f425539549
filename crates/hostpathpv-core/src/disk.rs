//! Node quota disk accounting.
//!
//! Node agents publish their quota disks under
//! [`NODE_DISK_QUOTA_INFO`]. The only field this tool writes is the
//! administrative disabled list kept under [`NODE_DISABLED_DISKS`].

use crate::annotations::{NODE_DISABLED_DISKS, NODE_DISK_QUOTA_INFO};
use crate::error::{HostpathError, Result};
use crate::paths;
use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};

/// Capacity and reservations of one quota disk
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskQuota {
    #[serde(default)]
    pub mount_path: String,
    #[serde(default)]
    pub capacity: i64,
    #[serde(default)]
    pub keep_quota: i64,
    #[serde(default)]
    pub none_quota: i64,
    #[serde(default)]
    pub share_quota: i64,
    #[serde(default)]
    pub disabled: bool,
}

impl DiskQuota {
    /// Bytes not yet reserved by any volume
    pub fn free_bytes(&self) -> i64 {
        self.capacity - self.keep_quota - self.none_quota - self.share_quota
    }
}

/// Decoded quota disks of a node, with the disabled list folded in
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeDiskQuota(pub Vec<DiskQuota>);

impl NodeDiskQuota {
    pub fn decode(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::default());
        }
        serde_json::from_str(trimmed)
            .map_err(|e| HostpathError::decode_error("node disk quota", e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| HostpathError::encode_error("node disk quota", e.to_string()))
    }

    /// Read a node's quota disks.
    ///
    /// A disk counts as disabled when its own flag is set or its path is in
    /// the node's disabled list. A malformed annotation is logged and read
    /// as "no quota disks".
    pub fn from_node(node: &Node) -> Self {
        let raw = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NODE_DISK_QUOTA_INFO))
            .map(String::as_str)
            .unwrap_or("");

        let mut quota = match Self::decode(raw) {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(
                    node = node.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "Ignoring malformed disk quota annotation"
                );
                Self::default()
            }
        };

        let disabled = disabled_disks(node);
        for disk in quota.0.iter_mut() {
            if disabled.iter().any(|d| paths::same(d, &disk.mount_path)) {
                disk.disabled = true;
            }
        }
        quota
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn disks(&self) -> impl Iterator<Item = &DiskQuota> {
        self.0.iter()
    }

    /// Disk whose mount path equals `path`
    pub fn find_disk(&self, path: &str) -> Option<&DiskQuota> {
        self.0.iter().find(|d| paths::same(&d.mount_path, path))
    }

    /// Disk that holds `path`
    pub fn disk_containing(&self, path: &str) -> Option<&DiskQuota> {
        self.0.iter().find(|d| paths::is_under(path, &d.mount_path))
    }
}

/// Cleaned entries of the node's disabled-disk list
pub fn disabled_disks(node: &Node) -> Vec<String> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(NODE_DISABLED_DISKS))
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(paths::clean)
                .collect()
        })
        .unwrap_or_default()
}

/// Add or remove `disk` from the node's disabled list.
///
/// Returns whether the node object changed. The annotation is only written
/// when it does.
pub fn set_disk_disabled(node: &mut Node, disk: &str, disable: bool) -> Result<bool> {
    let node_name = node.metadata.name.clone().unwrap_or_default();
    let quota = NodeDiskQuota::from_node(node);
    let Some(current) = quota.find_disk(disk) else {
        return Err(HostpathError::unknown_disk(node_name, paths::clean(disk)));
    };
    if current.disabled == disable {
        return Ok(false);
    }

    let disk = paths::clean(disk);
    let mut list = disabled_disks(node);
    let listed = list.iter().any(|d| *d == disk);
    match (disable, listed) {
        (true, true) | (false, false) => return Ok(false),
        (true, false) => list.push(disk),
        (false, true) => list.retain(|d| *d != disk),
    }

    node.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(NODE_DISABLED_DISKS.to_string(), list.join(","));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node_with(info: &str, disabled: Option<&str>) -> Node {
        let mut annotations = BTreeMap::new();
        annotations.insert(NODE_DISK_QUOTA_INFO.to_string(), info.to_string());
        if let Some(list) = disabled {
            annotations.insert(NODE_DISABLED_DISKS.to_string(), list.to_string());
        }
        let mut node = Node::default();
        node.metadata.name = Some("n1".to_string());
        node.metadata.annotations = Some(annotations);
        node
    }

    const INFO: &str = r#"[{"mountPath":"/d1","capacity":1000,"keepQuota":100,"noneQuota":50,"shareQuota":25,"disabled":false},{"mountPath":"/d2","capacity":500}]"#;

    #[test]
    fn test_decode_and_free_bytes() {
        let quota = NodeDiskQuota::from_node(&node_with(INFO, None));
        assert_eq!(quota.0.len(), 2);
        assert_eq!(quota.find_disk("/d1/").unwrap().free_bytes(), 825);
        assert_eq!(quota.find_disk("/d2").unwrap().free_bytes(), 500);
        assert!(quota.find_disk("/d3").is_none());
    }

    #[test]
    fn test_disk_containing() {
        let quota = NodeDiskQuota::from_node(&node_with(INFO, None));
        assert_eq!(quota.disk_containing("/d1/a").unwrap().mount_path, "/d1");
        assert!(quota.disk_containing("/d10/a").is_none());
    }

    #[test]
    fn test_disabled_list_merges() {
        let quota = NodeDiskQuota::from_node(&node_with(INFO, Some(" /d2/ ,")));
        assert!(!quota.find_disk("/d1").unwrap().disabled);
        assert!(quota.find_disk("/d2").unwrap().disabled);
    }

    #[test]
    fn test_malformed_annotation_means_no_disks() {
        let quota = NodeDiskQuota::from_node(&node_with("{oops", None));
        assert!(quota.is_empty());
    }

    #[test]
    fn test_set_disk_disabled() {
        let mut node = node_with(INFO, None);
        assert!(set_disk_disabled(&mut node, "/d2", true).unwrap());
        assert_eq!(disabled_disks(&node), vec!["/d2".to_string()]);

        // already disabled
        assert!(!set_disk_disabled(&mut node, "/d2/", true).unwrap());

        assert!(set_disk_disabled(&mut node, "/d2", false).unwrap());
        assert!(disabled_disks(&node).is_empty());
    }

    #[test]
    fn test_set_disk_disabled_unknown_disk() {
        let mut node = node_with(INFO, None);
        let before = node.clone();
        let err = set_disk_disabled(&mut node, "/nope", true).unwrap_err();
        assert!(matches!(err, HostpathError::UnknownDisk { .. }));
        assert_eq!(node, before);
    }
}
