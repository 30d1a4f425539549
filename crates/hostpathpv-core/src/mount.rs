//! Per-volume mount placement record.
//!
//! The record is stored as JSON under [`crate::annotations::MOUNT_NODE`] and
//! lists, per node, the host paths backing the volume together with the
//! quota and usage figures the node agents last reported.

use crate::annotations::MOUNT_NODE;
use crate::error::{HostpathError, Result};
use crate::paths;
use k8s_openapi::api::core::v1::PersistentVolume;
use serde::{Deserialize, Serialize};

/// Pod that exclusively owns a quota path
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "PodInfoWire", into = "PodInfoWire")]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// On-the-wire form: `{"info": "namespace:name:uid"}`
#[derive(Serialize, Deserialize)]
struct PodInfoWire {
    #[serde(default)]
    info: String,
}

impl From<PodInfoWire> for PodRef {
    fn from(wire: PodInfoWire) -> Self {
        let parts: Vec<&str> = wire.info.split(':').collect();
        match parts.as_slice() {
            [ns, name, uid] => Self {
                namespace: ns.to_string(),
                name: name.to_string(),
                uid: uid.to_string(),
            },
            _ => Self::default(),
        }
    }
}

impl From<PodRef> for PodInfoWire {
    fn from(pod: PodRef) -> Self {
        if pod.namespace.is_empty() && pod.name.is_empty() && pod.uid.is_empty() {
            return Self {
                info: String::new(),
            };
        }
        Self {
            info: format!("{}:{}:{}", pod.namespace, pod.name, pod.uid),
        }
    }
}

impl PodRef {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// `namespace:name`
    pub fn key(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }
}

/// One quota directory on one node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountEntry {
    #[serde(default)]
    pub host_path: String,
    #[serde(rename = "volumeQuotaSize", default)]
    pub quota_size: i64,
    #[serde(rename = "volumeCurrentSize", default)]
    pub current_size: i64,
    #[serde(rename = "volumeCurrentFileNum", default)]
    pub current_file_count: i64,
    #[serde(rename = "podInfo", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<PodRef>,
}

impl MountEntry {
    /// A zero-sized entry not bound to any pod
    pub fn shared(host_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        paths::same(&self.host_path, path)
    }
}

/// All quota directories a volume holds on one node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMounts {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub mount_infos: Vec<MountEntry>,
}

/// Decoded value of the volume mount annotation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountRecord(pub Vec<NodeMounts>);

impl MountRecord {
    /// Decode a raw annotation value; empty input yields an empty record
    pub fn decode(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::default());
        }
        serde_json::from_str(trimmed)
            .map_err(|e| HostpathError::decode_error("volume mount record", e.to_string()))
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| HostpathError::encode_error("volume mount record", e.to_string()))
    }

    /// Read the record from a volume's annotations
    pub fn from_volume(pv: &PersistentVolume) -> Result<Self> {
        let raw = pv
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(MOUNT_NODE))
            .map(String::as_str)
            .unwrap_or("");
        Self::decode(raw)
    }

    /// Encode the record into a volume's annotations
    pub fn write_to(&self, pv: &mut PersistentVolume) -> Result<()> {
        let encoded = self.encode()?;
        pv.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(MOUNT_NODE.to_string(), encoded);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|n| n.mount_infos.is_empty())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeMounts> {
        self.0.iter()
    }

    /// Iterate `(node, entry)` pairs
    pub fn entries(&self) -> impl Iterator<Item = (&str, &MountEntry)> {
        self.0.iter().flat_map(|n| {
            n.mount_infos
                .iter()
                .map(move |e| (n.node_name.as_str(), e))
        })
    }

    pub fn find(&self, node: &str, path: &str) -> Option<&MountEntry> {
        self.0
            .iter()
            .filter(|n| n.node_name == node)
            .flat_map(|n| n.mount_infos.iter())
            .find(|e| e.matches(path))
    }

    /// Record a new shared quota path on `node`
    pub fn add_path(&mut self, node: &str, path: &str) -> Result<()> {
        if self.find(node, path).is_some() {
            return Err(HostpathError::path_exists(node, paths::clean(path)));
        }
        let entry = MountEntry::shared(paths::clean(path));
        match self.0.iter_mut().find(|n| n.node_name == node) {
            Some(group) => group.mount_infos.push(entry),
            None => self.0.push(NodeMounts {
                node_name: node.to_string(),
                mount_infos: vec![entry],
            }),
        }
        Ok(())
    }

    /// Remove entries selected by node and path.
    ///
    /// `None` for node selects every node; `None` for path selects every
    /// path of the selected nodes. Groups left empty are dropped. Returns
    /// the removed entries as `node:path`.
    pub fn remove_paths(&mut self, node: Option<&str>, path: Option<&str>) -> Vec<String> {
        let mut removed = Vec::new();
        for group in self.0.iter_mut() {
            if node.is_some_and(|n| n != group.node_name) {
                continue;
            }
            let node_name = group.node_name.clone();
            group.mount_infos.retain(|entry| {
                let selected = path.is_none_or(|p| entry.matches(p));
                if selected {
                    removed.push(format!("{}:{}", node_name, entry.host_path));
                }
                !selected
            });
        }
        self.0.retain(|g| !g.mount_infos.is_empty());
        removed
    }

    /// Move one entry from `from_node:from_path` to `to_node:to_path`.
    ///
    /// Quota, usage and owner are carried over unchanged. When the source
    /// entry is missing, or the destination is already recorded, the record
    /// is left untouched.
    pub fn repoint(
        &mut self,
        volume: &str,
        from_node: &str,
        from_path: &str,
        to_node: &str,
        to_path: &str,
    ) -> Result<()> {
        let located = self.0.iter().enumerate().find_map(|(gi, group)| {
            if group.node_name != from_node {
                return None;
            }
            group
                .mount_infos
                .iter()
                .position(|e| e.matches(from_path))
                .map(|ei| (gi, ei))
        });

        let Some((gi, ei)) = located else {
            return Err(HostpathError::path_not_found(volume, from_node, from_path));
        };
        let same_entry = from_node == to_node && paths::same(from_path, to_path);
        if !same_entry && self.find(to_node, to_path).is_some() {
            return Err(HostpathError::path_exists(to_node, paths::clean(to_path)));
        }

        let mut entry = self.0[gi].mount_infos.remove(ei);
        if self.0[gi].mount_infos.is_empty() {
            self.0.remove(gi);
        }
        entry.host_path = paths::clean(to_path);

        match self.0.iter_mut().find(|n| n.node_name == to_node) {
            Some(group) => group.mount_infos.push(entry),
            None => self.0.push(NodeMounts {
                node_name: to_node.to_string(),
                mount_infos: vec![entry],
            }),
        }
        Ok(())
    }
}
