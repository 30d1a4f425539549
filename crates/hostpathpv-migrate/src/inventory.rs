//! Read-only view over the cluster's hostpath volumes and pods.

use crate::error::Result;
use hostpathpv_cluster::ClusterStore;
use hostpathpv_core::{classify, is_hostpath_volume, MountEntry, MountRecord};
use k8s_openapi::api::core::v1::{PersistentVolume, Pod};
use tracing::debug;

/// A recorded quota path and the volume it belongs to
#[derive(Debug, Clone)]
pub struct Located<'a> {
    pub volume: &'a PersistentVolume,
    pub entry: MountEntry,
}

impl Located<'_> {
    pub fn volume_name(&self) -> &str {
        hostpathpv_core::name_of(&self.volume.metadata)
    }
}

/// Snapshot of all volumes and pods taken at the start of an operation
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub volumes: Vec<PersistentVolume>,
    pub pods: Vec<Pod>,
}

impl Inventory {
    pub fn new(volumes: Vec<PersistentVolume>, pods: Vec<Pod>) -> Self {
        Self { volumes, pods }
    }

    pub async fn load(store: &dyn ClusterStore) -> Result<Self> {
        let volumes = store.list_volumes().await?;
        let pods = store.list_pods(None).await?;
        debug!(
            volumes = volumes.len(),
            pods = pods.len(),
            "Loaded cluster inventory"
        );
        Ok(Self { volumes, pods })
    }

    /// Hostpath volumes with a readable mount record
    fn records(&self) -> impl Iterator<Item = (&PersistentVolume, MountRecord)> {
        self.volumes.iter().filter_map(|pv| {
            if !is_hostpath_volume(pv) {
                return None;
            }
            match MountRecord::from_volume(pv) {
                Ok(record) if !record.is_empty() => Some((pv, record)),
                Ok(_) => None,
                Err(e) => {
                    debug!(
                        volume = hostpathpv_core::name_of(&pv.metadata),
                        error = %e,
                        "Skipping volume with unreadable mount record"
                    );
                    None
                }
            }
        })
    }

    /// First volume recording `node:path`
    pub fn locate(&self, node: &str, path: &str) -> Option<Located<'_>> {
        self.records().find_map(|(volume, record)| {
            record
                .find(node, path)
                .cloned()
                .map(|entry| Located { volume, entry })
        })
    }

    /// Sum of the reported usage of the given paths on `node`
    pub fn used_size(&self, node: &str, paths: &[String]) -> i64 {
        paths
            .iter()
            .filter_map(|p| self.locate(node, p))
            .map(|l| l.entry.current_size)
            .sum()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<&Pod> {
        self.pods.iter().find(|p| {
            p.metadata.namespace.as_deref() == Some(namespace)
                && p.metadata.name.as_deref() == Some(name)
        })
    }

    /// Pods currently using the quota path `node:path`.
    ///
    /// An exclusively owned path yields its owner when the recorded UID
    /// still matches the live pod. A shared path yields every pod on the
    /// node mounting the volume's claim.
    pub fn pods_using_path(&self, node: &str, path: &str) -> Vec<&Pod> {
        let Some(located) = self.locate(node, path) else {
            return Vec::new();
        };

        if let Some(owner) = &located.entry.owner {
            return match self.pod(&owner.namespace, &owner.name) {
                Some(pod) if pod.metadata.uid.as_deref() == Some(owner.uid.as_str()) => vec![pod],
                Some(pod) => {
                    debug!(
                        pod = %owner.key(),
                        recorded = %owner.uid,
                        live = pod.metadata.uid.as_deref().unwrap_or_default(),
                        "Recorded owner UID does not match the live pod"
                    );
                    Vec::new()
                }
                None => Vec::new(),
            };
        }

        match located.volume.spec.as_ref().and_then(|s| s.claim_ref.as_ref()) {
            Some(claim) => pods_with_claim_on_node(
                &self.pods,
                claim.name.as_deref().unwrap_or_default(),
                claim.namespace.as_deref().unwrap_or_default(),
                node,
            ),
            None => Vec::new(),
        }
    }

    /// Paths on `node` owned by pod `namespace/name`, split into keep-policy
    /// and other paths
    pub fn pod_paths(&self, namespace: &str, name: &str, node: &str) -> (Vec<String>, Vec<String>) {
        let mut keep = Vec::new();
        let mut other = Vec::new();
        for (volume, record) in self.records() {
            let is_keep = classify(volume).is_keep();
            for (entry_node, entry) in record.entries() {
                if entry_node != node {
                    continue;
                }
                let Some(owner) = &entry.owner else {
                    continue;
                };
                if owner.namespace != namespace || owner.name != name {
                    continue;
                }
                if is_keep {
                    keep.push(entry.host_path.clone());
                } else {
                    other.push(entry.host_path.clone());
                }
            }
        }
        (keep, other)
    }
}

fn mounts_claim(pod: &Pod, claim: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .is_some_and(|c| c.claim_name == claim)
            })
        })
}

/// Pods in `namespace` scheduled on `node` that mount `claim`
pub fn pods_with_claim_on_node<'a>(
    pods: &'a [Pod],
    claim: &str,
    namespace: &str,
    node: &str,
) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
        .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node))
        .filter(|p| mounts_claim(p, claim))
        .collect()
}

/// Pods mounting any of `claims`
pub fn pods_using_claims<'a>(pods: &'a [Pod], claims: &[String]) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|p| claims.iter().any(|c| mounts_claim(p, c)))
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use hostpathpv_core::annotations::{MOUNT_NODE, MOUNT_POLICY, NODE_DISK_QUOTA_INFO, QUOTA_FOR_ONE_POD};
    use hostpathpv_core::{DiskQuota, MountEntry, MountRecord, NodeDiskQuota, NodeMounts, PodRef};
    use k8s_openapi::api::core::v1::{
        HostPathVolumeSource, Node, ObjectReference, PersistentVolume, PersistentVolumeClaimVolumeSource,
        PersistentVolumeSpec, PersistentVolumeStatus, Pod, PodSpec, Volume,
    };
    use std::collections::BTreeMap;

    pub fn node(name: &str, disks: &[(&str, i64)]) -> Node {
        let quota = NodeDiskQuota(
            disks
                .iter()
                .map(|(path, capacity)| DiskQuota {
                    mount_path: path.to_string(),
                    capacity: *capacity,
                    ..Default::default()
                })
                .collect(),
        );
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.annotations = Some(BTreeMap::from([(
            NODE_DISK_QUOTA_INFO.to_string(),
            quota.encode().unwrap(),
        )]));
        node
    }

    /// Legacy keep volume bound to `default/<name>-claim` holding the given
    /// `(node, path, quota, used, owner)` entries
    pub fn volume(
        name: &str,
        one_pod: bool,
        entries: &[(&str, &str, i64, i64, Option<&Pod>)],
    ) -> PersistentVolume {
        let mut record = MountRecord::default();
        for (node, path, quota, used, owner) in entries {
            let entry = MountEntry {
                host_path: path.to_string(),
                quota_size: *quota,
                current_size: *used,
                current_file_count: 1,
                owner: owner.map(|p| {
                    PodRef::new(
                        p.metadata.namespace.clone().unwrap_or_default(),
                        p.metadata.name.clone().unwrap_or_default(),
                        p.metadata.uid.clone().unwrap_or_default(),
                    )
                }),
            };
            match record.0.iter_mut().find(|n| n.node_name == *node) {
                Some(group) => group.mount_infos.push(entry),
                None => record.0.push(NodeMounts {
                    node_name: node.to_string(),
                    mount_infos: vec![entry],
                }),
            }
        }

        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some(name.to_string());
        pv.metadata.annotations = Some(BTreeMap::from([
            (MOUNT_NODE.to_string(), record.encode().unwrap()),
            (MOUNT_POLICY.to_string(), "keep".to_string()),
            (QUOTA_FOR_ONE_POD.to_string(), one_pod.to_string()),
        ]));
        pv.spec = Some(PersistentVolumeSpec {
            host_path: Some(HostPathVolumeSource {
                path: "/".to_string(),
                ..Default::default()
            }),
            claim_ref: Some(ObjectReference {
                name: Some(format!("{}-claim", name)),
                namespace: Some("default".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        pv.status = Some(PersistentVolumeStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        pv
    }

    /// Pod in `default` on `node` mounting `claim`
    pub fn pod(name: &str, uid: &str, node: &str, claim: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("default".to_string());
        pod.metadata.uid = Some(uid.to_string());
        pod.spec = Some(PodSpec {
            node_name: Some(node.to_string()),
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }
}
