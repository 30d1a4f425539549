//! Volume objects created by the move and upgrade flows.

use crate::templates::short_hash;
use hostpathpv_core::annotations::{
    APP_LABEL, CSI_DRIVER_NAME, MOUNT_POLICY, POLICY_KEEP, QUOTA_FOR_ONE_POD,
};
use hostpathpv_core::{MountEntry, MountRecord, NodeMounts, Result};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, HostPathVolumeSource, PersistentVolume, PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

pub fn placeholder_name(node: &str, dest_dirs: &[String]) -> String {
    format!("move-{}-tmp-pv-{}", node, short_hash(dest_dirs, 5))
}

pub fn local_placeholder_name(node: &str) -> String {
    format!("move-{}-tmp-pv", node)
}

/// Name of the volume holding the quota directories while an upgrade swaps
/// the volume object
pub fn upgrade_placeholder_name(volume: &str) -> String {
    format!("{}-csihostpathpv-tmp", short_hash(&[volume], 10))
}

fn own_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("name".to_string(), name.to_string());
    labels.insert("app".to_string(), APP_LABEL.to_string());
    labels
}

fn storage(quantity: Quantity) -> BTreeMap<String, Quantity> {
    let mut capacity = BTreeMap::new();
    capacity.insert("storage".to_string(), quantity);
    capacity
}

/// Keep-policy volume pinning `dirs` on `node` so nothing else claims them.
///
/// Each entry is `(path, quota_size)`. The object is never bound; it only
/// makes the node agents treat the directories as taken.
pub fn placeholder_volume(name: &str, node: &str, dirs: &[(String, i64)]) -> Result<PersistentVolume> {
    let record = MountRecord(vec![NodeMounts {
        node_name: node.to_string(),
        mount_infos: dirs
            .iter()
            .map(|(path, quota)| MountEntry {
                quota_size: *quota,
                ..MountEntry::shared(path.clone())
            })
            .collect(),
    }]);

    let mut pv = PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(own_labels(name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            capacity: Some(storage(Quantity("1".to_string()))),
            host_path: Some(HostPathVolumeSource {
                path: "\\".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    record.write_to(&mut pv)?;
    let annotations = pv.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(MOUNT_POLICY.to_string(), POLICY_KEEP.to_string());
    annotations.insert(QUOTA_FOR_ONE_POD.to_string(), "true".to_string());
    Ok(pv)
}

/// Modern-driver copy of a legacy volume.
///
/// The new object keeps the annotations and declared capacity and points at
/// the old object's UID, so the node agents find the same quota
/// directories. `copy_labels` selects between the original labels and
/// a fresh `name`/`app` pair for temporary copies.
pub fn replacement_volume(name: &str, from: &PersistentVolume, copy_labels: bool) -> PersistentVolume {
    let labels = if copy_labels {
        from.metadata.labels.clone().unwrap_or_default()
    } else {
        own_labels(name)
    };
    let capacity = from
        .spec
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
        .cloned()
        .unwrap_or_else(|| Quantity("0".to_string()));

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            annotations: Some(from.metadata.annotations.clone().unwrap_or_default()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            capacity: Some(storage(capacity)),
            csi: Some(CSIPersistentVolumeSource {
                driver: CSI_DRIVER_NAME.to_string(),
                volume_handle: from.metadata.uid.clone().unwrap_or_default(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
