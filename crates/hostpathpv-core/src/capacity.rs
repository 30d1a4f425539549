use crate::annotations::CAPACITY_OVERRIDE;
use crate::classify::is_hostpath_volume;
use crate::error::{HostpathError, Result};
use crate::mount::MountRecord;
use crate::quantities::{StorageQuantity, MIB};
use k8s_openapi::api::core::v1::PersistentVolume;

/// Smallest capacity a volume may be set to
pub const MIN_CAPACITY: i64 = 10 * MIB;

/// Raw override annotation, if present
pub fn capacity_override(pv: &PersistentVolume) -> Option<&str> {
    pv.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CAPACITY_OVERRIDE))
        .map(String::as_str)
}

/// Declared `spec.capacity.storage` in bytes
pub fn declared_capacity(pv: &PersistentVolume) -> Option<i64> {
    pv.spec
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(StorageQuantity::from_k8s_resource_map)
        .map(|q| q.bytes)
}

/// Effective capacity in bytes.
///
/// A parseable override wins, then the declared capacity, then zero.
pub fn get_capacity(pv: &PersistentVolume) -> i64 {
    capacity_override(pv)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .or_else(|| declared_capacity(pv))
        .unwrap_or(0)
}

/// Write the override annotation. The volume is untouched on error.
pub fn set_capacity(pv: &mut PersistentVolume, bytes: i64) -> Result<()> {
    let name = pv.metadata.name.clone().unwrap_or_default();
    if !is_hostpath_volume(pv) {
        return Err(HostpathError::not_hostpath_volume(name));
    }
    if bytes < MIN_CAPACITY {
        return Err(HostpathError::invalid_argument(
            format!("capacity {} bytes of volume {} is below 10Mi", bytes, name),
            "Choose a capacity of at least 10 MiB",
        ));
    }
    pv.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CAPACITY_OVERRIDE.to_string(), bytes.to_string());
    Ok(())
}

/// Sum of the usage the node agents reported for every recorded path
pub fn used_bytes(pv: &PersistentVolume) -> Result<i64> {
    Ok(MountRecord::from_volume(pv)?
        .entries()
        .map(|(_, e)| e.current_size)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::MOUNT_NODE;
    use k8s_openapi::api::core::v1::{HostPathVolumeSource, PersistentVolumeSpec};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn volume(declared: Option<&str>, override_ann: Option<&str>) -> PersistentVolume {
        let capacity = declared.map(|d| {
            let mut m = BTreeMap::new();
            m.insert("storage".to_string(), Quantity(d.to_string()));
            m
        });
        let mut pv = PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                capacity,
                host_path: Some(HostPathVolumeSource {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        pv.metadata.name = Some("pv1".to_string());
        if let Some(o) = override_ann {
            let mut a = BTreeMap::new();
            a.insert(CAPACITY_OVERRIDE.to_string(), o.to_string());
            pv.metadata.annotations = Some(a);
        }
        pv
    }

    #[test]
    fn test_get_capacity_precedence() {
        assert_eq!(get_capacity(&volume(Some("1Gi"), None)), 1024 * MIB);
        assert_eq!(get_capacity(&volume(Some("1Gi"), Some("20971520"))), 20 * MIB);
        assert_eq!(get_capacity(&volume(Some("1Gi"), Some("garbage"))), 1024 * MIB);
        assert_eq!(get_capacity(&volume(None, None)), 0);
        assert_eq!(get_capacity(&volume(None, Some("garbage"))), 0);
    }

    #[test]
    fn test_set_then_get() {
        let mut pv = volume(Some("1Gi"), None);
        set_capacity(&mut pv, 50 * MIB).unwrap();
        assert_eq!(get_capacity(&pv), 50 * MIB);
        set_capacity(&mut pv, MIN_CAPACITY).unwrap();
        assert_eq!(get_capacity(&pv), MIN_CAPACITY);
    }

    #[test]
    fn test_set_too_small_does_not_mutate() {
        let mut pv = volume(Some("1Gi"), Some("20971520"));
        let before = pv.clone();
        let err = set_capacity(&mut pv, MIN_CAPACITY - 1).unwrap_err();
        assert!(matches!(err, HostpathError::InvalidArgument { .. }));
        assert_eq!(pv, before);
    }

    #[test]
    fn test_set_rejects_non_hostpath() {
        let mut pv = PersistentVolume::default();
        let err = set_capacity(&mut pv, 100 * MIB).unwrap_err();
        assert!(matches!(err, HostpathError::NotHostpathVolume { .. }));
    }

    #[test]
    fn test_used_bytes() {
        let mut pv = volume(Some("1Gi"), None);
        let mut a = BTreeMap::new();
        a.insert(
            MOUNT_NODE.to_string(),
            r#"[{"nodeName":"n1","mountInfos":[{"hostPath":"/d1/a","volumeCurrentSize":400},{"hostPath":"/d1/b","volumeCurrentSize":100}]}]"#.to_string(),
        );
        pv.metadata.annotations = Some(a);
        assert_eq!(used_bytes(&pv).unwrap(), 500);
    }
}
