use crate::annotations::{MOUNT_POLICY, POLICY_NONE, QUOTA_FOR_ONE_POD};
use k8s_openapi::api::core::v1::PersistentVolume;
use std::fmt;

/// Storage driver shape of a hostpath volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// `hostPath` volume source
    Legacy,
    /// CSI source whose driver name mentions `hostpath`
    Modern,
}

/// Policy class of a volume: mount policy crossed with single-pod ownership
/// and the driver shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeClass {
    KeepFalse,
    KeepTrue,
    NoneFalse,
    NoneTrue,
    ModernKeepFalse,
    ModernKeepTrue,
    ModernNoneFalse,
    ModernNoneTrue,
    Unknown,
}

impl VolumeClass {
    /// Whether directories of this class outlive the pods using them
    pub fn is_keep(self) -> bool {
        matches!(
            self,
            Self::KeepFalse | Self::KeepTrue | Self::ModernKeepFalse | Self::ModernKeepTrue
        )
    }

    pub fn is_modern(self) -> bool {
        matches!(
            self,
            Self::ModernKeepFalse
                | Self::ModernKeepTrue
                | Self::ModernNoneFalse
                | Self::ModernNoneTrue
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepFalse => "KeepFalse",
            Self::KeepTrue => "KeepTrue",
            Self::NoneFalse => "NoneFalse",
            Self::NoneTrue => "NoneTrue",
            Self::ModernKeepFalse => "CSIKeepFalse",
            Self::ModernKeepTrue => "CSIKeepTrue",
            Self::ModernNoneFalse => "CSINoneFalse",
            Self::ModernNoneTrue => "CSINoneTrue",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for VolumeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn driver_of(pv: &PersistentVolume) -> Option<Driver> {
    let spec = pv.spec.as_ref()?;
    if spec.host_path.is_some() {
        return Some(Driver::Legacy);
    }
    match &spec.csi {
        Some(csi) if csi.driver.to_lowercase().contains("hostpath") => Some(Driver::Modern),
        _ => None,
    }
}

pub fn is_hostpath_volume(pv: &PersistentVolume) -> bool {
    driver_of(pv).is_some()
}

/// Hostpath volume explicitly marked as not owned by a single pod
pub fn is_shared(pv: &PersistentVolume) -> bool {
    is_hostpath_volume(pv) && annotation(pv, QUOTA_FOR_ONE_POD) == Some("false")
}

fn annotation<'a>(pv: &'a PersistentVolume, key: &str) -> Option<&'a str> {
    pv.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Classify a volume.
///
/// Missing annotations read as "keep" and "not owned by one pod".
pub fn classify(pv: &PersistentVolume) -> VolumeClass {
    let Some(driver) = driver_of(pv) else {
        return VolumeClass::Unknown;
    };

    let none_policy = annotation(pv, MOUNT_POLICY) == Some(POLICY_NONE);
    let one_pod = annotation(pv, QUOTA_FOR_ONE_POD) == Some("true");

    use VolumeClass::*;
    match (driver, none_policy, one_pod) {
        (Driver::Legacy, false, true) => KeepTrue,
        (Driver::Legacy, false, false) => KeepFalse,
        (Driver::Legacy, true, false) => NoneFalse,
        (Driver::Legacy, true, true) => NoneTrue,
        (Driver::Modern, false, true) => ModernKeepTrue,
        (Driver::Modern, false, false) => ModernKeepFalse,
        (Driver::Modern, true, false) => ModernNoneFalse,
        (Driver::Modern, true, true) => ModernNoneTrue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, HostPathVolumeSource, PersistentVolumeSpec,
    };
    use std::collections::BTreeMap;

    fn legacy() -> PersistentVolume {
        PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                host_path: Some(HostPathVolumeSource {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn modern(driver: &str) -> PersistentVolume {
        PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: driver.to_string(),
                    volume_handle: "h".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn annotate(mut pv: PersistentVolume, policy: Option<&str>, one_pod: Option<&str>) -> PersistentVolume {
        let mut annotations = BTreeMap::new();
        if let Some(p) = policy {
            annotations.insert(MOUNT_POLICY.to_string(), p.to_string());
        }
        if let Some(o) = one_pod {
            annotations.insert(QUOTA_FOR_ONE_POD.to_string(), o.to_string());
        }
        pv.metadata.annotations = Some(annotations);
        pv
    }

    #[test]
    fn test_decision_table() {
        use VolumeClass::*;
        let cases = [
            (Some("keep"), Some("true"), KeepTrue, ModernKeepTrue),
            (Some("keep"), Some("false"), KeepFalse, ModernKeepFalse),
            (Some("other"), None, KeepFalse, ModernKeepFalse),
            (Some("none"), Some("false"), NoneFalse, ModernNoneFalse),
            (Some("none"), None, NoneFalse, ModernNoneFalse),
            (Some("none"), Some("true"), NoneTrue, ModernNoneTrue),
            (None, Some("true"), KeepTrue, ModernKeepTrue),
            (None, None, KeepFalse, ModernKeepFalse),
        ];
        for (policy, one_pod, want_legacy, want_modern) in cases {
            assert_eq!(classify(&annotate(legacy(), policy, one_pod)), want_legacy);
            assert_eq!(
                classify(&annotate(modern("xfshostpathplugin"), policy, one_pod)),
                want_modern
            );
        }
    }

    #[test]
    fn test_absent_annotations() {
        assert_eq!(classify(&legacy()), VolumeClass::KeepFalse);
        assert_eq!(classify(&modern("HostPath.csi")), VolumeClass::ModernKeepFalse);
    }

    #[test]
    fn test_unknown_shapes() {
        assert_eq!(classify(&PersistentVolume::default()), VolumeClass::Unknown);
        assert_eq!(classify(&modern("ebs.csi.aws.com")), VolumeClass::Unknown);
    }

    #[test]
    fn test_is_shared() {
        assert!(is_shared(&annotate(legacy(), None, Some("false"))));
        assert!(!is_shared(&legacy()));
        assert!(!is_shared(&annotate(PersistentVolume::default(), None, Some("false"))));
    }

    #[test]
    fn test_flags() {
        assert!(VolumeClass::ModernKeepTrue.is_keep());
        assert!(VolumeClass::ModernKeepTrue.is_modern());
        assert!(!VolumeClass::NoneTrue.is_keep());
        assert!(!VolumeClass::Unknown.is_keep());
        assert_eq!(VolumeClass::ModernNoneFalse.to_string(), "CSINoneFalse");
    }
}
