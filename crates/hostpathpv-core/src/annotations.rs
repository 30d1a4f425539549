//! Annotation keys and well-known values shared with the node agents and
//! the CSI driver.

/// Volume annotation holding the encoded `MountRecord`
pub const MOUNT_NODE: &str = "io.enndata.kubelet/alpha-pvchostpathnode";

/// Volume annotation overriding the declared capacity (decimal bytes)
pub const CAPACITY_OVERRIDE: &str = "io.enndata.user/alpha-pvhostpathcapcity";

/// Volume annotation selecting the mount policy (`keep` or `none`)
pub const MOUNT_POLICY: &str = "io.enndata.user/alpha-pvhostpathmountpolicy";

/// Volume annotation marking the quota as owned by a single pod
pub const QUOTA_FOR_ONE_POD: &str = "io.enndata.user/alpha-pvhostpathquotaforonepod";

/// Volume annotation where node agents report per-path scale results
pub const SCALE_STATE: &str = "io.enndata.kubelet/alpha-pvhostpathscalestate";

/// Node annotation holding the encoded `NodeDiskQuota`
pub const NODE_DISK_QUOTA_INFO: &str = "io.enndata.kubelet/alpha-nodediskquotainfo";

/// Node annotation holding the comma-joined list of disabled quota disks
pub const NODE_DISABLED_DISKS: &str = "io.enndata.user/alpha-nodequotadisklist-disable";

pub const POLICY_KEEP: &str = "keep";
pub const POLICY_NONE: &str = "none";

/// CSI driver name used for volumes created by `upgrade`
pub const CSI_DRIVER_NAME: &str = "xfshostpathplugin";

/// Label value stamped on every object this tool creates
pub const APP_LABEL: &str = "kubectlhostpathpv";
