//! Hostpathpv Core - volume metadata model for hostpath persistent volumes
//!
//! This crate provides:
//! - The per-volume mount record codec and its edit operations
//! - The per-node quota disk record and disabled-disk list
//! - Volume classification by mount policy, pod ownership and driver
//! - Effective capacity and usage accessors
//! - Error types with miette diagnostics
//!
//! Nothing here performs I/O; callers persist mutated objects themselves.

pub mod annotations;
pub mod capacity;
pub mod classify;
pub mod disk;
pub mod error;
pub mod mount;
pub mod paths;
pub mod quantities;

// Re-export commonly used types
pub use capacity::{get_capacity, set_capacity, used_bytes, MIN_CAPACITY};
pub use classify::{classify, driver_of, is_hostpath_volume, is_shared, Driver, VolumeClass};
pub use disk::{set_disk_disabled, DiskQuota, NodeDiskQuota};
pub use error::{HostpathError, Result};
pub use mount::{MountEntry, MountRecord, NodeMounts, PodRef};
pub use quantities::format_bytes;

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Serialize a value to JSON
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| HostpathError::encode_error(std::any::type_name::<T>(), e.to_string()))
}

/// Deserialize a value from JSON
pub fn from_json<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_json::from_str(data)
        .map_err(|e| HostpathError::decode_error(std::any::type_name::<T>(), e.to_string()))
}

/// Name of an object, or an empty string
pub fn name_of(meta: &ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}
