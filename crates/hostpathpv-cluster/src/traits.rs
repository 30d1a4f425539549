use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};

/// Options for pod deletion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteParams {
    /// Only delete the object if its UID still matches
    pub uid_precondition: Option<String>,
    /// Grace period override in seconds
    pub grace_period_seconds: Option<i64>,
}

impl DeleteParams {
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            uid_precondition: Some(uid.into()),
            ..Default::default()
        }
    }
}

/// Trait for the remote object store holding volumes, nodes and pods
///
/// This trait abstracts over the Kubernetes API server so that every
/// operation can run against `MockCluster` in tests. Updates carry the
/// object's resource version and fail with `ClusterError::Conflict` when it
/// is stale; callers retry through `retry_on_conflict`.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    // --- Persistent volumes ---

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume>;

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>>;

    async fn create_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    async fn update_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    async fn delete_volume(&self, name: &str) -> Result<()>;

    // --- Nodes ---

    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn update_node(&self, node: &Node) -> Result<Node>;

    // --- Pods ---

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// List pods in one namespace, or in all namespaces when `None`
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    async fn delete_pod(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<()>;

    /// Follow the log of a pod's container, yielding one line per item
    async fn pod_log_lines(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<BoxStream<'static, Result<String>>>;
}
