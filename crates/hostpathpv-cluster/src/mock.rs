use crate::error::{ClusterError, Result};
use crate::traits::{ClusterStore, DeleteParams};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    GetVolume,
    ListVolumes,
    CreateVolume,
    UpdateVolume,
    DeleteVolume,
    GetNode,
    UpdateNode,
    GetPod,
    ListPods,
    CreatePod,
    DeletePod,
    PodLogs,
}

/// What an injected fault returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// HTTP 500 style API error
    ServerError,
    /// Optimistic concurrency conflict
    Conflict,
}

#[derive(Debug, Clone)]
struct Fault {
    op: MockOp,
    name_contains: String,
    kind: FaultKind,
    skip: usize,
    remaining: usize,
}

#[derive(Debug, Clone)]
struct MockPod {
    pod: Pod,
    phases: VecDeque<String>,
}

#[derive(Default)]
struct MockState {
    volumes: HashMap<String, PersistentVolume>,
    nodes: HashMap<String, Node>,
    pods: HashMap<(String, String), MockPod>,
    phase_scripts: Vec<(String, Vec<String>)>,
    log_scripts: Vec<(String, Vec<String>)>,
    faults: Vec<Fault>,
    calls: Vec<String>,
    next_version: u64,
    next_ip: u32,
    bind_created_volumes: bool,
}

impl MockState {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
    }

    fn admit(&mut self, meta: &mut ObjectMeta) {
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        self.bump(meta);
    }

    /// Record the call and fire a matching fault, if any
    fn enter(&mut self, op: MockOp, name: &str) -> Result<()> {
        self.calls.push(format!("{:?} {}", op, name));
        let Some(idx) = self
            .faults
            .iter()
            .position(|f| f.op == op && name.contains(&f.name_contains))
        else {
            return Ok(());
        };
        let fault = &mut self.faults[idx];
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        fault.remaining -= 1;
        let kind = fault.kind;
        if fault.remaining == 0 {
            self.faults.remove(idx);
        }
        debug!("Mock: injected {:?} for {:?} {}", kind, op, name);
        Err(match kind {
            FaultKind::ServerError => {
                ClusterError::api(format!("{:?} {}", op, name), 500, "injected failure")
            }
            FaultKind::Conflict => ClusterError::conflict(format!("{:?}", op), name),
        })
    }

    fn script_for(scripts: &[(String, Vec<String>)], name: &str) -> Option<Vec<String>> {
        scripts
            .iter()
            .rev()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, v)| v.clone())
    }
}

fn name(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

fn check_version(kind: &str, stored: &ObjectMeta, incoming: &ObjectMeta) -> Result<()> {
    match &incoming.resource_version {
        Some(v) if Some(v) != stored.resource_version.as_ref() => {
            Err(ClusterError::conflict(kind, name(incoming)))
        }
        _ => Ok(()),
    }
}

/// In-memory cluster for tests and dry runs
///
/// Objects get UIDs, resource versions and creation timestamps on admission,
/// and updates with a stale resource version fail with a conflict. Worker
/// pods follow scripted phase sequences chosen by name prefix (one step per
/// `get_pod`), and any store operation can be made to fail a given number
/// of times.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<RwLock<MockState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_volume(&self, mut pv: PersistentVolume) {
        let mut state = self.state.write().await;
        state.admit(&mut pv.metadata);
        state.volumes.insert(name(&pv.metadata), pv);
    }

    pub async fn add_node(&self, mut node: Node) {
        let mut state = self.state.write().await;
        state.admit(&mut node.metadata);
        state.nodes.insert(name(&node.metadata), node);
    }

    /// Add a workload pod as-is; its phase never changes
    pub async fn add_pod(&self, mut pod: Pod) {
        let mut state = self.state.write().await;
        state.admit(&mut pod.metadata);
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            name(&pod.metadata),
        );
        state.pods.insert(
            key,
            MockPod {
                pod,
                phases: VecDeque::new(),
            },
        );
    }

    /// Phase sequence for pods created later whose name starts with `prefix`.
    ///
    /// The first phase is set on creation; each `get_pod` advances one step
    /// and the last phase sticks. Pods without a script succeed at once.
    pub async fn script_phases(&self, prefix: &str, phases: &[&str]) {
        self.state.write().await.phase_scripts.push((
            prefix.to_string(),
            phases.iter().map(|p| p.to_string()).collect(),
        ));
    }

    /// Log lines served for pods whose name starts with `prefix`
    pub async fn script_logs(&self, prefix: &str, lines: &[&str]) {
        self.state.write().await.log_scripts.push((
            prefix.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        ));
    }

    /// Fail the next `times` calls of `op` on objects whose name contains
    /// `name_contains`
    pub async fn inject_fault(&self, op: MockOp, name_contains: &str, kind: FaultKind, times: usize) {
        self.inject_fault_after(op, name_contains, kind, 0, times)
            .await;
    }

    /// Like `inject_fault`, but let the first `skip` matching calls through
    pub async fn inject_fault_after(
        &self,
        op: MockOp,
        name_contains: &str,
        kind: FaultKind,
        skip: usize,
        times: usize,
    ) {
        if times == 0 {
            return;
        }
        self.state.write().await.faults.push(Fault {
            op,
            name_contains: name_contains.to_string(),
            kind,
            skip,
            remaining: times,
        });
    }

    /// Mark volumes created from now on as Bound
    pub async fn bind_created_volumes(&self, bind: bool) {
        self.state.write().await.bind_created_volumes = bind;
    }

    /// Every store call so far, as `Op name`
    pub async fn calls(&self) -> Vec<String> {
        self.state.read().await.calls.clone()
    }

    pub async fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn pod_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .read()
            .await
            .pods
            .keys()
            .map(|(ns, n)| format!("{}/{}", ns, n))
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ClusterStore for MockCluster {
    async fn get_volume(&self, pv_name: &str) -> Result<PersistentVolume> {
        let mut state = self.state.write().await;
        state.enter(MockOp::GetVolume, pv_name)?;
        state
            .volumes
            .get(pv_name)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("persistentvolume", pv_name))
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        let mut state = self.state.write().await;
        state.enter(MockOp::ListVolumes, "")?;
        let mut items: Vec<PersistentVolume> = state.volumes.values().cloned().collect();
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(items)
    }

    async fn create_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let pv_name = name(&pv.metadata);
        let mut state = self.state.write().await;
        state.enter(MockOp::CreateVolume, &pv_name)?;
        if state.volumes.contains_key(&pv_name) {
            return Err(ClusterError::already_exists("persistentvolume", pv_name));
        }
        let mut created = pv.clone();
        created.metadata.resource_version = None;
        created.metadata.uid = None;
        state.admit(&mut created.metadata);
        let phase = if state.bind_created_volumes {
            "Bound"
        } else {
            "Available"
        };
        created.status = Some(PersistentVolumeStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        state.volumes.insert(pv_name.clone(), created.clone());
        debug!("Mock: volume created: {}", pv_name);
        Ok(created)
    }

    async fn update_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let pv_name = name(&pv.metadata);
        let mut state = self.state.write().await;
        state.enter(MockOp::UpdateVolume, &pv_name)?;
        let stored = state
            .volumes
            .get(&pv_name)
            .ok_or_else(|| ClusterError::not_found("persistentvolume", &pv_name))?;
        check_version("persistentvolume", &stored.metadata, &pv.metadata)?;
        let terminating = stored.metadata.deletion_timestamp.clone();

        let mut updated = pv.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.deletion_timestamp = terminating;
        state.bump(&mut updated.metadata);

        let finalized = updated
            .metadata
            .finalizers
            .as_ref()
            .is_none_or(|f| f.is_empty());
        if updated.metadata.deletion_timestamp.is_some() && finalized {
            state.volumes.remove(&pv_name);
            debug!("Mock: volume finalized: {}", pv_name);
        } else {
            state.volumes.insert(pv_name, updated.clone());
        }
        Ok(updated)
    }

    async fn delete_volume(&self, pv_name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::DeleteVolume, pv_name)?;
        let stored = state
            .volumes
            .get_mut(pv_name)
            .ok_or_else(|| ClusterError::not_found("persistentvolume", pv_name))?;
        let has_finalizers = stored
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            stored.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            debug!("Mock: volume terminating: {}", pv_name);
        } else {
            state.volumes.remove(pv_name);
            debug!("Mock: volume deleted: {}", pv_name);
        }
        Ok(())
    }

    async fn get_node(&self, node_name: &str) -> Result<Node> {
        let mut state = self.state.write().await;
        state.enter(MockOp::GetNode, node_name)?;
        state
            .nodes
            .get(node_name)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("node", node_name))
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let node_name = name(&node.metadata);
        let mut state = self.state.write().await;
        state.enter(MockOp::UpdateNode, &node_name)?;
        let stored = state
            .nodes
            .get(&node_name)
            .ok_or_else(|| ClusterError::not_found("node", &node_name))?;
        check_version("node", &stored.metadata, &node.metadata)?;
        let mut updated = node.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        state.bump(&mut updated.metadata);
        state.nodes.insert(node_name, updated.clone());
        Ok(updated)
    }

    async fn get_pod(&self, namespace: &str, pod_name: &str) -> Result<Pod> {
        let mut state = self.state.write().await;
        state.enter(MockOp::GetPod, pod_name)?;
        let entry = state
            .pods
            .get_mut(&(namespace.to_string(), pod_name.to_string()))
            .ok_or_else(|| ClusterError::not_found("pod", pod_name))?;
        if entry.phases.len() > 1 {
            entry.phases.pop_front();
        }
        if let Some(phase) = entry.phases.front() {
            entry
                .pod
                .status
                .get_or_insert_with(Default::default)
                .phase = Some(phase.clone());
        }
        Ok(entry.pod.clone())
    }

    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let mut state = self.state.write().await;
        state.enter(MockOp::ListPods, namespace.unwrap_or(""))?;
        let mut items: Vec<Pod> = state
            .pods
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|want| want == ns.as_str()))
            .map(|(_, p)| p.pod.clone())
            .collect();
        items.sort_by(|a, b| {
            (&a.metadata.namespace, &a.metadata.name).cmp(&(&b.metadata.namespace, &b.metadata.name))
        });
        Ok(items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let pod_name = name(&pod.metadata);
        let mut state = self.state.write().await;
        state.enter(MockOp::CreatePod, &pod_name)?;
        let key = (namespace.to_string(), pod_name.clone());
        if state.pods.contains_key(&key) {
            return Err(ClusterError::already_exists("pod", pod_name));
        }

        let phases: VecDeque<String> = MockState::script_for(&state.phase_scripts, &pod_name)
            .unwrap_or_else(|| vec!["Succeeded".to_string()])
            .into();

        let mut created = pod.clone();
        created.metadata.namespace = Some(namespace.to_string());
        state.admit(&mut created.metadata);
        state.next_ip += 1;
        let ip = format!("10.244.0.{}", state.next_ip);
        created.status = Some(PodStatus {
            phase: phases.front().cloned(),
            pod_ip: Some(ip),
            ..Default::default()
        });

        state.pods.insert(
            key,
            MockPod {
                pod: created.clone(),
                phases,
            },
        );
        debug!("Mock: pod created: {}/{}", namespace, pod_name);
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, pod_name: &str, params: &DeleteParams) -> Result<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::DeletePod, pod_name)?;
        let key = (namespace.to_string(), pod_name.to_string());
        let stored = state
            .pods
            .get(&key)
            .ok_or_else(|| ClusterError::not_found("pod", pod_name))?;
        if let Some(uid) = &params.uid_precondition {
            if stored.pod.metadata.uid.as_ref() != Some(uid) {
                return Err(ClusterError::conflict("pod", pod_name));
            }
        }
        state.pods.remove(&key);
        debug!("Mock: pod deleted: {}/{}", namespace, pod_name);
        Ok(())
    }

    async fn pod_log_lines(
        &self,
        namespace: &str,
        pod_name: &str,
        _container: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let mut state = self.state.write().await;
        state.enter(MockOp::PodLogs, pod_name)?;
        if !state
            .pods
            .contains_key(&(namespace.to_string(), pod_name.to_string()))
        {
            return Err(ClusterError::not_found("pod", pod_name));
        }
        let lines = MockState::script_for(&state.log_scripts, pod_name).unwrap_or_default();
        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn pod(ns: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let mock = MockCluster::new();
        mock.add_node(node("n1")).await;

        let first = mock.get_node("n1").await.unwrap();
        let second = mock.get_node("n1").await.unwrap();
        mock.update_node(&first).await.unwrap();
        let err = mock.update_node(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_scripted_phases_advance_per_get() {
        let mock = MockCluster::new();
        mock.script_phases("mover", &["Pending", "Running", "Succeeded"])
            .await;
        let created = mock.create_pod("kube-system", &pod("", "mover-1")).await.unwrap();
        assert_eq!(created.status.unwrap().phase.as_deref(), Some("Pending"));

        let phase = |p: Pod| p.status.and_then(|s| s.phase).unwrap_or_default();
        assert_eq!(phase(mock.get_pod("kube-system", "mover-1").await.unwrap()), "Running");
        assert_eq!(phase(mock.get_pod("kube-system", "mover-1").await.unwrap()), "Succeeded");
        assert_eq!(phase(mock.get_pod("kube-system", "mover-1").await.unwrap()), "Succeeded");
    }

    #[tokio::test]
    async fn test_delete_pod_uid_precondition() {
        let mock = MockCluster::new();
        mock.add_pod(pod("default", "web-0")).await;
        let uid = mock
            .get_pod("default", "web-0")
            .await
            .unwrap()
            .metadata
            .uid
            .unwrap();

        let err = mock
            .delete_pod("default", "web-0", &DeleteParams::with_uid("other"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        mock.delete_pod("default", "web-0", &DeleteParams::with_uid(uid))
            .await
            .unwrap();
        assert!(mock.get_pod("default", "web-0").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_faults_expire() {
        let mock = MockCluster::new();
        mock.add_node(node("n1")).await;
        mock.inject_fault(MockOp::GetNode, "n1", FaultKind::ServerError, 2)
            .await;
        assert!(mock.get_node("n1").await.is_err());
        assert!(mock.get_node("n1").await.is_err());
        assert!(mock.get_node("n1").await.is_ok());
        assert_eq!(mock.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_delayed_fault() {
        let mock = MockCluster::new();
        mock.add_node(node("n1")).await;
        mock.inject_fault_after(MockOp::GetNode, "n1", FaultKind::Conflict, 1, 1)
            .await;
        assert!(mock.get_node("n1").await.is_ok());
        assert!(mock.get_node("n1").await.unwrap_err().is_conflict());
        assert!(mock.get_node("n1").await.is_ok());
    }

    #[tokio::test]
    async fn test_volume_finalizers_hold_deletion() {
        let mock = MockCluster::new();
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some("pv1".to_string());
        pv.metadata.finalizers = Some(vec!["kubernetes.io/pv-protection".to_string()]);
        mock.add_volume(pv).await;

        mock.delete_volume("pv1").await.unwrap();
        let mut stuck = mock.get_volume("pv1").await.unwrap();
        assert!(stuck.metadata.deletion_timestamp.is_some());

        stuck.metadata.finalizers = None;
        mock.update_volume(&stuck).await.unwrap();
        assert!(mock.get_volume("pv1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_scripted_logs() {
        let mock = MockCluster::new();
        mock.script_logs("mover", &["Has moved 1MB", "done"]).await;
        mock.create_pod("kube-system", &pod("", "mover-1")).await.unwrap();
        let lines: Vec<String> = mock
            .pod_log_lines("kube-system", "mover-1", "move")
            .await
            .unwrap()
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["Has moved 1MB".to_string(), "done".to_string()]);
    }
}
