use crate::error::{ClusterError, Result};
use crate::traits::{ClusterStore, DeleteParams};
use futures_util::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the worker task lifecycle manager
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Interval between phase checks
    pub poll_interval: Duration,
    /// Interval between finalizer clearing attempts on a terminating volume
    pub finalizer_retry_interval: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            finalizer_retry_interval: Duration::from_millis(100),
        }
    }
}

/// Handle on a pod whose lifecycle is being tracked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl TaskRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone(),
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle phase of a pod, empty when not reported yet
pub fn phase_of(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Creates, watches and removes the transient objects of an operation.
///
/// Every wait polls at a fixed interval, measures its budget against a
/// monotonic deadline and returns `ClusterError::Cancelled` as soon as the
/// cancellation token fires.
#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn ClusterStore>,
    config: TaskManagerConfig,
    token: CancellationToken,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        config: TaskManagerConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            token,
        }
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Same store and settings, but deaf to the current token.
    ///
    /// Used to run compensations after the operator interrupted.
    pub fn detached(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            token: CancellationToken::new(),
        }
    }

    /// Sleep for `duration` unless cancelled first
    pub async fn pause(&self, duration: Duration, during: &str) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(ClusterError::cancelled(during)),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn check_cancelled(&self, during: &str) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(ClusterError::cancelled(during));
        }
        Ok(())
    }

    /// Create a worker task, replacing any leftover of the same name
    pub async fn create_task(&self, pod: &Pod) -> Result<TaskRef> {
        let wanted = TaskRef::from_pod(pod);
        self.check_cancelled(&format!("creating task {}", wanted))?;
        self.delete_and_wait_gone(std::slice::from_ref(&wanted), true)
            .await?;

        let created = self.store.create_pod(&wanted.namespace, pod).await?;
        info!(task = %wanted, "Worker task created");
        Ok(TaskRef::from_pod(&created))
    }

    /// Wait until every task is Running or Succeeded and return the
    /// current objects in input order
    pub async fn wait_running(&self, tasks: &[TaskRef]) -> Result<Vec<Pod>> {
        loop {
            let mut ready = Vec::with_capacity(tasks.len());
            for task in tasks {
                let pod = self.store.get_pod(&task.namespace, &task.name).await?;
                match phase_of(&pod) {
                    "Running" | "Succeeded" => ready.push(pod),
                    "Failed" => {
                        return Err(ClusterError::task_failed(
                            &task.namespace,
                            &task.name,
                            "failed before it started running",
                        ))
                    }
                    phase => {
                        debug!(task = %task, phase, "Waiting for task to run");
                        break;
                    }
                }
            }
            if ready.len() == tasks.len() {
                return Ok(ready);
            }
            self.pause(self.config.poll_interval, "waiting for tasks to run")
                .await?;
        }
    }

    /// Wait until every task has exited.
    ///
    /// A Failed task is fatal at once. A task that disappeared counts as
    /// finished. Past `timeout` the wait fails with `TimedOut`.
    pub async fn wait_terminal(&self, tasks: &[TaskRef], timeout: Duration) -> Result<()> {
        self.wait_exit(tasks, timeout, true).await
    }

    /// Like [`wait_terminal`](Self::wait_terminal), but only a Succeeded
    /// phase counts: a task that disappeared first is a `TaskFailed`.
    pub async fn wait_succeeded(&self, tasks: &[TaskRef], timeout: Duration) -> Result<()> {
        self.wait_exit(tasks, timeout, false).await
    }

    async fn wait_exit(&self, tasks: &[TaskRef], timeout: Duration, vanished_ok: bool) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut pending: Vec<&TaskRef> = tasks.iter().collect();

        loop {
            let mut still_running = Vec::new();
            for task in pending {
                let pod = match self.store.get_pod(&task.namespace, &task.name).await {
                    Ok(pod) => pod,
                    Err(e) if e.is_not_found() && vanished_ok => {
                        warn!(task = %task, "Task vanished before reporting an exit, treating it as done");
                        continue;
                    }
                    Err(e) if e.is_not_found() => {
                        warn!(task = %task, "Task vanished before reporting an exit");
                        return Err(ClusterError::task_failed(
                            &task.namespace,
                            &task.name,
                            "disappeared before reporting an exit",
                        ));
                    }
                    Err(e) => return Err(e),
                };
                match phase_of(&pod) {
                    "Succeeded" => debug!(task = %task, "Task succeeded"),
                    "Failed" => {
                        let message = pod
                            .status
                            .as_ref()
                            .and_then(|s| s.message.clone().or_else(|| s.reason.clone()))
                            .unwrap_or_else(|| "task exited with failure".to_string());
                        return Err(ClusterError::task_failed(
                            &task.namespace,
                            &task.name,
                            message,
                        ));
                    }
                    _ => still_running.push(task),
                }
            }

            if still_running.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::timed_out(
                    format!("task {} to exit", still_running[0]),
                    timeout.as_secs(),
                ));
            }
            pending = still_running;
            self.pause(self.config.poll_interval, "waiting for tasks to exit")
                .await?;
        }
    }

    /// Optionally delete the tasks, then wait until none of them exists
    pub async fn delete_and_wait_gone(&self, tasks: &[TaskRef], force: bool) -> Result<()> {
        for task in tasks {
            if force {
                match self
                    .store
                    .delete_pod(&task.namespace, &task.name, &DeleteParams::default())
                    .await
                {
                    Ok(()) => debug!(task = %task, "Deleted task"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            self.wait_until(task, |_| false).await?;
        }
        Ok(())
    }

    /// Wait until each pod is gone or back in Pending
    pub async fn wait_gone_or_pending(&self, pods: &[TaskRef]) -> Result<()> {
        for pod in pods {
            self.wait_until(pod, |p| phase_of(p) == "Pending").await?;
        }
        Ok(())
    }

    async fn wait_until(&self, task: &TaskRef, done: impl Fn(&Pod) -> bool) -> Result<()> {
        loop {
            match self.store.get_pod(&task.namespace, &task.name).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
                Ok(pod) if done(&pod) => return Ok(()),
                Ok(_) => {}
            }
            self.pause(
                self.config.poll_interval,
                &format!("waiting for pod {} to go away", task),
            )
            .await?;
        }
    }

    /// Delete workload pods one by one, `interval` apart.
    ///
    /// Each delete carries the pod's UID as precondition so a replacement
    /// that reused the name is left alone. Already missing pods are fine.
    pub async fn delete_pods(&self, pods: &[TaskRef], interval: Duration) -> Result<()> {
        for (i, pod) in pods.iter().enumerate() {
            self.check_cancelled("deleting pods")?;
            let params = DeleteParams {
                uid_precondition: pod.uid.clone(),
                ..Default::default()
            };
            match self.store.delete_pod(&pod.namespace, &pod.name, &params).await {
                Ok(()) => info!(pod = %pod, "Deleted pod"),
                Err(e) if e.is_not_found() => debug!(pod = %pod, "Pod already gone"),
                Err(e) => return Err(e),
            }
            if i + 1 < pods.len() && !interval.is_zero() {
                self.pause(interval, "deleting pods").await?;
            }
        }
        Ok(())
    }

    /// Follow the log of one task's container
    pub async fn follow_logs(
        &self,
        task: &TaskRef,
        container: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        self.store
            .pod_log_lines(&task.namespace, &task.name, container)
            .await
    }

    /// Wait until a volume reports the Bound phase
    pub async fn wait_volume_bound(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let pv = self.store.get_volume(name).await?;
            let phase = pv.status.as_ref().and_then(|s| s.phase.as_deref());
            if phase == Some("Bound") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::timed_out(
                    format!("volume {} to bind", name),
                    timeout.as_secs(),
                ));
            }
            self.pause(self.config.poll_interval, "waiting for volume to bind")
                .await?;
        }
    }

    /// Delete a volume and strip its finalizers until it is really gone
    pub async fn delete_volume_until_gone(&self, name: &str) -> Result<()> {
        match self.store.delete_volume(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        loop {
            let mut pv = match self.store.get_volume(name).await {
                Err(e) if e.is_not_found() => {
                    debug!(volume = name, "Volume deleted");
                    return Ok(());
                }
                other => other?,
            };
            if pv.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
                pv.metadata.finalizers = None;
                if let Err(e) = self.store.update_volume(&pv).await {
                    debug!(volume = name, error = %e, "Clearing finalizers failed, retrying");
                }
            }
            self.pause(
                self.config.finalizer_retry_interval,
                &format!("deleting volume {}", name),
            )
            .await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FaultKind, MockCluster, MockOp};
    use k8s_openapi::api::core::v1::PersistentVolume;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn manager(mock: &MockCluster) -> TaskManager {
        TaskManager::new(
            Arc::new(mock.clone()),
            TaskManagerConfig::default(),
            CancellationToken::new(),
        )
    }

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

    #[tokio::test(start_paused = true)]
    async fn test_create_task_replaces_leftover() {
        let mock = MockCluster::new();
        mock.add_pod(pod("kube-system", "move-n1-tmp-pod")).await;
        let old_uid = mock
            .get_pod("kube-system", "move-n1-tmp-pod")
            .await
            .unwrap()
            .metadata
            .uid;

        let task = manager(&mock)
            .create_task(&pod("kube-system", "move-n1-tmp-pod"))
            .await
            .unwrap();
        assert_eq!(task.name, "move-n1-tmp-pod");
        assert_ne!(task.uid, old_uid);
        assert!(mock
            .calls()
            .await
            .contains(&"DeletePod move-n1-tmp-pod".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_running_returns_address() {
        let mock = MockCluster::new();
        mock.script_phases("sender", &["Pending", "Pending", "Running"])
            .await;
        let tm = manager(&mock);
        let task = tm.create_task(&pod("kube-system", "sender")).await.unwrap();

        let running = tm.wait_running(&[task]).await.unwrap();
        assert_eq!(phase_of(&running[0]), "Running");
        assert!(running[0].status.as_ref().unwrap().pod_ip.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_terminal_times_out() {
        let mock = MockCluster::new();
        mock.script_phases("mover", &["Running"]).await;
        let tm = manager(&mock);
        let task = tm.create_task(&pod("kube-system", "mover")).await.unwrap();

        let err = tm
            .wait_terminal(&[task], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TimedOut { seconds: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_terminal_failed_is_fatal() {
        let mock = MockCluster::new();
        mock.script_phases("mover", &["Running", "Running", "Failed"])
            .await;
        let tm = manager(&mock);
        let task = tm.create_task(&pod("kube-system", "mover")).await.unwrap();

        let err = tm
            .wait_terminal(&[task], Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TaskFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_terminal_vanished_task_is_done() {
        let mock = MockCluster::new();
        let tm = manager(&mock);
        tm.wait_terminal(&[TaskRef::new("kube-system", "gone")], Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_succeeded_vanished_task_failed() {
        let mock = MockCluster::new();
        mock.script_phases("mover", &["Running"]).await;
        let tm = manager(&mock);
        let task = tm.create_task(&pod("kube-system", "mover")).await.unwrap();
        let remover = mock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            remover
                .delete_pod("kube-system", "mover", &DeleteParams::default())
                .await
                .unwrap();
        });

        let err = tm
            .wait_succeeded(&[task], Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TaskFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait_but_not_detached() {
        let mock = MockCluster::new();
        mock.script_phases("mover", &["Running"]).await;
        let tm = manager(&mock);
        let task = tm.create_task(&pod("kube-system", "mover")).await.unwrap();

        tm.token().cancel();
        let err = tm
            .wait_terminal(std::slice::from_ref(&task), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        tm.detached()
            .delete_and_wait_gone(&[task], true)
            .await
            .unwrap();
        assert!(mock.pod_names().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gone_or_pending() {
        let mock = MockCluster::new();
        let mut web = pod("default", "web-0");
        web.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        mock.add_pod(web).await;
        manager(&mock)
            .wait_gone_or_pending(&[
                TaskRef::new("default", "web-0"),
                TaskRef::new("default", "missing"),
            ])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_pods_respects_uid() {
        let mock = MockCluster::new();
        mock.add_pod(pod("default", "web-0")).await;
        mock.add_pod(pod("default", "web-1")).await;
        let tm = manager(&mock);

        let mut stale = TaskRef::new("default", "web-0");
        stale.uid = Some("not-the-uid".to_string());
        assert!(tm
            .delete_pods(&[stale], Duration::ZERO)
            .await
            .unwrap_err()
            .is_conflict());

        let current: Vec<TaskRef> = mock
            .list_pods(Some("default"))
            .await
            .unwrap()
            .iter()
            .map(TaskRef::from_pod)
            .collect();
        tm.delete_pods(&current, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(mock.pod_names().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_volume_until_gone_clears_finalizers() {
        let mock = MockCluster::new();
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some("pv1".to_string());
        pv.metadata.finalizers = Some(vec!["kubernetes.io/pv-protection".to_string()]);
        mock.add_volume(pv).await;
        mock.inject_fault(MockOp::UpdateVolume, "pv1", FaultKind::Conflict, 1)
            .await;

        manager(&mock).delete_volume_until_gone("pv1").await.unwrap();
        assert!(mock.volume_names().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_volume_bound() {
        let mock = MockCluster::new();
        mock.bind_created_volumes(false).await;
        let mut pv = PersistentVolume::default();
        pv.metadata.name = Some("pv1".to_string());
        mock.create_volume(&pv).await.unwrap();

        let tm = manager(&mock);
        let err = tm
            .wait_volume_bound("pv1", Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::TimedOut { .. }));

        mock.bind_created_volumes(true).await;
        pv.metadata.name = Some("pv2".to_string());
        mock.create_volume(&pv).await.unwrap();
        tm.wait_volume_bound("pv2", Duration::from_secs(3))
            .await
            .unwrap();
    }
}
