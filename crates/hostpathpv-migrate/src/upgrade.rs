//! Switching legacy hostPath volumes to the hostpath CSI driver.
//!
//! The quota directories stay where they are. Converter tasks tag them as
//! CSI managed, a temporary CSI volume holds them while the legacy object is
//! replaced by a CSI object of the same name, and finally the pods using the
//! claims are restarted so they attach through the new driver.

use crate::context::MigrationContext;
use crate::error::{MigrateError, Result};
use crate::inventory::pods_using_claims;
use crate::move_remote::register_task_cleanup;
use crate::options::UpgradeOptions;
use hostpathpv_cluster::{templates, volumes, ClusterStore, TaskRef};
use hostpathpv_core::{driver_of, name_of, Driver, MountRecord};
use k8s_openapi::api::core::v1::PersistentVolume;
use std::time::Duration;
use tracing::{info, warn};

/// Attempts at creating each replacement volume
const CREATE_ATTEMPTS: u32 = 5;

const CREATE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Validated input of an upgrade
#[derive(Debug, Clone)]
pub struct UpgradePlan {
    /// Volumes as they were before anything changed
    pub volumes: Vec<PersistentVolume>,
    /// Pods mounting the volumes' claims
    pub pods: Vec<TaskRef>,
}

impl UpgradePlan {
    pub fn volume_names(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|pv| name_of(&pv.metadata).to_string())
            .collect()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.pods.iter().map(|p| p.name.clone()).collect()
    }
}

/// Fetch and check the named volumes and find the pods using them.
///
/// Every volume must be a legacy hostPath volume, and all bound claims must
/// live in one namespace.
pub async fn plan_upgrade(store: &dyn ClusterStore, names: &[String]) -> Result<UpgradePlan> {
    if names.is_empty() {
        return Err(MigrateError::validation(
            "No volume to upgrade",
            "Pass one or more comma separated volume names",
        ));
    }

    let mut volumes = Vec::with_capacity(names.len());
    for name in names {
        let pv = store.get_volume(name).await?;
        if driver_of(&pv) != Some(Driver::Legacy) {
            return Err(MigrateError::validation(
                format!("Volume {} is not a hostPath volume", name),
                "Only volumes with a hostPath source can be upgraded",
            ));
        }
        volumes.push(pv);
    }

    let mut namespace: Option<String> = None;
    let mut claims = Vec::new();
    for pv in &volumes {
        let Some(claim) = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref()) else {
            continue;
        };
        let claim_ns = claim.namespace.clone().unwrap_or_default();
        match &namespace {
            None => namespace = Some(claim_ns),
            Some(ns) if *ns != claim_ns => {
                return Err(MigrateError::validation(
                    format!("Volumes are claimed from two namespaces, {} and {}", ns, claim_ns),
                    "Upgrade the volumes of each namespace separately",
                ));
            }
            Some(_) => {}
        }
        claims.push(claim.name.clone().unwrap_or_default());
    }

    let pods = match &namespace {
        Some(ns) => {
            let listed = store.list_pods(Some(ns)).await?;
            pods_using_claims(&listed, &claims)
                .into_iter()
                .map(TaskRef::from_pod)
                .collect()
        }
        None => Vec::new(),
    };
    Ok(UpgradePlan { volumes, pods })
}

/// Run the upgrade; cleanup runs whatever the outcome
pub async fn upgrade_volumes(
    ctx: &MigrationContext,
    plan: &UpgradePlan,
    options: &UpgradeOptions,
) -> Result<()> {
    let result = run(ctx, plan, options).await;
    ctx.finish(result).await
}

async fn run(ctx: &MigrationContext, plan: &UpgradePlan, options: &UpgradeOptions) -> Result<String> {
    let tasks = ctx.tasks();
    let store = tasks.store().clone();
    let names = plan.volume_names();

    // 1
    let converters = ctx
        .step(1, "Start create pods to change quotapath type:", async {
            let image = options.converter_image();
            let mut created = Vec::new();
            for pv in &plan.volumes {
                let volume = name_of(&pv.metadata);
                let record = MountRecord::from_volume(pv)?;
                for group in record.nodes() {
                    let paths: Vec<String> = group
                        .mount_infos
                        .iter()
                        .map(|e| e.host_path.clone())
                        .collect();
                    if paths.is_empty() {
                        continue;
                    }
                    let pod = templates::converter_task(
                        &templates::converter_task_name(&group.node_name, volume),
                        &group.node_name,
                        &paths,
                        &image,
                    );
                    let task = tasks.create_task(&pod).await?;
                    register_task_cleanup(ctx, &task);
                    created.push(task);
                }
            }
            Ok(created)
        })
        .await?;

    // 2
    ctx.step(2, "Start wait change quotapath type pod exit:", async {
        tasks
            .wait_terminal(&converters, options.convert_timeout)
            .await?;
        Ok(())
    })
    .await?;

    // 3
    ctx.step(3, "Start create CSI hostpath pv to keep quota dir:", async {
        for pv in &plan.volumes {
            let name = volumes::upgrade_placeholder_name(name_of(&pv.metadata));
            store
                .create_volume(&volumes::replacement_volume(&name, pv, false))
                .await?;
            ctx.register(format!("delete pv {}", name), move |tasks| async move {
                tasks.delete_volume_until_gone(&name).await
            });
        }
        Ok(())
    })
    .await?;

    // 4 and 5 swap the volume objects; once the first legacy object is
    // deleted they run to the end on a manager that ignores the interrupt.
    let swapping = tasks.detached();
    ctx.step(4, format!("Start delete old hostpath pv {:?}:", names), async {
        for name in &names {
            swapping.delete_volume_until_gone(name).await?;
            info!(volume = %name, "Legacy volume object removed");
        }
        Ok(())
    })
    .await?;

    // 5
    ctx.commit_step(5, "Start create CSI hostpath pv to replace:", async {
        for pv in &plan.volumes {
            let replacement = volumes::replacement_volume(name_of(&pv.metadata), pv, true);
            let mut attempt = 1;
            loop {
                match store.create_volume(&replacement).await {
                    Ok(_) => break,
                    Err(e) if attempt < CREATE_ATTEMPTS => {
                        warn!(volume = name_of(&pv.metadata), attempt, error = %e, "Creating replacement volume failed, retrying");
                        attempt += 1;
                        swapping
                            .pause(CREATE_RETRY_INTERVAL, "creating replacement volumes")
                            .await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    })
    .await?;

    // 6
    ctx.step(6, "Start wait CSI hostpath pv bound:", async {
        for pv in &plan.volumes {
            let was_bound = pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
            if was_bound {
                tasks
                    .wait_volume_bound(name_of(&pv.metadata), options.bind_timeout)
                    .await?;
            }
        }
        Ok(())
    })
    .await?;

    // 7
    ctx.step(7, "Start delete using hostpath pv pods:", async {
        tasks
            .delete_pods(&plan.pods, options.delete_interval)
            .await?;
        Ok(())
    })
    .await?;

    Ok(format!(
        "Upgrade hostpath pv {:?} to csi hostpath pv success",
        names
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::fixtures::{pod, volume};
    use crate::progress::{Progress, ProgressEvent};
    use hostpathpv_cluster::{FaultKind, MockCluster, MockOp, TaskManager, TaskManagerConfig};
    use hostpathpv_core::{classify, VolumeClass};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    async fn cluster() -> MockCluster {
        let mock = MockCluster::new();
        let web = pod("web-0", "uid-web", "n1", "pv1-claim");
        let mut pv = volume("pv1", true, &[("n1", "/d1/a", 600, 400, Some(&web))]);
        pv.metadata.finalizers = Some(vec!["kubernetes.io/pv-protection".to_string()]);
        pv.metadata.labels = Some([("team".to_string(), "db".to_string())].into());
        mock.add_volume(pv).await;
        mock.add_pod(web).await;
        mock.add_pod(pod("other", "uid-other", "n1", "unrelated-claim")).await;
        mock.bind_created_volumes(true).await;
        mock
    }

    fn context(mock: &MockCluster) -> (MigrationContext, tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
        let tasks = TaskManager::new(
            Arc::new(mock.clone()),
            TaskManagerConfig::default(),
            CancellationToken::new(),
        );
        let (progress, rx) = Progress::channel();
        (MigrationContext::new(tasks, progress), rx)
    }

    #[tokio::test]
    async fn test_plan_finds_pods_of_claims() {
        let mock = cluster().await;
        let plan = plan_upgrade(&mock, &names(&["pv1"])).await.unwrap();
        assert_eq!(plan.volume_names(), names(&["pv1"]));
        assert_eq!(plan.pod_names(), names(&["web-0"]));
        assert!(mock.calls().await.contains(&"ListPods default".to_string()));
    }

    #[tokio::test]
    async fn test_plan_rejects_bad_input() {
        let mock = cluster().await;
        let mut other = volume("pv2", true, &[]);
        if let Some(claim) = other.spec.as_mut().and_then(|s| s.claim_ref.as_mut()) {
            claim.namespace = Some("prod".to_string());
        }
        mock.add_volume(other).await;

        let err = plan_upgrade(&mock, &names(&["pv1", "pv2"])).await.unwrap_err();
        assert!(err.is_usage());
        assert!(plan_upgrade(&mock, &[]).await.unwrap_err().is_usage());
        assert!(plan_upgrade(&mock, &names(&["missing"]))
            .await
            .unwrap_err()
            .to_string()
            .contains("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_replaces_volume_object() {
        let mock = cluster().await;
        let old = mock.get_volume("pv1").await.unwrap();
        let plan = plan_upgrade(&mock, &names(&["pv1"])).await.unwrap();
        let (ctx, mut rx) = context(&mock);

        upgrade_volumes(&ctx, &plan, &UpgradeOptions::default())
            .await
            .unwrap();

        let new = mock.get_volume("pv1").await.unwrap();
        assert_eq!(classify(&new), VolumeClass::ModernKeepTrue);
        let csi = new.spec.as_ref().and_then(|s| s.csi.as_ref()).unwrap();
        assert_eq!(csi.volume_handle, old.metadata.uid.clone().unwrap());
        assert_eq!(new.metadata.labels, old.metadata.labels);
        assert_eq!(
            MountRecord::from_volume(&new).unwrap(),
            MountRecord::from_volume(&old).unwrap()
        );

        // Placeholder and converter are gone; only the unrelated pod remains.
        assert_eq!(mock.volume_names().await, names(&["pv1"]));
        assert_eq!(mock.pod_names().await, names(&["default/other"]));
        assert!(mock
            .calls()
            .await
            .contains(&"CreatePod change-n1-pv1-quotapath-tmppod".to_string()));

        let mut summary = None;
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Summary { text } = event {
                summary = Some(text);
            }
        }
        assert_eq!(
            summary.as_deref(),
            Some("Upgrade hostpath pv [\"pv1\"] to csi hostpath pv success")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_swap_still_replaces_volume() {
        let mock = cluster().await;
        let plan = plan_upgrade(&mock, &names(&["pv1"])).await.unwrap();
        let (ctx, _rx) = context(&mock);
        let token = ctx.tasks().token().clone();
        let watched = mock.clone();
        tokio::spawn(async move {
            while !watched.calls().await.contains(&"DeleteVolume pv1".to_string()) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            token.cancel();
        });

        let err = upgrade_volumes(&ctx, &plan, &UpgradeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Interrupted { step: 6 }));
        let new = mock.get_volume("pv1").await.unwrap();
        assert_eq!(classify(&new), VolumeClass::ModernKeepTrue);
        assert_eq!(mock.volume_names().await, names(&["pv1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_creation_retries_then_fails() {
        let mock = cluster().await;
        let plan = plan_upgrade(&mock, &names(&["pv1"])).await.unwrap();
        mock.inject_fault(MockOp::CreateVolume, "pv1", FaultKind::ServerError, 5)
            .await;
        let (ctx, mut rx) = context(&mock);

        let err = upgrade_volumes(&ctx, &plan, &UpgradeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Cluster(_)));
        let attempts = mock
            .calls()
            .await
            .iter()
            .filter(|c| c.as_str() == "CreateVolume pv1")
            .count();
        assert_eq!(attempts, 5);

        let mut failed = None;
        let mut cleaned = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ProgressEvent::StepFinished { step, ok: false, .. } => failed = Some(step),
                ProgressEvent::Cleanup { label, .. } => cleaned.push(label),
                _ => {}
            }
        }
        assert_eq!(failed, Some(5));
        assert_eq!(cleaned.len(), 2);
        assert!(cleaned[0].ends_with("-csihostpathpv-tmp"));
        assert!(mock.volume_names().await.is_empty());
        assert_eq!(mock.pod_names().await.len(), 2);
    }
}
