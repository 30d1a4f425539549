//! Node schedulability toggling.

use hostpathpv_cluster::{retry_on_conflict, ClusterStore, Result};
use tracing::{info, warn};

async fn set_unschedulable(store: &dyn ClusterStore, name: &str, unschedulable: bool) -> Result<bool> {
    retry_on_conflict(&format!("node {}", name), move || async move {
        let mut node = store.get_node(name).await?;
        let current = node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        if current == unschedulable {
            return Ok(false);
        }
        node.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        store.update_node(&node).await?;
        Ok(true)
    })
    .await
}

/// Mark the nodes unschedulable and return the ones that actually changed.
///
/// Nodes already cordoned are left out of the result so they stay cordoned
/// afterwards. On failure the nodes changed so far are restored before the
/// error is returned.
pub async fn cordon(store: &dyn ClusterStore, names: &[String]) -> Result<Vec<String>> {
    let mut changed: Vec<String> = Vec::new();
    for name in names {
        if changed.contains(name) {
            continue;
        }
        match set_unschedulable(store, name, true).await {
            Ok(true) => {
                info!(node = %name, "Node cordoned");
                changed.push(name.clone());
            }
            Ok(false) => {}
            Err(e) => {
                if let Err(revert) = uncordon(store, &changed).await {
                    warn!(error = %revert, "Failed to restore nodes after a partial cordon");
                }
                return Err(e);
            }
        }
    }
    Ok(changed)
}

/// Mark the nodes schedulable again; nodes already schedulable are skipped
pub async fn uncordon(store: &dyn ClusterStore, names: &[String]) -> Result<()> {
    for name in names {
        if set_unschedulable(store, name, false).await? {
            info!(node = %name, "Node uncordoned");
        }
    }
    Ok(())
}
