//! Single-object maintenance commands: add and delete recorded quota paths,
//! toggle a node's disk, and resize a volume.

use crate::error::{MigrateError, Result};
use hostpathpv_cluster::{retry_on_conflict, ClusterStore, TaskManager};
use hostpathpv_core::annotations::SCALE_STATE;
use hostpathpv_core::capacity::capacity_override;
use hostpathpv_core::quantities::MIB;
use hostpathpv_core::{
    format_bytes, get_capacity, is_hostpath_volume, paths, set_capacity, HostpathError, MountRecord,
};
use hostpathpv_core::{classify, PersistentVolume};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// How many times the scale report is polled
const SCALE_POLLS: u32 = 20;

const SCALE_POLL_INTERVAL: Duration = Duration::from_secs(1);

async fn get_hostpath_volume(store: &dyn ClusterStore, name: &str) -> Result<PersistentVolume> {
    let pv = store.get_volume(name).await?;
    if !is_hostpath_volume(&pv) {
        return Err(HostpathError::not_hostpath_volume(name).into());
    }
    Ok(pv)
}

/// Record a new shared quota path `node:path` on the volume
pub async fn add_path(store: &dyn ClusterStore, volume: &str, node: &str, path: &str) -> Result<()> {
    get_hostpath_volume(store, volume).await?;
    retry_on_conflict(&format!("volume {}", volume), move || async move {
        let mut pv = store.get_volume(volume).await?;
        let mut record = MountRecord::from_volume(&pv)?;
        record.add_path(node, path)?;
        record.write_to(&mut pv)?;
        store.update_volume(&pv).await?;
        Ok(())
    })
    .await?;
    info!(volume, node, path = %paths::clean(path), "Quota path added");
    Ok(())
}

/// Which recorded paths a delete removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteSelector {
    All,
    Node(String),
    Path { node: String, path: String },
}

impl DeleteSelector {
    /// Build from the `--all`, `--node` and `--path` flags
    pub fn from_flags(all: bool, node: Option<String>, path: Option<String>) -> Result<Self> {
        match (all, node, path) {
            (true, None, None) => Ok(Self::All),
            (false, Some(node), None) => Ok(Self::Node(node)),
            (false, Some(node), Some(path)) => Ok(Self::Path { node, path }),
            (true, _, _) => Err(MigrateError::validation(
                "--all cannot be combined with --node or --path",
                "Use either --all or --node [--path]",
            )),
            (false, None, _) => Err(MigrateError::validation(
                "No node given",
                "Use --node NODE [--path PATH] or --all",
            )),
        }
    }

    fn node(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Node(node) | Self::Path { node, .. } => Some(node),
        }
    }

    fn path(&self) -> Option<&str> {
        match self {
            Self::Path { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Paths a delete would remove, for confirmation
#[derive(Debug, Clone)]
pub struct DeletePlan {
    pub volume: String,
    pub selector: DeleteSelector,
    /// Entries as `node:path`
    pub removed: Vec<String>,
}

/// Work out which entries `selector` removes without changing anything
pub async fn plan_delete(store: &dyn ClusterStore, volume: &str, selector: DeleteSelector) -> Result<DeletePlan> {
    let pv = get_hostpath_volume(store, volume).await?;
    let mut record = MountRecord::from_volume(&pv)?;
    if record.is_empty() {
        return Err(MigrateError::no_quota_path(volume));
    }
    let removed = record.remove_paths(selector.node(), selector.path());
    Ok(DeletePlan {
        volume: volume.to_string(),
        selector,
        removed,
    })
}

/// Remove the planned entries; returns what was actually removed
pub async fn apply_delete(store: &dyn ClusterStore, plan: &DeletePlan) -> Result<Vec<String>> {
    if plan.removed.is_empty() {
        return Ok(Vec::new());
    }
    let volume = plan.volume.as_str();
    let selector = &plan.selector;
    let removed = retry_on_conflict(&format!("volume {}", volume), move || async move {
        let mut pv = store.get_volume(volume).await?;
        let mut record = MountRecord::from_volume(&pv)?;
        let removed = record.remove_paths(selector.node(), selector.path());
        if !removed.is_empty() {
            record.write_to(&mut pv)?;
            store.update_volume(&pv).await?;
        }
        Ok(removed)
    })
    .await?;
    info!(volume, removed = removed.len(), "Quota paths deleted");
    Ok(removed)
}

/// Enable or disable a quota disk of a node. Returns whether anything
/// changed.
pub async fn set_disk_disabled(store: &dyn ClusterStore, node: &str, disk: &str, disable: bool) -> Result<bool> {
    let changed = retry_on_conflict(&format!("node {}", node), move || async move {
        let mut current = store.get_node(node).await?;
        if !hostpathpv_core::set_disk_disabled(&mut current, disk, disable)? {
            return Ok(false);
        }
        store.update_node(&current).await?;
        Ok(true)
    })
    .await?;
    if changed {
        info!(node, disk = %paths::clean(disk), disable, "Disk state changed");
    } else {
        debug!(node, disk, disable, "Disk already in the requested state");
    }
    Ok(changed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOp {
    Up,
    Down,
    To,
}

impl ScaleOp {
    /// New capacity in bytes, `None` when it leaves the `i64` range
    fn target(self, current: i64, size: i64) -> Option<i64> {
        match self {
            Self::Up => current.checked_add(size),
            Self::Down => current.checked_sub(size),
            Self::To => Some(size),
        }
    }
}

impl FromStr for ScaleOp {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "to" => Ok(Self::To),
            other => Err(MigrateError::validation(
                format!("Unknown scale operation '{}'", other),
                "Use one of up, down or to",
            )),
        }
    }
}

impl fmt::Display for ScaleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::To => "to",
        })
    }
}

/// One node agent's answer to a resize
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleState {
    #[serde(default)]
    node_name: String,
    #[serde(default)]
    host_path: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    message: String,
}

fn scale_states(pv: &PersistentVolume) -> Vec<ScaleState> {
    let Some(raw) = pv.metadata.annotations.as_ref().and_then(|a| a.get(SCALE_STATE)) else {
        return Vec::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        debug!(error = %e, "Unreadable scale state");
        Vec::new()
    })
}

/// Resize outcome of one quota path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScale {
    pub node: String,
    pub path: String,
    /// `None` until the node agent reported, then empty on success or the
    /// agent's message
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleOutcome {
    /// Target equals the current capacity and no override was ever written
    Unchanged,
    /// Capacity written; the driver does not report per path
    Applied,
    /// Capacity written and the node agents were asked for their results
    Reported(Vec<PathScale>),
}

#[derive(Debug, Clone)]
pub struct ScaleReport {
    pub volume: String,
    pub op: ScaleOp,
    pub size_mib: u64,
    pub current: i64,
    pub target: i64,
    pub outcome: ScaleOutcome,
}

impl ScaleReport {
    /// All paths confirmed without error
    pub fn succeeded(&self) -> bool {
        match &self.outcome {
            ScaleOutcome::Unchanged | ScaleOutcome::Applied => true,
            ScaleOutcome::Reported(paths) => paths
                .iter()
                .all(|p| p.message.as_deref().is_some_and(str::is_empty)),
        }
    }

    /// Operator-facing result lines
    pub fn lines(&self) -> Vec<String> {
        let target = format_bytes(self.target);
        match &self.outcome {
            ScaleOutcome::Unchanged => vec![format!(
                "pv {} cursize is {} no change",
                self.volume,
                format_bytes(self.current)
            )],
            ScaleOutcome::Applied => vec![format!(
                "set pv {} capacity to {} success",
                self.volume, target
            )],
            ScaleOutcome::Reported(paths) => {
                let mut lines: Vec<String> = paths
                    .iter()
                    .filter_map(|p| match p.message.as_deref() {
                        Some("") => Some(format!(
                            "node [{}] path [{}] scale to {} success",
                            p.node, p.path, target
                        )),
                        Some(reason) => Some(format!(
                            "node [{}] path [{}] scale to {} fail because [{}]",
                            p.node, p.path, target, reason
                        )),
                        None => None,
                    })
                    .collect();
                if self.succeeded() {
                    lines.push(format!(
                        "scale pv {} {} {}Mi success, cur capacity:{}",
                        self.volume, self.op, self.size_mib, target
                    ));
                } else {
                    lines.push(format!(
                        "scale pv {} {} {}Mi fail",
                        self.volume, self.op, self.size_mib
                    ));
                }
                lines
            }
        }
    }
}

/// Resize a volume by `size_mib` (or to it, for [`ScaleOp::To`]).
///
/// CSI volumes are then polled for the node agents' per-path results.
pub async fn scale(tasks: &TaskManager, volume: &str, op: ScaleOp, size_mib: u64) -> Result<ScaleReport> {
    let store = tasks.store().as_ref();
    let pv = get_hostpath_volume(store, volume).await?;
    let size = i64::try_from(size_mib)
        .ok()
        .and_then(|mib| mib.checked_mul(MIB))
        .ok_or_else(|| MigrateError::validation(format!("{} MiB is too large", size_mib), "Pass a smaller size"))?;
    let current = get_capacity(&pv);
    let target = op.target(current, size).ok_or_else(|| {
        MigrateError::validation(
            format!("Scaling {} {} by {} MiB overflows its capacity of {} bytes", volume, op, size_mib, current),
            "Pass a smaller size",
        )
    })?;
    let mut report = ScaleReport {
        volume: volume.to_string(),
        op,
        size_mib,
        current,
        target,
        outcome: ScaleOutcome::Unchanged,
    };

    // Only a volume that already carries annotations but no override is
    // treated as unchanged.
    if current == target
        && pv.metadata.annotations.is_some()
        && capacity_override(&pv).unwrap_or_default().is_empty()
    {
        return Ok(report);
    }

    let mut checked = pv.clone();
    set_capacity(&mut checked, target)?;
    retry_on_conflict(&format!("volume {}", volume), move || async move {
        let mut fresh = store.get_volume(volume).await?;
        set_capacity(&mut fresh, target)?;
        store.update_volume(&fresh).await?;
        Ok(())
    })
    .await?;
    info!(volume, target, "Capacity updated");

    if !classify(&pv).is_modern() {
        report.outcome = ScaleOutcome::Applied;
        return Ok(report);
    }

    let mut results: Vec<PathScale> = MountRecord::from_volume(&pv)?
        .entries()
        .map(|(node, entry)| PathScale {
            node: node.to_string(),
            path: entry.host_path.clone(),
            message: None,
        })
        .collect();
    for attempt in 1..=SCALE_POLLS {
        let states = match store.get_volume(volume).await {
            Ok(fresh) => scale_states(&fresh),
            Err(e) => {
                debug!(attempt, error = %e, "Reading scale state failed");
                Vec::new()
            }
        };
        for result in results.iter_mut().filter(|r| r.message.is_none()) {
            if let Some(state) = states.iter().find(|s| {
                s.node_name == result.node && paths::same(&s.host_path, &result.path) && s.size == target
            }) {
                result.message = Some(state.message.clone());
            }
        }
        if attempt == SCALE_POLLS || results.iter().all(|r| r.message.is_some()) {
            break;
        }
        tasks.pause(SCALE_POLL_INTERVAL, "waiting for scale results").await?;
    }
    report.outcome = ScaleOutcome::Reported(results);
    Ok(report)
}
