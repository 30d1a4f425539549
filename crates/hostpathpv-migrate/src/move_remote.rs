//! Moving quota paths from one node to another.
//!
//! Twelve steps: check, reserve the destination with a placeholder volume,
//! cordon both nodes, evict the pods using the paths, start a data server on
//! the source node and a mover on the destination node, wait for the copy,
//! repoint the mount records and uncordon. Every transient object is
//! registered for cleanup the moment it exists.

use crate::context::MigrationContext;
use crate::cordon::{cordon, uncordon};
use crate::error::{MigrateError, Result};
use crate::inventory::Inventory;
use crate::options::MoveOptions;
use crate::precheck::{check_can_move, check_paths_belong_to_one_pod, Violation};
use crate::progress::Progress;
use futures_util::StreamExt;
use hostpathpv_cluster::templates::{self, MOVE_CONTAINER, TASK_NAMESPACE};
use hostpathpv_cluster::{retry_on_conflict, volumes, ClusterStore, TaskManager, TaskRef};
use hostpathpv_core::{format_bytes, paths, MountRecord};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Marker of the progress lines the mover prints
const MOVED_SENTINEL: &str = "Has moved";

/// A node and some paths on it, as given on the command line (`n1:/a,/b`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePaths {
    pub node: String,
    pub paths: Vec<String>,
}

impl NodePaths {
    pub fn parse(arg: &str) -> Result<Self> {
        let mut parts = arg.split(':');
        let (Some(node), Some(list), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(MigrateError::validation(
                format!("'{}' is not of the form NODE:PATH[,PATH]", arg),
                "Use for example --from node1:/xfs/disk1/dir1,/xfs/disk1/dir2",
            ));
        };
        let paths: Vec<String> = list
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(|p| paths::clean(p.trim()))
            .collect();
        if node.is_empty() || paths.is_empty() {
            return Err(MigrateError::validation(
                format!("'{}' names no node or no path", arg),
                "Both the node name and at least one path are required",
            ));
        }
        Ok(Self {
            node: node.to_string(),
            paths,
        })
    }
}

impl fmt::Display for NodePaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.paths.join(","))
    }
}

/// Quota paths on one node and the disks on another node receiving them
#[derive(Debug, Clone)]
pub struct CrossNodeMove {
    pub from: NodePaths,
    pub to: NodePaths,
}

impl CrossNodeMove {
    pub fn new(from: NodePaths, to: NodePaths) -> Self {
        Self { from, to }
    }

    /// Directory each source lands in: the destination disk joined with the
    /// source's last element
    pub fn dest_dirs(&self) -> Vec<String> {
        self.from
            .paths
            .iter()
            .zip(&self.to.paths)
            .map(|(src, disk)| paths::join(disk, &paths::base(src)))
            .collect()
    }

    /// `from -> to` lines shown for confirmation
    pub fn describe(&self) -> Vec<String> {
        self.from
            .paths
            .iter()
            .zip(&self.to.paths)
            .map(|(src, disk)| format!("{}:{} -> {}:{}", self.from.node, src, self.to.node, disk))
            .collect()
    }
}

/// Run the cross-node move; cleanup runs whatever the outcome
pub async fn move_across_nodes(
    ctx: &MigrationContext,
    plan: &CrossNodeMove,
    options: &MoveOptions,
) -> Result<()> {
    let result = run(ctx, plan, options).await;
    ctx.finish(result).await
}

async fn run(ctx: &MigrationContext, plan: &CrossNodeMove, options: &MoveOptions) -> Result<String> {
    let tasks = ctx.tasks();
    let store = tasks.store().clone();
    let from = plan.from.node.as_str();
    let to = plan.to.node.as_str();
    let sources = &plan.from.paths;
    let disks = &plan.to.paths;
    let dest_dirs = plan.dest_dirs();
    let image = options.transfer_image();

    // 1
    let inventory = ctx
        .step(1, "Start check quota path is moveable:", async {
            let from_node = store.get_node(from).await?;
            let to_node = store.get_node(to).await?;
            let inventory = Inventory::load(store.as_ref()).await?;
            check_paths_belong_to_one_pod(sources, &inventory, from)?;
            check_can_move(&from_node, &to_node, &inventory, sources, disks)?;
            Ok(inventory)
        })
        .await?;

    // 2
    let placeholder = volumes::placeholder_name(to, &dest_dirs);
    let reserved: Vec<(String, i64)> = sources
        .iter()
        .zip(&dest_dirs)
        .map(|(src, dir)| {
            let quota = inventory
                .locate(from, src)
                .map(|l| l.entry.quota_size)
                .unwrap_or(0);
            (dir.clone(), quota)
        })
        .collect();
    let keep_wait = options.keep_wait.as_secs();
    ctx.step(
        2,
        format!(
            "Start create tmp pv {} and sleep {}s to keep dir in {}:",
            placeholder, keep_wait, to
        ),
        async {
            let pv = volumes::placeholder_volume(&placeholder, to, &reserved)?;
            store.create_volume(&pv).await?;
            let name = placeholder.clone();
            ctx.register(format!("delete pv {}", placeholder), move |tasks| async move {
                delete_volume(&tasks, &name).await
            });
            countdown(tasks, ctx.progress(), 2, keep_wait).await
        },
    )
    .await?;

    // 3
    let cordoned = ctx
        .step(
            3,
            format!("Start set node {}, {} unscheduleable:", from, to),
            async {
                let changed =
                    cordon(store.as_ref(), &[from.to_string(), to.to_string()]).await?;
                let restore = changed.clone();
                ctx.register(
                    format!("set node {:?} scheduleable", changed),
                    move |tasks| async move { uncordon(tasks.store().as_ref(), &restore).await },
                );
                Ok(changed)
            },
        )
        .await?;

    // 4
    let workloads: Vec<TaskRef> = inventory
        .pods_using_path(from, &sources[0])
        .into_iter()
        .map(TaskRef::from_pod)
        .collect();
    let names = pod_list(&workloads);
    ctx.step(4, format!("Start delete pods{}:", names), async {
        tasks
            .delete_pods(&workloads, std::time::Duration::ZERO)
            .await?;
        Ok(())
    })
    .await?;

    // 5
    ctx.step(5, format!("Start wait pods{} deleted:", names), async {
        tasks.delete_and_wait_gone(&workloads, false).await?;
        Ok(())
    })
    .await?;

    // 6
    let sender_name = templates::sender_task_name(from, sources);
    let sender = ctx
        .step(6, "Start create from pod to move:", async {
            let pod = templates::sender_task(&sender_name, from, sources, &image);
            let sender = tasks.create_task(&pod).await?;
            register_task_cleanup(ctx, &sender);
            Ok(sender)
        })
        .await?;

    // 7
    let server_ip = ctx
        .step(
            7,
            format!("Start wait from pod [{}] to running:", sender.name),
            async {
                let running = tasks.wait_running(std::slice::from_ref(&sender)).await?;
                running
                    .first()
                    .and_then(|p| p.status.as_ref())
                    .and_then(|s| s.pod_ip.clone())
                    .filter(|ip| !ip.is_empty())
                    .ok_or_else(|| {
                        hostpathpv_cluster::ClusterError::task_failed(
                            &sender.namespace,
                            &sender.name,
                            "running without a pod IP",
                        )
                        .into()
                    })
            },
        )
        .await?;

    // 8
    let mover_name = templates::mover_task_name(to, &dest_dirs);
    let mover = ctx
        .step(8, format!("Start create scp move pod :{}", mover_name), async {
            let pod = templates::mover_task(&mover_name, to, &server_ip, sources, disks, &image);
            let mover = tasks.create_task(&pod).await?;
            register_task_cleanup(ctx, &mover);
            Ok(mover)
        })
        .await?;

    // 9
    ctx.step(
        9,
        format!("Start wait to pod [{}] to running:", mover.name),
        async {
            tasks.wait_running(std::slice::from_ref(&mover)).await?;
            Ok(())
        },
    )
    .await?;

    // 10
    let size = inventory.used_size(from, sources);
    let timeout = options.move_timeout;
    ctx.step(
        10,
        format!(
            "Start wait move size={} , timeOut={}s:",
            format_bytes(size),
            timeout.as_secs()
        ),
        async {
            let stop = tasks.token().child_token();
            let reporter = tokio::spawn(report_transfer(
                tasks.clone(),
                mover.clone(),
                ctx.progress().clone(),
                10,
                stop.clone(),
            ));
            let waited = tasks.wait_succeeded(std::slice::from_ref(&mover), timeout).await;
            stop.cancel();
            if let Err(e) = reporter.await {
                debug!(error = %e, "Transfer reporter ended abnormally");
            }
            waited?;
            Ok(())
        },
    )
    .await?;

    // 11: no cancellable wait in here, an interrupt cannot split the commit
    ctx.step(11, "Start change PV mount history", async {
        let moves: Vec<(String, String)> = sources.iter().cloned().zip(dest_dirs.iter().cloned()).collect();
        repoint_paths(store.as_ref(), &inventory, from, to, &moves).await
    })
    .await?;

    // 12
    ctx.step(
        12,
        format!("Start set node {:?} scheduleable:", cordoned),
        async {
            uncordon(store.as_ref(), &cordoned).await?;
            Ok(())
        },
    )
    .await?;

    info!(from, to, paths = sources.len(), "Cross-node move finished");
    Ok(format!("Move hostpaths from {} to {} success", from, to))
}

pub(crate) fn pod_list(pods: &[TaskRef]) -> String {
    let names: Vec<String> = pods.iter().map(|p| p.to_string()).collect();
    format!("[{}]", names.join(" "))
}

pub(crate) async fn delete_volume(tasks: &TaskManager, name: &str) -> hostpathpv_cluster::Result<()> {
    match tasks.store().delete_volume(name).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    }
}

/// Register deletion of a worker task created inside the current step
pub(crate) fn register_task_cleanup(ctx: &MigrationContext, task: &TaskRef) {
    let target = task.clone();
    ctx.register(format!("delete pod {}", task), move |tasks| async move {
        tasks
            .delete_and_wait_gone(std::slice::from_ref(&target), true)
            .await
    });
}

/// Hold for `secs` seconds, showing `(i/secs)` as the step detail
pub(crate) async fn countdown(
    tasks: &TaskManager,
    progress: &Progress,
    step: usize,
    secs: u64,
) -> Result<()> {
    for i in 1..=secs {
        progress.detail(step, format!("({}/{})", i, secs));
        tasks
            .pause(std::time::Duration::from_secs(1), "holding the destination")
            .await?;
    }
    Ok(())
}

/// Relay the mover's transfer lines as step details until `stop` fires or
/// the log ends
async fn report_transfer(
    tasks: TaskManager,
    mover: TaskRef,
    progress: Progress,
    step: usize,
    stop: CancellationToken,
) {
    let mut lines = match tasks.follow_logs(&mover, MOVE_CONTAINER).await {
        Ok(lines) => lines,
        Err(e) => {
            debug!(task = %mover, error = %e, "Mover log unavailable");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.next() => match line {
                Some(Ok(line)) if line.contains(MOVED_SENTINEL) => {
                    progress.detail(step, format!("[ {} ]", line.trim()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(task = %mover, error = %e, "Mover log stream broke");
                    break;
                }
                None => break,
            },
        }
    }
}

/// Move every `(source, dest_dir)` entry of `from` to `to`.
///
/// Entries are grouped by volume and each volume is rewritten in a single
/// update. All volumes are read and checked before the first update, so a
/// missing entry leaves every record untouched.
pub(crate) async fn repoint_paths(
    store: &dyn ClusterStore,
    inventory: &Inventory,
    from: &str,
    to: &str,
    moves: &[(String, String)],
) -> Result<()> {
    let mut groups: Vec<(String, Vec<(String, String)>)> = Vec::new();
    for (src, dest) in moves {
        let Some(located) = inventory.locate(from, src) else {
            return Err(Violation::NotAQuotaPath {
                node: from.to_string(),
                path: paths::clean(src),
            }
            .into());
        };
        let volume = located.volume_name().to_string();
        match groups.iter_mut().find(|(v, _)| *v == volume) {
            Some((_, entries)) => entries.push((src.clone(), dest.clone())),
            None => groups.push((volume, vec![(src.clone(), dest.clone())])),
        }
    }

    for (volume, entries) in &groups {
        let pv = store.get_volume(volume).await?;
        let mut record = MountRecord::from_volume(&pv)?;
        for (src, dest) in entries {
            record.repoint(volume, from, src, to, dest)?;
        }
    }

    for (volume, entries) in &groups {
        retry_on_conflict(&format!("volume {}", volume), move || async move {
            let mut pv = store.get_volume(volume).await?;
            let mut record = MountRecord::from_volume(&pv)?;
            for (src, dest) in entries {
                record.repoint(volume, from, src, to, dest)?;
            }
            record.write_to(&mut pv)?;
            store.update_volume(&pv).await?;
            Ok(())
        })
        .await?;
        info!(volume = %volume, paths = entries.len(), from, to, "Mount record repointed");
    }
    Ok(())
}
