//! Moving one quota path to another disk of the same node.

use crate::context::MigrationContext;
use crate::cordon::{cordon, uncordon};
use crate::error::Result;
use crate::inventory::Inventory;
use crate::move_remote::{delete_volume, pod_list, register_task_cleanup, repoint_paths};
use crate::options::MoveOptions;
use crate::precheck::check_can_move;
use hostpathpv_cluster::{templates, volumes, TaskRef};
use hostpathpv_core::{format_bytes, paths};
use tracing::info;

/// A quota path and the disk of the same node it moves to
#[derive(Debug, Clone)]
pub struct LocalMove {
    pub node: String,
    pub source: String,
    pub dest_disk: String,
}

impl LocalMove {
    pub fn new(node: impl Into<String>, source: &str, dest_disk: &str) -> Self {
        Self {
            node: node.into(),
            source: paths::clean(source),
            dest_disk: paths::clean(dest_disk),
        }
    }

    pub fn dest_dir(&self) -> String {
        paths::join(&self.dest_disk, &paths::base(&self.source))
    }
}

/// Run the same-node move; cleanup runs whatever the outcome
pub async fn move_within_node(
    ctx: &MigrationContext,
    plan: &LocalMove,
    options: &MoveOptions,
) -> Result<()> {
    let result = run(ctx, plan, options).await;
    ctx.finish(result).await
}

async fn run(ctx: &MigrationContext, plan: &LocalMove, options: &MoveOptions) -> Result<String> {
    let tasks = ctx.tasks();
    let store = tasks.store().clone();
    let node = plan.node.as_str();
    let sources = vec![plan.source.clone()];
    let dest_dir = plan.dest_dir();

    // 1
    let inventory = ctx
        .step(1, "Start check quota path is moveable:", async {
            let current = store.get_node(node).await?;
            let inventory = Inventory::load(store.as_ref()).await?;
            check_can_move(
                &current,
                &current,
                &inventory,
                &sources,
                std::slice::from_ref(&plan.dest_disk),
            )?;
            Ok(inventory)
        })
        .await?;
    let (volume, quota, used) = match inventory.locate(node, &plan.source) {
        Some(l) => (
            l.volume_name().to_string(),
            l.entry.quota_size,
            l.entry.current_size,
        ),
        None => (String::new(), 0, 0),
    };

    // 2
    ctx.step(2, format!("Start create tmp pv to keep {} :", dest_dir), async {
        let name = volumes::local_placeholder_name(node);
        let pv = volumes::placeholder_volume(&name, node, &[(dest_dir.clone(), quota)])?;
        store.create_volume(&pv).await?;
        ctx.register(format!("delete pv {}", name), move |tasks| async move {
            delete_volume(&tasks, &name).await
        });
        Ok(())
    })
    .await?;

    // 3
    let cordoned = ctx
        .step(3, format!("Start set node {} unscheduleable:", node), async {
            let changed = cordon(store.as_ref(), &[node.to_string()]).await?;
            let restore = changed.clone();
            ctx.register(
                format!("set node {:?} scheduleable", changed),
                move |tasks| async move { uncordon(tasks.store().as_ref(), &restore).await },
            );
            Ok(changed)
        })
        .await?;

    // 4
    let workloads: Vec<TaskRef> = inventory
        .pods_using_path(node, &plan.source)
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
        tasks.wait_gone_or_pending(&workloads).await?;
        Ok(())
    })
    .await?;

    // 6
    let mover = ctx
        .step(6, "Start create pod to move:", async {
            let pod = templates::local_mover_task(
                &templates::local_mover_task_name(node),
                node,
                &plan.source,
                &plan.dest_disk,
                &options.local_image(),
            );
            let mover = tasks.create_task(&pod).await?;
            register_task_cleanup(ctx, &mover);
            Ok(mover)
        })
        .await?;

    // 7
    let timeout = options.move_timeout;
    ctx.step(
        7,
        format!(
            "Start move size={} , timeOut={}s:",
            format_bytes(used),
            timeout.as_secs()
        ),
        async {
            tasks
                .wait_succeeded(std::slice::from_ref(&mover), timeout)
                .await?;
            Ok(())
        },
    )
    .await?;

    // 8
    ctx.step(
        8,
        format!(
            "Start change PV[{}] mount history to {}:{}:",
            volume, node, dest_dir
        ),
        async {
            let moves = [(plan.source.clone(), dest_dir.clone())];
            repoint_paths(store.as_ref(), &inventory, node, node, &moves).await
        },
    )
    .await?;

    // 9
    ctx.step(9, format!("Start set node {} scheduleable:", node), async {
        uncordon(store.as_ref(), &cordoned).await?;
        Ok(())
    })
    .await?;

    info!(node, from = %plan.source, to = %dest_dir, "Same-node move finished");
    Ok(format!(
        "Move {}:{} to {}:{} success",
        node, plan.source, node, dest_dir
    ))
}
