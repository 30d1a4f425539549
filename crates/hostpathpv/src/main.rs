mod cli;

use clap::Parser;
use cli::{local_path, split_names, Cli, Commands};
use hostpathpv_cluster::{ApiClient, ClusterConfig, ClusterStore, TaskManager, TaskManagerConfig};
use hostpathpv_migrate::volume_ops::{self, DeleteSelector};
use hostpathpv_migrate::{
    move_across_nodes, move_within_node, plan_upgrade, upgrade_volumes, CrossNodeMove, LocalMove,
    MigrateError, MigrationContext, MoveOptions, NodePaths, Progress, Renderer, UpgradeOptions,
};
use std::future::Future;
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, MigrateError>;

/// Exit status when the operator interrupted, as a shell reports SIGINT
const EXIT_INTERRUPTED: u8 = 130;

const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let token = CancellationToken::new();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    tokio::spawn(forward_signals(signal_tx));
    tokio::spawn(escalate_signals(token.clone(), signal_rx, || {
        eprintln!("Interrupted again, exiting without finishing cleanup");
        std::process::exit(i32::from(EXIT_INTERRUPTED));
    }));

    match run(cli, token).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            let code = if e.is_interrupted() {
                EXIT_INTERRUPTED
            } else if e.is_usage() {
                EXIT_USAGE
            } else {
                1
            };
            eprintln!("{:?}", miette::Report::new(e));
            ExitCode::from(code)
        }
    }
}

/// Send one message per SIGINT or SIGTERM until nobody listens
async fn forward_signals(tx: mpsc::UnboundedSender<()>) {
    #[cfg(unix)]
    let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            None
        }
    };

    loop {
        #[cfg(unix)]
        let term = async {
            let received = match terminate.as_mut() {
                Some(stream) => stream.recv().await.is_some(),
                None => false,
            };
            if !received {
                std::future::pending::<()>().await;
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Cannot listen for ctrl-c");
                    return;
                }
            }
            _ = term => {}
        }
        if tx.send(()).is_err() {
            return;
        }
    }
}

/// Cancel `token` on the first signal. A second signal gives up on the
/// cleanup and calls `abort`.
async fn escalate_signals<A>(token: CancellationToken, mut signals: mpsc::UnboundedReceiver<()>, abort: A)
where
    A: FnOnce(),
{
    if signals.recv().await.is_none() {
        return;
    }
    info!("Interrupt received, cleaning up; interrupt again to exit at once");
    token.cancel();

    if signals.recv().await.is_none() {
        return;
    }
    warn!("Second interrupt received, leaving cleanup unfinished");
    abort();
}

fn connect(cli: &Cli) -> Result<Arc<dyn ClusterStore>> {
    let config = ClusterConfig::infer(cli.kubeconfig.as_deref(), cli.context.as_deref())?;
    let client = ApiClient::new(&config)?;
    debug!(server = client.base_url(), "Connected");
    Ok(Arc::new(client))
}

/// Ask a y/n question on stdout. Anything but `y` declines.
fn confirm(question: &str) -> bool {
    print!("{} (y/n):", question);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y"),
        Err(e) => {
            warn!(error = %e, "Cannot read the answer");
            false
        }
    }
}

/// Run a stepped operation with the terminal renderer attached
async fn with_progress<F, Fut>(tasks: TaskManager, op: F) -> Result<()>
where
    F: FnOnce(MigrationContext) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let (progress, rx) = Progress::channel();
    let renderer = tokio::spawn(Renderer::new(std::io::stdout()).run(rx));
    // The context owns the last sender; the renderer stops once it is gone.
    let result = op(MigrationContext::new(tasks, progress)).await;
    if let Err(e) = renderer.await {
        warn!(error = %e, "Progress renderer failed");
    }
    result
}

/// Returns `Ok(false)` when the command finished but did not fully succeed
async fn run(cli: Cli, token: CancellationToken) -> Result<bool> {
    let store = connect(&cli)?;
    let tasks = TaskManager::new(store.clone(), TaskManagerConfig::default(), token);

    match cli.command {
        Commands::Add { name, node, path, .. } => {
            volume_ops::add_path(store.as_ref(), &name, &node, &path).await?;
            println!("{}:{} add ok", node, hostpathpv_core::paths::clean(&path));
        }

        Commands::Delete {
            name,
            node,
            path,
            all,
            force,
            ..
        } => {
            let selector = DeleteSelector::from_flags(all, node, path)?;
            let plan = volume_ops::plan_delete(store.as_ref(), &name, selector).await?;
            if plan.removed.is_empty() {
                println!("not quota path to delete");
                return Ok(true);
            }
            if !force {
                for path in &plan.removed {
                    println!("{}", path);
                }
                if !confirm("Are sure to delete above quota path") {
                    return Ok(true);
                }
            }
            for path in volume_ops::apply_delete(store.as_ref(), &plan).await? {
                println!("{} delete ok", path);
            }
        }

        Commands::Setdisable {
            name, disk, disable, ..
        } => {
            volume_ops::set_disk_disabled(store.as_ref(), &name, &disk, disable).await?;
            println!("set success");
        }

        Commands::Move {
            name,
            from,
            to,
            force,
            movetimeout,
            movepodmemlimit,
            tmppvkeepwait,
            moveimage,
            alwayspullmoveimage,
            ..
        } => {
            let options = MoveOptions {
                image: moveimage,
                always_pull: alwayspullmoveimage,
                memory_limit_mib: movepodmemlimit,
                move_timeout: Duration::from_secs(movetimeout),
                keep_wait: Duration::from_secs(tmppvkeepwait),
            };
            match name {
                Some(node) => {
                    let plan = LocalMove::new(node.as_str(), &local_path(&node, &from)?, &local_path(&node, &to)?);
                    println!("{}:{} -> {}:{}", plan.node, plan.source, plan.node, plan.dest_disk);
                    if !force && !confirm("Are you sure to move these hostpaths") {
                        return Ok(true);
                    }
                    with_progress(tasks, |ctx| async move {
                        move_within_node(&ctx, &plan, &options).await
                    })
                    .await?;
                }
                None => {
                    let plan = CrossNodeMove::new(NodePaths::parse(&from)?, NodePaths::parse(&to)?);
                    for line in plan.describe() {
                        println!("{}", line);
                    }
                    if !force && !confirm("Are you sure to move these hostpaths") {
                        return Ok(true);
                    }
                    with_progress(tasks, |ctx| async move {
                        move_across_nodes(&ctx, &plan, &options).await
                    })
                    .await?;
                }
            }
        }

        Commands::Upgrade {
            names,
            upgradeimage,
            deleteinterval,
            force,
            ..
        } => {
            let plan = plan_upgrade(store.as_ref(), &split_names(&names)).await?;
            if !force
                && !confirm(&format!(
                    "Are you sure to upgrade pv {:?} by delete pods {:?}",
                    plan.volume_names(),
                    plan.pod_names()
                ))
            {
                return Ok(true);
            }
            let options = UpgradeOptions {
                image: upgradeimage,
                delete_interval: deleteinterval,
                ..Default::default()
            };
            with_progress(tasks, |ctx| async move {
                upgrade_volumes(&ctx, &plan, &options).await
            })
            .await?;
        }

        Commands::Scale { name, op, size, .. } => {
            let report = volume_ops::scale(&tasks, &name, op, size).await?;
            for line in report.lines() {
                println!("{}", line);
            }
            return Ok(report.succeeded());
        }
    }
    Ok(true)
}
