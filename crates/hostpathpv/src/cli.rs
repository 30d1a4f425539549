use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use hostpathpv_migrate::options::{DEFAULT_MOVE_IMAGE, DEFAULT_UPGRADE_IMAGE};
use hostpathpv_migrate::{MigrateError, NodePaths, ScaleOp};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "hostpathpv",
    version,
    about = "Manage quota paths of hostpath persistent volumes"
)]
pub struct Cli {
    /// Path to the kubeconfig file
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Log filter, e.g. `info` or `hostpathpv_migrate=debug`
    #[arg(long, global = true, env = "HOSTPATHPV_LOG")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Resource type accepted by volume commands
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeResource {
    #[value(alias = "pvs")]
    Pv,
}

/// Resource type accepted by node commands
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeResource {
    #[value(alias = "nodes")]
    Node,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record a quota path on a volume
    Add {
        resource: VolumeResource,
        name: String,
        /// Node holding the path
        #[arg(long)]
        node: String,
        /// Quota directory to record
        #[arg(long)]
        path: String,
    },
    /// Remove recorded quota paths from a volume
    Delete {
        resource: VolumeResource,
        name: String,
        /// Delete the quota paths of this node
        #[arg(long)]
        node: Option<String>,
        /// Delete only this path, used with --node
        #[arg(long, requires = "node")]
        path: Option<String>,
        /// Delete every quota path
        #[arg(long, conflicts_with_all = ["node", "path"])]
        all: bool,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// Disable or re-enable a quota disk of a node
    Setdisable {
        resource: NodeResource,
        name: String,
        /// Quota disk mount path
        #[arg(long)]
        disk: String,
        /// Whether the disk should be disabled
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        disable: bool,
    },
    /// Move quota paths to other disks, on the same node or another one
    Move {
        resource: NodeResource,
        /// Move within this node; without it the move crosses nodes
        name: Option<String>,
        /// Source, `NODE:PATH[,PATH]` (or `PATH` when moving within a node)
        #[arg(long)]
        from: String,
        /// Destination disks, `NODE:DISK[,DISK]` (or `DISK` when moving
        /// within a node)
        #[arg(long)]
        to: String,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
        /// Seconds the data transfer may take
        #[arg(long, default_value_t = 100_000)]
        movetimeout: u64,
        /// Memory limit of the transfer pods in MiB
        #[arg(long, default_value_t = 1024)]
        movepodmemlimit: u64,
        /// Seconds the placeholder volume holds the destination before the
        /// nodes are cordoned
        #[arg(long, default_value_t = 60)]
        tmppvkeepwait: u64,
        /// Image of the transfer pods
        #[arg(long, default_value = DEFAULT_MOVE_IMAGE)]
        moveimage: String,
        /// Pull the transfer image on every start
        #[arg(long)]
        alwayspullmoveimage: bool,
    },
    /// Convert legacy hostPath volumes to the CSI driver
    Upgrade {
        resource: VolumeResource,
        /// Comma separated volume names
        names: String,
        /// Image of the driver tag converter pods
        #[arg(long, default_value = DEFAULT_UPGRADE_IMAGE)]
        upgradeimage: String,
        /// Pause between deleting two pods using the volumes
        #[arg(long, default_value = "10s", value_parser = parse_duration)]
        deleteinterval: Duration,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// Change the capacity of a volume
    Scale {
        resource: VolumeResource,
        name: String,
        /// One of up, down or to
        op: ScaleOp,
        /// Size in MiB
        size: u64,
    },
}

/// A humantime duration, or a bare number of seconds
pub fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw.trim())
}

/// Split a comma separated list, dropping empty items
pub fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A single path of a same-node move.
///
/// Accepts `PATH` or `NODE:PATH` where NODE must be the node being worked on.
pub fn local_path(node: &str, raw: &str) -> Result<String, MigrateError> {
    let parsed = if raw.contains(':') {
        NodePaths::parse(raw)?
    } else {
        NodePaths::parse(&format!("{}:{}", node, raw))?
    };
    if parsed.node != node {
        return Err(MigrateError::validation(
            format!("'{}' is on node {}, not {}", raw, parsed.node, node),
            "Omit the node name to move within a node",
        ));
    }
    match parsed.paths.as_slice() {
        [single] => Ok(single.clone()),
        _ => Err(MigrateError::validation(
            format!("'{}' names more than one path", raw),
            "A move within a node takes exactly one source and one destination disk",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_move_defaults() {
        let cli = Cli::parse_from([
            "hostpathpv",
            "move",
            "node",
            "--from=n1:/d1/a,/d1/b",
            "--to=n2:/d2,/d3",
        ]);
        let Commands::Move {
            name,
            movetimeout,
            movepodmemlimit,
            tmppvkeepwait,
            moveimage,
            force,
            ..
        } = cli.command
        else {
            panic!("expected move");
        };
        assert!(name.is_none());
        assert_eq!(movetimeout, 100_000);
        assert_eq!(movepodmemlimit, 1024);
        assert_eq!(tmppvkeepwait, 60);
        assert_eq!(moveimage, DEFAULT_MOVE_IMAGE);
        assert!(!force);
    }

    #[test]
    fn test_parse_setdisable_explicit_false() {
        let cli = Cli::parse_from(["hostpathpv", "setdisable", "node", "n1", "--disk", "/d1", "--disable=false"]);
        assert!(matches!(cli.command, Commands::Setdisable { disable: false, .. }));

        let cli = Cli::parse_from(["hostpathpv", "setdisable", "node", "n1", "--disk", "/d1"]);
        assert!(matches!(cli.command, Commands::Setdisable { disable: true, .. }));
    }

    #[test]
    fn test_parse_scale_and_upgrade() {
        let cli = Cli::parse_from(["hostpathpv", "scale", "pv", "pv1", "down", "20"]);
        assert!(matches!(
            cli.command,
            Commands::Scale { op: ScaleOp::Down, size: 20, .. }
        ));

        let cli = Cli::parse_from(["hostpathpv", "upgrade", "pv", "a,b", "--deleteinterval", "2m"]);
        let Commands::Upgrade { deleteinterval, names, .. } = cli.command else {
            panic!("expected upgrade");
        };
        assert_eq!(deleteinterval, Duration::from_secs(120));
        assert_eq!(split_names(&names), vec!["a", "b"]);
    }

    #[test]
    fn test_rejects_wrong_resource_and_flag_mixes() {
        assert!(Cli::try_parse_from(["hostpathpv", "add", "node", "x", "--node", "n", "--path", "/p"]).is_err());
        assert!(Cli::try_parse_from(["hostpathpv", "delete", "pv", "x", "--all", "--node", "n1"]).is_err());
        assert!(Cli::try_parse_from(["hostpathpv", "delete", "pv", "x", "--path", "/p"]).is_err());
        assert!(Cli::try_parse_from(["hostpathpv", "scale", "pv", "x", "sideways", "1"]).is_err());
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("n1", "/d1//a/").unwrap(), "/d1/a");
        assert_eq!(local_path("n1", "n1:/d2").unwrap(), "/d2");
        assert!(local_path("n1", "n2:/d2").unwrap_err().is_usage());
        assert!(local_path("n1", "/d1/a,/d1/b").unwrap_err().is_usage());
    }
}
