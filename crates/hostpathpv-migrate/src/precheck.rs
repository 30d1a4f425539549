//! Move admission rules.
//!
//! Every rule only reads the inventory and node objects. The first rule
//! that fails decides the [`Violation`].

use crate::inventory::Inventory;
use hostpathpv_core::{classify, format_bytes, paths, NodeDiskQuota};
use k8s_openapi::api::core::v1::Node;
use miette::Diagnostic;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Reason a move is refused
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum Violation {
    #[error("{sources} source paths but {dests} destinations")]
    #[diagnostic(
        code(hostpathpv::precondition::arity_mismatch),
        help("Give exactly one destination disk per source path")
    )]
    ArityMismatch {
        #[allow(unused)]
        sources: usize,
        #[allow(unused)]
        dests: usize,
    },

    #[error("Cannot move {path} onto its own disk {disk}")]
    #[diagnostic(
        code(hostpathpv::precondition::same_disk_move),
        help("Pick a different disk of the node as destination")
    )]
    SameDiskMove {
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        disk: String,
    },

    #[error("Node {node} has no quota disk")]
    #[diagnostic(
        code(hostpathpv::precondition::no_disk),
        help("The node agent publishes quota disks in the node's disk quota annotation")
    )]
    NoDisk {
        #[allow(unused)]
        node: String,
    },

    #[error("{path} is not under a quota disk of {node}")]
    #[diagnostic(code(hostpathpv::precondition::invalid_source_path))]
    InvalidSourcePath {
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        path: String,
    },

    #[error("Disk {disk} of {node} is disabled")]
    #[diagnostic(
        code(hostpathpv::precondition::disabled_disk),
        help("Enable it with `hostpathpv setdisable node {node} --disk {disk} --disable=false`")
    )]
    DisabledDisk {
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        disk: String,
    },

    #[error("{path} is not a quota disk of {node}")]
    #[diagnostic(
        code(hostpathpv::precondition::invalid_dest_path),
        help("Destinations must be quota disk roots, not directories below them")
    )]
    InvalidDestPath {
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        path: String,
    },

    #[error("{path} is not a quota path at {node}")]
    #[diagnostic(code(hostpathpv::precondition::not_a_quota_path))]
    NotAQuotaPath {
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        path: String,
    },

    #[error("{path} belongs to volume {volume} of class {class}; only keep volumes can be moved")]
    #[diagnostic(code(hostpathpv::precondition::unsupported_policy))]
    UnsupportedPolicy {
        #[allow(unused)]
        volume: String,
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        class: String,
    },

    #[error("Moving {path} needs {required} of quota but {disk} only has {available}")]
    #[diagnostic(code(hostpathpv::precondition::insufficient_space))]
    InsufficientSpace {
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        disk: String,
        #[allow(unused)]
        required: String,
        #[allow(unused)]
        available: String,
    },

    #[error("{node}:{path} is already a quota path of volume {volume}")]
    #[diagnostic(
        code(hostpathpv::precondition::destination_taken),
        help("Move to another disk, or remove the stale quota path with `hostpathpv delete pv {volume} --node {node} --path {path}`")
    )]
    DestinationTaken {
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        volume: String,
    },

    #[error("No source paths given")]
    #[diagnostic(code(hostpathpv::precondition::no_paths))]
    NoPaths,

    #[error("Pod {pod} also uses {path}, which is {reason}")]
    #[diagnostic(
        code(hostpathpv::precondition::path_set_mismatch),
        help("Move every quota path of a pod in one operation")
    )]
    PathSetMismatch {
        #[allow(unused)]
        pod: String,
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        reason: String,
    },
}

fn node_name(node: &Node) -> &str {
    hostpathpv_core::name_of(&node.metadata)
}

/// Check whether `sources[i]` on `from` may be moved into disk `dests[i]`
/// on `to`
pub fn check_can_move(
    from: &Node,
    to: &Node,
    inventory: &Inventory,
    sources: &[String],
    dests: &[String],
) -> Result<(), Violation> {
    if sources.len() != dests.len() {
        return Err(Violation::ArityMismatch {
            sources: sources.len(),
            dests: dests.len(),
        });
    }

    if node_name(from) == node_name(to) {
        for (src, dest) in sources.iter().zip(dests) {
            if paths::is_under(src, dest) {
                return Err(Violation::SameDiskMove {
                    path: paths::clean(src),
                    disk: paths::clean(dest),
                });
            }
        }
    }

    let from_disks = NodeDiskQuota::from_node(from);
    if from_disks.is_empty() {
        return Err(Violation::NoDisk {
            node: node_name(from).to_string(),
        });
    }
    let to_disks = NodeDiskQuota::from_node(to);
    if to_disks.is_empty() {
        return Err(Violation::NoDisk {
            node: node_name(to).to_string(),
        });
    }

    for src in sources {
        if from_disks.disk_containing(src).is_none() {
            return Err(Violation::InvalidSourcePath {
                node: node_name(from).to_string(),
                path: paths::clean(src),
            });
        }
    }

    let mut targets = Vec::with_capacity(dests.len());
    for dest in dests {
        let Some(disk) = to_disks.find_disk(dest) else {
            return Err(Violation::InvalidDestPath {
                node: node_name(to).to_string(),
                path: paths::clean(dest),
            });
        };
        if disk.disabled {
            return Err(Violation::DisabledDisk {
                node: node_name(to).to_string(),
                disk: paths::clean(&disk.mount_path),
            });
        }
        targets.push(disk);
    }

    // Several paths may land on one disk; they share its free space.
    let mut claimed: HashMap<String, i64> = HashMap::new();
    let mut planned: Vec<(String, String)> = Vec::new();
    for (src, disk) in sources.iter().zip(targets) {
        let Some(located) = inventory.locate(node_name(from), src) else {
            return Err(Violation::NotAQuotaPath {
                node: node_name(from).to_string(),
                path: paths::clean(src),
            });
        };

        let class = classify(located.volume);
        if !class.is_keep() {
            return Err(Violation::UnsupportedPolicy {
                volume: located.volume_name().to_string(),
                path: paths::clean(src),
                class: class.to_string(),
            });
        }

        let disk_path = paths::clean(&disk.mount_path);
        let dest_dir = paths::join(&disk_path, &paths::base(src));
        let taken = inventory
            .locate(node_name(to), &dest_dir)
            .map(|l| l.volume_name().to_string())
            .or_else(|| {
                planned
                    .iter()
                    .find(|(dir, _)| *dir == dest_dir)
                    .map(|(_, volume)| volume.clone())
            });
        if let Some(volume) = taken {
            return Err(Violation::DestinationTaken {
                node: node_name(to).to_string(),
                path: dest_dir,
                volume,
            });
        }
        planned.push((dest_dir, located.volume_name().to_string()));

        let already = claimed.get(&disk_path).copied().unwrap_or(0);
        let available = disk.free_bytes() - already;
        let required = located.entry.quota_size;
        if required > available {
            return Err(Violation::InsufficientSpace {
                path: paths::clean(src),
                disk: disk_path,
                required: format_bytes(required),
                available: format_bytes(available),
            });
        }
        claimed.insert(disk_path, already + required);
    }

    debug!(
        from = node_name(from),
        to = node_name(to),
        paths = sources.len(),
        "Move admitted"
    );
    Ok(())
}

/// Check that `sources` is exactly the set of keep paths the pod using the
/// first source owns on `node`.
///
/// Paths nobody uses pass.
pub fn check_paths_belong_to_one_pod(
    sources: &[String],
    inventory: &Inventory,
    node: &str,
) -> Result<(), Violation> {
    let Some(first) = sources.first() else {
        return Err(Violation::NoPaths);
    };
    let users = inventory.pods_using_path(node, first);
    let Some(pod) = users.first() else {
        return Ok(());
    };

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let pod_key = format!("{}/{}", namespace, name);
    let (owned, _) = inventory.pod_paths(namespace, name, node);

    for path in &owned {
        if !sources.iter().any(|s| paths::same(s, path)) {
            return Err(Violation::PathSetMismatch {
                pod: pod_key,
                path: paths::clean(path),
                reason: "missing from the move".to_string(),
            });
        }
    }
    for src in sources {
        if !owned.iter().any(|p| paths::same(p, src)) {
            return Err(Violation::PathSetMismatch {
                pod: pod_key,
                path: paths::clean(src),
                reason: "not owned by that pod".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::fixtures::{node, pod, volume};
    use hostpathpv_core::annotations::{MOUNT_POLICY, NODE_DISABLED_DISKS};

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn one_path_inventory() -> Inventory {
        Inventory::new(
            vec![volume("pv1", false, &[("n1", "/d1/a", 600, 400, None)])],
            vec![],
        )
    }

    #[test]
    fn test_insufficient_space() {
        let inv = one_path_inventory();
        let n1 = node("n1", &[("/d1", 1000)]);

        let small = node("n2", &[("/d2", 500)]);
        let err = check_can_move(&n1, &small, &inv, &strings(&["/d1/a"]), &strings(&["/d2"]))
            .unwrap_err();
        assert!(matches!(err, Violation::InsufficientSpace { .. }));

        let big = node("n2", &[("/d2", 700)]);
        check_can_move(&n1, &big, &inv, &strings(&["/d1/a"]), &strings(&["/d2"])).unwrap();
    }

    #[test]
    fn test_same_disk_move() {
        let inv = one_path_inventory();
        let n1 = node("n1", &[("/d1", 1000), ("/d2", 1000)]);

        let err = check_can_move(&n1, &n1, &inv, &strings(&["/d1/a"]), &strings(&["/d1"]))
            .unwrap_err();
        assert!(matches!(err, Violation::SameDiskMove { .. }));

        check_can_move(&n1, &n1, &inv, &strings(&["/d1/a"]), &strings(&["/d2"])).unwrap();
    }

    #[test]
    fn test_rule_order() {
        let inv = one_path_inventory();
        let n1 = node("n1", &[("/d1", 1000)]);
        let n2 = node("n2", &[("/d2", 1000)]);
        let bare = node("n3", &[]);

        assert!(matches!(
            check_can_move(&n1, &n2, &inv, &strings(&["/d1/a"]), &[]),
            Err(Violation::ArityMismatch { sources: 1, dests: 0 })
        ));
        assert!(matches!(
            check_can_move(&n1, &bare, &inv, &strings(&["/d1/a"]), &strings(&["/d2"])),
            Err(Violation::NoDisk { .. })
        ));
        assert!(matches!(
            check_can_move(&n1, &n2, &inv, &strings(&["/d9/a"]), &strings(&["/d2"])),
            Err(Violation::InvalidSourcePath { .. })
        ));
        assert!(matches!(
            check_can_move(&n1, &n2, &inv, &strings(&["/d1/a"]), &strings(&["/d2/sub"])),
            Err(Violation::InvalidDestPath { .. })
        ));
        assert!(matches!(
            check_can_move(&n1, &n2, &inv, &strings(&["/d1/zzz"]), &strings(&["/d2"])),
            Err(Violation::NotAQuotaPath { .. })
        ));
    }

    #[test]
    fn test_disabled_destination() {
        let inv = one_path_inventory();
        let n1 = node("n1", &[("/d1", 1000)]);
        let mut n2 = node("n2", &[("/d2", 1000)]);
        n2.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(NODE_DISABLED_DISKS.to_string(), "/d2/".to_string());

        let err = check_can_move(&n1, &n2, &inv, &strings(&["/d1/a"]), &strings(&["/d2"]))
            .unwrap_err();
        assert_eq!(
            err,
            Violation::DisabledDisk {
                node: "n2".to_string(),
                disk: "/d2".to_string()
            }
        );
    }

    #[test]
    fn test_none_policy_rejected() {
        let mut pv = volume("pv1", false, &[("n1", "/d1/a", 10, 1, None)]);
        pv.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(MOUNT_POLICY.to_string(), "none".to_string());
        let inv = Inventory::new(vec![pv], vec![]);
        let err = check_can_move(
            &node("n1", &[("/d1", 1000)]),
            &node("n2", &[("/d2", 1000)]),
            &inv,
            &strings(&["/d1/a"]),
            &strings(&["/d2"]),
        )
        .unwrap_err();
        assert!(matches!(err, Violation::UnsupportedPolicy { .. }));
    }

    #[test]
    fn test_paths_share_destination_space() {
        let inv = Inventory::new(
            vec![volume(
                "pv1",
                false,
                &[("n1", "/d1/a", 400, 1, None), ("n1", "/d1/b", 400, 1, None)],
            )],
            vec![],
        );
        let err = check_can_move(
            &node("n1", &[("/d1", 1000)]),
            &node("n2", &[("/d2", 700)]),
            &inv,
            &strings(&["/d1/a", "/d1/b"]),
            &strings(&["/d2", "/d2"]),
        )
        .unwrap_err();
        assert!(matches!(err, Violation::InsufficientSpace { ref path, .. } if path == "/d1/b"));
    }

    #[test]
    fn test_destination_already_recorded() {
        let inv = Inventory::new(
            vec![
                volume("pv1", false, &[("n1", "/d1/a", 100, 1, None)]),
                volume("pv2", false, &[("n2", "/d2/a", 100, 1, None)]),
            ],
            vec![],
        );
        let n1 = node("n1", &[("/d1", 1000)]);
        let err = check_can_move(
            &n1,
            &node("n2", &[("/d2", 1000), ("/d3", 1000)]),
            &inv,
            &strings(&["/d1/a"]),
            &strings(&["/d2/"]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            Violation::DestinationTaken {
                node: "n2".to_string(),
                path: "/d2/a".to_string(),
                volume: "pv2".to_string(),
            }
        );

        check_can_move(
            &n1,
            &node("n2", &[("/d2", 1000), ("/d3", 1000)]),
            &inv,
            &strings(&["/d1/a"]),
            &strings(&["/d3"]),
        )
        .unwrap();
    }

    #[test]
    fn test_two_sources_cannot_share_a_destination_dir() {
        let inv = Inventory::new(
            vec![volume(
                "pv1",
                false,
                &[("n1", "/d1/a", 10, 1, None), ("n1", "/d2/a", 10, 1, None)],
            )],
            vec![],
        );
        let err = check_can_move(
            &node("n1", &[("/d1", 1000), ("/d2", 1000)]),
            &node("n2", &[("/d3", 1000)]),
            &inv,
            &strings(&["/d1/a", "/d2/a"]),
            &strings(&["/d3", "/d3"]),
        )
        .unwrap_err();
        assert!(matches!(err, Violation::DestinationTaken { ref path, .. } if path == "/d3/a"));
    }

    #[test]
    fn test_paths_belong_to_one_pod() {
        let web = pod("web-0", "uid-1", "n1", "pv1-claim");
        let inv = Inventory::new(
            vec![volume(
                "pv1",
                true,
                &[("n1", "/d1/a", 1, 1, Some(&web)), ("n1", "/d1/b", 1, 1, Some(&web))],
            )],
            vec![web],
        );

        check_paths_belong_to_one_pod(&strings(&["/d1/a", "/d1/b"]), &inv, "n1").unwrap();

        let err = check_paths_belong_to_one_pod(&strings(&["/d1/a"]), &inv, "n1").unwrap_err();
        assert!(matches!(err, Violation::PathSetMismatch { ref path, .. } if path == "/d1/b"));

        let err = check_paths_belong_to_one_pod(&strings(&["/d1/a", "/d1/b", "/d1/c"]), &inv, "n1")
            .unwrap_err();
        assert!(matches!(err, Violation::PathSetMismatch { ref path, .. } if path == "/d1/c"));

        assert_eq!(
            check_paths_belong_to_one_pod(&[], &inv, "n1"),
            Err(Violation::NoPaths)
        );
        check_paths_belong_to_one_pod(&strings(&["/d9/x"]), &inv, "n1").unwrap();
    }
}
