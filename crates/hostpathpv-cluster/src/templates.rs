//! Pod shapes of the transient worker tasks.
//!
//! Every task runs in `kube-system`, is pinned to a node by `nodeName`,
//! never restarts and mounts host directories through `hostPath` volumes.

use hostpathpv_core::annotations::APP_LABEL;
use hostpathpv_core::paths;
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Namespace all worker tasks run in
pub const TASK_NAMESPACE: &str = "kube-system";

/// Container name shared by the move tasks
pub const MOVE_CONTAINER: &str = "move";

/// Container name of the driver tag converter
pub const CONVERT_CONTAINER: &str = "change";

/// Deadline of the same-node mover and the converter, in seconds
pub const SHORT_TASK_DEADLINE_SECS: i64 = 100;

/// First `len` hex characters of the SHA-256 of the concatenated inputs
pub fn short_hash<S: AsRef<str>>(parts: &[S], len: usize) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..len.min(digest.len())].to_string()
}

pub fn sender_task_name(node: &str, source_paths: &[String]) -> String {
    format!("move-{}-tmp-pod-from-{}", node, short_hash(source_paths, 5))
}

pub fn mover_task_name(node: &str, dest_dirs: &[String]) -> String {
    format!("move-{}-tmp-pod-to-{}", node, short_hash(dest_dirs, 5))
}

pub fn local_mover_task_name(node: &str) -> String {
    format!("move-{}-tmp-pod", node)
}

pub fn converter_task_name(node: &str, volume: &str) -> String {
    format!("change-{}-{}-quotapath-tmppod", node, volume)
}

/// Image, pull policy and memory limit of a task container
#[derive(Debug, Clone)]
pub struct TaskImage {
    pub image: String,
    pub always_pull: bool,
    /// Memory limit in MiB, `0` for none
    pub memory_limit_mib: u64,
}

impl TaskImage {
    fn pull_policy(&self) -> String {
        if self.always_pull { "Always" } else { "IfNotPresent" }.to_string()
    }

    fn resources(&self) -> ResourceRequirements {
        let quantities = |memory: String| {
            let mut m = BTreeMap::new();
            m.insert("cpu".to_string(), Quantity("0m".to_string()));
            m.insert("memory".to_string(), Quantity(memory));
            m
        };
        ResourceRequirements {
            limits: Some(quantities(hostpathpv_core::quantities::mebibytes(
                self.memory_limit_mib,
            ))),
            requests: Some(quantities("0Mi".to_string())),
            ..Default::default()
        }
    }
}

fn host_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, at: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: at.to_string(),
        ..Default::default()
    }
}

struct TaskShape<'a> {
    name: &'a str,
    node: &'a str,
    container: &'a str,
    image: &'a TaskImage,
    command: Vec<String>,
    volumes: Vec<Volume>,
    mounts: Vec<VolumeMount>,
    deadline_secs: Option<i64>,
}

fn build(shape: TaskShape<'_>) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), APP_LABEL.to_string());
    labels.insert("name".to_string(), shape.name.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(shape.name.to_string()),
            namespace: Some(TASK_NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(shape.node.to_string()),
            restart_policy: Some("Never".to_string()),
            active_deadline_seconds: shape.deadline_secs,
            volumes: Some(shape.volumes),
            containers: vec![Container {
                name: shape.container.to_string(),
                image: Some(shape.image.image.clone()),
                image_pull_policy: Some(shape.image.pull_policy()),
                command: Some(vec![shape.command[0].clone()]),
                args: Some(shape.command[1..].to_vec()),
                volume_mounts: Some(shape.mounts),
                resources: Some(shape.image.resources()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deepest directory containing the grandparent of every source path.
///
/// The sender exports this directory; each source path is then addressed
/// relative to it.
pub fn sender_root(source_paths: &[String]) -> String {
    let mut roots = source_paths
        .iter()
        .map(|p| paths::dir(&paths::dir(p)));
    let Some(first) = roots.next() else {
        return "/".to_string();
    };
    roots.fold(first, |acc, next| {
        let mut common = acc;
        while !paths::is_under(&next, &common) {
            common = paths::dir(&common);
        }
        common
    })
}

/// Data server on the source node exporting the source directories over ssh
pub fn sender_task(name: &str, node: &str, source_paths: &[String], image: &TaskImage) -> Pod {
    build(TaskShape {
        name,
        node,
        container: MOVE_CONTAINER,
        image,
        command: vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            "/usr/sbin/sshd -D".to_string(),
        ],
        volumes: vec![host_volume("fromdir", &sender_root(source_paths))],
        mounts: vec![mount("fromdir", "/fromdir")],
        deadline_secs: None,
    })
}

/// Receiver on the destination node pulling every source path from the
/// sender at `server_ip` into the matching destination disk
pub fn mover_task(
    name: &str,
    node: &str,
    server_ip: &str,
    source_paths: &[String],
    dest_disks: &[String],
    image: &TaskImage,
) -> Pod {
    let root = sender_root(source_paths);
    let mut script = "/entrypoint.sh".to_string();
    for src in source_paths {
        let cleaned = paths::clean(src);
        let relative = cleaned
            .strip_prefix(root.as_str())
            .unwrap_or(&cleaned)
            .trim_start_matches('/');
        script.push_str(&format!(" {}:{}", server_ip, paths::join("/fromdir", relative)));
    }

    let mut volumes = Vec::with_capacity(dest_disks.len());
    let mut mounts = Vec::with_capacity(dest_disks.len());
    for (i, disk) in dest_disks.iter().enumerate() {
        let vol = format!("todir-{}", i);
        volumes.push(host_volume(&vol, disk));
        mounts.push(mount(&vol, &format!("/todir-{}", i)));
    }

    build(TaskShape {
        name,
        node,
        container: MOVE_CONTAINER,
        image,
        command: vec!["/bin/bash".to_string(), "-c".to_string(), script],
        volumes,
        mounts,
        deadline_secs: None,
    })
}

/// In-place move of one quota directory onto another disk of the same node
pub fn local_mover_task(
    name: &str,
    node: &str,
    source_path: &str,
    dest_disk: &str,
    image: &TaskImage,
) -> Pod {
    build(TaskShape {
        name,
        node,
        container: MOVE_CONTAINER,
        image,
        command: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("mv /fromdir/{} /todir/", paths::base(source_path)),
        ],
        volumes: vec![
            host_volume("fromdir", &paths::dir(source_path)),
            host_volume("todir", &paths::clean(dest_disk)),
        ],
        mounts: vec![mount("fromdir", "/fromdir"), mount("todir", "/todir")],
        deadline_secs: Some(SHORT_TASK_DEADLINE_SECS),
    })
}

/// Tags every quota directory of a volume on one node as CSI managed
pub fn converter_task(name: &str, node: &str, quota_paths: &[String], image: &TaskImage) -> Pod {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let mut steps = Vec::new();
    for (i, p) in quota_paths.iter().enumerate() {
        let p = paths::clean(p);
        let dir_vol = format!("dir{}", i);
        let csis_vol = format!("csis{}", i);
        volumes.push(host_volume(&dir_vol, &p));
        volumes.push(host_volume(&csis_vol, &paths::join(&paths::dir(&p), "csis")));
        mounts.push(mount(&dir_vol, &format!("/changequotapath/dir{}", i)));
        mounts.push(mount(&csis_vol, &format!("/changequotapath/csis{}", i)));
        steps.push(format!(
            "(echo true > /changequotapath/dir{i}/csi || echo true > /changequotapath/csis{i}/{})",
            paths::base(&p)
        ));
    }

    build(TaskShape {
        name,
        node,
        container: CONVERT_CONTAINER,
        image,
        command: vec!["/bin/sh".to_string(), "-c".to_string(), steps.join(" && ")],
        volumes,
        mounts,
        deadline_secs: Some(SHORT_TASK_DEADLINE_SECS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> TaskImage {
        TaskImage {
            image: "mover:v1".to_string(),
            always_pull: false,
            memory_limit_mib: 1024,
        }
    }

    fn args(pod: &Pod) -> Vec<String> {
        pod.spec.as_ref().unwrap().containers[0]
            .args
            .clone()
            .unwrap()
    }

    fn host_paths(pod: &Pod) -> Vec<String> {
        pod.spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.host_path.as_ref().unwrap().path.clone())
            .collect()
    }

    #[test]
    fn test_short_hash_is_stable() {
        let a = short_hash(&["/d1/a", "/d1/b"], 5);
        assert_eq!(a.len(), 5);
        assert_eq!(a, short_hash(&["/d1/a".to_string(), "/d1/b".to_string()], 5));
        assert_ne!(a, short_hash(&["/d1/b", "/d1/a"], 5));
    }

    #[test]
    fn test_task_names() {
        let dirs = vec!["/d2/a".to_string()];
        assert!(mover_task_name("n2", &dirs).starts_with("move-n2-tmp-pod-to-"));
        assert!(sender_task_name("n1", &dirs).starts_with("move-n1-tmp-pod-from-"));
        assert_eq!(local_mover_task_name("n1"), "move-n1-tmp-pod");
        assert_eq!(
            converter_task_name("n1", "pv1"),
            "change-n1-pv1-quotapath-tmppod"
        );
    }

    #[test]
    fn test_sender_root() {
        assert_eq!(sender_root(&["/xfs/disk1/dir1".to_string()]), "/xfs");
        assert_eq!(
            sender_root(&["/xfs/disk1/a".to_string(), "/xfs/disk2/b".to_string()]),
            "/xfs"
        );
        assert_eq!(
            sender_root(&["/xfs/disk1/a".to_string(), "/data/disk2/b".to_string()]),
            "/"
        );
    }

    #[test]
    fn test_sender_and_mover() {
        let sources = vec!["/xfs/disk1/dir1".to_string()];
        let sender = sender_task("s", "n1", &sources, &image());
        assert_eq!(host_paths(&sender), vec!["/xfs".to_string()]);

        let mover = mover_task("m", "n2", "10.0.0.9", &sources, &["/xfs/disk3".to_string()], &image());
        assert_eq!(
            args(&mover),
            vec![
                "-c".to_string(),
                "/entrypoint.sh 10.0.0.9:/fromdir/disk1/dir1".to_string()
            ]
        );
        assert_eq!(host_paths(&mover), vec!["/xfs/disk3".to_string()]);

        let spec = mover.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("n2"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let limits = spec.containers[0].resources.clone().unwrap().limits.unwrap();
        assert_eq!(limits["memory"].0, "1024Mi");
    }

    #[test]
    fn test_local_mover() {
        let pod = local_mover_task("l", "n1", "/d1/a", "/d2", &image());
        assert_eq!(args(&pod)[1], "mv /fromdir/a /todir/");
        assert_eq!(host_paths(&pod), vec!["/d1".to_string(), "/d2".to_string()]);
        assert_eq!(pod.spec.unwrap().active_deadline_seconds, Some(100));
    }

    #[test]
    fn test_converter() {
        let pod = converter_task(
            "c",
            "n1",
            &["/d1/a".to_string(), "/d1/b".to_string()],
            &image(),
        );
        assert_eq!(
            args(&pod)[1],
            "(echo true > /changequotapath/dir0/csi || echo true > /changequotapath/csis0/a) && (echo true > /changequotapath/dir1/csi || echo true > /changequotapath/csis1/b)"
        );
        assert_eq!(
            host_paths(&pod),
            vec!["/d1/a", "/d1/csis", "/d1/b", "/d1/csis"]
        );
    }
}
