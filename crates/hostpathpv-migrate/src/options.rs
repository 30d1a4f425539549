use hostpathpv_cluster::TaskImage;
use std::time::Duration;

pub const DEFAULT_MOVE_IMAGE: &str = "127.0.0.1:29006/library/hostpathscpmove:v3.1";
pub const DEFAULT_UPGRADE_IMAGE: &str = "127.0.0.1:29006/library/busybox:1.25";

/// Tunables of the move flows
#[derive(Debug, Clone)]
pub struct MoveOptions {
    /// Image of the sender, mover and same-node mover tasks
    pub image: String,
    /// Pull the image on every task start
    pub always_pull: bool,
    /// Memory limit of the transfer tasks in MiB
    pub memory_limit_mib: u64,
    /// Budget for the data transfer
    pub move_timeout: Duration,
    /// How long the placeholder volume holds the destination before the
    /// nodes are cordoned
    pub keep_wait: Duration,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            image: DEFAULT_MOVE_IMAGE.to_string(),
            always_pull: false,
            memory_limit_mib: 1024,
            move_timeout: Duration::from_secs(100_000),
            keep_wait: Duration::from_secs(60),
        }
    }
}

impl MoveOptions {
    pub fn transfer_image(&self) -> TaskImage {
        TaskImage {
            image: self.image.clone(),
            always_pull: self.always_pull,
            memory_limit_mib: self.memory_limit_mib,
        }
    }

    /// The same-node mover never forces a pull
    pub fn local_image(&self) -> TaskImage {
        TaskImage {
            always_pull: false,
            ..self.transfer_image()
        }
    }
}

/// Tunables of the driver upgrade
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Image of the driver tag converter
    pub image: String,
    /// Pause between deleting two workload pods
    pub delete_interval: Duration,
    /// Budget for the converters to exit
    pub convert_timeout: Duration,
    /// Budget for a replacement volume to bind
    pub bind_timeout: Duration,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            image: DEFAULT_UPGRADE_IMAGE.to_string(),
            delete_interval: Duration::from_secs(10),
            convert_timeout: Duration::from_secs(120),
            bind_timeout: Duration::from_secs(40),
        }
    }
}

impl UpgradeOptions {
    pub fn converter_image(&self) -> TaskImage {
        TaskImage {
            image: self.image.clone(),
            always_pull: false,
            memory_limit_mib: 0,
        }
    }
}
