use crate::precheck::Violation;
use hostpathpv_cluster::ClusterError;
use hostpathpv_core::HostpathError;
use miette::Diagnostic;
use thiserror::Error;

/// Error type for move, upgrade and volume maintenance operations
#[derive(Error, Debug, Diagnostic)]
pub enum MigrateError {
    /// Operator input is unusable
    #[error("Invalid input: {message}")]
    #[diagnostic(code(hostpathpv::migrate::validation), help("{suggestion}"))]
    Validation {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// A move was refused before anything was changed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Precondition(#[from] Violation),

    /// Volume has no recorded quota paths
    #[error("Volume {volume} has no quota paths")]
    #[diagnostic(
        code(hostpathpv::migrate::no_quota_path),
        help("Quota paths are recorded once a pod using the volume has been scheduled")
    )]
    NoQuotaPath {
        #[allow(unused)]
        volume: String,
    },

    /// The operator interrupted the operation
    #[error("Interrupted during step {step}, cleanup has been run")]
    #[diagnostic(
        code(hostpathpv::migrate::interrupted),
        help("Check node schedulability and the volume mount record before retrying")
    )]
    Interrupted {
        #[allow(unused)]
        step: usize,
    },

    /// Cluster store or worker task error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cluster(#[from] ClusterError),

    /// Metadata model error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] HostpathError),
}

/// Result type alias for migrate operations
pub type Result<T> = std::result::Result<T, MigrateError>;

impl MigrateError {
    pub fn validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn no_quota_path(volume: impl Into<String>) -> Self {
        Self::NoQuotaPath {
            volume: volume.into(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
            || matches!(self, Self::Cluster(e) if e.is_cancelled())
    }

    /// Whether the operator's input was at fault rather than the cluster
    pub fn is_usage(&self) -> bool {
        if matches!(self, Self::Validation { .. }) {
            return true;
        }
        matches!(
            self.core(),
            Some(HostpathError::InvalidArgument { .. } | HostpathError::UnknownDisk { .. })
        )
    }

    /// Metadata model error, also when raised inside a store update
    pub fn core(&self) -> Option<&HostpathError> {
        match self {
            Self::Core(e) | Self::Cluster(ClusterError::Core(e)) => Some(e),
            _ => None,
        }
    }
}
