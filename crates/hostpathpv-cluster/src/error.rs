use miette::Diagnostic;
use thiserror::Error;

/// Error type for cluster store and worker task operations
#[derive(Error, Debug, Diagnostic)]
pub enum ClusterError {
    /// Object does not exist
    #[error("{kind} {name} not found")]
    #[diagnostic(
        code(hostpathpv::cluster::not_found),
        help("Check the name with `kubectl get {kind}`")
    )]
    NotFound {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        name: String,
    },

    /// Object already exists
    #[error("{kind} {name} already exists")]
    #[diagnostic(
        code(hostpathpv::cluster::already_exists),
        help("Delete the existing object first or choose a different name")
    )]
    AlreadyExists {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        name: String,
    },

    /// Optimistic concurrency conflict on update
    #[error("Conflict updating {kind} {name}: the object was modified concurrently")]
    #[diagnostic(
        code(hostpathpv::cluster::conflict),
        help("Another client changed the object. Re-read it and retry the update")
    )]
    Conflict {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        name: String,
    },

    /// API server rejected a request
    #[error("API server returned {status} for {operation}: {message}")]
    #[diagnostic(
        code(hostpathpv::cluster::api_error),
        help("Inspect the API server response above. Permission errors usually mean the kubeconfig user lacks RBAC rights")
    )]
    Api {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        status: u16,
        #[allow(unused)]
        message: String,
    },

    /// Request could not be sent or the response could not be read
    #[error("Request to API server failed: {message}")]
    #[diagnostic(
        code(hostpathpv::cluster::transport_error),
        help("Verify the API server address and TLS settings in your kubeconfig")
    )]
    Transport {
        #[allow(unused)]
        message: String,
    },

    /// Response body could not be decoded
    #[error("Failed to decode {what}: {message}")]
    #[diagnostic(
        code(hostpathpv::cluster::decode_error),
        help("The API server may be running an incompatible version")
    )]
    Decode {
        #[allow(unused)]
        what: String,
        #[allow(unused)]
        message: String,
    },

    /// Connection configuration is invalid
    #[error("Invalid cluster configuration: {message}")]
    #[diagnostic(code(hostpathpv::cluster::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// A worker task ended in the Failed phase
    #[error("Worker task {namespace}/{name} failed: {message}")]
    #[diagnostic(
        code(hostpathpv::cluster::task_failed),
        help("Inspect the task logs with `kubectl logs -n {namespace} {name}` before it is cleaned up")
    )]
    TaskFailed {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
        #[allow(unused)]
        message: String,
    },

    /// A wait exceeded its deadline
    #[error("Timed out after {seconds}s waiting for {what}")]
    #[diagnostic(
        code(hostpathpv::cluster::timed_out),
        help("Increase the timeout or check whether the cluster is making progress")
    )]
    TimedOut {
        #[allow(unused)]
        what: String,
        #[allow(unused)]
        seconds: u64,
    },

    /// Operation cancelled by the operator
    #[error("Cancelled while {during}")]
    #[diagnostic(code(hostpathpv::cluster::cancelled))]
    Cancelled {
        #[allow(unused)]
        during: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] hostpathpv_core::HostpathError),
}

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn api(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn decode(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn task_failed(
        namespace: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TaskFailed {
            namespace: namespace.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn timed_out(what: impl Into<String>, seconds: u64) -> Self {
        Self::TimedOut {
            what: what.into(),
            seconds,
        }
    }

    pub fn cancelled(during: impl Into<String>) -> Self {
        Self::Cancelled {
            during: during.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
