// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for hostpath volume metadata operations
#[derive(Error, Debug, Diagnostic)]
pub enum HostpathError {
    /// Annotation payload could not be decoded
    #[error("Failed to decode {what}: {message}")]
    #[diagnostic(
        code(hostpathpv::decode_error),
        help("The annotation holds malformed JSON. Inspect it with `kubectl get -o yaml` and repair or remove it")
    )]
    DecodeError {
        #[allow(unused)]
        what: String,
        #[allow(unused)]
        message: String,
    },

    /// Annotation payload could not be encoded
    #[error("Failed to encode {what}: {message}")]
    #[diagnostic(
        code(hostpathpv::encode_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    EncodeError {
        #[allow(unused)]
        what: String,
        #[allow(unused)]
        message: String,
    },

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(hostpathpv::invalid_argument), help("{suggestion}"))]
    InvalidArgument {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Volume is neither a legacy nor a modern hostpath volume
    #[error("Volume {volume} is not a hostpath volume")]
    #[diagnostic(
        code(hostpathpv::not_hostpath_volume),
        help("Only volumes with a hostPath source or a hostpath CSI driver are managed by this tool")
    )]
    NotHostpathVolume {
        #[allow(unused)]
        volume: String,
    },

    /// Quota path is not recorded on the given node
    #[error("Quota path {node}:{path} is not recorded in volume {volume}")]
    #[diagnostic(
        code(hostpathpv::path_not_found),
        help("List the volume's mount record to see which node paths it currently owns")
    )]
    PathNotFound {
        #[allow(unused)]
        volume: String,
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        path: String,
    },

    /// Quota path is already recorded
    #[error("Quota path {node}:{path} already exists")]
    #[diagnostic(
        code(hostpathpv::path_exists),
        help("A node path can only be recorded once per volume")
    )]
    PathExists {
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        path: String,
    },

    /// Disk is not one of the node's quota disks
    #[error("{disk} is not a quota disk of node {node}")]
    #[diagnostic(
        code(hostpathpv::unknown_disk),
        help("Quota disks are listed in the node's disk quota annotation")
    )]
    UnknownDisk {
        #[allow(unused)]
        node: String,
        #[allow(unused)]
        disk: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, HostpathError>;

impl HostpathError {
    pub fn decode_error(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DecodeError {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn encode_error(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EncodeError {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn not_hostpath_volume(volume: impl Into<String>) -> Self {
        Self::NotHostpathVolume {
            volume: volume.into(),
        }
    }

    pub fn path_not_found(
        volume: impl Into<String>,
        node: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::PathNotFound {
            volume: volume.into(),
            node: node.into(),
            path: path.into(),
        }
    }

    pub fn path_exists(node: impl Into<String>, path: impl Into<String>) -> Self {
        Self::PathExists {
            node: node.into(),
            path: path.into(),
        }
    }

    pub fn unknown_disk(node: impl Into<String>, disk: impl Into<String>) -> Self {
        Self::UnknownDisk {
            node: node.into(),
            disk: disk.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_not_found_message() {
        let err = HostpathError::path_not_found("pv1", "n1", "/d1/a");
        assert_eq!(
            err.to_string(),
            "Quota path n1:/d1/a is not recorded in volume pv1"
        );
    }

    #[test]
    fn test_diagnostic_code() {
        let err = HostpathError::invalid_argument("too small", "use at least 10Mi");
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("hostpathpv::invalid_argument"));
    }
}
