//! Cluster connection settings from a kubeconfig file or the in-cluster
//! service account.

use crate::error::{ClusterError, Result};
use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Resolved connection settings for `ApiClient`
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    /// API server base URL, e.g. `https://10.0.0.1:6443`
    pub server: String,
    pub token: Option<String>,
    /// PEM bundle used to verify the API server
    pub ca_pem: Option<Vec<u8>>,
    /// PEM client certificate followed by its key
    pub identity_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<Named<KubeCluster>>,
    #[serde(default)]
    contexts: Vec<Named<KubeContext>>,
    #[serde(default)]
    users: Vec<Named<KubeUser>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "context", alias = "user")]
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeCluster {
    server: String,
    #[serde(default)]
    certificate_authority: Option<String>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct KubeContext {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeUser {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    token_file: Option<String>,
    #[serde(default)]
    client_certificate: Option<String>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
}

impl ClusterConfig {
    /// Pick a configuration the way kubectl does: an explicit kubeconfig,
    /// then `~/.kube/config`, then the in-cluster service account.
    pub fn infer(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Self> {
        if let Some(path) = kubeconfig {
            return Self::from_kubeconfig(path, context);
        }
        if let Some(home) = std::env::var_os("HOME") {
            let default_path = PathBuf::from(home).join(".kube").join("config");
            if default_path.exists() {
                return Self::from_kubeconfig(&default_path, context);
            }
        }
        Self::in_cluster()
    }

    pub fn from_kubeconfig(path: &Path, context: Option<&str>) -> Result<Self> {
        debug!("Loading kubeconfig from {}", path.display());
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::invalid_config(
                format!("cannot read kubeconfig {}: {}", path.display(), e),
                "Pass --kubeconfig or set KUBECONFIG to a readable file",
            )
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_kubeconfig_str(&raw, base_dir, context)
    }

    /// Parse kubeconfig YAML. Relative file references resolve against
    /// `base_dir`.
    pub fn from_kubeconfig_str(yaml: &str, base_dir: &Path, context: Option<&str>) -> Result<Self> {
        let kubeconfig: Kubeconfig = serde_yaml::from_str(yaml).map_err(|e| {
            ClusterError::invalid_config(
                format!("malformed kubeconfig: {}", e),
                "Check the file with `kubectl config view`",
            )
        })?;

        let context_name = context
            .map(str::to_string)
            .or_else(|| kubeconfig.current_context.clone())
            .ok_or_else(|| {
                ClusterError::invalid_config(
                    "kubeconfig has no current-context",
                    "Select one with `kubectl config use-context`",
                )
            })?;

        let ctx = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.value)
            .ok_or_else(|| {
                ClusterError::invalid_config(
                    format!("context {} not found in kubeconfig", context_name),
                    "List contexts with `kubectl config get-contexts`",
                )
            })?;

        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == ctx.cluster)
            .map(|c| &c.value)
            .ok_or_else(|| {
                ClusterError::invalid_config(
                    format!("cluster {} not found in kubeconfig", ctx.cluster),
                    "Every context must reference a defined cluster",
                )
            })?;

        let default_user = KubeUser::default();
        let user = match &ctx.user {
            Some(name) => kubeconfig
                .users
                .iter()
                .find(|u| &u.name == name)
                .map(|u| &u.value)
                .ok_or_else(|| {
                    ClusterError::invalid_config(
                        format!("user {} not found in kubeconfig", name),
                        "Every context must reference a defined user",
                    )
                })?,
            None => &default_user,
        };

        let ca_pem = load_blob(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base_dir,
        )?;

        let cert = load_blob(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            base_dir,
        )?;
        let key = load_blob(
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
            base_dir,
        )?;
        let identity_pem = match (cert, key) {
            (Some(mut cert), Some(key)) => {
                cert.push(b'\n');
                cert.extend_from_slice(&key);
                Some(cert)
            }
            _ => None,
        };

        let token = match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(file)) => Some(read_trimmed(&resolve(base_dir, file))?),
            (None, None) => None,
        };

        Ok(Self {
            server: cluster.server.trim_end_matches('/').to_string(),
            token,
            ca_pem,
            identity_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
        })
    }

    /// Configuration from the pod's service account
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            ClusterError::invalid_config(
                "no kubeconfig found and not running inside a cluster",
                "Pass --kubeconfig or set KUBECONFIG",
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = read_trimmed(&dir.join("token"))?;
        let ca_pem = std::fs::read(dir.join("ca.crt")).ok();

        Ok(Self {
            server: format!("https://{}:{}", host, port),
            token: Some(token),
            ca_pem,
            identity_pem: None,
            insecure_skip_tls_verify: false,
        })
    }
}

fn resolve(base_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            ClusterError::invalid_config(
                format!("cannot read {}: {}", path.display(), e),
                "Check the file permissions",
            )
        })
}

/// Inline base64 data wins over a file reference
fn load_blob(data: Option<&str>, file: Option<&str>, base_dir: &Path) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| {
                ClusterError::invalid_config(
                    format!("invalid base64 in kubeconfig: {}", e),
                    "Re-export the credentials with `kubectl config view --raw`",
                )
            })?;
        return Ok(Some(decoded));
    }
    match file {
        Some(file) => {
            let path = resolve(base_dir, file);
            std::fs::read(&path).map(Some).map_err(|e| {
                ClusterError::invalid_config(
                    format!("cannot read {}: {}", path.display(), e),
                    "Check the file referenced by the kubeconfig",
                )
            })
        }
        None => Ok(None),
    }
}
