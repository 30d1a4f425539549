use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::traits::{ClusterStore, DeleteParams};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{DeleteOptions, Preconditions};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use tracing::debug;

/// Which verb a request performs, for mapping HTTP 409
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Read,
    Create,
    Update,
    Delete,
}

/// HTTP client for the Kubernetes API server
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl ApiClient {
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let mut builder = Client::builder().use_rustls_tls();

        if let Some(ca) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(ca).map_err(|e| {
                ClusterError::invalid_config(
                    format!("invalid certificate authority: {}", e),
                    "The CA must be a PEM encoded certificate",
                )
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity) = &config.identity_pem {
            let identity = reqwest::Identity::from_pem(identity).map_err(|e| {
                ClusterError::invalid_config(
                    format!("invalid client certificate or key: {}", e),
                    "Client credentials must be PEM encoded",
                )
            })?;
            builder = builder.identity(identity);
        }
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ClusterError::transport(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.server.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(
        &self,
        req: RequestBuilder,
        verb: Verb,
        kind: &str,
        name: &str,
    ) -> Result<reqwest::Response> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ClusterError::transport(format!("HTTP request failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<k8s_openapi::apimachinery::pkg::apis::meta::v1::Status>(&body)
            .ok()
            .and_then(|s| s.message)
            .unwrap_or(body);

        Err(match (status, verb) {
            (StatusCode::NOT_FOUND, _) => ClusterError::not_found(kind, name),
            (StatusCode::CONFLICT, Verb::Create) => ClusterError::already_exists(kind, name),
            (StatusCode::CONFLICT, _) => ClusterError::conflict(kind, name),
            (_, verb) => ClusterError::api(
                format!("{:?} {} {}", verb, kind, name),
                status.as_u16(),
                message,
            ),
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        verb: Verb,
        kind: &str,
        name: &str,
    ) -> Result<T> {
        let resp = self.execute(req, verb, kind, name).await?;
        let body = resp
            .text()
            .await
            .map_err(|e| ClusterError::transport(format!("failed to read response: {}", e)))?;
        hostpathpv_core::from_json(&body).map_err(|e| ClusterError::decode(kind, e.to_string()))
    }
}

#[async_trait]
impl ClusterStore for ApiClient {
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume> {
        let url = self.url(&format!("/api/v1/persistentvolumes/{}", name));
        debug!("GET {}", url);
        self.fetch(self.client.get(&url), Verb::Read, "persistentvolume", name)
            .await
    }

    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        let url = self.url("/api/v1/persistentvolumes");
        debug!("GET {}", url);
        let list: k8s_openapi::List<PersistentVolume> = self
            .fetch(self.client.get(&url), Verb::Read, "persistentvolumes", "")
            .await?;
        Ok(list.items)
    }

    async fn create_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = hostpathpv_core::name_of(&pv.metadata);
        let url = self.url("/api/v1/persistentvolumes");
        debug!("POST {}", url);
        self.fetch(
            self.client.post(&url).json(pv),
            Verb::Create,
            "persistentvolume",
            name,
        )
        .await
    }

    async fn update_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = hostpathpv_core::name_of(&pv.metadata);
        let url = self.url(&format!("/api/v1/persistentvolumes/{}", name));
        debug!("PUT {}", url);
        self.fetch(
            self.client.put(&url).json(pv),
            Verb::Update,
            "persistentvolume",
            name,
        )
        .await
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let url = self.url(&format!("/api/v1/persistentvolumes/{}", name));
        debug!("DELETE {}", url);
        self.execute(self.client.delete(&url), Verb::Delete, "persistentvolume", name)
            .await?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let url = self.url(&format!("/api/v1/nodes/{}", name));
        debug!("GET {}", url);
        self.fetch(self.client.get(&url), Verb::Read, "node", name).await
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let name = hostpathpv_core::name_of(&node.metadata);
        let url = self.url(&format!("/api/v1/nodes/{}", name));
        debug!("PUT {}", url);
        self.fetch(self.client.put(&url).json(node), Verb::Update, "node", name)
            .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let url = self.url(&format!("/api/v1/namespaces/{}/pods/{}", namespace, name));
        debug!("GET {}", url);
        self.fetch(self.client.get(&url), Verb::Read, "pod", name).await
    }

    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let url = match namespace {
            Some(ns) => self.url(&format!("/api/v1/namespaces/{}/pods", ns)),
            None => self.url("/api/v1/pods"),
        };
        debug!("GET {}", url);
        let list: k8s_openapi::List<Pod> = self
            .fetch(self.client.get(&url), Verb::Read, "pods", "")
            .await?;
        Ok(list.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let name = hostpathpv_core::name_of(&pod.metadata);
        let url = self.url(&format!("/api/v1/namespaces/{}/pods", namespace));
        debug!("POST {}", url);
        self.fetch(self.client.post(&url).json(pod), Verb::Create, "pod", name)
            .await
    }

    async fn delete_pod(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<()> {
        let url = self.url(&format!("/api/v1/namespaces/{}/pods/{}", namespace, name));
        debug!("DELETE {}", url);
        let options = DeleteOptions {
            grace_period_seconds: params.grace_period_seconds,
            preconditions: params.uid_precondition.as_ref().map(|uid| Preconditions {
                uid: Some(uid.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.execute(
            self.client.delete(&url).json(&options),
            Verb::Delete,
            "pod",
            name,
        )
        .await?;
        Ok(())
    }

    async fn pod_log_lines(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let url = self.url(&format!(
            "/api/v1/namespaces/{}/pods/{}/log",
            namespace, name
        ));
        debug!("GET {} (follow)", url);
        let req = self
            .client
            .get(&url)
            .query(&[("container", container), ("follow", "true")]);
        let resp = self.execute(req, Verb::Read, "pod", name).await?;

        let state = (Some(resp), LineBuffer::default());
        let lines = stream::unfold(state, |(mut resp, mut buf)| async move {
            loop {
                if let Some(line) = buf.pop() {
                    return Some((Ok(line), (resp, buf)));
                }
                let body = resp.as_mut()?;
                match body.chunk().await {
                    Ok(Some(chunk)) => buf.push(&chunk),
                    Ok(None) => {
                        resp = None;
                        buf.finish();
                    }
                    Err(e) => {
                        let err = ClusterError::transport(format!("log stream broke: {}", e));
                        return Some((Err(err), (None, buf)));
                    }
                }
            }
        });
        Ok(lines.boxed())
    }
}

/// Splits a byte stream into text lines
#[derive(Debug, Default)]
struct LineBuffer {
    partial: Vec<u8>,
    ready: VecDeque<String>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if b == b'\n' {
                let line = std::mem::take(&mut self.partial);
                self.ready
                    .push_back(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string());
            } else {
                self.partial.push(b);
            }
        }
    }

    /// Flush a trailing line without newline
    fn finish(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.ready
                .push_back(String::from_utf8_lossy(&line).into_owned());
        }
    }

    fn pop(&mut self) -> Option<String> {
        self.ready.pop_front()
    }
}
