//! Thin wrapper over the kube client
//!
//! Create-or-patch semantics for resources (a 409 turns into a merge
//! patch), 404-tolerant deletes, and pod exec/copy over the client's
//! first-class attach streams. Each exec opens its own streaming call, so
//! the primary API transport is never repurposed for WebSocket traffic.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use kube::api::{AttachParams, Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::error::OrchestratorError;

type Result<T> = std::result::Result<T, OrchestratorError>;

fn is_api_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

/// Kubernetes API access for the orchestrator.
#[derive(Clone)]
pub struct KubeClients {
    client: Client,
}

impl KubeClients {
    /// Infer config from the environment (kubeconfig or in-cluster).
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(OrchestratorError::Kubernetes)?;
        info!("kubernetes client initialized");
        Ok(Self { client })
    }

    pub fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn network_policies(&self, namespace: &str) -> Api<NetworkPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    // ------------------------------------------------------------------
    // Generic create/patch/delete
    // ------------------------------------------------------------------

    /// Create a resource; on conflict, patch it to the desired state.
    pub async fn create_or_patch<K>(&self, api: &Api<K>, resource: &K) -> Result<()>
    where
        K: Resource + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
    {
        let name = resource
            .meta()
            .name
            .clone()
            .ok_or_else(|| OrchestratorError::Validation("resource has no name".to_string()))?;

        match api.create(&PostParams::default(), resource).await {
            Ok(_) => {
                info!("created {}", name);
                Ok(())
            }
            Err(err) if is_api_code(&err, 409) => {
                debug!("{} exists, patching to desired state", name);
                api.patch(&name, &PatchParams::default(), &Patch::Merge(resource))
                    .await
                    .map_err(OrchestratorError::Kubernetes)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a resource; a missing resource is success.
    pub async fn delete_ignore_missing<K>(&self, api: &Api<K>, name: &str) -> Result<()>
    where
        K: Resource + Clone + std::fmt::Debug + DeserializeOwned,
    {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_api_code(&err, 404) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------

    pub async fn ensure_namespace(&self, manifest: &Namespace) -> Result<()> {
        match self
            .namespaces()
            .create(&PostParams::default(), manifest)
            .await
        {
            Ok(_) => {
                info!("created namespace {:?}", manifest.meta().name);
                Ok(())
            }
            Err(err) if is_api_code(&err, 409) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        match self.namespaces().get(namespace).await {
            Ok(_) => Ok(true),
            Err(err) if is_api_code(&err, 404) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a namespace and everything in it. Missing is success.
    pub async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        match self
            .namespaces()
            .delete(namespace, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("deleted namespace {}", namespace);
                Ok(())
            }
            Err(err) if is_api_code(&err, 404) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Secrets
    // ------------------------------------------------------------------

    /// Copy a secret between namespaces, preserving type and data. Returns
    /// false when the source secret does not exist.
    pub async fn copy_secret(
        &self,
        secret_name: &str,
        source_namespace: &str,
        target_namespace: &str,
    ) -> Result<bool> {
        match self.secrets(target_namespace).get(secret_name).await {
            Ok(_) => return Ok(true),
            Err(err) if is_api_code(&err, 404) => {}
            Err(err) => return Err(err.into()),
        }

        let source = match self.secrets(source_namespace).get(secret_name).await {
            Ok(secret) => secret,
            Err(err) if is_api_code(&err, 404) => {
                warn!(
                    "secret {} not found in {}",
                    secret_name, source_namespace
                );
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };

        let mut copy = Secret::default();
        copy.metadata.name = Some(secret_name.to_string());
        copy.metadata.labels = Some(
            [(
                "app.kubernetes.io/managed-by".to_string(),
                super::manifests::MANAGED_BY.to_string(),
            )]
            .into(),
        );
        copy.type_ = source.type_;
        copy.data = source.data;

        match self
            .secrets(target_namespace)
            .create(&PostParams::default(), &copy)
            .await
        {
            Ok(_) => {
                info!("copied secret {} to {}", secret_name, target_namespace);
                Ok(true)
            }
            Err(err) if is_api_code(&err, 409) => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Deployments & pods
    // ------------------------------------------------------------------

    pub async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        self.deployments(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "spec": { "replicas": replicas } })),
            )
            .await
            .map_err(OrchestratorError::Kubernetes)?;
        info!("scaled {}/{} to {} replicas", namespace, name, replicas);
        Ok(())
    }

    pub fn is_pod_ready(pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }

    /// Find a running, ready pod by label selector.
    pub async fn ready_pod(&self, namespace: &str, label_selector: &str) -> Result<Option<String>> {
        let params = ListParams::default().labels(label_selector);
        let pods = match self.pods(namespace).list(&params).await {
            Ok(pods) => pods,
            Err(err) if is_api_code(&err, 404) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        for pod in pods.items {
            let running = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|phase| phase == "Running")
                .unwrap_or(false);
            if running && Self::is_pod_ready(&pod) {
                return Ok(pod.metadata.name);
            }
        }
        Ok(None)
    }

    /// The always-on file-manager pod for a project namespace.
    pub async fn file_manager_pod(&self, namespace: &str) -> Result<Option<String>> {
        self.ready_pod(namespace, "app=file-manager").await
    }

    /// Wait until a deployment reports all replicas ready.
    pub async fn wait_for_deployment_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let api = self.deployments(namespace);

        while tokio::time::Instant::now() < deadline {
            match api.get(name).await {
                Ok(deployment) => {
                    let status = deployment.status.unwrap_or_default();
                    let ready = status.ready_replicas.unwrap_or(0);
                    let desired = status.replicas.unwrap_or(0);
                    if desired > 0 && ready == desired {
                        info!("deployment {}/{} is ready", namespace, name);
                        return Ok(());
                    }
                }
                Err(err) if is_api_code(&err, 404) => {}
                Err(err) => warn!("error checking deployment {}: {}", name, err),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(OrchestratorError::Timeout(timeout.as_secs()))
    }

    // ------------------------------------------------------------------
    // Exec and file streaming
    // ------------------------------------------------------------------

    /// Execute a command in a pod and return combined stdout + stderr.
    pub async fn exec(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<String> {
        debug!(
            "exec in {}/{} [{}]: {:?}",
            namespace,
            pod_name,
            container,
            command.first()
        );
        let pods = self.pods(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let run = async {
            let mut attached = pods
                .exec(pod_name, command.iter().map(|s| s.as_str()), &params)
                .await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let stdout_stream = attached.stdout();
            let stderr_stream = attached.stderr();

            let read_out = async {
                if let Some(mut stream) = stdout_stream {
                    let _ = stream.read_to_end(&mut stdout).await;
                }
            };
            let read_err = async {
                if let Some(mut stream) = stderr_stream {
                    let _ = stream.read_to_end(&mut stderr).await;
                }
            };
            tokio::join!(read_out, read_err);

            attached.join().await.map_err(anyhow::Error::from)?;

            stdout.extend_from_slice(&stderr);
            Ok::<String, anyhow::Error>(String::from_utf8_lossy(&stdout).to_string())
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => {
                error!("exec failed in {}/{}: {}", namespace, pod_name, err);
                Err(err.into())
            }
            Err(_) => Err(OrchestratorError::Timeout(timeout.as_secs())),
        }
    }

    /// Stream a local file into a pod: the file is wrapped in an in-memory
    /// tar and piped to `tar xf -` over the exec stream's stdin. No
    /// credentials or host tooling involved.
    pub async fn copy_to_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        local_path: &std::path::Path,
        pod_path: &str,
        timeout: Duration,
    ) -> Result<()> {
        let file_name = std::path::Path::new(pod_path)
            .file_name()
            .ok_or_else(|| OrchestratorError::Validation("pod path has no file name".into()))?
            .to_string_lossy()
            .to_string();
        let pod_dir = std::path::Path::new(pod_path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        let data = tokio::fs::read(local_path).await?;
        let tar_bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, &file_name, data.as_slice())?;
            builder.into_inner()
        })
        .await
        .map_err(|e| OrchestratorError::Other(e.into()))??;

        info!(
            "copying {} bytes to {}/{}:{}",
            tar_bytes.len(),
            namespace,
            pod_name,
            pod_path
        );

        let pods = self.pods(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(true)
            .stdout(true)
            .stderr(true);
        let command = vec![
            "tar".to_string(),
            "xf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            pod_dir,
        ];

        let run = async {
            let mut attached = pods
                .exec(pod_name, command.iter().map(|s| s.as_str()), &params)
                .await?;

            if let Some(mut stdin) = attached.stdin() {
                let _ = stdin.write_all(&tar_bytes).await;
                let _ = stdin.shutdown().await;
            }
            attached.join().await.map_err(anyhow::Error::from)?;
            Ok::<(), anyhow::Error>(())
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(OrchestratorError::Timeout(timeout.as_secs())),
        }
    }

    /// Stream a file out of a pod: contents are base64-framed over the exec
    /// stream's stdout to survive WebSocket framing, then decoded locally.
    pub async fn copy_from_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        pod_path: &str,
        local_path: &std::path::Path,
        timeout: Duration,
    ) -> Result<u64> {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("base64 < {}", crate::security::shell_quote(pod_path)),
        ];
        let encoded = self
            .exec(namespace, pod_name, container, &command, timeout)
            .await?;

        let cleaned: String = encoded
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if cleaned.is_empty() {
            return Err(OrchestratorError::DataIntegrity(format!(
                "no data received from pod for {}",
                pod_path
            )));
        }

        let bytes = BASE64.decode(cleaned.as_bytes()).map_err(|e| {
            OrchestratorError::DataIntegrity(format!("invalid base64 stream from pod: {}", e))
        })?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &bytes).await?;

        info!(
            "copied {} bytes from {}/{}:{}",
            bytes.len(),
            namespace,
            pod_name,
            pod_path
        );
        Ok(bytes.len() as u64)
    }
}
