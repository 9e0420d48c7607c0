//! Deployment backend abstraction
//!
//! One contract, two implementations: Docker Compose for single-host
//! deployments and Kubernetes for cluster mode. The factory selects and
//! caches the backend from configuration; callers hold `Arc<dyn
//! Orchestrator>` and never branch on deployment mode - every method
//! returns the same shapes from both backends.

pub mod compose;
pub mod docker;
pub mod kubernetes;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::activity::ActivityTracker;
use crate::catalog;
use crate::config::Settings;
use crate::domain::{Container, ContainerConnection, ConnectorType, DeploymentMode, Project};
use crate::error::OrchestratorError;
use crate::fsops::{FileEntry, GrepMatch};
use crate::naming::{container_hostname, sanitize_service_name};
use crate::object_store::ProjectArchiveStore;
use crate::proxy::ProxyRegistry;
use crate::store::{ProjectLocks, ProjectStore};

pub use docker::DockerOrchestrator;
pub use kubernetes::KubernetesOrchestrator;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Coarse run state shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Starting,
    Partial,
    Stopped,
    NotFound,
    Error,
}

/// Result of starting a whole project.
#[derive(Debug, Clone, Serialize)]
pub struct StartedProject {
    pub status: RunState,
    pub project_slug: String,
    /// container name -> public URL
    pub containers: BTreeMap<String, String>,
}

/// Result of starting one container.
#[derive(Debug, Clone, Serialize)]
pub struct StartedContainer {
    pub status: RunState,
    pub container_name: String,
    pub url: String,
}

/// Live state of one container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub status: RunState,
    pub url: Option<String>,
    pub ready: bool,
    pub replicas: Option<i32>,
    pub ready_replicas: Option<i32>,
}

/// Live state of a whole project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub status: RunState,
    /// container identifier -> state
    pub containers: BTreeMap<String, ContainerStatus>,
}

/// Readiness probe result for command execution.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyStatus {
    pub ready: bool,
    pub message: String,
}

/// Addressing for file and shell operations against one workload.
#[derive(Debug, Clone, Copy)]
pub struct FileScope<'a> {
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub project_slug: &'a str,
    pub container_name: &'a str,
    /// Subdirectory inside the project for multi-container layouts.
    pub subdir: Option<&'a str>,
}

/// Content-search parameters.
#[derive(Debug, Clone)]
pub struct GrepQuery {
    pub pattern: String,
    pub directory: String,
    pub file_pattern: String,
    pub case_sensitive: bool,
    pub max_results: usize,
}

impl Default for GrepQuery {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            directory: ".".to_string(),
            file_pattern: "*".to_string(),
            case_sensitive: true,
            max_results: 100,
        }
    }
}

/// Host label a workload is published under: the sanitized container
/// directory, falling back to the sanitized name for root-dir containers.
pub fn workload_host_label(container: &Container) -> String {
    match container.subdir() {
        Some(dir) => sanitize_service_name(dir),
        None => sanitize_service_name(&container.name),
    }
}

/// Env vars produced by a container's inbound `env_injection` edges,
/// expanded from the target services' connection templates.
pub fn injected_environment(
    container: &Container,
    all_containers: &[Container],
    connections: &[ContainerConnection],
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for connection in connections {
        if connection.source_container_id != container.id
            || connection.connector_type != ConnectorType::EnvInjection
        {
            continue;
        }
        let Some(target) = all_containers
            .iter()
            .find(|c| c.id == connection.target_container_id)
        else {
            tracing::warn!(
                "connection {} points at a container not in this project",
                connection.id
            );
            continue;
        };
        let Some(service_slug) = target.service_slug.as_deref() else {
            continue;
        };
        let Some(def) = catalog::get_service(service_slug) else {
            tracing::warn!(
                "unknown catalog service '{}', skipping injection",
                service_slug
            );
            continue;
        };

        let target_name = sanitize_service_name(&target.name);
        env.extend(catalog::expand_connection_template(
            def,
            &target_name,
            &connection.config,
        ));
    }

    env
}

/// The contract both backends implement.
///
/// All methods are cancel-safe at suspension points; state observed before
/// an await may have changed after it. Lifecycle methods for one project
/// are serialized by the caller-visible per-project lock.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn deployment_mode(&self) -> DeploymentMode;
    fn settings(&self) -> &Settings;

    // ---- project lifecycle -------------------------------------------

    async fn start_project(
        &self,
        project: &Project,
        containers: &[Container],
        connections: &[ContainerConnection],
        user_id: Uuid,
    ) -> Result<StartedProject>;

    async fn stop_project(
        &self,
        project_slug: &str,
        project_id: Uuid,
        user_id: Uuid,
    ) -> Result<()>;

    async fn restart_project(
        &self,
        project: &Project,
        containers: &[Container],
        connections: &[ContainerConnection],
        user_id: Uuid,
    ) -> Result<StartedProject> {
        self.stop_project(&project.slug, project.id, user_id).await?;
        self.start_project(project, containers, connections, user_id)
            .await
    }

    async fn get_project_status(
        &self,
        project_slug: &str,
        project_id: Uuid,
    ) -> Result<ProjectStatus>;

    // ---- individual containers ---------------------------------------

    async fn start_container(
        &self,
        project: &Project,
        container: &Container,
        all_containers: &[Container],
        connections: &[ContainerConnection],
        user_id: Uuid,
    ) -> Result<StartedContainer>;

    async fn stop_container(
        &self,
        project_slug: &str,
        project_id: Uuid,
        container_name: &str,
        user_id: Uuid,
    ) -> Result<()>;

    async fn get_container_status(
        &self,
        project_slug: &str,
        project_id: Uuid,
        container_name: &str,
        user_id: Uuid,
    ) -> Result<ContainerStatus>;

    // ---- file operations ---------------------------------------------

    async fn read_file(&self, scope: FileScope<'_>, file_path: &str) -> Result<Option<String>>;
    async fn write_file(&self, scope: FileScope<'_>, file_path: &str, content: &str)
        -> Result<()>;
    async fn delete_file(&self, scope: FileScope<'_>, file_path: &str) -> Result<()>;
    async fn list_files(&self, scope: FileScope<'_>, directory: &str) -> Result<Vec<FileEntry>>;
    async fn glob_files(
        &self,
        scope: FileScope<'_>,
        pattern: &str,
        directory: &str,
    ) -> Result<Vec<FileEntry>>;
    async fn grep_files(&self, scope: FileScope<'_>, query: &GrepQuery)
        -> Result<Vec<GrepMatch>>;

    // ---- shell operations --------------------------------------------

    async fn execute_command(
        &self,
        scope: FileScope<'_>,
        command: &[String],
        timeout: Option<Duration>,
        working_dir: Option<&str>,
    ) -> Result<String>;

    async fn is_container_ready(&self, scope: FileScope<'_>) -> Result<ReadyStatus>;

    // ---- activity & cleanup ------------------------------------------

    /// Best-effort; must never fail the caller.
    async fn track_activity(&self, user_id: Uuid, project_id: Uuid, container_name: Option<&str>);

    /// Apply the backend's idle policy; returns the project keys acted on.
    async fn cleanup_idle_environments(&self, idle_timeout_minutes: i64) -> Result<Vec<String>>;

    /// Make sure the project's directory exists. No-op on Kubernetes,
    /// where the PVC and pods own directory creation.
    async fn ensure_project_directory(&self, project_slug: &str) -> Result<()>;

    /// Public URL for a container. Default implementation shared by both
    /// backends; scheme follows TLS configuration.
    fn container_url(&self, project_slug: &str, container_name: &str) -> String {
        let settings = self.settings();
        format!(
            "{}://{}",
            settings.url_scheme(),
            container_hostname(project_slug, container_name, &settings.app_domain)
        )
    }
}

/// Everything a backend needs handed in at construction.
pub struct BackendDeps {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn ProjectStore>,
    pub activity: Arc<ActivityTracker>,
    pub locks: Arc<ProjectLocks>,
    pub proxies: Arc<ProxyRegistry>,
    /// Present in Kubernetes mode; Docker mode runs without object storage.
    pub archive_store: Option<Arc<ProjectArchiveStore>>,
}

/// Creates and caches backend instances per deployment mode.
pub struct OrchestratorFactory {
    deps: BackendDeps,
    cache: Mutex<HashMap<DeploymentMode, Arc<dyn Orchestrator>>>,
}

impl OrchestratorFactory {
    pub fn new(deps: BackendDeps) -> Self {
        Self {
            deps,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Get the orchestrator for the configured deployment mode.
    pub async fn get(&self) -> Result<Arc<dyn Orchestrator>> {
        self.get_for_mode(self.deps.settings.deployment_mode).await
    }

    /// Get (or lazily create) the orchestrator for a specific mode.
    pub async fn get_for_mode(&self, mode: DeploymentMode) -> Result<Arc<dyn Orchestrator>> {
        let mut cache = self.cache.lock().await;
        if let Some(orchestrator) = cache.get(&mode) {
            return Ok(Arc::clone(orchestrator));
        }

        let orchestrator: Arc<dyn Orchestrator> = match mode {
            DeploymentMode::Docker => {
                tracing::info!("creating Docker orchestrator");
                Arc::new(DockerOrchestrator::new(
                    Arc::clone(&self.deps.settings),
                    Arc::clone(&self.deps.store),
                    Arc::clone(&self.deps.activity),
                    Arc::clone(&self.deps.locks),
                    Arc::clone(&self.deps.proxies),
                ))
            }
            DeploymentMode::Kubernetes => {
                tracing::info!("creating Kubernetes orchestrator");
                let archive_store = self
                    .deps
                    .archive_store
                    .as_ref()
                    .map(Arc::clone)
                    .ok_or_else(|| {
                        OrchestratorError::Validation(
                            "kubernetes mode requires object storage configuration".to_string(),
                        )
                    })?;
                Arc::new(
                    KubernetesOrchestrator::connect(
                        Arc::clone(&self.deps.settings),
                        Arc::clone(&self.deps.store),
                        Arc::clone(&self.deps.locks),
                        archive_store,
                    )
                    .await?,
                )
            }
        };

        cache.insert(mode, Arc::clone(&orchestrator));
        Ok(orchestrator)
    }

    /// Drop cached instances (tests only).
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}
