//! Background project and container initialization
//!
//! Creating a project or adding a container to its graph does slow work
//! (clones, installs, tree copies), so the API layer launches these as
//! background tasks and polls a task record for progress. Cancellation is
//! a hard failure: no partial state is committed, and any resources already
//! created are left for the idle reaper to collect.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::base_cache::BaseCacheManager;
use crate::config::{Settings, GIT_CLONE_TIMEOUT};
use crate::domain::{DeploymentMode, Project, ProjectSource};
use crate::error::{GitError, OrchestratorError};
use crate::fsops;
use crate::orchestrator::{DockerOrchestrator, KubernetesOrchestrator, Orchestrator};
use crate::store::{ProjectLocks, ProjectStore};
use crate::tools::get_tool_path;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Lifecycle of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// Pollable progress record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub percent: u8,
    pub message: String,
    pub status: TaskStatus,
}

/// Shared handle to a task record. Callers poll `snapshot()`; the worker
/// reports progress and checks for cancellation between steps.
#[derive(Clone)]
pub struct TaskHandle {
    record: Arc<RwLock<TaskRecord>>,
    cancelled: Arc<AtomicBool>,
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHandle {
    pub fn new() -> Self {
        Self {
            record: Arc::new(RwLock::new(TaskRecord {
                percent: 0,
                message: "Queued".to_string(),
                status: TaskStatus::Pending,
            })),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn update(&self, percent: u8, message: impl Into<String>) {
        let mut record = self.record.write().await;
        record.percent = percent.min(100);
        record.message = message.into();
        record.status = TaskStatus::Running;
    }

    pub async fn succeed(&self, message: impl Into<String>) {
        let mut record = self.record.write().await;
        record.percent = 100;
        record.message = message.into();
        record.status = TaskStatus::Success;
    }

    pub async fn fail(&self, message: impl Into<String>) {
        let mut record = self.record.write().await;
        record.message = message.into();
        record.status = TaskStatus::Failed;
    }

    pub async fn snapshot(&self) -> TaskRecord {
        self.record.read().await.clone()
    }

    /// Request cancellation; the worker treats it as a hard failure at the
    /// next step boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(OrchestratorError::Validation("task cancelled".to_string()))
        } else {
            Ok(())
        }
    }
}

/// The backend handle the initializer works against: the contract for
/// shared operations plus the concrete backend for mode-specific setup
/// (cache copies on Docker, in-pod clones on Kubernetes).
#[derive(Clone)]
pub enum InitializerBackend {
    Docker(Arc<DockerOrchestrator>),
    Kubernetes(Arc<KubernetesOrchestrator>),
}

impl InitializerBackend {
    fn as_orchestrator(&self) -> &dyn Orchestrator {
        match self {
            InitializerBackend::Docker(docker) => docker.as_ref(),
            InitializerBackend::Kubernetes(kubernetes) => kubernetes.as_ref(),
        }
    }

    fn mode(&self) -> DeploymentMode {
        self.as_orchestrator().deployment_mode()
    }
}

/// Runs project-creation and container-addition workflows.
pub struct ProjectInitializer {
    settings: Arc<Settings>,
    store: Arc<dyn ProjectStore>,
    locks: Arc<ProjectLocks>,
    cache: Arc<BaseCacheManager>,
    backend: InitializerBackend,
}

impl ProjectInitializer {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn ProjectStore>,
        locks: Arc<ProjectLocks>,
        cache: Arc<BaseCacheManager>,
        backend: InitializerBackend,
    ) -> Self {
        Self {
            settings,
            store,
            locks,
            cache,
            backend,
        }
    }

    /// Seed a new project's files according to its source, reporting
    /// progress through the task handle. Runs under the project lock.
    pub async fn initialize_project(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        source: ProjectSource,
        task: &TaskHandle,
    ) -> Result<()> {
        let result = self
            .initialize_project_inner(project_id, user_id, source, task)
            .await;
        match &result {
            Ok(()) => task.succeed("Project initialized successfully").await,
            Err(e) => {
                error!("project init failed for {}: {}", project_id, e);
                task.fail(format!("Initialization failed: {}", e)).await;
            }
        }
        result
    }

    async fn initialize_project_inner(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        source: ProjectSource,
        task: &TaskHandle,
    ) -> Result<()> {
        let _guard = self.locks.lock(project_id).await;
        task.check_cancelled()?;

        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                kind: "project",
                name: project_id.to_string(),
            })?;

        task.update(10, "Preparing project storage").await;
        self.backend
            .as_orchestrator()
            .ensure_project_directory(&project.slug)
            .await?;

        task.check_cancelled()?;
        match source {
            ProjectSource::Template => {
                task.update(30, "Copying starter template").await;
                self.seed_from_template(&project).await?;
            }
            ProjectSource::Base { base_id } => {
                self.seed_from_base(&project, user_id, base_id, task).await?;
            }
            ProjectSource::Github { repo_url, branch } => {
                self.seed_from_github(&project, repo_url, branch, task).await?;
            }
        }

        task.check_cancelled()?;
        task.update(95, "Recording project state").await;
        info!("project {} initialized", project.slug);
        Ok(())
    }

    async fn seed_from_template(&self, project: &Project) -> Result<()> {
        match self.backend.mode() {
            DeploymentMode::Docker => {
                let template_dir = self.settings.template_dir.clone();
                if !template_dir.exists() {
                    return Err(OrchestratorError::NotFound {
                        kind: "template directory",
                        name: template_dir.display().to_string(),
                    });
                }
                let dest = self.settings.projects_path.join(&project.slug);
                let copied = fsops::copy_tree(
                    template_dir,
                    dest,
                    vec![
                        "node_modules".to_string(),
                        ".git".to_string(),
                        "dist".to_string(),
                        "build".to_string(),
                        ".next".to_string(),
                    ],
                )
                .await?;
                info!("copied {} template files into {}", copied, project.slug);
            }
            DeploymentMode::Kubernetes => {
                // Files land on the PVC when the first container
                // initializes; nothing to copy from here.
                info!("template seeding deferred to container init for {}", project.slug);
            }
        }
        Ok(())
    }

    async fn seed_from_base(
        &self,
        project: &Project,
        user_id: Uuid,
        base_id: Uuid,
        task: &TaskHandle,
    ) -> Result<()> {
        let base = self
            .store
            .get_base(base_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                kind: "marketplace base",
                name: base_id.to_string(),
            })?;

        task.update(30, format!("Loading marketplace base: {}", base.slug))
            .await;

        match &self.backend {
            InitializerBackend::Docker(docker) => {
                if self.cache.is_cached(&base.slug) {
                    task.update(50, "Copying base files from cache").await;
                    docker
                        .copy_base_to_project(&base.slug, &project.slug, None)
                        .await?;
                } else if let Some(repo_url) = &base.git_repo_url {
                    // Cache miss: clone straight into the project directory.
                    task.update(50, "Cloning base repository").await;
                    let dest = self.settings.projects_path.join(&project.slug);
                    clone_repository(repo_url, &base.default_branch, &dest, None).await?;
                } else {
                    warn!("base {} is not cached and has no repo, using template", base.slug);
                    self.seed_from_template(project).await?;
                }
            }
            InitializerBackend::Kubernetes(kubernetes) => {
                task.update(50, "Cloning base into project storage").await;
                kubernetes
                    .initialize_container_files(
                        project.id,
                        user_id,
                        &crate::naming::sanitize_service_name(&base.slug),
                        base.git_repo_url.as_deref(),
                        &base.default_branch,
                    )
                    .await?;
            }
        }

        if let Some(repo_url) = &base.git_repo_url {
            self.store.set_git_remote(project.id, repo_url).await?;
        }
        Ok(())
    }

    async fn seed_from_github(
        &self,
        project: &Project,
        repo_url: String,
        branch: Option<String>,
        task: &TaskHandle,
    ) -> Result<()> {
        if !repo_url.starts_with("https://") && !repo_url.starts_with("git@") {
            return Err(OrchestratorError::Git(GitError::InvalidUrl(repo_url)));
        }

        task.update(30, format!("Cloning repository: {}", repo_url))
            .await;
        let branch = branch.unwrap_or_else(|| "main".to_string());
        // The user's stored OAuth token, when present, arrives via the
        // GIT_ACCESS_TOKEN env var of this process - decrypted in memory
        // only, never written to disk.
        let token = std::env::var("GIT_ACCESS_TOKEN").ok();

        match self.backend.mode() {
            DeploymentMode::Docker => {
                let dest = self.settings.projects_path.join(&project.slug);
                clone_repository(&repo_url, &branch, &dest, token.as_deref()).await?;

                task.update(60, "Patching project for platform compatibility")
                    .await;
                if let Err(e) = auto_patch_project(&dest).await {
                    warn!("auto-patch skipped for {}: {:#}", project.slug, e);
                }
            }
            DeploymentMode::Kubernetes => {
                // Clone to a scratch dir is unnecessary: the in-pod init
                // performs the clone directly on the PVC.
                if let InitializerBackend::Kubernetes(kubernetes) = &self.backend {
                    kubernetes
                        .initialize_container_files(
                            project.id,
                            project.owner_id,
                            "app",
                            Some(&repo_url),
                            &branch,
                        )
                        .await?;
                }
            }
        }

        task.update(85, "Recording repository remote").await;
        self.store.set_git_remote(project.id, &repo_url).await?;
        Ok(())
    }

    /// Initialize one newly-added container's subdirectory, touching
    /// nothing else in the project.
    pub async fn initialize_container(
        &self,
        project_id: Uuid,
        container_id: Uuid,
        user_id: Uuid,
        task: &TaskHandle,
    ) -> Result<()> {
        let result = self
            .initialize_container_inner(project_id, container_id, user_id, task)
            .await;
        match &result {
            Ok(()) => task.succeed("Container initialized successfully").await,
            Err(e) => {
                error!("container init failed for {}: {}", container_id, e);
                task.fail(format!("Initialization failed: {}", e)).await;
            }
        }
        result
    }

    async fn initialize_container_inner(
        &self,
        project_id: Uuid,
        container_id: Uuid,
        user_id: Uuid,
        task: &TaskHandle,
    ) -> Result<()> {
        let _guard = self.locks.lock(project_id).await;
        task.check_cancelled()?;
        task.update(10, "Initializing container").await;

        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                kind: "project",
                name: project_id.to_string(),
            })?;
        let container = self
            .store
            .get_container(container_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                kind: "container",
                name: container_id.to_string(),
            })?;

        let base = match container.base_id {
            Some(base_id) => self.store.get_base(base_id).await?,
            None => None,
        };

        task.update(20, "Ensuring project directory exists").await;
        self.backend
            .as_orchestrator()
            .ensure_project_directory(&project.slug)
            .await?;

        task.check_cancelled()?;
        match &self.backend {
            InitializerBackend::Docker(docker) => {
                let subdir = container.subdir();
                let has_files = docker.project_has_files(&project.slug, subdir).await?;
                if has_files {
                    task.update(40, "Using existing project files").await;
                } else if let Some(base) = &base {
                    task.update(40, "Copying base files").await;
                    if self.cache.is_cached(&base.slug) {
                        docker
                            .copy_base_to_project(&base.slug, &project.slug, subdir)
                            .await?;
                    } else if let Some(repo_url) = &base.git_repo_url {
                        let mut dest = self.settings.projects_path.join(&project.slug);
                        if let Some(subdir) = subdir {
                            dest = dest.join(subdir);
                        }
                        clone_repository(repo_url, &base.default_branch, &dest, None).await?;
                    } else {
                        warn!("base {} unavailable, leaving directory empty", base.slug);
                    }
                }

                // Compose config is derived state; refresh it so the new
                // container is startable.
                task.update(80, "Updating Compose configuration").await;
                let containers = self.store.containers_for_project(project_id).await?;
                let connections = self.store.connections_for_project(project_id).await?;
                docker
                    .write_compose_file(&project, &containers, &connections, user_id)
                    .await?;
            }
            InitializerBackend::Kubernetes(kubernetes) => {
                task.update(40, "Initializing container files").await;
                let dir_label = crate::orchestrator::workload_host_label(&container);
                let git_url = base.as_ref().and_then(|b| b.git_repo_url.clone());
                let branch = base
                    .as_ref()
                    .map(|b| b.default_branch.clone())
                    .unwrap_or_else(|| "main".to_string());
                kubernetes
                    .initialize_container_files(
                        project_id,
                        user_id,
                        &dir_label,
                        git_url.as_deref(),
                        &branch,
                    )
                    .await?;
            }
        }

        info!("container {} initialized", container.name);
        Ok(())
    }
}

impl ProjectInitializer {
    /// Permanently delete a project: tear down its environment (backing up
    /// the archive on Kubernetes), then drop the record. Partial failures
    /// leave the record in place so the operation can be retried.
    pub async fn delete_project(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        task: &TaskHandle,
    ) -> Result<()> {
        let result = self.delete_project_inner(project_id, user_id, task).await;
        match &result {
            Ok(()) => task.succeed("Project deleted").await,
            Err(e) => task.fail(format!("Deletion failed: {}", e)).await,
        }
        result
    }

    async fn delete_project_inner(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        task: &TaskHandle,
    ) -> Result<()> {
        let Some(project) = self.store.get_project(project_id).await? else {
            // Idempotent: deleting a missing project is success.
            return Ok(());
        };

        task.update(20, "Tearing down project environment").await;
        match &self.backend {
            InitializerBackend::Docker(docker) => {
                docker.delete_project_permanently(&project, user_id).await?;
            }
            InitializerBackend::Kubernetes(kubernetes) => {
                kubernetes.delete_project_permanently(&project).await?;
            }
        }

        task.update(80, "Removing project record").await;
        self.store.delete_project(project_id).await?;
        info!("project {} removed", project.slug);
        Ok(())
    }
}

/// Clone a repository onto the host filesystem. The auth token, when
/// given, is injected into the https remote for this invocation only.
async fn clone_repository(
    repo_url: &str,
    branch: &str,
    destination: &Path,
    token: Option<&str>,
) -> Result<()> {
    let url = match token {
        Some(token) if repo_url.starts_with("https://") => repo_url
            .replacen("https://", &format!("https://x-access-token:{}@", token), 1),
        _ => repo_url.to_string(),
    };

    let clone = Command::new(get_tool_path("git"))
        .args([
            "clone",
            "--depth",
            "1",
            "--branch",
            branch,
            "--single-branch",
            url.as_str(),
        ])
        .arg(destination)
        .output();

    let output = tokio::time::timeout(GIT_CLONE_TIMEOUT, clone)
        .await
        .map_err(|_| OrchestratorError::Timeout(GIT_CLONE_TIMEOUT.as_secs()))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Never echo the tokenized URL back.
        return Err(OrchestratorError::Git(GitError::CloneFailed {
            url: repo_url.to_string(),
            stderr: stderr.replace(&url, repo_url).trim().to_string(),
        }));
    }
    Ok(())
}

/// Best-effort compatibility patching for imported repositories: dev
/// servers must bind 0.0.0.0 and accept proxied hostnames to be reachable
/// through the platform's routing.
async fn auto_patch_project(project_path: &Path) -> anyhow::Result<()> {
    for name in ["vite.config.js", "vite.config.ts"] {
        let config_path = project_path.join(name);
        let Some(content) = fsops::read_to_string(config_path.clone()).await? else {
            continue;
        };
        if content.contains("allowedHosts") {
            continue;
        }
        let Some(patched) = patch_vite_config(&content) else {
            warn!("unrecognized vite config shape in {}, leaving as-is", name);
            continue;
        };
        fsops::write_string(config_path, patched).await?;
        info!("patched {} for proxy compatibility", name);
    }
    Ok(())
}

/// Insert a permissive dev-server block into a `defineConfig({...})` call.
fn patch_vite_config(content: &str) -> Option<String> {
    let marker = "defineConfig({";
    let index = content.find(marker)?;
    let insert_at = index + marker.len();
    let server_block =
        "\n  server: { host: '0.0.0.0', allowedHosts: true, strictPort: true },";
    let mut patched = String::with_capacity(content.len() + server_block.len());
    patched.push_str(&content[..insert_at]);
    patched.push_str(server_block);
    patched.push_str(&content[insert_at..]);
    Some(patched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_handle_progression() {
        let task = TaskHandle::new();
        assert_eq!(task.snapshot().await.status, TaskStatus::Pending);

        task.update(40, "Cloning").await;
        let record = task.snapshot().await;
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.percent, 40);
        assert_eq!(record.message, "Cloning");

        task.succeed("Done").await;
        let record = task.snapshot().await;
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.percent, 100);
    }

    #[tokio::test]
    async fn test_cancellation_is_a_hard_failure() {
        let task = TaskHandle::new();
        task.cancel();
        assert!(task.is_cancelled());
        assert!(task.check_cancelled().is_err());
    }

    #[test]
    fn test_patch_vite_config() {
        let config = "import { defineConfig } from 'vite'\nexport default defineConfig({\n  plugins: [],\n})\n";
        let patched = patch_vite_config(config).unwrap();
        assert!(patched.contains("host: '0.0.0.0'"));
        assert!(patched.contains("allowedHosts: true"));
        assert!(patched.contains("plugins: []"));

        assert!(patch_vite_config("module.exports = {}").is_none());
    }

    #[test]
    fn test_percent_is_clamped() {
        tokio_test::block_on(async {
            let task = TaskHandle::new();
            task.update(150, "overflow").await;
            assert_eq!(task.snapshot().await.percent, 100);
        });
    }
}
