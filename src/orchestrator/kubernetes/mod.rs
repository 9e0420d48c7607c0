//! Kubernetes backend
//!
//! Each project maps to its own namespace holding a PVC, a NetworkPolicy,
//! an always-on file-manager pod, and one Deployment/Service/Ingress per
//! started container. File and shell operations run through the
//! file-manager pod's exec stream, falling back to a dev container when
//! the file-manager is absent.
//!
//! Hibernation streams the project archive out of the pod and uploads it
//! from this process; object-store credentials never enter a project
//! namespace. The namespace is only deleted after the upload verifies.

pub mod client;
pub mod manifests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::client::KubeClients;
use self::manifests::{
    COMPONENT_DEV_CONTAINER, FILE_MANAGER_NAME, LABEL_COMPONENT, LABEL_CONTAINER_DIR,
};
use super::{
    injected_environment, workload_host_label, ContainerStatus, FileScope, GrepQuery,
    Orchestrator, ProjectStatus, ReadyStatus, RunState, StartedContainer, StartedProject,
};
use crate::catalog::{self, ServiceType};
use crate::config::{
    Settings, GIT_CLONE_TIMEOUT, POD_COPY_TIMEOUT, POD_READY_TIMEOUT,
};
use crate::domain::{
    Container, ContainerConnection, ContainerDeployMode, ContainerKind, DeploymentMode,
    EnvironmentStatus, Project,
};
use crate::error::OrchestratorError;
use crate::fsops::{FileEntry, FileKind, GrepMatch};
use crate::manifest::{self, DEFAULT_DEV_PORT};
use crate::naming::{container_resource_name, project_namespace, sanitize_service_name};
use crate::object_store::ProjectArchiveStore;
use crate::security::shell_quote;
use crate::store::{ProjectLocks, ProjectStore};

type Result<T> = std::result::Result<T, OrchestratorError>;

const EXEC_SHORT: Duration = Duration::from_secs(10);
const EXEC_MEDIUM: Duration = Duration::from_secs(30);
const EXEC_ARCHIVE: Duration = Duration::from_secs(120);

/// Archive staging path inside the file-manager pod.
const POD_ARCHIVE_PATH: &str = "/tmp/project.zip";

/// Zip the project tree inside the pod, leaving the archive at
/// /tmp/project.zip. Exclude patterns are doubled (`x/*` and `*/x/*`) so
/// they match at the root and in container subdirectories.
const HIBERNATE_ZIP_SCRIPT: &str = r#"
cd /app
rm -f /tmp/project.zip
zip -r -q /tmp/project.zip . \
    -x "*/node_modules/*" \
    -x "node_modules/*" \
    -x "*/.git/*" \
    -x ".git/*" \
    -x "*/__pycache__/*" \
    -x "__pycache__/*" \
    -x "*/.next/*" \
    -x ".next/*" \
    -x "*.pyc" \
    -x ".DS_Store" \
    -x "*.log"
echo "ZIP_SIZE=$(stat -c%s /tmp/project.zip 2>/dev/null || stat -f%z /tmp/project.zip)"
"#;

const RESTORE_UNZIP_SCRIPT: &str = r#"
cd /app
unzip -o -q /tmp/project.zip
rm -f /tmp/project.zip
echo "FILES_RESTORED=$(ls -1 /app | wc -l)"
"#;

fn clean_rel_path(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Absolute in-pod path for a scoped file reference: strip traversal,
/// prepend /app plus the container subdirectory when present.
fn pod_path(subdir: Option<&str>, file_path: &str) -> String {
    let clean = clean_rel_path(file_path);
    match subdir.filter(|s| !s.is_empty() && *s != ".") {
        Some(subdir) => format!("/app/{}/{}", clean_rel_path(subdir), clean),
        None => format!("/app/{}", clean),
    }
}

fn sh(script: impl Into<String>) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.into()]
}

/// Idempotency probe before cloning: a directory that already carries a
/// package.json and a minimum file count is left alone.
fn init_check_script(target_dir: &str) -> String {
    let quoted = shell_quote(target_dir);
    format!(
        "if [ -d {dir} ] && [ -f {dir}/package.json ]; then \
            echo \"EXISTS:$(ls -1 {dir} 2>/dev/null | wc -l)\"; \
         else echo \"NOT_EXISTS\"; fi",
        dir = quoted
    )
}

fn git_clone_script(git_url: &str, branch: &str, target_dir: &str) -> String {
    let dir = shell_quote(target_dir);
    format!(
        concat!(
            "set -e\n",
            "rm -rf {dir}\n",
            "git clone --depth 1 --branch {branch} --single-branch {url} {dir}\n",
            "rm -rf {dir}/.git\n",
            "cd {dir}\n",
            "if [ -f package.json ]; then npm install --prefer-offline --no-audit || true; fi\n",
            "if [ -f frontend/package.json ]; then (cd frontend && npm install --prefer-offline --no-audit) || true; fi\n",
            "if [ -f requirements.txt ]; then pip install --user -r requirements.txt || true; fi\n",
            "if [ -f backend/requirements.txt ]; then (cd backend && pip install --user -r requirements.txt) || true; fi\n",
            "if [ -f go.mod ]; then go mod download || true; fi\n",
            "echo CLONE_OK\n",
        ),
        dir = dir,
        branch = shell_quote(branch),
        url = shell_quote(git_url),
    )
}

pub struct KubernetesOrchestrator {
    settings: Arc<Settings>,
    store: Arc<dyn ProjectStore>,
    locks: Arc<ProjectLocks>,
    archive: Arc<ProjectArchiveStore>,
    kube: KubeClients,
}

impl KubernetesOrchestrator {
    pub async fn connect(
        settings: Arc<Settings>,
        store: Arc<dyn ProjectStore>,
        locks: Arc<ProjectLocks>,
        archive: Arc<ProjectArchiveStore>,
    ) -> Result<Self> {
        let kube = KubeClients::connect().await?;
        info!(
            "kubernetes orchestrator initialized, storage class {}",
            settings.k8s.storage_class
        );
        Ok(Self {
            settings,
            store,
            locks,
            archive,
            kube,
        })
    }

    fn namespace(&self, project_id: Uuid) -> String {
        project_namespace(&project_id)
    }

    // ------------------------------------------------------------------
    // Environment lifecycle
    // ------------------------------------------------------------------

    /// Ensure namespace, NetworkPolicy, PVC, TLS secret and file-manager
    /// exist, then optionally rehydrate from the archive store.
    async fn ensure_environment(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        container_count: usize,
        restore_from_archive: bool,
    ) -> Result<String> {
        let namespace = self.namespace(project_id);
        info!(
            "ensuring environment for project {} (namespace {})",
            project_id, namespace
        );

        let ns_manifest = manifests::namespace_manifest(&namespace, project_id, user_id)?;
        self.kube.ensure_namespace(&ns_manifest).await?;

        if self.settings.k8s.enable_network_policies {
            let policy = manifests::network_policy_manifest(
                project_id,
                &self.settings.k8s.ingress_namespace,
            )?;
            self.kube
                .create_or_patch(&self.kube.network_policies(&namespace), &policy)
                .await?;
        }

        let pvc = manifests::pvc_manifest(
            project_id,
            user_id,
            &self.settings.k8s.storage_class,
            &self.settings.k8s.pvc_size,
            container_count > 1,
        )?;
        self.kube
            .create_or_patch(&self.kube.pvcs(&namespace), &pvc)
            .await?;

        // Wildcard TLS for ingress termination. Object-store credentials
        // are deliberately NOT copied here.
        if let Some(tls_secret) = &self.settings.k8s.wildcard_tls_secret {
            self.kube
                .copy_secret(tls_secret, &self.settings.k8s.platform_namespace, &namespace)
                .await?;
        }

        let file_manager = manifests::file_manager_deployment(
            project_id,
            user_id,
            &self.settings.devserver_image,
            &self.settings.k8s.image_pull_policy,
            self.settings.k8s.image_pull_secret.as_deref(),
        )?;
        self.kube
            .create_or_patch(&self.kube.deployments(&namespace), &file_manager)
            .await?;
        self.kube
            .wait_for_deployment_ready(&namespace, FILE_MANAGER_NAME, POD_READY_TIMEOUT)
            .await?;

        if restore_from_archive {
            self.restore_from_archive(project_id, user_id, &namespace)
                .await?;
        }

        Ok(namespace)
    }

    async fn wait_for_file_manager_pod(&self, namespace: &str) -> Result<String> {
        for attempt in 0..10 {
            if let Some(pod) = self.kube.file_manager_pod(namespace).await? {
                return Ok(pod);
            }
            debug!(
                "waiting for file-manager pod in {} (attempt {}/10)",
                namespace,
                attempt + 1
            );
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        Err(OrchestratorError::NotFound {
            kind: "file-manager pod",
            name: namespace.to_string(),
        })
    }

    /// Pod and container to run file operations against: the file-manager
    /// when present, else any live dev container.
    async fn file_ops_target(&self, namespace: &str) -> Result<(String, String)> {
        if let Some(pod) = self.kube.file_manager_pod(namespace).await? {
            return Ok((pod, FILE_MANAGER_NAME.to_string()));
        }
        let selector = format!("{}={}", LABEL_COMPONENT, COMPONENT_DEV_CONTAINER);
        if let Some(pod) = self.kube.ready_pod(namespace, &selector).await? {
            debug!("file-manager absent in {}, using dev pod {}", namespace, pod);
            return Ok((pod, "dev-server".to_string()));
        }
        Err(OrchestratorError::NotFound {
            kind: "pod",
            name: namespace.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Container file initialization
    // ------------------------------------------------------------------

    /// Populate a container's directory from its base repository before the
    /// container is started. Idempotent: an already-populated directory
    /// (package.json plus at least 3 entries) is left untouched.
    pub async fn initialize_container_files(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        container_directory: &str,
        git_url: Option<&str>,
        git_branch: &str,
    ) -> Result<()> {
        let namespace = self.namespace(project_id);
        let target_dir = format!("/app/{}", clean_rel_path(container_directory));

        if !self.kube.namespace_exists(&namespace).await? {
            self.ensure_environment(project_id, user_id, 1, false).await?;
        }
        let pod = self.wait_for_file_manager_pod(&namespace).await?;

        let check = self
            .kube
            .exec(
                &namespace,
                &pod,
                FILE_MANAGER_NAME,
                &sh(init_check_script(&target_dir)),
                EXEC_MEDIUM,
            )
            .await?;
        let check = check.trim();
        if let Some(count) = check.strip_prefix("EXISTS:") {
            let files: usize = count.trim().parse().unwrap_or(0);
            if files >= 3 {
                info!(
                    "{} already initialized ({} entries), skipping clone",
                    target_dir, files
                );
                return Ok(());
            }
            warn!("{} exists with only {} entries, re-cloning", target_dir, files);
        }

        let Some(git_url) = git_url else {
            return Err(OrchestratorError::Validation(format!(
                "container '{}' has no base repository URL; containers are created from a marketplace base with a git repository",
                container_directory
            )));
        };

        info!("cloning {} into {}", git_url, target_dir);
        let output = self
            .kube
            .exec(
                &namespace,
                &pod,
                FILE_MANAGER_NAME,
                &sh(git_clone_script(git_url, git_branch, &target_dir)),
                GIT_CLONE_TIMEOUT,
            )
            .await?;

        if !output.contains("CLONE_OK") {
            return Err(OrchestratorError::Git(crate::error::GitError::CloneFailed {
                url: git_url.to_string(),
                stderr: output.trim().chars().take(500).collect(),
            }));
        }
        info!("initialized files for {}", container_directory);
        Ok(())
    }

    /// Read and validate the container's manifest from the PVC; fall back
    /// to the project root manifest, then to defaults.
    async fn container_runtime(
        &self,
        namespace: &str,
        container: &Container,
    ) -> (Vec<String>, u16) {
        let mut parsed = None;

        if let Ok((pod, exec_container)) = self.file_ops_target(namespace).await {
            let mut candidates = Vec::new();
            if let Some(subdir) = container.subdir() {
                candidates.push(format!("/app/{}/TESSLATE.md", clean_rel_path(subdir)));
            }
            candidates.push("/app/TESSLATE.md".to_string());

            for path in candidates {
                let script = format!("cat {} 2>/dev/null || true", shell_quote(&path));
                if let Ok(content) = self
                    .kube
                    .exec(namespace, &pod, &exec_container, &sh(script), EXEC_SHORT)
                    .await
                {
                    if !content.trim().is_empty() {
                        let mut m = manifest::parse_manifest(&content);
                        if m.validate() {
                            parsed = Some(m);
                            break;
                        }
                        // Invalid manifest: fall through to the generic
                        // command, never a partial acceptance.
                        warn!("manifest at {} failed validation", path);
                        break;
                    }
                }
            }
        }

        let port = parsed
            .as_ref()
            .map(|m| m.port)
            .or(container.internal_port)
            .unwrap_or(DEFAULT_DEV_PORT);
        (manifest::startup_command(parsed.as_ref()), port)
    }

    // ------------------------------------------------------------------
    // Container lifecycle (lock-free inner bodies)
    // ------------------------------------------------------------------

    async fn start_container_inner(
        &self,
        project: &Project,
        container: &Container,
        all_containers: &[Container],
        connections: &[ContainerConnection],
        user_id: Uuid,
        environment_restored: bool,
    ) -> Result<StartedContainer> {
        let namespace = self.namespace(project.id);

        if container.kind == ContainerKind::Service {
            return self.start_catalog_service(project, container, user_id).await;
        }

        let dir_label = workload_host_label(container);

        // Files must exist before the deployment; restored projects already
        // carry them in the archive.
        if !environment_restored {
            let base = match container.base_id {
                Some(base_id) => self.store.get_base(base_id).await?,
                None => None,
            };
            let git_url = base.as_ref().and_then(|b| b.git_repo_url.clone());
            let branch = base
                .as_ref()
                .map(|b| b.default_branch.clone())
                .unwrap_or_else(|| "main".to_string());
            self.initialize_container_files(
                project.id,
                user_id,
                &dir_label,
                git_url.as_deref(),
                &branch,
            )
            .await?;
        }

        let (startup_command, port) = self.container_runtime(&namespace, container).await;

        let mut environment: BTreeMap<String, String> = container.environment_vars.clone();
        environment.insert("PROJECT_ID".to_string(), project.id.to_string());
        environment.insert("CONTAINER_ID".to_string(), container.id.to_string());
        environment.insert("CONTAINER_NAME".to_string(), container.name.clone());
        environment.extend(injected_environment(container, all_containers, connections));

        let deployment = manifests::dev_deployment(
            project.id,
            user_id,
            container.id,
            &dir_label,
            &self.settings.devserver_image,
            &self.settings.k8s.image_pull_policy,
            self.settings.k8s.image_pull_secret.as_deref(),
            port,
            &startup_command,
            &environment,
            self.settings.k8s.enable_pod_affinity && all_containers.len() > 1,
            &self.settings.k8s.affinity_topology_key,
        )?;
        self.kube
            .create_or_patch(&self.kube.deployments(&namespace), &deployment)
            .await?;

        let service = manifests::service_manifest(project.id, container.id, &dir_label, port)?;
        self.kube
            .create_or_patch(&self.kube.services(&namespace), &service)
            .await?;

        let ingress = manifests::ingress_manifest(
            project.id,
            container.id,
            &dir_label,
            &project.slug,
            port,
            &self.settings.app_domain,
            &self.settings.k8s.ingress_class,
            self.settings.k8s.wildcard_tls_secret.as_deref(),
        )?;
        self.kube
            .create_or_patch(&self.kube.ingresses(&namespace), &ingress)
            .await?;

        let url = self.container_url(&project.slug, &dir_label);
        info!("container started: {}", url);

        Ok(StartedContainer {
            status: RunState::Running,
            container_name: container.name.clone(),
            url,
        })
    }

    async fn start_catalog_service(
        &self,
        project: &Project,
        container: &Container,
        user_id: Uuid,
    ) -> Result<StartedContainer> {
        let namespace = self.namespace(project.id);
        let service_slug = container.service_slug.as_deref().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "service container '{}' has no catalog slug",
                container.name
            ))
        })?;
        let def = catalog::get_service(service_slug).ok_or(OrchestratorError::NotFound {
            kind: "catalog service",
            name: service_slug.to_string(),
        })?;

        if def.service_type == ServiceType::External
            || container.deploy_mode == ContainerDeployMode::External
        {
            debug!("service '{}' is external, nothing to start", service_slug);
            return Ok(StartedContainer {
                status: RunState::Running,
                container_name: container.name.clone(),
                url: String::new(),
            });
        }

        let service_name = sanitize_service_name(&container.name);
        let environment: BTreeMap<String, String> = def
            .environment_vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let command: Option<Vec<String>> = def
            .command
            .as_ref()
            .map(|argv| argv.iter().map(|a| a.to_string()).collect());

        let deployment = manifests::catalog_service_deployment(
            project.id,
            user_id,
            container.id,
            &service_name,
            def.docker_image,
            def.internal_port,
            &environment,
            command.as_deref(),
        )?;
        self.kube
            .create_or_patch(&self.kube.deployments(&namespace), &deployment)
            .await?;

        if let Some(port) = def.internal_port {
            let service =
                manifests::catalog_service_service(project.id, container.id, &service_name, port)?;
            self.kube
                .create_or_patch(&self.kube.services(&namespace), &service)
                .await?;
        }

        Ok(StartedContainer {
            status: RunState::Running,
            container_name: container.name.clone(),
            url: String::new(),
        })
    }

    /// Resolve the resource label for a container addressed by name: use
    /// its directory when the record is known, else the sanitized name.
    async fn resolve_dir_label(&self, project_id: Uuid, container_name: &str) -> String {
        match self.store.containers_for_project(project_id).await {
            Ok(containers) => containers
                .iter()
                .find(|c| c.name == container_name)
                .map(workload_host_label)
                .unwrap_or_else(|| sanitize_service_name(container_name)),
            Err(_) => sanitize_service_name(container_name),
        }
    }

    // ------------------------------------------------------------------
    // Hibernation / restoration
    // ------------------------------------------------------------------

    /// Zip the project inside the pod, stream the archive to this process,
    /// upload, and verify. Any failure aborts hibernation with the
    /// namespace intact - the live PVC is the only copy of the data until
    /// the upload verifies.
    async fn save_to_archive(
        &self,
        project_id: Uuid,
        owner_id: Uuid,
        namespace: &str,
    ) -> Result<()> {
        let pod = self.kube.file_manager_pod(namespace).await?.ok_or_else(|| {
            OrchestratorError::DataIntegrity(format!(
                "no file-manager pod in {}; cannot snapshot project files",
                namespace
            ))
        })?;

        let zip_output = self
            .kube
            .exec(
                namespace,
                &pod,
                FILE_MANAGER_NAME,
                &sh(HIBERNATE_ZIP_SCRIPT),
                EXEC_ARCHIVE,
            )
            .await
            .map_err(|e| {
                OrchestratorError::DataIntegrity(format!("archive build failed: {}", e))
            })?;
        debug!("hibernate zip: {}", zip_output.trim());

        let spool = tempfile::Builder::new()
            .prefix("tesslate-hibernate-")
            .suffix(".zip")
            .tempfile()
            .map_err(OrchestratorError::Io)?;
        let spool_path = spool.path().to_path_buf();

        self.kube
            .copy_from_pod(
                namespace,
                &pod,
                FILE_MANAGER_NAME,
                POD_ARCHIVE_PATH,
                &spool_path,
                POD_COPY_TIMEOUT,
            )
            .await
            .map_err(|e| {
                OrchestratorError::DataIntegrity(format!("archive streaming failed: {}", e))
            })?;

        self.archive
            .upload_archive(owner_id, project_id, &spool_path)
            .await
            .map_err(|e| OrchestratorError::DataIntegrity(format!("archive upload failed: {}", e)))?;

        // Upload-and-verify before anything is torn down.
        let verified = self
            .archive
            .exists(owner_id, project_id)
            .await
            .map_err(|e| OrchestratorError::DataIntegrity(e.to_string()))?;
        if !verified {
            return Err(OrchestratorError::DataIntegrity(
                "uploaded archive did not verify".to_string(),
            ));
        }

        // Best-effort cleanup of the staging file inside the pod.
        let _ = self
            .kube
            .exec(
                namespace,
                &pod,
                FILE_MANAGER_NAME,
                &sh(format!("rm -f {}", POD_ARCHIVE_PATH)),
                EXEC_SHORT,
            )
            .await;

        info!("project {} archived to object storage", project_id);
        Ok(())
    }

    /// Download the archive and unpack it onto the fresh PVC. Returns false
    /// when no archive exists (new project, nothing to restore).
    async fn restore_from_archive(
        &self,
        project_id: Uuid,
        owner_id: Uuid,
        namespace: &str,
    ) -> Result<bool> {
        if !self
            .archive
            .exists(owner_id, project_id)
            .await
            .map_err(OrchestratorError::Storage)?
        {
            warn!("no archive found for project {}", project_id);
            return Ok(false);
        }

        let spool = tempfile::Builder::new()
            .prefix("tesslate-restore-")
            .suffix(".zip")
            .tempfile()
            .map_err(OrchestratorError::Io)?;
        let spool_path = spool.path().to_path_buf();

        self.archive
            .download_archive(owner_id, project_id, &spool_path)
            .await?;

        let pod = self.wait_for_file_manager_pod(namespace).await?;
        self.kube
            .copy_to_pod(
                namespace,
                &pod,
                FILE_MANAGER_NAME,
                &spool_path,
                POD_ARCHIVE_PATH,
                POD_COPY_TIMEOUT,
            )
            .await?;

        let output = self
            .kube
            .exec(
                namespace,
                &pod,
                FILE_MANAGER_NAME,
                &sh(RESTORE_UNZIP_SCRIPT),
                EXEC_ARCHIVE,
            )
            .await?;
        info!("project {} restored: {}", project_id, output.trim());
        Ok(true)
    }

    /// Hibernate: archive to object storage, then delete the namespace
    /// (which cascades every Deployment, Service, Ingress and the PVC).
    pub async fn hibernate_project(&self, project: &Project) -> Result<()> {
        self.delete_project_environment(project, true).await?;
        info!("project {} hibernated", project.slug);
        Ok(())
    }

    /// Restore a hibernated project's environment. Idempotent: an
    /// already-active environment is returned as-is.
    pub async fn restore_project(
        &self,
        project: &Project,
        container_count: usize,
    ) -> Result<String> {
        let namespace = self.namespace(project.id);
        if self.kube.namespace_exists(&namespace).await? {
            debug!("project {} already active in {}", project.slug, namespace);
            return Ok(namespace);
        }
        self.ensure_environment(project.id, project.owner_id, container_count.max(1), true)
            .await
    }

    /// Tear down a project permanently, optionally archiving first.
    pub async fn delete_project_environment(
        &self,
        project: &Project,
        save_to_archive: bool,
    ) -> Result<()> {
        let namespace = self.namespace(project.id);
        if save_to_archive {
            self.save_to_archive(project.id, project.owner_id, &namespace)
                .await?;
        }
        self.kube.delete_namespace(&namespace).await
    }

    /// Permanent deletion: back the archive up under the deleted/ prefix
    /// (independent retention), drop the active archive, delete the
    /// namespace.
    pub async fn delete_project_permanently(&self, project: &Project) -> Result<()> {
        let _guard = self.locks.lock(project.id).await;

        let backed_up = self
            .archive
            .copy_to_deleted(project.owner_id, project.id)
            .await?;
        if backed_up {
            self.archive.delete(project.owner_id, project.id).await?;
        }

        self.kube
            .delete_namespace(&self.namespace(project.id))
            .await?;
        info!("project {} deleted", project.slug);
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for KubernetesOrchestrator {
    fn deployment_mode(&self) -> DeploymentMode {
        DeploymentMode::Kubernetes
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn start_project(
        &self,
        project: &Project,
        containers: &[Container],
        connections: &[ContainerConnection],
        user_id: Uuid,
    ) -> Result<StartedProject> {
        let _guard = self.locks.lock(project.id).await;

        let was_hibernated = project.environment_status == EnvironmentStatus::Hibernated;
        let namespace_exists = self
            .kube
            .namespace_exists(&self.namespace(project.id))
            .await?;

        let mut restored = false;
        if !namespace_exists {
            self.ensure_environment(project.id, user_id, containers.len(), was_hibernated)
                .await?;
            restored = was_hibernated;
            if was_hibernated {
                self.store
                    .update_environment_status(project.id, EnvironmentStatus::Active, None)
                    .await?;
            }
        }

        let mut container_urls = BTreeMap::new();
        for container in containers {
            let started = self
                .start_container_inner(
                    project,
                    container,
                    containers,
                    connections,
                    user_id,
                    restored,
                )
                .await?;
            if !started.url.is_empty() {
                container_urls.insert(container.name.clone(), started.url);
            }
        }

        self.track_activity(user_id, project.id, None).await;
        info!("project {} started", project.slug);

        Ok(StartedProject {
            status: RunState::Running,
            project_slug: project.slug.clone(),
            containers: container_urls,
        })
    }

    async fn stop_project(
        &self,
        project_slug: &str,
        project_id: Uuid,
        _user_id: Uuid,
    ) -> Result<()> {
        let _guard = self.locks.lock(project_id).await;
        let namespace = self.namespace(project_id);

        // Remove dev workloads and their routing; the file-manager and the
        // PVC stay so files remain reachable.
        let selector = format!("{}={}", LABEL_COMPONENT, COMPONENT_DEV_CONTAINER);
        let params = kube::api::ListParams::default().labels(&selector);

        let deployments = self.kube.deployments(&namespace);
        if let Ok(list) = deployments.list(&params).await {
            for deployment in list.items {
                if let Some(name) = deployment.metadata.name {
                    self.kube.delete_ignore_missing(&deployments, &name).await?;
                }
            }
        }

        let id_params =
            kube::api::ListParams::default().labels(manifests::LABEL_CONTAINER_ID);
        let services = self.kube.services(&namespace);
        if let Ok(list) = services.list(&id_params).await {
            for service in list.items {
                if let Some(name) = service.metadata.name {
                    self.kube.delete_ignore_missing(&services, &name).await?;
                }
            }
        }
        let ingresses = self.kube.ingresses(&namespace);
        if let Ok(list) = ingresses.list(&id_params).await {
            for ingress in list.items {
                if let Some(name) = ingress.metadata.name {
                    self.kube.delete_ignore_missing(&ingresses, &name).await?;
                }
            }
        }

        info!("project {} stopped (files persist)", project_slug);
        Ok(())
    }

    async fn get_project_status(
        &self,
        project_slug: &str,
        project_id: Uuid,
    ) -> Result<ProjectStatus> {
        let namespace = self.namespace(project_id);
        if !self.kube.namespace_exists(&namespace).await? {
            return Ok(ProjectStatus {
                status: RunState::NotFound,
                containers: BTreeMap::new(),
            });
        }

        let pods = self
            .kube
            .pods(&namespace)
            .list(&kube::api::ListParams::default())
            .await
            .map_err(OrchestratorError::Kubernetes)?;

        let mut containers = BTreeMap::new();
        for pod in pods.items {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            let ready = KubeClients::is_pod_ready(&pod);

            if let Some(dir) = labels.get(LABEL_CONTAINER_DIR) {
                let url = ready.then(|| self.container_url(project_slug, dir));
                containers.insert(
                    dir.clone(),
                    ContainerStatus {
                        status: if ready { RunState::Running } else { RunState::Starting },
                        url,
                        ready,
                        replicas: Some(1),
                        ready_replicas: Some(if ready { 1 } else { 0 }),
                    },
                );
            } else if labels.get("app").map(|a| a == FILE_MANAGER_NAME) == Some(true) {
                containers.insert(
                    FILE_MANAGER_NAME.to_string(),
                    ContainerStatus {
                        status: if ready { RunState::Running } else { RunState::Starting },
                        url: None,
                        ready,
                        replicas: Some(1),
                        ready_replicas: Some(if ready { 1 } else { 0 }),
                    },
                );
            }
        }

        Ok(ProjectStatus {
            status: RunState::Running,
            containers,
        })
    }

    async fn start_container(
        &self,
        project: &Project,
        container: &Container,
        all_containers: &[Container],
        connections: &[ContainerConnection],
        user_id: Uuid,
    ) -> Result<StartedContainer> {
        let _guard = self.locks.lock(project.id).await;

        let was_hibernated = project.environment_status == EnvironmentStatus::Hibernated;
        let namespace_exists = self
            .kube
            .namespace_exists(&self.namespace(project.id))
            .await?;

        let mut restored = false;
        if !namespace_exists {
            self.ensure_environment(
                project.id,
                user_id,
                all_containers.len(),
                was_hibernated,
            )
            .await?;
            restored = was_hibernated;
            if was_hibernated {
                self.store
                    .update_environment_status(project.id, EnvironmentStatus::Active, None)
                    .await?;
            }
        }

        let started = self
            .start_container_inner(project, container, all_containers, connections, user_id, restored)
            .await?;
        self.track_activity(user_id, project.id, Some(&container.name))
            .await;
        Ok(started)
    }

    async fn stop_container(
        &self,
        _project_slug: &str,
        project_id: Uuid,
        container_name: &str,
        _user_id: Uuid,
    ) -> Result<()> {
        let _guard = self.locks.lock(project_id).await;
        let namespace = self.namespace(project_id);
        let dir_label = self.resolve_dir_label(project_id, container_name).await;
        let resource = container_resource_name(&dir_label);

        self.kube
            .delete_ignore_missing(&self.kube.deployments(&namespace), &resource)
            .await?;
        self.kube
            .delete_ignore_missing(&self.kube.services(&namespace), &resource)
            .await?;
        self.kube
            .delete_ignore_missing(&self.kube.ingresses(&namespace), &resource)
            .await?;

        info!("container {} stopped (files persist)", container_name);
        Ok(())
    }

    async fn get_container_status(
        &self,
        project_slug: &str,
        project_id: Uuid,
        container_name: &str,
        _user_id: Uuid,
    ) -> Result<ContainerStatus> {
        let namespace = self.namespace(project_id);
        let dir_label = self.resolve_dir_label(project_id, container_name).await;
        let resource = container_resource_name(&dir_label);

        match self.kube.deployments(&namespace).get(&resource).await {
            Ok(deployment) => {
                let status = deployment.status.unwrap_or_default();
                let ready_replicas = status.ready_replicas.unwrap_or(0);
                let ready = ready_replicas > 0;
                Ok(ContainerStatus {
                    status: if ready { RunState::Running } else { RunState::Starting },
                    url: ready.then(|| self.container_url(project_slug, &dir_label)),
                    ready,
                    replicas: status.replicas,
                    ready_replicas: status.ready_replicas,
                })
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(ContainerStatus {
                status: RunState::Stopped,
                url: None,
                ready: false,
                replicas: None,
                ready_replicas: None,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_file(&self, scope: FileScope<'_>, file_path: &str) -> Result<Option<String>> {
        let namespace = self.namespace(scope.project_id);
        let (pod, container) = self.file_ops_target(&namespace).await?;
        let full_path = pod_path(scope.subdir, file_path);

        let probe = format!(
            "test -f {} && echo exists || echo notfound",
            shell_quote(&full_path)
        );
        let result = self
            .kube
            .exec(&namespace, &pod, &container, &sh(probe), EXEC_SHORT)
            .await?;
        if result.contains("notfound") {
            return Ok(None);
        }

        let content = self
            .kube
            .exec(
                &namespace,
                &pod,
                &container,
                &sh(format!("cat {}", shell_quote(&full_path))),
                EXEC_MEDIUM,
            )
            .await?;

        self.track_activity(scope.user_id, scope.project_id, Some(scope.container_name))
            .await;
        Ok(Some(content))
    }

    async fn write_file(
        &self,
        scope: FileScope<'_>,
        file_path: &str,
        content: &str,
    ) -> Result<()> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;

        let namespace = self.namespace(scope.project_id);
        let (pod, container) = self.file_ops_target(&namespace).await?;
        let full_path = pod_path(scope.subdir, file_path);

        let dir = full_path
            .rsplit_once('/')
            .map(|(d, _)| d.to_string())
            .unwrap_or_else(|| "/app".to_string());
        self.kube
            .exec(
                &namespace,
                &pod,
                &container,
                &sh(format!("mkdir -p {}", shell_quote(&dir))),
                EXEC_SHORT,
            )
            .await?;

        // Base64 framing keeps arbitrary content intact over the stream.
        let encoded = BASE64.encode(content.as_bytes());
        self.kube
            .exec(
                &namespace,
                &pod,
                &container,
                &sh(format!(
                    "echo '{}' | base64 -d > {}",
                    encoded,
                    shell_quote(&full_path)
                )),
                EXEC_MEDIUM,
            )
            .await?;

        self.track_activity(scope.user_id, scope.project_id, Some(scope.container_name))
            .await;
        Ok(())
    }

    async fn delete_file(&self, scope: FileScope<'_>, file_path: &str) -> Result<()> {
        let namespace = self.namespace(scope.project_id);
        let (pod, container) = self.file_ops_target(&namespace).await?;
        let full_path = pod_path(scope.subdir, file_path);

        self.kube
            .exec(
                &namespace,
                &pod,
                &container,
                &sh(format!("rm -f {}", shell_quote(&full_path))),
                EXEC_SHORT,
            )
            .await?;
        self.track_activity(scope.user_id, scope.project_id, Some(scope.container_name))
            .await;
        Ok(())
    }

    async fn list_files(&self, scope: FileScope<'_>, directory: &str) -> Result<Vec<FileEntry>> {
        let namespace = self.namespace(scope.project_id);
        let (pod, container) = self.file_ops_target(&namespace).await?;
        let dir = if directory == "." {
            pod_path(scope.subdir, "")
        } else {
            pod_path(scope.subdir, directory)
        };
        let dir = dir.trim_end_matches('/').to_string();

        let output = self
            .kube
            .exec(
                &namespace,
                &pod,
                &container,
                &sh(format!("ls -la {} 2>/dev/null || echo EMPTY", shell_quote(&dir))),
                EXEC_MEDIUM,
            )
            .await?;

        // BusyBox-compatible `ls -la` parse; no `find -printf` available.
        let mut files = Vec::new();
        for line in output.lines() {
            if line.starts_with("total") || line == "EMPTY" || line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 9 {
                continue;
            }
            let name = parts[8..].join(" ");
            if name == "." || name == ".." {
                continue;
            }
            files.push(FileEntry {
                name: name.clone(),
                path: name,
                kind: if parts[0].starts_with('d') {
                    FileKind::Directory
                } else {
                    FileKind::File
                },
                size: parts[4].parse().unwrap_or(0),
            });
        }
        Ok(files)
    }

    async fn glob_files(
        &self,
        scope: FileScope<'_>,
        pattern: &str,
        directory: &str,
    ) -> Result<Vec<FileEntry>> {
        let namespace = self.namespace(scope.project_id);
        let (pod, container) = self.file_ops_target(&namespace).await?;
        let dir = if directory == "." {
            pod_path(scope.subdir, "")
        } else {
            pod_path(scope.subdir, directory)
        };
        let dir = dir.trim_end_matches('/').to_string();

        let script = format!(
            "find {} -name {} -type f 2>/dev/null | head -n 100",
            shell_quote(&dir),
            shell_quote(pattern)
        );
        let output = self
            .kube
            .exec(&namespace, &pod, &container, &sh(script), EXEC_MEDIUM)
            .await?;

        let mut entries = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let rel = line.strip_prefix("/app/").unwrap_or(line).to_string();
            let name = rel.rsplit('/').next().unwrap_or(&rel).to_string();
            entries.push(FileEntry {
                name,
                path: rel,
                kind: FileKind::File,
                size: 0,
            });
        }
        Ok(entries)
    }

    async fn grep_files(
        &self,
        scope: FileScope<'_>,
        query: &GrepQuery,
    ) -> Result<Vec<GrepMatch>> {
        let namespace = self.namespace(scope.project_id);
        let (pod, container) = self.file_ops_target(&namespace).await?;
        let dir = if query.directory == "." {
            pod_path(scope.subdir, "")
        } else {
            pod_path(scope.subdir, &query.directory)
        };
        let dir = dir.trim_end_matches('/').to_string();

        let case_flag = if query.case_sensitive { "" } else { "-i " };
        let script = format!(
            "grep -rn {}-e {} {} 2>/dev/null | head -n {}",
            case_flag,
            shell_quote(&query.pattern),
            shell_quote(&dir),
            query.max_results
        );
        let output = self
            .kube
            .exec(&namespace, &pod, &container, &sh(script), EXEC_MEDIUM)
            .await?;

        let name_filter = glob::Pattern::new(&query.file_pattern).ok();
        let mut matches = Vec::new();
        for line in output.lines() {
            let mut parts = line.splitn(3, ':');
            let (Some(file), Some(line_no), Some(content)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(line_no) = line_no.parse::<u64>() else {
                continue;
            };
            let rel = file.strip_prefix("/app/").unwrap_or(file).to_string();
            if let Some(filter) = &name_filter {
                let basename = rel.rsplit('/').next().unwrap_or(&rel);
                if !filter.matches(basename) {
                    continue;
                }
            }
            let mut snippet = content.trim().to_string();
            snippet.truncate(200);
            matches.push(GrepMatch {
                file: rel,
                line: line_no,
                content: snippet,
            });
            if matches.len() >= query.max_results {
                break;
            }
        }
        Ok(matches)
    }

    async fn execute_command(
        &self,
        scope: FileScope<'_>,
        command: &[String],
        timeout: Option<Duration>,
        working_dir: Option<&str>,
    ) -> Result<String> {
        let namespace = self.namespace(scope.project_id);
        let (pod, container) = self.file_ops_target(&namespace).await?;
        let budget = Settings::clamp_exec_timeout(timeout);

        let full_command = match working_dir {
            Some(dir) => sh(format!(
                "cd /app/{} && {}",
                clean_rel_path(dir),
                command.join(" ")
            )),
            None => command.to_vec(),
        };

        let output = self
            .kube
            .exec(&namespace, &pod, &container, &full_command, budget)
            .await?;
        self.track_activity(scope.user_id, scope.project_id, Some(scope.container_name))
            .await;
        Ok(output)
    }

    async fn is_container_ready(&self, scope: FileScope<'_>) -> Result<ReadyStatus> {
        let namespace = self.namespace(scope.project_id);
        if self.kube.file_manager_pod(&namespace).await?.is_some() {
            return Ok(ReadyStatus {
                ready: true,
                message: "file-manager is ready".to_string(),
            });
        }

        let status = self
            .get_container_status(
                scope.project_slug,
                scope.project_id,
                scope.container_name,
                scope.user_id,
            )
            .await?;
        Ok(ReadyStatus {
            ready: status.ready,
            message: if status.ready {
                "Container is ready".to_string()
            } else {
                format!("Container status: {:?}", status.status)
            },
        })
    }

    async fn track_activity(
        &self,
        _user_id: Uuid,
        project_id: Uuid,
        _container_name: Option<&str>,
    ) {
        // Store-backed so every backend replica agrees on idleness.
        if let Err(e) = self.store.record_activity(project_id, Utc::now()).await {
            debug!("activity stamp failed for {}: {}", project_id, e);
        }
    }

    /// Single-tier idle policy: hibernate to object storage after the
    /// threshold. The status flip to hibernated commits only after the
    /// backend reports success, so a failed upload leaves the project
    /// active and retryable.
    async fn cleanup_idle_environments(&self, idle_timeout_minutes: i64) -> Result<Vec<String>> {
        let minutes = if idle_timeout_minutes > 0 {
            idle_timeout_minutes
        } else {
            self.settings.k8s.hibernation_idle_minutes
        };
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes);

        let idle = self.store.idle_projects(cutoff).await?;
        info!("found {} idle projects (cutoff {} min)", idle.len(), minutes);

        let mut hibernated = Vec::new();
        for project in idle {
            let _guard = self.locks.lock(project.id).await;
            match self.hibernate_project(&project).await {
                Ok(()) => {
                    self.store
                        .update_environment_status(
                            project.id,
                            EnvironmentStatus::Hibernated,
                            Some(Utc::now()),
                        )
                        .await?;
                    info!("hibernated {}", project.slug);
                    hibernated.push(project.id.to_string());
                }
                Err(e) => {
                    // Status stays active; the reaper retries next pass.
                    error!("failed to hibernate {}: {}", project.slug, e);
                }
            }
        }
        Ok(hibernated)
    }

    async fn ensure_project_directory(&self, project_slug: &str) -> Result<()> {
        // Directories are created on the PVC by the pods themselves.
        debug!("ensure_project_directory({}) is a no-op on kubernetes", project_slug);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_path_normalization() {
        assert_eq!(pod_path(None, "src/main.ts"), "/app/src/main.ts");
        assert_eq!(pod_path(None, "/etc/passwd"), "/app/etc/passwd");
        assert_eq!(pod_path(None, "../../secret"), "/app/secret");
        assert_eq!(
            pod_path(Some("backend"), "hello.txt"),
            "/app/backend/hello.txt"
        );
        assert_eq!(pod_path(Some("."), "a.txt"), "/app/a.txt");
    }

    #[test]
    fn test_git_clone_script_contents() {
        let script = git_clone_script(
            "https://github.com/tesslate/vite-react-fastapi.git",
            "main",
            "/app/backend",
        );
        assert!(script.contains("git clone --depth 1 --branch main --single-branch"));
        assert!(script.contains("rm -rf /app/backend/.git"));
        assert!(script.contains("npm install"));
        assert!(script.contains("pip install --user -r requirements.txt"));
        assert!(script.contains("go mod download"));
    }

    #[test]
    fn test_init_check_script_probes_package_json() {
        let script = init_check_script("/app/frontend");
        assert!(script.contains("[ -f /app/frontend/package.json ]"));
        assert!(script.contains("NOT_EXISTS"));
    }

    #[test]
    fn test_hibernate_script_excludes() {
        for pattern in ["node_modules/*", ".git/*", "__pycache__/*", "*.log"] {
            assert!(
                HIBERNATE_ZIP_SCRIPT.contains(pattern),
                "missing exclude {}",
                pattern
            );
        }
        assert!(HIBERNATE_ZIP_SCRIPT.contains("zip -r -q /tmp/project.zip"));
        assert!(RESTORE_UNZIP_SCRIPT.contains("unzip -o -q /tmp/project.zip"));
    }
}
