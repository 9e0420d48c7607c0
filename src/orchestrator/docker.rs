//! Docker Compose backend
//!
//! Single-host orchestration over `docker compose`. The shared projects
//! volume is mounted at `/projects` in this process and, via the Compose
//! `volume.subpath` feature, at `/app` inside each workload, so file
//! operations are direct POSIX calls with no exec round-trip.
//!
//! The generated Compose file is derived state, rebuilt from the project
//! and container records before every `up`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::compose::{self, generate_project_compose, BaseContainerRuntime};
use super::{
    workload_host_label, ContainerStatus, FileScope, GrepQuery, Orchestrator, ProjectStatus,
    ReadyStatus, RunState, StartedContainer, StartedProject,
};
use crate::activity::ActivityTracker;
use crate::config::Settings;
use crate::domain::{
    Container, ContainerConnection, ContainerKind, DeploymentMode, Project,
};
use crate::error::{ComposeError, OrchestratorError};
use crate::fsops::{self, FileEntry, GrepMatch};
use crate::manifest::{self, DEFAULT_DEV_PORT};
use crate::naming::sanitize_service_name;
use crate::proxy::ProxyRegistry;
use crate::store::{ProjectLocks, ProjectStore};
use crate::tools::get_tool_path;

/// Tier-2 threshold: a project paused this long becomes deletable.
const TIER2_PAUSE: Duration = Duration::from_secs(24 * 60 * 60);

type Result<T> = std::result::Result<T, OrchestratorError>;

/// One line of `docker compose ps --format json` output.
#[derive(Debug, Deserialize)]
struct ComposePsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State")]
    state: String,
}

fn parse_compose_ps(stdout: &str) -> BTreeMap<String, String> {
    let mut states = BTreeMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ComposePsEntry>(line) {
            Ok(entry) => {
                states.insert(entry.service, entry.state);
            }
            Err(e) => debug!("unparseable compose ps line: {}", e),
        }
    }
    states
}

/// Strip path traversal and leading slashes from a caller-supplied path.
fn sanitize_rel_path(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect::<Vec<_>>()
        .join("/")
}

pub struct DockerOrchestrator {
    settings: Arc<Settings>,
    store: Arc<dyn ProjectStore>,
    activity: Arc<ActivityTracker>,
    locks: Arc<ProjectLocks>,
    proxies: Arc<ProxyRegistry>,
}

impl DockerOrchestrator {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn ProjectStore>,
        activity: Arc<ActivityTracker>,
        locks: Arc<ProjectLocks>,
        proxies: Arc<ProxyRegistry>,
    ) -> Self {
        info!(
            "docker orchestrator initialized, projects path {}",
            settings.projects_path.display()
        );
        Self {
            settings,
            store,
            activity,
            locks,
            proxies,
        }
    }

    fn compose_file_path(&self, project_slug: &str) -> PathBuf {
        self.settings.compose_dir.join(format!("{}.yml", project_slug))
    }

    pub fn project_path(&self, project_slug: &str) -> PathBuf {
        self.settings.projects_path.join(project_slug)
    }

    fn scoped_root(&self, scope: &FileScope<'_>) -> PathBuf {
        let mut root = self.project_path(scope.project_slug);
        if let Some(subdir) = scope.subdir {
            if subdir != "." {
                root = root.join(sanitize_rel_path(subdir));
            }
        }
        root
    }

    fn scoped_path(&self, scope: &FileScope<'_>, file_path: &str) -> PathBuf {
        self.scoped_root(scope).join(sanitize_rel_path(file_path))
    }

    /// Run `docker compose` with a project file and name; captures stderr
    /// into the error on failure.
    async fn run_compose(
        &self,
        project_slug: &str,
        args: &[&str],
        action: &str,
    ) -> Result<String> {
        let compose_file = self.compose_file_path(project_slug);
        if !compose_file.exists() {
            return Err(ComposeError::FileMissing {
                slug: project_slug.to_string(),
            }
            .into());
        }

        let output = Command::new(get_tool_path("docker"))
            .arg("compose")
            .arg("-f")
            .arg(&compose_file)
            .arg("-p")
            .arg(project_slug)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("docker compose {} failed for {}: {}", action, project_slug, stderr);
            return Err(ComposeError::CommandFailed {
                action: action.to_string(),
                stderr,
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_docker(&self, args: &[&str]) -> Result<(bool, String)> {
        let output = Command::new(get_tool_path("docker")).args(args).output().await?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok((output.status.success(), combined))
    }

    /// Resolve a base container's startup command and port from its
    /// manifest: the container's own directory is consulted first, then the
    /// project root, then the stored port, then defaults.
    async fn container_runtime(
        &self,
        project: &Project,
        container: &Container,
    ) -> BaseContainerRuntime {
        let project_path = self.project_path(&project.slug);

        let mut manifest = None;
        if let Some(subdir) = container.subdir() {
            manifest = manifest::load_manifest_from_dir(&project_path.join(subdir)).await;
        }
        if manifest.is_none() {
            manifest = manifest::load_manifest_from_dir(&project_path).await;
        }

        let port = manifest
            .as_ref()
            .map(|m| m.port)
            .or(container.internal_port)
            .unwrap_or(DEFAULT_DEV_PORT);

        BaseContainerRuntime {
            command: manifest::startup_command(manifest.as_ref()),
            port,
        }
    }

    /// Regenerate and write the Compose file from current records.
    pub async fn write_compose_file(
        &self,
        project: &Project,
        containers: &[Container],
        connections: &[ContainerConnection],
        user_id: Uuid,
    ) -> Result<PathBuf> {
        let mut runtime = HashMap::new();
        for container in containers {
            if container.kind == ContainerKind::Base {
                runtime.insert(container.id, self.container_runtime(project, container).await);
            }
        }

        let compose = generate_project_compose(
            &self.settings,
            project,
            containers,
            connections,
            &runtime,
            user_id,
        )?;
        let rendered = compose::render(&compose)?;

        fsops::create_dir_all(self.settings.compose_dir.clone()).await?;
        let path = self.compose_file_path(&project.slug);
        fsops::write_string(path.clone(), rendered).await?;
        info!("generated compose file for project {}", project.slug);
        Ok(path)
    }

    /// Delete a project's directory tree on the shared volume.
    pub async fn delete_project_directory(&self, project_slug: &str) -> Result<()> {
        fsops::remove_tree(self.project_path(project_slug)).await?;
        info!("deleted project directory {}", project_slug);
        Ok(())
    }

    /// Copy a cached marketplace base into a project (optionally into a
    /// container subdirectory).
    pub async fn copy_base_to_project(
        &self,
        base_slug: &str,
        project_slug: &str,
        target_subdir: Option<&str>,
    ) -> Result<()> {
        let cache_path = self.settings.base_cache_dir.join(base_slug);
        if !cache_path.exists() {
            return Err(OrchestratorError::NotFound {
                kind: "base cache entry",
                name: base_slug.to_string(),
            });
        }

        let mut destination = self.project_path(project_slug);
        if let Some(subdir) = target_subdir {
            destination = destination.join(sanitize_rel_path(subdir));
        }
        fsops::create_dir_all(destination.clone()).await?;

        let copied = fsops::copy_tree(
            cache_path,
            destination,
            vec![
                ".git".to_string(),
                "__pycache__".to_string(),
                "*.pyc".to_string(),
                ".DS_Store".to_string(),
            ],
        )
        .await?;
        info!(
            "copied base {} into {}{} ({} files)",
            base_slug,
            project_slug,
            target_subdir.map(|s| format!("/{}", s)).unwrap_or_default(),
            copied
        );
        Ok(())
    }

    /// Whether a project (or one container's subdirectory) already has files.
    pub async fn project_has_files(
        &self,
        project_slug: &str,
        subdir: Option<&str>,
    ) -> Result<bool> {
        let mut path = self.project_path(project_slug);
        if let Some(subdir) = subdir {
            path = path.join(sanitize_rel_path(subdir));
        }
        Ok(fsops::dir_has_files(path).await?)
    }

    /// Bounded bulk read of a project's text files (editor bootstrap).
    pub async fn files_with_content(
        &self,
        project_slug: &str,
        subdir: Option<&str>,
        max_files: usize,
        max_file_size: u64,
    ) -> Result<Vec<(String, String)>> {
        let mut root = self.project_path(project_slug);
        if let Some(subdir) = subdir {
            root = root.join(sanitize_rel_path(subdir));
        }
        Ok(fsops::files_with_content(root, max_files, max_file_size).await?)
    }

    /// Permanently remove a project's runtime footprint: stack down,
    /// generated compose file gone, directory gone, proxy slot released.
    pub async fn delete_project_permanently(&self, project: &Project, user_id: Uuid) -> Result<()> {
        let _guard = self.locks.lock(project.id).await;

        match self
            .run_compose(&project.slug, &["down", "--remove-orphans", "--volumes"], "down")
            .await
        {
            Ok(_) => {}
            Err(OrchestratorError::Compose(ComposeError::FileMissing { .. })) => {}
            Err(e) => return Err(e),
        }

        fsops::remove_file(self.compose_file_path(&project.slug)).await?;
        self.delete_project_directory(&project.slug).await?;
        self.proxies.disconnect_project(&project.slug).await;
        self.proxies.release(&project.slug);
        self.activity.forget(user_id, project.id);
        info!("project {} deleted", project.slug);
        Ok(())
    }

    async fn project_status_inner(&self, project_slug: &str) -> Result<ProjectStatus> {
        if !self.compose_file_path(project_slug).exists() {
            return Ok(ProjectStatus {
                status: RunState::NotFound,
                containers: BTreeMap::new(),
            });
        }

        let stdout = self
            .run_compose(project_slug, &["ps", "--format", "json"], "ps")
            .await?;
        let states = parse_compose_ps(&stdout);

        let mut containers = BTreeMap::new();
        let mut all_running = !states.is_empty();
        for (service, state) in states {
            let running = state == "running";
            all_running &= running;
            let url = running.then(|| {
                format!(
                    "{}://{}-{}.{}",
                    self.settings.url_scheme(),
                    project_slug,
                    service,
                    self.settings.app_domain
                )
            });
            containers.insert(
                service,
                ContainerStatus {
                    status: if running { RunState::Running } else { RunState::Stopped },
                    url,
                    ready: running,
                    replicas: None,
                    ready_replicas: None,
                },
            );
        }

        Ok(ProjectStatus {
            status: if all_running { RunState::Running } else { RunState::Partial },
            containers,
        })
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    fn deployment_mode(&self) -> DeploymentMode {
        DeploymentMode::Docker
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

        self.write_compose_file(project, containers, connections, user_id)
            .await?;

        info!("starting project {}", project.slug);
        self.run_compose(&project.slug, &["up", "-d", "--remove-orphans"], "up")
            .await?;

        self.proxies.connect_project(&project.slug).await?;

        let mut container_urls = BTreeMap::new();
        for container in containers {
            if container.kind == ContainerKind::Base {
                let label = workload_host_label(container);
                container_urls
                    .insert(container.name.clone(), self.container_url(&project.slug, &label));
            }
        }

        self.track_activity(user_id, project.id, None).await;

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
        user_id: Uuid,
    ) -> Result<()> {
        let _guard = self.locks.lock(project_id).await;

        info!("stopping project {}", project_slug);
        match self
            .run_compose(project_slug, &["down", "--remove-orphans"], "down")
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(OrchestratorError::Compose(ComposeError::FileMissing { .. })) => {
                warn!("compose file not found for {}", project_slug);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.proxies.disconnect_project(project_slug).await;
        self.activity.forget(user_id, project_id);
        Ok(())
    }

    async fn get_project_status(
        &self,
        project_slug: &str,
        _project_id: Uuid,
    ) -> Result<ProjectStatus> {
        self.project_status_inner(project_slug).await
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

        // Compose config is derived state: regenerate before every up.
        self.write_compose_file(project, all_containers, connections, user_id)
            .await?;

        let service_name = sanitize_service_name(&container.name);
        info!("starting container {} ({})", container.name, service_name);
        self.run_compose(&project.slug, &["up", "-d", &service_name], "up")
            .await?;

        self.proxies.connect_project(&project.slug).await?;
        self.track_activity(user_id, project.id, Some(&container.name))
            .await;

        let label = workload_host_label(container);
        Ok(StartedContainer {
            status: RunState::Running,
            container_name: container.name.clone(),
            url: self.container_url(&project.slug, &label),
        })
    }

    async fn stop_container(
        &self,
        project_slug: &str,
        project_id: Uuid,
        container_name: &str,
        _user_id: Uuid,
    ) -> Result<()> {
        let _guard = self.locks.lock(project_id).await;

        let service_name = sanitize_service_name(container_name);
        info!("stopping container {} ({})", container_name, service_name);
        self.run_compose(project_slug, &["stop", &service_name], "stop")
            .await?;
        Ok(())
    }

    async fn get_container_status(
        &self,
        project_slug: &str,
        project_id: Uuid,
        container_name: &str,
        _user_id: Uuid,
    ) -> Result<ContainerStatus> {
        let project_status = self.get_project_status(project_slug, project_id).await?;
        if project_status.status == RunState::NotFound {
            return Ok(ContainerStatus {
                status: RunState::NotFound,
                url: None,
                ready: false,
                replicas: None,
                ready_replicas: None,
            });
        }

        let service_name = sanitize_service_name(container_name);
        Ok(project_status
            .containers
            .get(&service_name)
            .cloned()
            .unwrap_or(ContainerStatus {
                status: RunState::NotFound,
                url: None,
                ready: false,
                replicas: None,
                ready_replicas: None,
            }))
    }

    async fn read_file(&self, scope: FileScope<'_>, file_path: &str) -> Result<Option<String>> {
        let path = self.scoped_path(&scope, file_path);
        let content = fsops::read_to_string(path).await?;
        if content.is_some() {
            self.track_activity(scope.user_id, scope.project_id, Some(scope.container_name))
                .await;
        }
        Ok(content)
    }

    async fn write_file(
        &self,
        scope: FileScope<'_>,
        file_path: &str,
        content: &str,
    ) -> Result<()> {
        let path = self.scoped_path(&scope, file_path);
        fsops::write_string(path, content.to_string()).await?;
        self.track_activity(scope.user_id, scope.project_id, Some(scope.container_name))
            .await;
        Ok(())
    }

    async fn delete_file(&self, scope: FileScope<'_>, file_path: &str) -> Result<()> {
        let path = self.scoped_path(&scope, file_path);
        fsops::remove_file(path).await?;
        self.track_activity(scope.user_id, scope.project_id, Some(scope.container_name))
            .await;
        Ok(())
    }

    async fn list_files(&self, scope: FileScope<'_>, directory: &str) -> Result<Vec<FileEntry>> {
        let base = self.project_path(scope.project_slug);
        let root = if directory == "." {
            self.scoped_root(&scope)
        } else {
            self.scoped_path(&scope, directory)
        };
        Ok(fsops::list_files(base, root, 500).await?)
    }

    async fn glob_files(
        &self,
        scope: FileScope<'_>,
        pattern: &str,
        directory: &str,
    ) -> Result<Vec<FileEntry>> {
        let base = self.project_path(scope.project_slug);
        let root = if directory == "." {
            self.scoped_root(&scope)
        } else {
            self.scoped_path(&scope, directory)
        };
        Ok(fsops::glob_files(base, root, pattern.to_string(), 100).await?)
    }

    async fn grep_files(
        &self,
        scope: FileScope<'_>,
        query: &GrepQuery,
    ) -> Result<Vec<GrepMatch>> {
        let base = self.project_path(scope.project_slug);
        let root = if query.directory == "." {
            self.scoped_root(&scope)
        } else {
            self.scoped_path(&scope, &query.directory)
        };
        Ok(fsops::grep_files(
            base,
            root,
            query.pattern.clone(),
            query.file_pattern.clone(),
            query.case_sensitive,
            query.max_results,
        )
        .await?)
    }

    async fn execute_command(
        &self,
        scope: FileScope<'_>,
        command: &[String],
        timeout: Option<Duration>,
        working_dir: Option<&str>,
    ) -> Result<String> {
        let service_name = sanitize_service_name(scope.container_name);
        let docker_container = format!("{}-{}", scope.project_slug, service_name);

        let mut args: Vec<String> = vec!["exec".to_string()];
        if let Some(dir) = working_dir {
            args.push("-w".to_string());
            args.push(format!("/app/{}", sanitize_rel_path(dir)));
        }
        args.push(docker_container);
        args.extend(command.iter().cloned());

        let budget = Settings::clamp_exec_timeout(timeout);
        debug!("docker {}", args.join(" "));

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let result = tokio::time::timeout(budget, self.run_docker(&arg_refs)).await;

        match result {
            Ok(Ok((_, output))) => {
                self.track_activity(scope.user_id, scope.project_id, Some(scope.container_name))
                    .await;
                Ok(output)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OrchestratorError::Timeout(budget.as_secs())),
        }
    }

    async fn is_container_ready(&self, scope: FileScope<'_>) -> Result<ReadyStatus> {
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
        user_id: Uuid,
        project_id: Uuid,
        _container_name: Option<&str>,
    ) {
        self.activity.touch(user_id, project_id);
        if let Err(e) = self.store.record_activity(project_id, Utc::now()).await {
            debug!("activity stamp failed for {}: {}", project_id, e);
        }
    }

    /// Two-tier idle policy. Tier 1 stops the project's services in place
    /// (the Compose stand-in for scale-to-zero); Tier 2 tears the stack
    /// down after 24 hours paused. Files stay on the shared volume in both
    /// tiers.
    async fn cleanup_idle_environments(&self, idle_timeout_minutes: i64) -> Result<Vec<String>> {
        let mut acted_on = Vec::new();
        let idle_for = Duration::from_secs((idle_timeout_minutes.max(0) as u64) * 60);

        // Tier 2 first so an entry never transitions twice in one pass.
        for (key, entry) in self.activity.long_paused_entries(TIER2_PAUSE) {
            let Some(project) = self.store.get_project(entry.project_id).await? else {
                self.activity.forget(entry.user_id, entry.project_id);
                continue;
            };
            let _guard = self.locks.lock(entry.project_id).await;
            info!("tier-2 cleanup: removing stack for {}", project.slug);
            match self
                .run_compose(&project.slug, &["down", "--remove-orphans"], "down")
                .await
            {
                Ok(_) => {}
                Err(OrchestratorError::Compose(ComposeError::FileMissing { .. })) => {}
                Err(e) => {
                    error!("tier-2 cleanup failed for {}: {}", project.slug, e);
                    continue;
                }
            }
            self.proxies.disconnect_project(&project.slug).await;
            self.activity.forget(entry.user_id, entry.project_id);
            acted_on.push(key);
        }

        // Tier 1: stop idle stacks, record the pause.
        for (key, entry) in self.activity.idle_entries(idle_for) {
            let Some(project) = self.store.get_project(entry.project_id).await? else {
                self.activity.forget(entry.user_id, entry.project_id);
                continue;
            };
            let _guard = self.locks.lock(entry.project_id).await;
            info!("tier-1 cleanup: stopping services for {}", project.slug);
            match self.run_compose(&project.slug, &["stop"], "stop").await {
                Ok(_) => {
                    self.activity.mark_paused(entry.user_id, entry.project_id);
                    acted_on.push(key);
                }
                Err(OrchestratorError::Compose(ComposeError::FileMissing { .. })) => {
                    self.activity.forget(entry.user_id, entry.project_id);
                }
                Err(e) => error!("tier-1 cleanup failed for {}: {}", project.slug, e),
            }
        }

        info!("idle cleanup acted on {} environments", acted_on.len());
        Ok(acted_on)
    }

    async fn ensure_project_directory(&self, project_slug: &str) -> Result<()> {
        fsops::create_dir_all(self.project_path(project_slug)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_rel_path() {
        assert_eq!(sanitize_rel_path("src/main.ts"), "src/main.ts");
        assert_eq!(sanitize_rel_path("/etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_rel_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_rel_path("./a/./b"), "a/b");
    }

    #[test]
    fn test_parse_compose_ps() {
        let stdout = concat!(
            r#"{"Service":"web","Name":"my-app-web","State":"running","Status":"Up 2 minutes"}"#,
            "\n",
            r#"{"Service":"db","Name":"my-app-db","State":"exited","Status":"Exited (0)"}"#,
            "\n",
        );
        let states = parse_compose_ps(stdout);
        assert_eq!(states.get("web").unwrap(), "running");
        assert_eq!(states.get("db").unwrap(), "exited");
    }

    #[test]
    fn test_parse_compose_ps_tolerates_garbage() {
        let states = parse_compose_ps("not json\n\n");
        assert!(states.is_empty());
    }
}
