//! Idle environment reaper
//!
//! Periodically finds active projects whose last activity is older than
//! the configured threshold (or never recorded) and hands them to the
//! backend's idle policy: hibernation to object storage on Kubernetes,
//! the two-tier stop/delete policy on Docker. Status transitions commit
//! only after the backend reports success, so a half-failed hibernation
//! never strands a project in the wrong state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::orchestrator::Orchestrator;

pub struct IdleReaper {
    orchestrator: Arc<dyn Orchestrator>,
    interval: Duration,
    idle_timeout_minutes: i64,
}

impl IdleReaper {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        interval: Duration,
        idle_timeout_minutes: i64,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            idle_timeout_minutes,
        }
    }

    /// One reaper pass; returns the project keys acted on.
    pub async fn run_once(&self) -> Vec<String> {
        match self
            .orchestrator
            .cleanup_idle_environments(self.idle_timeout_minutes)
            .await
        {
            Ok(acted_on) => {
                if !acted_on.is_empty() {
                    info!("reaper acted on {} environments", acted_on.len());
                }
                acted_on
            }
            Err(e) => {
                error!("reaper pass failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Run forever on the configured interval.
    pub async fn run(&self) {
        info!(
            "idle reaper running every {:?}, threshold {} min",
            self.interval, self.idle_timeout_minutes
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_settings, Settings};
    use crate::domain::{Container, ContainerConnection, DeploymentMode, Project};
    use crate::error::OrchestratorError;
    use crate::fsops::{FileEntry, GrepMatch};
    use crate::orchestrator::{
        ContainerStatus, FileScope, GrepQuery, ProjectStatus, ReadyStatus, RunState,
        StartedContainer, StartedProject,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Minimal backend that counts cleanup invocations.
    struct StubOrchestrator {
        settings: Settings,
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl crate::orchestrator::Orchestrator for StubOrchestrator {
        fn deployment_mode(&self) -> DeploymentMode {
            DeploymentMode::Docker
        }

        fn settings(&self) -> &Settings {
            &self.settings
        }

        async fn start_project(
            &self,
            project: &Project,
            _containers: &[Container],
            _connections: &[ContainerConnection],
            _user_id: Uuid,
        ) -> Result<StartedProject, OrchestratorError> {
            Ok(StartedProject {
                status: RunState::Running,
                project_slug: project.slug.clone(),
                containers: BTreeMap::new(),
            })
        }

        async fn stop_project(
            &self,
            _project_slug: &str,
            _project_id: Uuid,
            _user_id: Uuid,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn get_project_status(
            &self,
            _project_slug: &str,
            _project_id: Uuid,
        ) -> Result<ProjectStatus, OrchestratorError> {
            Ok(ProjectStatus {
                status: RunState::NotFound,
                containers: BTreeMap::new(),
            })
        }

        async fn start_container(
            &self,
            _project: &Project,
            container: &Container,
            _all_containers: &[Container],
            _connections: &[ContainerConnection],
            _user_id: Uuid,
        ) -> Result<StartedContainer, OrchestratorError> {
            Ok(StartedContainer {
                status: RunState::Running,
                container_name: container.name.clone(),
                url: String::new(),
            })
        }

        async fn stop_container(
            &self,
            _project_slug: &str,
            _project_id: Uuid,
            _container_name: &str,
            _user_id: Uuid,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn get_container_status(
            &self,
            _project_slug: &str,
            _project_id: Uuid,
            _container_name: &str,
            _user_id: Uuid,
        ) -> Result<ContainerStatus, OrchestratorError> {
            Ok(ContainerStatus {
                status: RunState::NotFound,
                url: None,
                ready: false,
                replicas: None,
                ready_replicas: None,
            })
        }

        async fn read_file(
            &self,
            _scope: FileScope<'_>,
            _file_path: &str,
        ) -> Result<Option<String>, OrchestratorError> {
            Ok(None)
        }

        async fn write_file(
            &self,
            _scope: FileScope<'_>,
            _file_path: &str,
            _content: &str,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn delete_file(
            &self,
            _scope: FileScope<'_>,
            _file_path: &str,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn list_files(
            &self,
            _scope: FileScope<'_>,
            _directory: &str,
        ) -> Result<Vec<FileEntry>, OrchestratorError> {
            Ok(Vec::new())
        }

        async fn glob_files(
            &self,
            _scope: FileScope<'_>,
            _pattern: &str,
            _directory: &str,
        ) -> Result<Vec<FileEntry>, OrchestratorError> {
            Ok(Vec::new())
        }

        async fn grep_files(
            &self,
            _scope: FileScope<'_>,
            _query: &GrepQuery,
        ) -> Result<Vec<GrepMatch>, OrchestratorError> {
            Ok(Vec::new())
        }

        async fn execute_command(
            &self,
            _scope: FileScope<'_>,
            _command: &[String],
            _timeout: Option<std::time::Duration>,
            _working_dir: Option<&str>,
        ) -> Result<String, OrchestratorError> {
            Ok(String::new())
        }

        async fn is_container_ready(
            &self,
            _scope: FileScope<'_>,
        ) -> Result<ReadyStatus, OrchestratorError> {
            Ok(ReadyStatus {
                ready: false,
                message: "stub".to_string(),
            })
        }

        async fn track_activity(
            &self,
            _user_id: Uuid,
            _project_id: Uuid,
            _container_name: Option<&str>,
        ) {
        }

        async fn cleanup_idle_environments(
            &self,
            _idle_timeout_minutes: i64,
        ) -> Result<Vec<String>, OrchestratorError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["user-x-project-y".to_string()])
        }

        async fn ensure_project_directory(
            &self,
            _project_slug: &str,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_once_delegates_to_backend() {
        let stub = Arc::new(StubOrchestrator {
            settings: test_settings(),
            cleanups: AtomicUsize::new(0),
        });
        let reaper = IdleReaper::new(stub.clone(), Duration::from_secs(60), 30);

        let acted_on = reaper.run_once().await;
        assert_eq!(acted_on, vec!["user-x-project-y"]);
        assert_eq!(stub.cleanups.load(Ordering::SeqCst), 1);
    }
}
