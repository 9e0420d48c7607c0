//! Project store abstraction
//!
//! The orchestrator reads and writes a thin slice of the platform's data
//! model: projects, containers, connections, marketplace bases. The real
//! deployment backs this trait with the relational store owned by the API
//! layer; the in-memory implementation here serves the binary's standalone
//! mode and the test suite.
//!
//! Also hosts the per-project lock registry that serializes lifecycle
//! operations within a project while keeping projects independent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::domain::{
    Container, ContainerConnection, EnvironmentStatus, MarketplaceBase, Project,
};
use crate::error::OrchestratorError;
use crate::naming::generate_project_slug;

const SLUG_INSERT_ATTEMPTS: usize = 10;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Persistence seam between the orchestrator and the platform's store.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>>;
    async fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>>;

    /// Create a project with a generated slug, regenerating the hash suffix
    /// on insert collision (up to 10 attempts).
    async fn create_project(&self, name: &str, owner_id: Uuid) -> Result<Project>;

    async fn update_environment_status(
        &self,
        id: Uuid,
        status: EnvironmentStatus,
        hibernated_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn set_git_remote(&self, id: Uuid, remote_url: &str) -> Result<()>;

    /// Best-effort activity stamp; failures here must not fail the caller.
    async fn record_activity(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Active projects whose last activity is older than `cutoff` or never
    /// recorded at all.
    async fn idle_projects(&self, cutoff: DateTime<Utc>) -> Result<Vec<Project>>;

    async fn delete_project(&self, id: Uuid) -> Result<()>;

    async fn containers_for_project(&self, project_id: Uuid) -> Result<Vec<Container>>;
    async fn connections_for_project(&self, project_id: Uuid)
        -> Result<Vec<ContainerConnection>>;
    async fn get_container(&self, id: Uuid) -> Result<Option<Container>>;
    async fn insert_container(&self, container: Container) -> Result<()>;

    async fn active_bases(&self) -> Result<Vec<MarketplaceBase>>;
    async fn get_base(&self, id: Uuid) -> Result<Option<MarketplaceBase>>;
}

#[derive(Default)]
struct MemoryState {
    projects: HashMap<Uuid, Project>,
    containers: HashMap<Uuid, Container>,
    connections: HashMap<Uuid, ContainerConnection>,
    bases: HashMap<Uuid, MarketplaceBase>,
}

/// In-memory `ProjectStore`.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_base(&self, base: MarketplaceBase) {
        self.state.write().await.bases.insert(base.id, base);
    }

    pub async fn insert_connection(&self, connection: ContainerConnection) {
        self.state
            .write()
            .await
            .connections
            .insert(connection.id, connection);
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.state.read().await.projects.get(&id).cloned())
    }

    async fn get_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        Ok(self
            .state
            .read()
            .await
            .projects
            .values()
            .find(|p| p.slug == slug)
            .cloned())
    }

    async fn create_project(&self, name: &str, owner_id: Uuid) -> Result<Project> {
        let mut state = self.state.write().await;

        for _ in 0..SLUG_INSERT_ATTEMPTS {
            let slug = generate_project_slug(name);
            if state.projects.values().any(|p| p.slug == slug) {
                continue;
            }
            let project = Project {
                id: Uuid::new_v4(),
                slug,
                name: name.to_string(),
                owner_id,
                environment_status: EnvironmentStatus::Absent,
                last_activity: None,
                hibernated_at: None,
                git_remote_url: None,
            };
            state.projects.insert(project.id, project.clone());
            return Ok(project);
        }

        Err(OrchestratorError::Validation(format!(
            "could not allocate a unique slug for '{}' after {} attempts",
            name, SLUG_INSERT_ATTEMPTS
        )))
    }

    async fn update_environment_status(
        &self,
        id: Uuid,
        status: EnvironmentStatus,
        hibernated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let project = state
            .projects
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound {
                kind: "project",
                name: id.to_string(),
            })?;
        project.environment_status = status;
        project.hibernated_at = hibernated_at;
        Ok(())
    }

    async fn set_git_remote(&self, id: Uuid, remote_url: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let project = state
            .projects
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound {
                kind: "project",
                name: id.to_string(),
            })?;
        project.git_remote_url = Some(remote_url.to_string());
        Ok(())
    }

    async fn record_activity(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(project) = self.state.write().await.projects.get_mut(&id) {
            project.last_activity = Some(at);
        }
        Ok(())
    }

    async fn idle_projects(&self, cutoff: DateTime<Utc>) -> Result<Vec<Project>> {
        Ok(self
            .state
            .read()
            .await
            .projects
            .values()
            .filter(|p| p.environment_status == EnvironmentStatus::Active)
            .filter(|p| match p.last_activity {
                Some(at) => at < cutoff,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn delete_project(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        state.projects.remove(&id);
        state.containers.retain(|_, c| c.project_id != id);
        state.connections.retain(|_, c| c.project_id != id);
        Ok(())
    }

    async fn containers_for_project(&self, project_id: Uuid) -> Result<Vec<Container>> {
        Ok(self
            .state
            .read()
            .await
            .containers
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn connections_for_project(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<ContainerConnection>> {
        Ok(self
            .state
            .read()
            .await
            .connections
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_container(&self, id: Uuid) -> Result<Option<Container>> {
        Ok(self.state.read().await.containers.get(&id).cloned())
    }

    async fn insert_container(&self, container: Container) -> Result<()> {
        let mut state = self.state.write().await;
        let duplicate_dir = state
            .containers
            .values()
            .any(|c| c.project_id == container.project_id && c.directory == container.directory);
        if duplicate_dir {
            return Err(OrchestratorError::Validation(format!(
                "directory '{}' is already used by another container in this project",
                container.directory
            )));
        }
        state.containers.insert(container.id, container);
        Ok(())
    }

    async fn active_bases(&self) -> Result<Vec<MarketplaceBase>> {
        Ok(self
            .state
            .read()
            .await
            .bases
            .values()
            .filter(|b| b.is_active)
            .cloned()
            .collect())
    }

    async fn get_base(&self, id: Uuid) -> Result<Option<MarketplaceBase>> {
        Ok(self.state.read().await.bases.get(&id).cloned())
    }
}

/// Per-project lock registry.
///
/// All lifecycle operations on one project (create, start/stop, hibernate,
/// restore, delete) are serialized through the project's lock; different
/// projects proceed concurrently.
#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a project, creating it on first use.
    pub async fn lock(&self, project_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(project_id).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::is_valid_slug;

    #[tokio::test]
    async fn test_create_project_generates_unique_valid_slugs() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();

        let mut slugs = std::collections::HashSet::new();
        for _ in 0..50 {
            let project = store.create_project("My App", owner).await.unwrap();
            assert!(is_valid_slug(&project.slug));
            assert!(project.slug.starts_with("my-app-"));
            assert!(slugs.insert(project.slug));
        }
    }

    #[tokio::test]
    async fn test_idle_query_includes_never_active() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();

        let fresh = store.create_project("fresh", owner).await.unwrap();
        let stale = store.create_project("stale", owner).await.unwrap();
        let untracked = store.create_project("untracked", owner).await.unwrap();

        for id in [fresh.id, stale.id, untracked.id] {
            store
                .update_environment_status(id, EnvironmentStatus::Active, None)
                .await
                .unwrap();
        }
        store.record_activity(fresh.id, Utc::now()).await.unwrap();
        store
            .record_activity(stale.id, Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(30);
        let idle = store.idle_projects(cutoff).await.unwrap();
        let idle_ids: Vec<Uuid> = idle.iter().map(|p| p.id).collect();

        assert!(idle_ids.contains(&stale.id));
        assert!(idle_ids.contains(&untracked.id));
        assert!(!idle_ids.contains(&fresh.id));
    }

    #[tokio::test]
    async fn test_duplicate_directory_rejected() {
        use crate::domain::{ContainerDeployMode, ContainerKind};
        use std::collections::BTreeMap;

        let store = MemoryStore::new();
        let project = store.create_project("x", Uuid::new_v4()).await.unwrap();

        let make = |dir: &str| Container {
            id: Uuid::new_v4(),
            project_id: project.id,
            name: dir.to_string(),
            directory: dir.to_string(),
            kind: ContainerKind::Base,
            base_id: Some(Uuid::new_v4()),
            service_slug: None,
            internal_port: None,
            environment_vars: BTreeMap::new(),
            deploy_mode: ContainerDeployMode::Container,
            status: "stopped".to_string(),
        };

        store.insert_container(make("frontend")).await.unwrap();
        assert!(store.insert_container(make("frontend")).await.is_err());
        store.insert_container(make("backend")).await.unwrap();
    }

    #[tokio::test]
    async fn test_project_locks_serialize() {
        let locks = Arc::new(ProjectLocks::new());
        let id = Uuid::new_v4();

        let guard = locks.lock(id).await;
        let locks2 = Arc::clone(&locks);
        let contended = tokio::spawn(async move { locks2.lock(id).await });

        // The second acquisition cannot complete while the guard is held.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contended.is_finished());

        drop(guard);
        contended.await.unwrap();
    }
}
