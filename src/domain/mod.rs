//! Thin data model for the orchestration core
//!
//! Only the fields the orchestrator reads or writes are modeled here; the
//! full relational schema (users, billing, chat history, project files)
//! lives with the API layer. Projects, containers and connections are three
//! flat tables with foreign keys - per-project graphs are built on demand.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which backend implementation runs project environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Docker,
    Kubernetes,
}

impl DeploymentMode {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "docker" => Ok(DeploymentMode::Docker),
            "kubernetes" => Ok(DeploymentMode::Kubernetes),
            other => Err(format!(
                "invalid deployment mode: '{}'; valid modes: docker, kubernetes",
                other
            )),
        }
    }

    pub fn is_docker(self) -> bool {
        self == DeploymentMode::Docker
    }

    pub fn is_kubernetes(self) -> bool {
        self == DeploymentMode::Kubernetes
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentMode::Docker => "docker",
            DeploymentMode::Kubernetes => "kubernetes",
        }
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-project environment lifecycle.
///
/// `Active` means the project directory (volume or PVC) exists and is the
/// source of truth; `Hibernated` means the object-store archive is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    #[default]
    Absent,
    Active,
    Hibernated,
}

/// A user-owned graph of containers and connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    /// Globally unique, DNS-safe URL slug (e.g. "my-app-k3x8n2").
    pub slug: String,
    pub name: String,
    pub owner_id: Uuid,
    pub environment_status: EnvironmentStatus,
    pub last_activity: Option<DateTime<Utc>>,
    pub hibernated_at: Option<DateTime<Utc>>,
    pub git_remote_url: Option<String>,
}

/// Whether a container is an application workload or a catalog service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Base,
    Service,
}

/// Declarative placement for catalog services that can run either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerDeployMode {
    #[default]
    Container,
    External,
}

/// One workload within a project.
///
/// Invariant: exactly one of `base_id` / `service_slug` is set, matching
/// `kind`. `directory` is unique within a project; empty or "." means the
/// project root and is only used for single-container projects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub directory: String,
    pub kind: ContainerKind,
    pub base_id: Option<Uuid>,
    pub service_slug: Option<String>,
    pub internal_port: Option<u16>,
    pub environment_vars: BTreeMap<String, String>,
    pub deploy_mode: ContainerDeployMode,
    pub status: String,
}

impl Container {
    /// True when the container's files occupy the project root.
    pub fn uses_project_root(&self) -> bool {
        self.directory.is_empty() || self.directory == "."
    }

    /// The subdirectory to scope file operations to, if any.
    pub fn subdir(&self) -> Option<&str> {
        if self.uses_project_root() {
            None
        } else {
            Some(&self.directory)
        }
    }
}

/// The kind of wiring a connection produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    /// Expand the target's connection template into the source's env.
    EnvInjection,
    HttpApi,
    Database,
    /// Compose-level startup ordering only.
    DependsOn,
}

/// A directed edge between two containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConnection {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_container_id: Uuid,
    pub target_container_id: Uuid,
    pub connector_type: ConnectorType,
    /// Opaque per-connection config; for external services this carries the
    /// user-supplied credential values keyed by credential field.
    pub config: BTreeMap<String, String>,
}

/// A reusable project template from the marketplace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceBase {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub git_repo_url: Option<String>,
    pub default_branch: String,
    pub is_active: bool,
    pub metadata: BTreeMap<String, String>,
}

/// Where a new project's initial files come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "source_type")]
pub enum ProjectSource {
    /// Copy the in-repo starter template.
    Template,
    /// A purchased marketplace base.
    Base { base_id: Uuid },
    /// Import from a user repository.
    Github {
        repo_url: String,
        branch: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_mode_parse() {
        assert_eq!(
            DeploymentMode::parse("docker").unwrap(),
            DeploymentMode::Docker
        );
        assert_eq!(
            DeploymentMode::parse(" Kubernetes ").unwrap(),
            DeploymentMode::Kubernetes
        );
        assert!(DeploymentMode::parse("swarm").is_err());
    }

    #[test]
    fn test_container_subdir() {
        let mut container = Container {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "Frontend".to_string(),
            directory: "frontend".to_string(),
            kind: ContainerKind::Base,
            base_id: Some(Uuid::new_v4()),
            service_slug: None,
            internal_port: Some(5173),
            environment_vars: BTreeMap::new(),
            deploy_mode: ContainerDeployMode::Container,
            status: "stopped".to_string(),
        };
        assert_eq!(container.subdir(), Some("frontend"));

        container.directory = ".".to_string();
        assert!(container.uses_project_root());
        assert_eq!(container.subdir(), None);
    }
}
