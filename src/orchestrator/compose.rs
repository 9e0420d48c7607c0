//! Docker Compose document generation
//!
//! The Compose file is derived state: it is regenerated from the project,
//! container and connection records before every `compose up`, and is never
//! read back as a source of truth. Container identity across regenerations
//! comes from the deterministic service name.
//!
//! Workload isolation comes from three pieces working together: a dedicated
//! bridge network per project, the shared projects volume mounted with a
//! per-project `subpath` so each workload only sees its own files, and
//! `extra_hosts` pinning the platform's internal hostnames to 127.0.0.1 so
//! untrusted code cannot reach them by name.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{injected_environment, workload_host_label};
use crate::catalog::{self, HealthCheck, ServiceType};
use crate::config::Settings;
use crate::domain::{
    Container, ContainerConnection, ContainerDeployMode, ContainerKind, ConnectorType, Project,
};
use crate::error::ComposeError;
use crate::naming::sanitize_service_name;

/// Shared network joined by every regional proxy and routed workload.
pub const REGIONAL_PROXY_NETWORK: &str = "tesslate-regional-traefik-network";

/// Internal hostnames pinned to loopback inside every workload container.
const PINNED_INTERNAL_HOSTS: &[&str] = &[
    "tesslate-orchestrator",
    "tesslate-postgres",
    "tesslate-redis",
    "postgres",
    "redis",
];

/// Runtime facts for a base container, resolved from its manifest before
/// generation: the validated startup argv and the dev-server port.
#[derive(Debug, Clone)]
pub struct BaseContainerRuntime {
    pub command: Vec<String>,
    pub port: u16,
}

// ---------------------------------------------------------------------
// Compose document model
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComposeFile {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub networks: BTreeMap<String, ComposeNetwork>,
    pub services: BTreeMap<String, ComposeService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub volumes: BTreeMap<String, ComposeVolume>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComposeNetwork {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComposeVolume {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ComposeService {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub networks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub volumes: Vec<ComposeMount>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub extra_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComposeMount {
    Short(String),
    Long(ComposeLongMount),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeLongMount {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeMountOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMountOptions {
    pub subpath: String,
}

// ---------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------

/// Network name for a project's dedicated bridge.
pub fn project_network_name(project_slug: &str) -> String {
    format!("tesslate-{}", project_slug)
}

fn depends_on_names(
    container: &Container,
    all_containers: &[Container],
    connections: &[ContainerConnection],
) -> Vec<String> {
    let mut names = Vec::new();
    for connection in connections {
        if connection.source_container_id != container.id
            || connection.connector_type != ConnectorType::DependsOn
        {
            continue;
        }
        if let Some(target) = all_containers
            .iter()
            .find(|c| c.id == connection.target_container_id)
        {
            names.push(sanitize_service_name(&target.name));
        }
    }
    names.sort();
    names
}

fn base_service(
    settings: &Settings,
    project: &Project,
    container: &Container,
    all_containers: &[Container],
    connections: &[ContainerConnection],
    runtime: &BaseContainerRuntime,
    user_id: Uuid,
    network_name: &str,
) -> ComposeService {
    let service_name = sanitize_service_name(&container.name);
    let qualified_name = format!("{}-{}", project.slug, service_name);
    let host_label = workload_host_label(container);
    let hostname = format!("{}-{}.{}", project.slug, host_label, settings.app_domain);

    // The volume subpath gives the workload a chroot-like view of only its
    // own files while the orchestrator keeps direct access to the whole
    // tree.
    let subpath = match container.subdir() {
        Some(dir) => format!("{}/{}", project.slug, dir),
        None => project.slug.clone(),
    };

    let mut environment = container.environment_vars.clone();
    environment.insert("PROJECT_ID".to_string(), project.id.to_string());
    environment.insert("CONTAINER_ID".to_string(), container.id.to_string());
    environment.insert("CONTAINER_NAME".to_string(), container.name.clone());
    environment.extend(injected_environment(container, all_containers, connections));

    let mut labels = BTreeMap::new();
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(
        "traefik.docker.network".to_string(),
        REGIONAL_PROXY_NETWORK.to_string(),
    );
    labels.insert(
        format!("traefik.http.routers.{}.rule", qualified_name),
        format!("Host(`{}`)", hostname),
    );
    labels.insert(
        format!(
            "traefik.http.services.{}.loadbalancer.server.port",
            qualified_name
        ),
        runtime.port.to_string(),
    );
    labels.insert("com.tesslate.project".to_string(), project.slug.clone());
    labels.insert("com.tesslate.container".to_string(), container.name.clone());
    labels.insert("com.tesslate.user".to_string(), user_id.to_string());

    ComposeService {
        image: settings.devserver_image.clone(),
        container_name: Some(qualified_name),
        user: Some("1000:1000".to_string()),
        working_dir: Some("/app".to_string()),
        networks: vec![network_name.to_string(), REGIONAL_PROXY_NETWORK.to_string()],
        volumes: vec![ComposeMount::Long(ComposeLongMount {
            kind: "volume".to_string(),
            source: settings.projects_volume.clone(),
            target: "/app".to_string(),
            volume: Some(VolumeMountOptions { subpath }),
        })],
        environment,
        labels,
        restart: Some("unless-stopped".to_string()),
        command: Some(runtime.command.clone()),
        ports: Vec::new(),
        depends_on: depends_on_names(container, all_containers, connections),
        extra_hosts: PINNED_INTERNAL_HOSTS
            .iter()
            .map(|h| format!("{}:127.0.0.1", h))
            .collect(),
        healthcheck: None,
    }
}

fn service_container(
    project: &Project,
    container: &Container,
    user_id: Uuid,
    network_name: &str,
) -> Option<(ComposeService, String)> {
    let service_slug = container.service_slug.as_deref()?;
    let def = catalog::get_service(service_slug)?;

    if def.service_type == ServiceType::External
        || container.deploy_mode == ContainerDeployMode::External
    {
        debug!("skipping external service '{}'", service_slug);
        return None;
    }

    let service_name = sanitize_service_name(&container.name);
    let qualified_name = format!("{}-{}", project.slug, service_name);
    let volume_name = format!("{}-{}-data", project.slug, service_slug);

    let mut labels = BTreeMap::new();
    labels.insert("com.tesslate.project".to_string(), project.slug.clone());
    labels.insert("com.tesslate.container".to_string(), container.name.clone());
    labels.insert("com.tesslate.user".to_string(), user_id.to_string());
    labels.insert(
        "com.tesslate.service".to_string(),
        service_slug.to_string(),
    );

    let mut networks = vec![network_name.to_string()];
    if def.is_routable() {
        // HTTP-facing services get proxy routing; databases stay private.
        labels.insert("traefik.enable".to_string(), "true".to_string());
        labels.insert(
            format!("traefik.http.routers.{}.rule", qualified_name),
            format!("Host(`{}`)", qualified_name),
        );
        if let Some(port) = def.internal_port {
            labels.insert(
                format!(
                    "traefik.http.services.{}.loadbalancer.server.port",
                    qualified_name
                ),
                port.to_string(),
            );
        }
        networks.push(REGIONAL_PROXY_NETWORK.to_string());
    } else {
        labels.insert("traefik.enable".to_string(), "false".to_string());
    }

    let service = ComposeService {
        image: def.docker_image.to_string(),
        container_name: Some(qualified_name),
        user: None,
        working_dir: None,
        networks,
        volumes: def
            .volumes
            .iter()
            .map(|path| ComposeMount::Short(format!("{}:{}", volume_name, path)))
            .collect(),
        environment: def
            .environment_vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        labels,
        restart: Some("unless-stopped".to_string()),
        command: def
            .command
            .as_ref()
            .map(|argv| argv.iter().map(|a| a.to_string()).collect()),
        ports: Vec::new(),
        depends_on: Vec::new(),
        extra_hosts: Vec::new(),
        healthcheck: def.health_check.clone(),
    };

    Some((service, volume_name))
}

/// Generate the Compose document for a project.
///
/// `runtime` carries each base container's validated startup command and
/// dev-server port, resolved from its manifest by the caller.
pub fn generate_project_compose(
    settings: &Settings,
    project: &Project,
    containers: &[Container],
    connections: &[ContainerConnection],
    runtime: &HashMap<Uuid, BaseContainerRuntime>,
    user_id: Uuid,
) -> Result<ComposeFile, ComposeError> {
    let network_name = project_network_name(&project.slug);

    let mut compose = ComposeFile::default();
    compose.networks.insert(
        network_name.clone(),
        ComposeNetwork {
            driver: Some("bridge".to_string()),
            name: Some(network_name.clone()),
            external: None,
        },
    );
    compose.networks.insert(
        REGIONAL_PROXY_NETWORK.to_string(),
        ComposeNetwork {
            driver: None,
            name: None,
            external: Some(true),
        },
    );

    for container in containers {
        let service_name = sanitize_service_name(&container.name);

        match container.kind {
            ContainerKind::Service => {
                if let Some((service, volume_name)) =
                    service_container(project, container, user_id, &network_name)
                {
                    compose.services.insert(service_name, service);
                    compose.volumes.insert(
                        volume_name.clone(),
                        ComposeVolume {
                            name: Some(volume_name),
                            external: None,
                        },
                    );
                }
            }
            ContainerKind::Base => {
                let runtime = runtime.get(&container.id).ok_or_else(|| {
                    ComposeError::Render(format!(
                        "missing runtime config for container '{}'",
                        container.name
                    ))
                })?;
                compose.services.insert(
                    service_name,
                    base_service(
                        settings,
                        project,
                        container,
                        containers,
                        connections,
                        runtime,
                        user_id,
                        &network_name,
                    ),
                );
            }
        }
    }

    compose.volumes.insert(
        settings.projects_volume.clone(),
        ComposeVolume {
            name: Some(settings.projects_volume.clone()),
            external: Some(true),
        },
    );

    Ok(compose)
}

/// Render a Compose document to YAML.
pub fn render(compose: &ComposeFile) -> Result<String, ComposeError> {
    serde_yaml::to_string(compose).map_err(|e| ComposeError::Render(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use crate::domain::EnvironmentStatus;

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            slug: "my-app-k3x8n2".to_string(),
            name: "My App".to_string(),
            owner_id: Uuid::new_v4(),
            environment_status: EnvironmentStatus::Active,
            last_activity: None,
            hibernated_at: None,
            git_remote_url: None,
        }
    }

    fn base_container(project_id: Uuid, name: &str, dir: &str) -> Container {
        Container {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_string(),
            directory: dir.to_string(),
            kind: ContainerKind::Base,
            base_id: Some(Uuid::new_v4()),
            service_slug: None,
            internal_port: Some(5173),
            environment_vars: BTreeMap::new(),
            deploy_mode: ContainerDeployMode::Container,
            status: "stopped".to_string(),
        }
    }

    fn service_container_row(project_id: Uuid, name: &str, slug: &str) -> Container {
        Container {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_string(),
            directory: name.to_string(),
            kind: ContainerKind::Service,
            base_id: None,
            service_slug: Some(slug.to_string()),
            internal_port: None,
            environment_vars: BTreeMap::new(),
            deploy_mode: ContainerDeployMode::Container,
            status: "stopped".to_string(),
        }
    }

    fn runtime_for(containers: &[Container]) -> HashMap<Uuid, BaseContainerRuntime> {
        containers
            .iter()
            .filter(|c| c.kind == ContainerKind::Base)
            .map(|c| {
                (
                    c.id,
                    BaseContainerRuntime {
                        command: vec!["sh".to_string(), "-c".to_string(), "npm run dev".to_string()],
                        port: 5173,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_generate_base_container_service() {
        let settings = test_settings();
        let project = project();
        let user_id = Uuid::new_v4();
        let containers = vec![base_container(project.id, "web", "web")];
        let runtime = runtime_for(&containers);

        let compose =
            generate_project_compose(&settings, &project, &containers, &[], &runtime, user_id)
                .unwrap();

        let web = compose.services.get("web").unwrap();
        assert_eq!(web.user.as_deref(), Some("1000:1000"));
        assert_eq!(web.image, "tesslate-devserver:latest");
        assert_eq!(
            web.labels
                .get("traefik.http.routers.my-app-k3x8n2-web.rule")
                .unwrap(),
            "Host(`my-app-k3x8n2-web.localhost`)"
        );
        assert!(web
            .extra_hosts
            .contains(&"tesslate-orchestrator:127.0.0.1".to_string()));
        assert!(web.extra_hosts.contains(&"postgres:127.0.0.1".to_string()));
        assert_eq!(web.environment.get("PROJECT_ID").unwrap(), &project.id.to_string());
        assert_eq!(web.environment.get("CONTAINER_NAME").unwrap(), "web");

        match &web.volumes[0] {
            ComposeMount::Long(mount) => {
                assert_eq!(mount.source, "tesslate-projects-data");
                assert_eq!(mount.target, "/app");
                assert_eq!(
                    mount.volume.as_ref().unwrap().subpath,
                    "my-app-k3x8n2/web"
                );
            }
            ComposeMount::Short(_) => panic!("expected subpath mount"),
        }

        // networks: project bridge + external proxy network
        assert!(compose.networks.contains_key("tesslate-my-app-k3x8n2"));
        assert_eq!(
            compose
                .networks
                .get(REGIONAL_PROXY_NETWORK)
                .unwrap()
                .external,
            Some(true)
        );
        // shared projects volume is external
        assert_eq!(
            compose
                .volumes
                .get("tesslate-projects-data")
                .unwrap()
                .external,
            Some(true)
        );
    }

    #[test]
    fn test_env_injection_expansion() {
        let settings = test_settings();
        let project = project();
        let user_id = Uuid::new_v4();

        let web = base_container(project.id, "web", "web");
        let db = service_container_row(project.id, "db", "postgres");
        let connection = ContainerConnection {
            id: Uuid::new_v4(),
            project_id: project.id,
            source_container_id: web.id,
            target_container_id: db.id,
            connector_type: ConnectorType::EnvInjection,
            config: BTreeMap::new(),
        };

        let containers = vec![web, db];
        let runtime = runtime_for(&containers);
        let compose = generate_project_compose(
            &settings,
            &project,
            &containers,
            &[connection],
            &runtime,
            user_id,
        )
        .unwrap();

        let web_service = compose.services.get("web").unwrap();
        assert_eq!(
            web_service.environment.get("DATABASE_URL").unwrap(),
            "postgresql://postgres:postgres@db:5432/app"
        );

        // databases are not routed
        let db_service = compose.services.get("db").unwrap();
        assert_eq!(db_service.labels.get("traefik.enable").unwrap(), "false");
        assert_eq!(db_service.image, "postgres:16-alpine");
        assert!(db_service.healthcheck.is_some());
        assert!(compose
            .volumes
            .contains_key("my-app-k3x8n2-postgres-data"));
    }

    #[test]
    fn test_depends_on_wiring() {
        let settings = test_settings();
        let project = project();
        let web = base_container(project.id, "web", "web");
        let db = service_container_row(project.id, "db", "postgres");
        let connection = ContainerConnection {
            id: Uuid::new_v4(),
            project_id: project.id,
            source_container_id: web.id,
            target_container_id: db.id,
            connector_type: ConnectorType::DependsOn,
            config: BTreeMap::new(),
        };

        let containers = vec![web, db];
        let runtime = runtime_for(&containers);
        let compose = generate_project_compose(
            &settings,
            &project,
            &containers,
            &[connection],
            &runtime,
            Uuid::new_v4(),
        )
        .unwrap();

        assert_eq!(compose.services.get("web").unwrap().depends_on, vec!["db"]);
    }

    #[test]
    fn test_external_service_is_skipped() {
        let settings = test_settings();
        let project = project();
        let supabase = service_container_row(project.id, "supabase", "supabase");
        let containers = vec![supabase];

        let compose = generate_project_compose(
            &settings,
            &project,
            &containers,
            &[],
            &HashMap::new(),
            Uuid::new_v4(),
        )
        .unwrap();
        assert!(compose.services.is_empty());
    }

    #[test]
    fn test_missing_runtime_is_an_error() {
        let settings = test_settings();
        let project = project();
        let containers = vec![base_container(project.id, "web", "web")];

        let result = generate_project_compose(
            &settings,
            &project,
            &containers,
            &[],
            &HashMap::new(),
            Uuid::new_v4(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_render_yaml_round_trip() {
        let settings = test_settings();
        let project = project();
        let containers = vec![base_container(project.id, "web", "web")];
        let runtime = runtime_for(&containers);
        let compose =
            generate_project_compose(&settings, &project, &containers, &[], &runtime, Uuid::new_v4())
                .unwrap();

        let yaml = render(&compose).unwrap();
        assert!(yaml.contains("subpath: my-app-k3x8n2/web"));

        let parsed: ComposeFile = serde_yaml::from_str(&yaml).unwrap();
        assert!(parsed.services.contains_key("web"));
    }
}
