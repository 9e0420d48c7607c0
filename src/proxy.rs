//! Regional reverse-proxy management (Docker backend)
//!
//! A single proxy container can only join a finite number of Docker
//! networks (~1000 per host). Sharding the proxy across regional instances,
//! each capped at 250 projects, keeps routing working at scale: the edge
//! proxy forwards to whichever regional instance has joined the target
//! project's network.
//!
//! Assignment is sequential-fill (first instance with capacity) and sticky
//! (a project keeps its instance until released).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::PROXY_READY_TIMEOUT;
use crate::orchestrator::compose::{
    ComposeFile, ComposeNetwork, ComposeService, REGIONAL_PROXY_NETWORK,
};
use crate::tools::get_tool_path;

/// Conservative per-instance project cap (Docker supports ~1000 networks).
pub const PROJECTS_PER_REGIONAL: usize = 250;
/// Safety valve against unbounded instance growth.
const MAX_REGIONALS: usize = 100;
/// Host port for the first regional dashboard; instance N adds N.
const REGIONAL_DASHBOARD_BASE_PORT: u16 = 8081;
/// Container name of the primary edge proxy.
const EDGE_PROXY_CONTAINER: &str = "tesslate-traefik";

/// Dev servers can take minutes to first-compile; these transport timeouts
/// keep the proxy from cutting them off.
const PROXY_TRANSPORT_TIMEOUT_SECS: u32 = 600;

#[derive(Default)]
struct ProxyState {
    /// project slug -> regional index (sticky)
    assignments: HashMap<String, usize>,
    /// regional index -> assigned project count
    counts: HashMap<usize, usize>,
    /// regional index -> started this process lifetime
    running: HashMap<usize, bool>,
}

/// Tracks regional proxy instances and project assignments.
pub struct ProxyRegistry {
    compose_dir: PathBuf,
    state: Mutex<ProxyState>,
}

impl ProxyRegistry {
    pub fn new(compose_dir: PathBuf) -> Self {
        info!("regional proxy registry initialized (sequential fill)");
        Self {
            compose_dir,
            state: Mutex::new(ProxyState::default()),
        }
    }

    pub fn regional_name(index: usize) -> String {
        format!("tesslate-traefik-regional-{}", index)
    }

    /// Sticky sequential-fill assignment.
    pub fn assign(&self, project_slug: &str) -> Result<usize> {
        let mut state = self.state.lock().expect("proxy registry poisoned");

        if let Some(index) = state.assignments.get(project_slug) {
            return Ok(*index);
        }

        let mut index = 0;
        while state.counts.get(&index).copied().unwrap_or(0) >= PROJECTS_PER_REGIONAL {
            index += 1;
            if index > MAX_REGIONALS {
                bail!("maximum regional proxy limit exceeded");
            }
        }

        state.assignments.insert(project_slug.to_string(), index);
        *state.counts.entry(index).or_insert(0) += 1;
        info!(
            "assigned {} to regional-{} ({}/{} projects)",
            project_slug,
            index,
            state.counts[&index],
            PROJECTS_PER_REGIONAL
        );
        Ok(index)
    }

    /// Release a project's assignment (project deleted).
    pub fn release(&self, project_slug: &str) {
        let mut state = self.state.lock().expect("proxy registry poisoned");
        if let Some(index) = state.assignments.remove(project_slug) {
            if let Some(count) = state.counts.get_mut(&index) {
                *count = count.saturating_sub(1);
            }
            info!("released {} from regional-{}", project_slug, index);
        }
    }

    pub fn assignment(&self, project_slug: &str) -> Option<usize> {
        self.state
            .lock()
            .expect("proxy registry poisoned")
            .assignments
            .get(project_slug)
            .copied()
    }

    fn regional_compose(&self, index: usize) -> ComposeFile {
        let container_name = Self::regional_name(index);
        let dashboard_port = REGIONAL_DASHBOARD_BASE_PORT + index as u16;

        let mut labels = BTreeMap::new();
        labels.insert(
            "com.tesslate.type".to_string(),
            "regional-traefik".to_string(),
        );
        labels.insert("com.tesslate.regional-index".to_string(), index.to_string());

        let service = ComposeService {
            image: "traefik:v2.10".to_string(),
            container_name: Some(container_name),
            restart: Some("unless-stopped".to_string()),
            networks: vec![REGIONAL_PROXY_NETWORK.to_string()],
            ports: vec![format!("{}:8080", dashboard_port)],
            volumes: vec![crate::orchestrator::compose::ComposeMount::Short(
                "/var/run/docker.sock:/var/run/docker.sock:ro".to_string(),
            )],
            command: Some(vec![
                "--api.insecure=true".to_string(),
                "--api.dashboard=true".to_string(),
                "--providers.docker=true".to_string(),
                "--providers.docker.exposedbydefault=false".to_string(),
                format!("--providers.docker.network={}", REGIONAL_PROXY_NETWORK),
                "--entrypoints.web.address=:80".to_string(),
                format!(
                    "--entryPoints.web.transport.respondingTimeouts.readTimeout={}s",
                    PROXY_TRANSPORT_TIMEOUT_SECS
                ),
                format!(
                    "--entryPoints.web.transport.respondingTimeouts.writeTimeout={}s",
                    PROXY_TRANSPORT_TIMEOUT_SECS
                ),
                format!(
                    "--entryPoints.web.transport.respondingTimeouts.idleTimeout={}s",
                    PROXY_TRANSPORT_TIMEOUT_SECS
                ),
                "--log.level=INFO".to_string(),
                "--accesslog=true".to_string(),
            ]),
            labels,
            ..Default::default()
        };

        let mut compose = ComposeFile::default();
        compose.networks.insert(
            REGIONAL_PROXY_NETWORK.to_string(),
            ComposeNetwork {
                driver: None,
                name: Some(REGIONAL_PROXY_NETWORK.to_string()),
                external: Some(true),
            },
        );
        compose.services.insert("traefik".to_string(), service);
        compose
    }

    async fn docker(args: &[&str]) -> Result<(bool, String)> {
        let output = Command::new(get_tool_path("docker"))
            .args(args)
            .output()
            .await
            .context("failed to invoke docker")?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok((output.status.success(), combined))
    }

    async fn ensure_shared_network() -> Result<()> {
        let (exists, _) = Self::docker(&["network", "inspect", REGIONAL_PROXY_NETWORK]).await?;
        if exists {
            return Ok(());
        }
        info!("creating network {}", REGIONAL_PROXY_NETWORK);
        let (ok, output) = Self::docker(&["network", "create", REGIONAL_PROXY_NETWORK]).await?;
        if !ok {
            bail!("failed to create {}: {}", REGIONAL_PROXY_NETWORK, output.trim());
        }
        Ok(())
    }

    async fn is_regional_running(index: usize) -> bool {
        let name = Self::regional_name(index);
        match Self::docker(&["inspect", "-f", "{{.State.Running}}", &name]).await {
            Ok((true, output)) => output.trim() == "true",
            _ => false,
        }
    }

    /// Wait for the regional proxy's API to answer.
    async fn wait_for_regional_ready(index: usize) {
        let dashboard_port = REGIONAL_DASHBOARD_BASE_PORT + index as u16;
        let url = format!("http://127.0.0.1:{}/api/overview", dashboard_port);
        let client = reqwest::Client::new();
        let deadline = Instant::now() + PROXY_READY_TIMEOUT;

        while Instant::now() < deadline {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("regional-{} is ready", index);
                    return;
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(500)).await,
            }
        }
        warn!(
            "regional-{} did not become ready within {:?}",
            index, PROXY_READY_TIMEOUT
        );
    }

    async fn connect_edge_proxy() {
        let (ok, _) = Self::docker(&[
            "network",
            "connect",
            REGIONAL_PROXY_NETWORK,
            EDGE_PROXY_CONTAINER,
        ])
        .await
        .unwrap_or((false, String::new()));
        if ok {
            info!("edge proxy connected to {}", REGIONAL_PROXY_NETWORK);
        } else {
            debug!("edge proxy already connected to {}", REGIONAL_PROXY_NETWORK);
        }
    }

    /// Start a regional proxy instance if it is not already running.
    pub async fn start_regional(&self, index: usize) -> Result<()> {
        if self
            .state
            .lock()
            .expect("proxy registry poisoned")
            .running
            .get(&index)
            .copied()
            .unwrap_or(false)
        {
            return Ok(());
        }

        if Self::is_regional_running(index).await {
            debug!("{} already running", Self::regional_name(index));
            self.mark_running(index);
            return Ok(());
        }

        Self::ensure_shared_network().await?;

        let compose = self.regional_compose(index);
        let rendered =
            serde_yaml::to_string(&compose).context("failed to render regional compose")?;
        tokio::fs::create_dir_all(&self.compose_dir).await?;
        let compose_file = self.compose_dir.join(format!("regional-{}.yml", index));
        tokio::fs::write(&compose_file, rendered).await?;

        info!("starting {}", Self::regional_name(index));
        let (ok, output) = Self::docker(&[
            "compose",
            "-f",
            compose_file.to_str().unwrap_or_default(),
            "-p",
            &format!("regional-traefik-{}", index),
            "up",
            "-d",
        ])
        .await?;
        if !ok {
            bail!("failed to start regional proxy: {}", output.trim());
        }

        Self::wait_for_regional_ready(index).await;
        Self::connect_edge_proxy().await;
        self.mark_running(index);
        Ok(())
    }

    fn mark_running(&self, index: usize) {
        self.state
            .lock()
            .expect("proxy registry poisoned")
            .running
            .insert(index, true);
    }

    /// Ensure the project's regional proxy is up and joined to the
    /// project's network. Routing failures are not fatal to project start.
    pub async fn connect_project(&self, project_slug: &str) -> Result<()> {
        let index = self.assign(project_slug)?;
        if let Err(e) = self.start_regional(index).await {
            warn!("could not start regional-{}: {:#}", index, e);
            return Ok(());
        }

        let network = format!("tesslate-{}", project_slug);
        let name = Self::regional_name(index);
        let (ok, _) = Self::docker(&["network", "connect", &network, &name])
            .await
            .unwrap_or((false, String::new()));
        if ok {
            info!("{} connected to {}", name, network);
        } else {
            debug!("{} already connected to {}", name, network);
        }
        Ok(())
    }

    /// Disconnect the project's regional proxy from its network.
    pub async fn disconnect_project(&self, project_slug: &str) {
        let Some(index) = self.assignment(project_slug) else {
            return;
        };
        let network = format!("tesslate-{}", project_slug);
        let name = Self::regional_name(index);
        let (ok, _) = Self::docker(&["network", "disconnect", &network, &name])
            .await
            .unwrap_or((false, String::new()));
        if ok {
            info!("{} disconnected from {}", name, network);
        } else {
            debug!("{} was not connected to {}", name, network);
        }
    }

    /// Stop a regional proxy instance.
    pub async fn stop_regional(&self, index: usize) -> Result<()> {
        let compose_file = self.compose_dir.join(format!("regional-{}.yml", index));
        if !compose_file.exists() {
            warn!("compose file not found for regional-{}", index);
            return Ok(());
        }

        let (ok, output) = Self::docker(&[
            "compose",
            "-f",
            compose_file.to_str().unwrap_or_default(),
            "-p",
            &format!("regional-traefik-{}", index),
            "down",
        ])
        .await?;
        if !ok {
            bail!("failed to stop regional proxy: {}", output.trim());
        }

        self.state
            .lock()
            .expect("proxy registry poisoned")
            .running
            .insert(index, false);
        info!("stopped {}", Self::regional_name(index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProxyRegistry {
        ProxyRegistry::new(PathBuf::from("docker-compose-regional-traefiks"))
    }

    #[test]
    fn test_assignment_is_sticky() {
        let registry = registry();
        let first = registry.assign("my-app-abc123").unwrap();
        let second = registry.assign("my-app-abc123").unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.assignment("my-app-abc123"), Some(first));
    }

    #[test]
    fn test_sequential_fill_overflows_to_next_regional() {
        let registry = registry();
        for i in 0..PROJECTS_PER_REGIONAL {
            assert_eq!(registry.assign(&format!("project-{}", i)).unwrap(), 0);
        }
        assert_eq!(registry.assign("overflow-project").unwrap(), 1);
    }

    #[test]
    fn test_release_frees_capacity() {
        let registry = registry();
        for i in 0..PROJECTS_PER_REGIONAL {
            registry.assign(&format!("project-{}", i)).unwrap();
        }
        registry.release("project-0");
        // Freed slot on regional-0 is reused before spilling to regional-1.
        assert_eq!(registry.assign("newcomer").unwrap(), 0);
    }

    #[test]
    fn test_regional_compose_shape() {
        let registry = registry();
        let compose = registry.regional_compose(2);
        let traefik = compose.services.get("traefik").unwrap();

        assert_eq!(traefik.image, "traefik:v2.10");
        assert_eq!(traefik.ports, vec!["8083:8080".to_string()]);
        let command = traefik.command.as_ref().unwrap();
        assert!(command
            .iter()
            .any(|c| c.contains("respondingTimeouts.readTimeout=600s")));
        assert!(command
            .iter()
            .any(|c| c.contains("respondingTimeouts.idleTimeout=600s")));
        assert_eq!(
            compose
                .networks
                .get(REGIONAL_PROXY_NETWORK)
                .unwrap()
                .external,
            Some(true)
        );
    }
}
