//! Runtime settings for the orchestration core
//!
//! Everything is read from the environment with sensible defaults so the
//! binary runs unconfigured against a local Docker daemon. Timeouts that the
//! rest of the crate relies on are fixed constants here rather than knobs.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::DeploymentMode;
use crate::error::ConfigError;

/// Default shell-exec timeout inside a workload container.
pub const EXEC_TIMEOUT_DEFAULT: Duration = Duration::from_secs(120);
/// Hard ceiling for caller-supplied shell-exec timeouts.
pub const EXEC_TIMEOUT_MAX: Duration = Duration::from_secs(300);
/// Budget for a git clone inside a pod or on the host.
pub const GIT_CLONE_TIMEOUT: Duration = Duration::from_secs(300);
/// Budget for a pod/deployment to report ready.
pub const POD_READY_TIMEOUT: Duration = Duration::from_secs(120);
/// Budget for a regional proxy to come up.
pub const PROXY_READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for streaming an archive into or out of a pod.
pub const POD_COPY_TIMEOUT: Duration = Duration::from_secs(300);

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Object-store connection settings.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Custom endpoint for DigitalOcean Spaces / MinIO; empty means AWS S3.
    pub endpoint_url: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Explicit credentials; when absent the SDK falls back to the
    /// ambient chain (IRSA on EKS, instance profiles, env vars).
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub projects_prefix: String,
}

/// Kubernetes backend settings.
#[derive(Debug, Clone)]
pub struct K8sSettings {
    pub storage_class: String,
    pub pvc_size: String,
    pub ingress_class: String,
    /// Namespace the ingress controller runs in; NetworkPolicies admit
    /// ingress traffic from it.
    pub ingress_namespace: String,
    /// Platform namespace holding the wildcard TLS secret.
    pub platform_namespace: String,
    pub wildcard_tls_secret: Option<String>,
    pub image_pull_policy: String,
    pub image_pull_secret: Option<String>,
    pub enable_network_policies: bool,
    pub enable_pod_affinity: bool,
    pub affinity_topology_key: String,
    pub hibernation_idle_minutes: i64,
}

/// Top-level settings, assembled once at process start and passed down.
#[derive(Debug, Clone)]
pub struct Settings {
    pub deployment_mode: DeploymentMode,
    /// Domain workload hostnames live under; a wildcard cert for
    /// `*.{app_domain}` covers every workload (single subdomain level).
    pub app_domain: String,
    pub devserver_image: String,

    // Docker backend
    pub projects_volume: String,
    pub projects_path: PathBuf,
    pub compose_dir: PathBuf,
    pub regional_compose_dir: PathBuf,
    pub base_cache_dir: PathBuf,
    pub base_cache_volume: String,
    pub template_dir: PathBuf,

    pub idle_timeout_minutes: i64,

    pub s3: S3Settings,
    pub k8s: K8sSettings,
}

impl Settings {
    /// Load settings from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode_raw = env_or("DEPLOYMENT_MODE", "docker");
        let deployment_mode = DeploymentMode::parse(&mode_raw).map_err(|_| {
            ConfigError::InvalidValue {
                field: "DEPLOYMENT_MODE".to_string(),
                value: mode_raw,
            }
        })?;

        let settings = Settings {
            deployment_mode,
            app_domain: env_or("APP_DOMAIN", "localhost"),
            devserver_image: env_or("DEVSERVER_IMAGE", "tesslate-devserver:latest"),
            projects_volume: env_or("PROJECTS_VOLUME", "tesslate-projects-data"),
            projects_path: PathBuf::from(env_or("PROJECTS_PATH", "/projects")),
            compose_dir: PathBuf::from(env_or("COMPOSE_DIR", "docker-compose-projects")),
            regional_compose_dir: PathBuf::from(env_or(
                "REGIONAL_COMPOSE_DIR",
                "docker-compose-regional-traefiks",
            )),
            base_cache_dir: PathBuf::from(env_or("BASE_CACHE_DIR", "/app/base-cache")),
            base_cache_volume: env_or("BASE_CACHE_VOLUME", "tesslate-base-cache"),
            template_dir: PathBuf::from(env_or("TEMPLATE_DIR", "template")),
            idle_timeout_minutes: env_or("IDLE_TIMEOUT_MINUTES", "30")
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "IDLE_TIMEOUT_MINUTES".to_string(),
                    value: env_or("IDLE_TIMEOUT_MINUTES", "30"),
                })?,
            s3: S3Settings {
                endpoint_url: env_opt("S3_ENDPOINT_URL"),
                region: env_or("S3_REGION", "us-east-1"),
                bucket: env_or("S3_BUCKET_NAME", "tesslate-projects"),
                access_key_id: env_opt("S3_ACCESS_KEY_ID"),
                secret_access_key: env_opt("S3_SECRET_ACCESS_KEY"),
                projects_prefix: env_or("S3_PROJECTS_PREFIX", "projects"),
            },
            k8s: K8sSettings {
                storage_class: env_or("K8S_STORAGE_CLASS", "do-block-storage"),
                pvc_size: env_or("K8S_PVC_SIZE", "5Gi"),
                ingress_class: env_or("K8S_INGRESS_CLASS", "nginx"),
                ingress_namespace: env_or("K8S_INGRESS_NAMESPACE", "ingress-nginx"),
                platform_namespace: env_or("K8S_PLATFORM_NAMESPACE", "tesslate"),
                wildcard_tls_secret: env_opt("K8S_WILDCARD_TLS_SECRET"),
                image_pull_policy: env_or("K8S_IMAGE_PULL_POLICY", "IfNotPresent"),
                image_pull_secret: env_opt("K8S_IMAGE_PULL_SECRET"),
                enable_network_policies: env_or("K8S_ENABLE_NETWORK_POLICIES", "true") == "true",
                enable_pod_affinity: env_or("K8S_ENABLE_POD_AFFINITY", "true") == "true",
                affinity_topology_key: env_or(
                    "K8S_AFFINITY_TOPOLOGY_KEY",
                    "kubernetes.io/hostname",
                ),
                hibernation_idle_minutes: env_or("K8S_HIBERNATION_IDLE_MINUTES", "30")
                    .parse()
                    .unwrap_or(30),
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.app_domain.is_empty() {
            return Err(ConfigError::MissingField {
                field: "APP_DOMAIN".to_string(),
            });
        }
        if self.deployment_mode.is_kubernetes() && self.s3.bucket.is_empty() {
            return Err(ConfigError::MissingField {
                field: "S3_BUCKET_NAME".to_string(),
            });
        }
        Ok(())
    }

    /// Clamp a caller-supplied exec timeout to the hard ceiling.
    pub fn clamp_exec_timeout(timeout: Option<Duration>) -> Duration {
        timeout
            .unwrap_or(EXEC_TIMEOUT_DEFAULT)
            .min(EXEC_TIMEOUT_MAX)
    }

    /// Workload URLs are https only when TLS termination is configured.
    pub fn url_scheme(&self) -> &'static str {
        match self.deployment_mode {
            DeploymentMode::Kubernetes if self.k8s.wildcard_tls_secret.is_some() => "https",
            _ => "http",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_settings() -> Settings {
        Settings {
            deployment_mode: DeploymentMode::Docker,
            app_domain: "localhost".to_string(),
            devserver_image: "tesslate-devserver:latest".to_string(),
            projects_volume: "tesslate-projects-data".to_string(),
            projects_path: PathBuf::from("/projects"),
            compose_dir: PathBuf::from("docker-compose-projects"),
            regional_compose_dir: PathBuf::from("docker-compose-regional-traefiks"),
            base_cache_dir: PathBuf::from("/app/base-cache"),
            base_cache_volume: "tesslate-base-cache".to_string(),
            template_dir: PathBuf::from("template"),
            idle_timeout_minutes: 30,
            s3: S3Settings {
                endpoint_url: None,
                region: "us-east-1".to_string(),
                bucket: "tesslate-projects".to_string(),
                access_key_id: None,
                secret_access_key: None,
                projects_prefix: "projects".to_string(),
            },
            k8s: K8sSettings {
                storage_class: "do-block-storage".to_string(),
                pvc_size: "5Gi".to_string(),
                ingress_class: "nginx".to_string(),
                ingress_namespace: "ingress-nginx".to_string(),
                platform_namespace: "tesslate".to_string(),
                wildcard_tls_secret: None,
                image_pull_policy: "IfNotPresent".to_string(),
                image_pull_secret: None,
                enable_network_policies: true,
                enable_pod_affinity: true,
                affinity_topology_key: "kubernetes.io/hostname".to_string(),
                hibernation_idle_minutes: 30,
            },
        }
    }

    #[test]
    fn test_clamp_exec_timeout() {
        assert_eq!(
            Settings::clamp_exec_timeout(None),
            Duration::from_secs(120)
        );
        assert_eq!(
            Settings::clamp_exec_timeout(Some(Duration::from_secs(600))),
            Duration::from_secs(300)
        );
        assert_eq!(
            Settings::clamp_exec_timeout(Some(Duration::from_secs(10))),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_url_scheme_follows_tls() {
        let mut settings = test_settings();
        assert_eq!(settings.url_scheme(), "http");

        settings.deployment_mode = DeploymentMode::Kubernetes;
        assert_eq!(settings.url_scheme(), "http");

        settings.k8s.wildcard_tls_secret = Some("wildcard-tls".to_string());
        assert_eq!(settings.url_scheme(), "https");
    }
}

#[cfg(test)]
pub(crate) use tests::test_settings;
