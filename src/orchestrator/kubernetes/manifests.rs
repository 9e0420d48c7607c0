//! Kubernetes manifest builders
//!
//! One namespace per project holds a PVC, a NetworkPolicy, the always-on
//! file-manager pod, and per-container Deployments with matching Services
//! and Ingresses. Manifests are built as JSON and deserialized into the
//! typed k8s-openapi structs.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use serde_json::json;
use uuid::Uuid;

use crate::naming::container_resource_name;

/// Label keys shared by every resource the orchestrator owns.
pub const LABEL_PROJECT_ID: &str = "tesslate.io/project-id";
pub const LABEL_USER_ID: &str = "tesslate.io/user-id";
pub const LABEL_CONTAINER_ID: &str = "tesslate.io/container-id";
pub const LABEL_CONTAINER_DIR: &str = "tesslate.io/container-directory";
pub const LABEL_COMPONENT: &str = "tesslate.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "tesslate-orchestrator";

/// Component label values.
pub const COMPONENT_FILE_MANAGER: &str = "file-manager";
pub const COMPONENT_DEV_CONTAINER: &str = "dev-container";

/// Fixed PVC name inside every project namespace.
pub const PROJECT_PVC_NAME: &str = "project-data";

/// Name of the always-on file-manager deployment.
pub const FILE_MANAGER_NAME: &str = "file-manager";

fn base_labels(project_id: Uuid, user_id: Uuid) -> serde_json::Value {
    json!({
        LABEL_PROJECT_ID: project_id.to_string(),
        LABEL_USER_ID: user_id.to_string(),
        LABEL_MANAGED_BY: MANAGED_BY,
    })
}

/// Project namespace with ownership labels.
pub fn namespace_manifest(namespace: &str, project_id: Uuid, user_id: Uuid) -> Result<Namespace> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": namespace,
            "labels": base_labels(project_id, user_id),
        }
    }))
    .context("failed to build namespace manifest")
}

/// One PVC per project, mounted at /app in every pod. `ReadWriteMany` is
/// selected for multi-container projects so all workloads can mount it.
pub fn pvc_manifest(
    project_id: Uuid,
    user_id: Uuid,
    storage_class: &str,
    size: &str,
    read_write_many: bool,
) -> Result<PersistentVolumeClaim> {
    let access_mode = if read_write_many {
        "ReadWriteMany"
    } else {
        "ReadWriteOnce"
    };
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": PROJECT_PVC_NAME,
            "labels": base_labels(project_id, user_id),
        },
        "spec": {
            "storageClassName": storage_class,
            "accessModes": [access_mode],
            "resources": {
                "requests": { "storage": size }
            }
        }
    }))
    .context("failed to build PVC manifest")
}

/// Namespace isolation policy.
///
/// Ingress: intra-namespace traffic plus the ingress controller.
/// Egress: intra-namespace, kube-system DNS, and the public internet -
/// never other project namespaces or the platform namespace (all RFC1918
/// space is carved out of the allow-all block).
pub fn network_policy_manifest(
    project_id: Uuid,
    ingress_namespace: &str,
) -> Result<NetworkPolicy> {
    serde_json::from_value(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {
            "name": "project-isolation",
            "labels": {
                LABEL_PROJECT_ID: project_id.to_string(),
                LABEL_MANAGED_BY: MANAGED_BY,
            }
        },
        "spec": {
            "podSelector": {},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [
                { "from": [ { "podSelector": {} } ] },
                {
                    "from": [
                        {
                            "namespaceSelector": {
                                "matchLabels": {
                                    "kubernetes.io/metadata.name": ingress_namespace
                                }
                            }
                        }
                    ]
                }
            ],
            "egress": [
                { "to": [ { "podSelector": {} } ] },
                {
                    "to": [
                        {
                            "namespaceSelector": {
                                "matchLabels": {
                                    "kubernetes.io/metadata.name": "kube-system"
                                }
                            }
                        }
                    ],
                    "ports": [
                        { "port": 53, "protocol": "UDP" },
                        { "port": 53, "protocol": "TCP" }
                    ]
                },
                {
                    "to": [
                        {
                            "ipBlock": {
                                "cidr": "0.0.0.0/0",
                                "except": [
                                    "10.0.0.0/8",
                                    "172.16.0.0/12",
                                    "192.168.0.0/16"
                                ]
                            }
                        }
                    ]
                }
            ]
        }
    }))
    .context("failed to build NetworkPolicy manifest")
}

fn pod_security_context() -> serde_json::Value {
    json!({
        "runAsNonRoot": true,
        "runAsUser": 1000,
        "runAsGroup": 1000,
        "fsGroup": 1000,
        "seccompProfile": { "type": "RuntimeDefault" }
    })
}

fn image_pull_secrets(secret: Option<&str>) -> serde_json::Value {
    match secret {
        Some(name) => json!([{ "name": name }]),
        None => json!([]),
    }
}

/// The always-running file-manager deployment: a small idle pod that mounts
/// the PVC and hosts all file operations and git clones, independent of
/// whether any dev container is running.
#[allow(clippy::too_many_arguments)]
pub fn file_manager_deployment(
    project_id: Uuid,
    user_id: Uuid,
    image: &str,
    image_pull_policy: &str,
    image_pull_secret: Option<&str>,
) -> Result<Deployment> {
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": FILE_MANAGER_NAME,
            "labels": {
                "app": FILE_MANAGER_NAME,
                LABEL_COMPONENT: COMPONENT_FILE_MANAGER,
                LABEL_PROJECT_ID: project_id.to_string(),
                LABEL_USER_ID: user_id.to_string(),
                LABEL_MANAGED_BY: MANAGED_BY,
            }
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": FILE_MANAGER_NAME } },
            "template": {
                "metadata": {
                    "labels": {
                        "app": FILE_MANAGER_NAME,
                        LABEL_COMPONENT: COMPONENT_FILE_MANAGER,
                        LABEL_PROJECT_ID: project_id.to_string(),
                    }
                },
                "spec": {
                    "securityContext": pod_security_context(),
                    "imagePullSecrets": image_pull_secrets(image_pull_secret),
                    "containers": [
                        {
                            "name": FILE_MANAGER_NAME,
                            "image": image,
                            "imagePullPolicy": image_pull_policy,
                            "command": ["/bin/sh", "-c", "sleep infinity"],
                            "workingDir": "/app",
                            "volumeMounts": [
                                { "name": "project-data", "mountPath": "/app" }
                            ],
                            "resources": {
                                "requests": { "memory": "64Mi", "cpu": "50m" },
                                "limits": { "memory": "256Mi", "cpu": "200m" }
                            }
                        }
                    ],
                    "volumes": [
                        {
                            "name": "project-data",
                            "persistentVolumeClaim": { "claimName": PROJECT_PVC_NAME }
                        }
                    ]
                }
            }
        }
    }))
    .context("failed to build file-manager deployment")
}

/// Per-container dev-server deployment `dev-{directory}`.
///
/// When the project has more than one container, required pod affinity on
/// the host topology key co-locates every pod carrying the project label;
/// this is what makes a ReadWriteOnce PVC workable with multiple workloads.
#[allow(clippy::too_many_arguments)]
pub fn dev_deployment(
    project_id: Uuid,
    user_id: Uuid,
    container_id: Uuid,
    container_directory: &str,
    image: &str,
    image_pull_policy: &str,
    image_pull_secret: Option<&str>,
    port: u16,
    startup_command: &[String],
    environment: &BTreeMap<String, String>,
    pod_affinity: bool,
    affinity_topology_key: &str,
) -> Result<Deployment> {
    let name = container_resource_name(container_directory);
    let working_dir = if container_directory.is_empty() || container_directory == "." {
        "/app".to_string()
    } else {
        format!("/app/{}", container_directory)
    };

    let env: Vec<serde_json::Value> = environment
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v }))
        .collect();

    let affinity = if pod_affinity {
        json!({
            "podAffinity": {
                "requiredDuringSchedulingIgnoredDuringExecution": [
                    {
                        "labelSelector": {
                            "matchLabels": {
                                LABEL_PROJECT_ID: project_id.to_string()
                            }
                        },
                        "topologyKey": affinity_topology_key
                    }
                ]
            }
        })
    } else {
        json!(null)
    };

    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "labels": {
                "app": name,
                LABEL_COMPONENT: COMPONENT_DEV_CONTAINER,
                LABEL_PROJECT_ID: project_id.to_string(),
                LABEL_USER_ID: user_id.to_string(),
                LABEL_CONTAINER_ID: container_id.to_string(),
                LABEL_CONTAINER_DIR: container_directory,
                LABEL_MANAGED_BY: MANAGED_BY,
            }
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": {
                    "labels": {
                        "app": name,
                        LABEL_COMPONENT: COMPONENT_DEV_CONTAINER,
                        LABEL_PROJECT_ID: project_id.to_string(),
                        LABEL_CONTAINER_ID: container_id.to_string(),
                        LABEL_CONTAINER_DIR: container_directory,
                    }
                },
                "spec": {
                    "securityContext": pod_security_context(),
                    "imagePullSecrets": image_pull_secrets(image_pull_secret),
                    "affinity": affinity,
                    "containers": [
                        {
                            "name": "dev-server",
                            "image": image,
                            "imagePullPolicy": image_pull_policy,
                            "command": startup_command,
                            "workingDir": working_dir,
                            "ports": [ { "containerPort": port } ],
                            "env": env,
                            "volumeMounts": [
                                { "name": "project-data", "mountPath": "/app" }
                            ],
                            "resources": {
                                "requests": { "memory": "256Mi", "cpu": "100m" },
                                "limits": { "memory": "1Gi", "cpu": "1" }
                            }
                        }
                    ],
                    "volumes": [
                        {
                            "name": "project-data",
                            "persistentVolumeClaim": { "claimName": PROJECT_PVC_NAME }
                        }
                    ]
                }
            }
        }
    }))
    .context("failed to build dev deployment")
}

/// ClusterIP service fronting one dev deployment.
pub fn service_manifest(
    project_id: Uuid,
    container_id: Uuid,
    container_directory: &str,
    port: u16,
) -> Result<Service> {
    let name = container_resource_name(container_directory);
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "labels": {
                LABEL_PROJECT_ID: project_id.to_string(),
                LABEL_CONTAINER_ID: container_id.to_string(),
                LABEL_MANAGED_BY: MANAGED_BY,
            }
        },
        "spec": {
            "type": "ClusterIP",
            "selector": { "app": name },
            "ports": [
                { "port": port, "targetPort": port, "protocol": "TCP" }
            ]
        }
    }))
    .context("failed to build service manifest")
}

/// Ingress publishing one dev deployment at
/// `{project-slug}-{directory}.{domain}` (one label beyond the app domain,
/// covered by the wildcard certificate).
#[allow(clippy::too_many_arguments)]
pub fn ingress_manifest(
    project_id: Uuid,
    container_id: Uuid,
    container_directory: &str,
    project_slug: &str,
    port: u16,
    domain: &str,
    ingress_class: &str,
    tls_secret: Option<&str>,
) -> Result<Ingress> {
    let name = container_resource_name(container_directory);
    let hostname = crate::naming::container_hostname(project_slug, container_directory, domain);

    let tls = match tls_secret {
        Some(secret) => json!([{ "hosts": [hostname], "secretName": secret }]),
        None => json!([]),
    };

    serde_json::from_value(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": name,
            "labels": {
                LABEL_PROJECT_ID: project_id.to_string(),
                LABEL_CONTAINER_ID: container_id.to_string(),
                LABEL_MANAGED_BY: MANAGED_BY,
            },
            "annotations": {
                "nginx.ingress.kubernetes.io/proxy-read-timeout": "600",
                "nginx.ingress.kubernetes.io/proxy-send-timeout": "600"
            }
        },
        "spec": {
            "ingressClassName": ingress_class,
            "tls": tls,
            "rules": [
                {
                    "host": hostname,
                    "http": {
                        "paths": [
                            {
                                "path": "/",
                                "pathType": "Prefix",
                                "backend": {
                                    "service": {
                                        "name": name,
                                        "port": { "number": port }
                                    }
                                }
                            }
                        ]
                    }
                }
            ]
        }
    }))
    .context("failed to build ingress manifest")
}

/// Component label for catalog services running inside a project namespace.
pub const COMPONENT_CATALOG_SERVICE: &str = "catalog-service";

/// Deployment for a catalog service (database, cache, ...) inside the
/// project namespace. Data paths are backed by an emptyDir: catalog
/// services are reprovisionable defaults, and project files - the durable
/// state - live on the PVC, not here.
#[allow(clippy::too_many_arguments)]
pub fn catalog_service_deployment(
    project_id: Uuid,
    user_id: Uuid,
    container_id: Uuid,
    service_name: &str,
    image: &str,
    port: Option<u16>,
    environment: &BTreeMap<String, String>,
    command: Option<&[String]>,
) -> Result<Deployment> {
    let env: Vec<serde_json::Value> = environment
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v }))
        .collect();
    let ports = match port {
        Some(p) => json!([{ "containerPort": p }]),
        None => json!([]),
    };
    let command_json = match command {
        Some(argv) => json!(argv),
        None => json!(null),
    };

    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": service_name,
            "labels": {
                "app": service_name,
                LABEL_COMPONENT: COMPONENT_CATALOG_SERVICE,
                LABEL_PROJECT_ID: project_id.to_string(),
                LABEL_USER_ID: user_id.to_string(),
                LABEL_CONTAINER_ID: container_id.to_string(),
                LABEL_MANAGED_BY: MANAGED_BY,
            }
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": service_name } },
            "template": {
                "metadata": {
                    "labels": {
                        "app": service_name,
                        LABEL_COMPONENT: COMPONENT_CATALOG_SERVICE,
                        LABEL_PROJECT_ID: project_id.to_string(),
                        LABEL_CONTAINER_ID: container_id.to_string(),
                    }
                },
                "spec": {
                    "containers": [
                        {
                            "name": service_name,
                            "image": image,
                            "command": command_json,
                            "ports": ports,
                            "env": env,
                            "volumeMounts": [
                                { "name": "service-data", "mountPath": "/data" }
                            ],
                            "resources": {
                                "requests": { "memory": "128Mi", "cpu": "50m" },
                                "limits": { "memory": "1Gi", "cpu": "1" }
                            }
                        }
                    ],
                    "volumes": [
                        { "name": "service-data", "emptyDir": {} }
                    ]
                }
            }
        }
    }))
    .context("failed to build catalog service deployment")
}

/// ClusterIP service exposing a catalog service under its sanitized name,
/// which is what connection templates resolve `{container_name}` to.
pub fn catalog_service_service(
    project_id: Uuid,
    container_id: Uuid,
    service_name: &str,
    port: u16,
) -> Result<Service> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": service_name,
            "labels": {
                LABEL_PROJECT_ID: project_id.to_string(),
                LABEL_CONTAINER_ID: container_id.to_string(),
                LABEL_MANAGED_BY: MANAGED_BY,
            }
        },
        "spec": {
            "type": "ClusterIP",
            "selector": { "app": service_name },
            "ports": [
                { "port": port, "targetPort": port, "protocol": "TCP" }
            ]
        }
    }))
    .context("failed to build catalog service manifest")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), "npm run dev".to_string()]
    }

    #[test]
    fn test_dev_deployment_shape() {
        let deployment = dev_deployment(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "frontend",
            "tesslate-devserver:latest",
            "IfNotPresent",
            None,
            5173,
            &cmd(),
            &BTreeMap::new(),
            true,
            "kubernetes.io/hostname",
        )
        .unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("dev-frontend"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));

        let pod_spec = spec.template.spec.unwrap();
        let container = &pod_spec.containers[0];
        assert_eq!(container.working_dir.as_deref(), Some("/app/frontend"));
        assert_eq!(
            container.ports.as_ref().unwrap()[0].container_port,
            5173
        );

        // required co-location with the project's other pods
        let affinity = pod_spec.affinity.unwrap().pod_affinity.unwrap();
        let terms = affinity
            .required_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");

        let security = pod_spec.security_context.unwrap();
        assert_eq!(security.run_as_user, Some(1000));
        assert_eq!(security.run_as_non_root, Some(true));
    }

    #[test]
    fn test_dev_deployment_without_affinity() {
        let deployment = dev_deployment(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            ".",
            "img",
            "IfNotPresent",
            None,
            3000,
            &cmd(),
            &BTreeMap::new(),
            false,
            "kubernetes.io/hostname",
        )
        .unwrap();

        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod_spec.affinity.is_none());
        assert_eq!(
            pod_spec.containers[0].working_dir.as_deref(),
            Some("/app")
        );
    }

    #[test]
    fn test_pvc_access_mode_tracks_container_count() {
        let single = pvc_manifest(Uuid::new_v4(), Uuid::new_v4(), "standard", "5Gi", false)
            .unwrap();
        assert_eq!(
            single.spec.unwrap().access_modes.unwrap(),
            vec!["ReadWriteOnce"]
        );

        let multi = pvc_manifest(Uuid::new_v4(), Uuid::new_v4(), "nfs-client", "5Gi", true)
            .unwrap();
        assert_eq!(
            multi.spec.unwrap().access_modes.unwrap(),
            vec!["ReadWriteMany"]
        );
    }

    #[test]
    fn test_network_policy_blocks_private_ranges() {
        let policy = network_policy_manifest(Uuid::new_v4(), "ingress-nginx").unwrap();
        let spec = policy.spec.unwrap();

        let egress = spec.egress.unwrap();
        let internet_rule = egress.last().unwrap();
        let block = internet_rule.to.as_ref().unwrap()[0]
            .ip_block
            .as_ref()
            .unwrap();
        assert_eq!(block.cidr, "0.0.0.0/0");
        let except = block.except.as_ref().unwrap();
        assert!(except.contains(&"10.0.0.0/8".to_string()));
        assert!(except.contains(&"172.16.0.0/12".to_string()));
        assert!(except.contains(&"192.168.0.0/16".to_string()));

        // ingress admits same-namespace pods and the ingress controller
        let ingress = spec.ingress.unwrap();
        assert_eq!(ingress.len(), 2);
    }

    #[test]
    fn test_ingress_host_and_tls() {
        let ingress = ingress_manifest(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "web",
            "my-app-k3x8n2",
            5173,
            "tesslate.app",
            "nginx",
            Some("wildcard-tls"),
        )
        .unwrap();

        let spec = ingress.spec.unwrap();
        let rule = &spec.rules.as_ref().unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("my-app-k3x8n2-web.tesslate.app"));

        let tls = &spec.tls.as_ref().unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("wildcard-tls"));

        let backend = &rule.http.as_ref().unwrap().paths[0].backend;
        let service = backend.service.as_ref().unwrap();
        assert_eq!(service.name, "dev-web");
        assert_eq!(service.port.as_ref().unwrap().number, Some(5173));
    }

    #[test]
    fn test_file_manager_idles() {
        let deployment = file_manager_deployment(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tesslate-devserver:latest",
            "IfNotPresent",
            Some("regcred"),
        )
        .unwrap();

        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        let container = &pod_spec.containers[0];
        assert_eq!(
            container.command.as_ref().unwrap()[2],
            "sleep infinity"
        );
        let secrets = serde_json::to_value(&pod_spec.image_pull_secrets).unwrap();
        assert_eq!(secrets[0]["name"], "regcred");
    }
}
