//! Static service catalog
//!
//! First-party services a user can drag into a project graph: container
//! services (databases, caches, queues) the orchestrator runs itself, and
//! external cloud services wired in through user-supplied credentials.
//! Each definition carries the container image and defaults where
//! applicable, plus a connection template describing the environment
//! variables injected into connected workloads.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// How a service is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Runs as a container inside the project environment.
    Container,
    /// External cloud service, credentials only.
    External,
    /// Can run either way.
    Hybrid,
}

/// Authentication method for external services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Oauth,
    Bearer,
    ConnectionString,
}

/// A credential field an external service asks the user for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialField {
    pub key: &'static str,
    pub label: &'static str,
    pub required: bool,
    pub secret: bool,
}

impl CredentialField {
    const fn required(key: &'static str, label: &'static str) -> Self {
        Self {
            key,
            label,
            required: true,
            secret: true,
        }
    }

    const fn optional(key: &'static str, label: &'static str) -> Self {
        Self {
            key,
            label,
            required: false,
            secret: true,
        }
    }
}

/// Compose-compatible health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
}

impl HealthCheck {
    fn cmd_shell(script: &str) -> Self {
        Self {
            test: vec!["CMD-SHELL".to_string(), script.to_string()],
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
            retries: 5,
        }
    }

    fn cmd(parts: &[&str]) -> Self {
        let mut test = vec!["CMD".to_string()];
        test.extend(parts.iter().map(|p| p.to_string()));
        Self {
            test,
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
            retries: 5,
        }
    }
}

/// A draggable first-party service.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub slug: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// database, cache, queue, search, storage, proxy, monitoring, baas,
    /// ai, payments, email, auth
    pub category: &'static str,
    pub service_type: ServiceType,

    // Container configuration
    pub docker_image: &'static str,
    pub internal_port: Option<u16>,
    pub environment_vars: BTreeMap<&'static str, &'static str>,
    pub volumes: Vec<&'static str>,
    pub health_check: Option<HealthCheck>,
    pub command: Option<Vec<&'static str>>,

    // External service configuration
    pub credential_fields: Vec<CredentialField>,
    pub auth_type: Option<AuthType>,

    /// Target env var name -> template with `{placeholder}` tokens.
    pub connection_template: BTreeMap<&'static str, &'static str>,
}

impl ServiceDefinition {
    fn container(
        slug: &'static str,
        name: &'static str,
        description: &'static str,
        category: &'static str,
        docker_image: &'static str,
        internal_port: u16,
    ) -> Self {
        Self {
            slug,
            name,
            description,
            category,
            service_type: ServiceType::Container,
            docker_image,
            internal_port: Some(internal_port),
            environment_vars: BTreeMap::new(),
            volumes: Vec::new(),
            health_check: None,
            command: None,
            credential_fields: Vec::new(),
            auth_type: None,
            connection_template: BTreeMap::new(),
        }
    }

    fn external(
        slug: &'static str,
        name: &'static str,
        description: &'static str,
        category: &'static str,
        auth_type: AuthType,
    ) -> Self {
        Self {
            slug,
            name,
            description,
            category,
            service_type: ServiceType::External,
            docker_image: "",
            internal_port: None,
            environment_vars: BTreeMap::new(),
            volumes: Vec::new(),
            health_check: None,
            command: None,
            credential_fields: Vec::new(),
            auth_type: Some(auth_type),
            connection_template: BTreeMap::new(),
        }
    }

    fn env(mut self, pairs: &[(&'static str, &'static str)]) -> Self {
        self.environment_vars = pairs.iter().copied().collect();
        self
    }

    fn volumes(mut self, paths: &[&'static str]) -> Self {
        self.volumes = paths.to_vec();
        self
    }

    fn health(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    fn command(mut self, argv: &[&'static str]) -> Self {
        self.command = Some(argv.to_vec());
        self
    }

    fn credentials(mut self, fields: Vec<CredentialField>) -> Self {
        self.credential_fields = fields;
        self
    }

    fn template(mut self, pairs: &[(&'static str, &'static str)]) -> Self {
        self.connection_template = pairs.iter().copied().collect();
        self
    }

    /// Whether the reverse proxy should route public traffic to this
    /// service. Databases and caches stay private to the project network.
    pub fn is_routable(&self) -> bool {
        matches!(self.category, "proxy" | "storage" | "search")
    }
}

fn build_catalog() -> BTreeMap<&'static str, ServiceDefinition> {
    let mut services = BTreeMap::new();

    let mut add = |def: ServiceDefinition| {
        services.insert(def.slug, def);
    };

    // ------------------------------------------------------------------
    // Container services
    // ------------------------------------------------------------------

    add(ServiceDefinition::container(
        "postgres",
        "PostgreSQL",
        "PostgreSQL 16 - powerful open-source relational database",
        "database",
        "postgres:16-alpine",
        5432,
    )
    .env(&[
        ("POSTGRES_USER", "postgres"),
        ("POSTGRES_PASSWORD", "postgres"),
        ("POSTGRES_DB", "app"),
        ("PGDATA", "/var/lib/postgresql/data/pgdata"),
    ])
    .volumes(&["/var/lib/postgresql/data"])
    .health(HealthCheck::cmd_shell("pg_isready -U postgres"))
    .template(&[
        (
            "DATABASE_URL",
            "postgresql://{POSTGRES_USER}:{POSTGRES_PASSWORD}@{container_name}:{internal_port}/{POSTGRES_DB}",
        ),
        ("POSTGRES_HOST", "{container_name}"),
        ("POSTGRES_PORT", "{internal_port}"),
    ]));

    add(ServiceDefinition::container(
        "mysql",
        "MySQL",
        "MySQL 8 - the world's most popular open-source database",
        "database",
        "mysql:8-oracle",
        3306,
    )
    .env(&[
        ("MYSQL_ROOT_PASSWORD", "root"),
        ("MYSQL_DATABASE", "app"),
        ("MYSQL_USER", "app"),
        ("MYSQL_PASSWORD", "password"),
    ])
    .volumes(&["/var/lib/mysql"])
    .health(HealthCheck::cmd(&["mysqladmin", "ping", "-h", "localhost"]))
    .template(&[
        (
            "DATABASE_URL",
            "mysql://{MYSQL_USER}:{MYSQL_PASSWORD}@{container_name}:{internal_port}/{MYSQL_DATABASE}",
        ),
        ("MYSQL_HOST", "{container_name}"),
        ("MYSQL_PORT", "{internal_port}"),
    ]));

    add(ServiceDefinition::container(
        "mongodb",
        "MongoDB",
        "MongoDB 7 - document-oriented NoSQL database",
        "database",
        "mongo:7",
        27017,
    )
    .env(&[
        ("MONGO_INITDB_ROOT_USERNAME", "root"),
        ("MONGO_INITDB_ROOT_PASSWORD", "password"),
        ("MONGO_INITDB_DATABASE", "app"),
    ])
    .volumes(&["/data/db"])
    .health(HealthCheck::cmd(&[
        "mongosh",
        "--eval",
        "db.adminCommand('ping')",
    ]))
    .template(&[
        (
            "MONGODB_URL",
            "mongodb://{MONGO_INITDB_ROOT_USERNAME}:{MONGO_INITDB_ROOT_PASSWORD}@{container_name}:{internal_port}/{MONGO_INITDB_DATABASE}?authSource=admin",
        ),
        ("MONGODB_HOST", "{container_name}"),
    ]));

    add(ServiceDefinition::container(
        "redis",
        "Redis",
        "Redis 7 - in-memory data structure store",
        "cache",
        "redis:7-alpine",
        6379,
    )
    .volumes(&["/data"])
    .command(&["redis-server", "--appendonly", "yes"])
    .health(HealthCheck::cmd(&["redis-cli", "ping"]))
    .template(&[
        ("REDIS_URL", "redis://{container_name}:{internal_port}"),
        ("REDIS_HOST", "{container_name}"),
        ("REDIS_PORT", "{internal_port}"),
    ]));

    add(ServiceDefinition::container(
        "rabbitmq",
        "RabbitMQ",
        "RabbitMQ - message broker with management UI",
        "queue",
        "rabbitmq:3-management-alpine",
        5672,
    )
    .env(&[
        ("RABBITMQ_DEFAULT_USER", "admin"),
        ("RABBITMQ_DEFAULT_PASS", "password"),
    ])
    .volumes(&["/var/lib/rabbitmq"])
    .health(HealthCheck::cmd(&["rabbitmq-diagnostics", "ping"]))
    .template(&[
        (
            "RABBITMQ_URL",
            "amqp://{RABBITMQ_DEFAULT_USER}:{RABBITMQ_DEFAULT_PASS}@{container_name}:{internal_port}",
        ),
        ("RABBITMQ_HOST", "{container_name}"),
    ]));

    add(ServiceDefinition::container(
        "elasticsearch",
        "Elasticsearch",
        "Elasticsearch 8 - distributed search and analytics engine",
        "search",
        "docker.elastic.co/elasticsearch/elasticsearch:8.11.0",
        9200,
    )
    .env(&[
        ("discovery.type", "single-node"),
        ("xpack.security.enabled", "false"),
        ("ES_JAVA_OPTS", "-Xms512m -Xmx512m"),
    ])
    .volumes(&["/usr/share/elasticsearch/data"])
    .health(HealthCheck::cmd_shell(
        "curl -f http://localhost:9200/_cluster/health || exit 1",
    ))
    .template(&[
        ("ELASTICSEARCH_URL", "http://{container_name}:{internal_port}"),
        ("ELASTICSEARCH_HOST", "{container_name}"),
    ]));

    add(ServiceDefinition::container(
        "minio",
        "MinIO",
        "MinIO - S3-compatible object storage",
        "storage",
        "minio/minio:latest",
        9000,
    )
    .env(&[
        ("MINIO_ROOT_USER", "admin"),
        ("MINIO_ROOT_PASSWORD", "password123"),
    ])
    .volumes(&["/data"])
    .command(&["server", "/data", "--console-address", ":9001"])
    .health(HealthCheck::cmd(&[
        "curl",
        "-f",
        "http://localhost:9000/minio/health/live",
    ]))
    .template(&[
        ("S3_ENDPOINT", "http://{container_name}:{internal_port}"),
        ("S3_ACCESS_KEY", "{MINIO_ROOT_USER}"),
        ("S3_SECRET_KEY", "{MINIO_ROOT_PASSWORD}"),
    ]));

    add(ServiceDefinition::container(
        "nginx",
        "Nginx",
        "Nginx - high-performance web server and reverse proxy",
        "proxy",
        "nginx:alpine",
        80,
    )
    .volumes(&["/usr/share/nginx/html", "/etc/nginx/conf.d"])
    .health(HealthCheck::cmd_shell("curl -f http://localhost/ || exit 1"))
    .template(&[("NGINX_URL", "http://{container_name}:{internal_port}")]));

    add(ServiceDefinition::container(
        "grafana",
        "Grafana",
        "Open-source analytics and monitoring solution",
        "monitoring",
        "grafana/grafana:latest",
        3000,
    )
    .env(&[
        ("GF_SECURITY_ADMIN_USER", "admin"),
        ("GF_SECURITY_ADMIN_PASSWORD", "admin"),
        ("GF_AUTH_ANONYMOUS_ENABLED", "true"),
    ])
    .volumes(&["/var/lib/grafana"])
    .health(HealthCheck::cmd_shell(
        "wget -qO- http://localhost:3000/api/health || exit 1",
    ))
    .template(&[("GRAFANA_URL", "http://{container_name}:{internal_port}")]));

    add(ServiceDefinition::container(
        "prometheus",
        "Prometheus",
        "Open-source monitoring and alerting toolkit",
        "monitoring",
        "prom/prometheus:latest",
        9090,
    )
    .volumes(&["/prometheus"])
    .command(&[
        "--config.file=/etc/prometheus/prometheus.yml",
        "--storage.tsdb.path=/prometheus",
    ])
    .health(HealthCheck::cmd_shell(
        "wget -qO- http://localhost:9090/-/healthy || exit 1",
    ))
    .template(&[("PROMETHEUS_URL", "http://{container_name}:{internal_port}")]));

    // ------------------------------------------------------------------
    // External services
    // ------------------------------------------------------------------

    add(ServiceDefinition::external(
        "supabase",
        "Supabase",
        "Open-source Firebase alternative with PostgreSQL, auth, storage and realtime",
        "baas",
        AuthType::ApiKey,
    )
    .credentials(vec![
        CredentialField::required("project_url", "Project URL"),
        CredentialField::required("anon_key", "Anon/Public Key"),
        CredentialField::optional("service_role_key", "Service Role Key"),
    ])
    .template(&[
        ("SUPABASE_URL", "{project_url}"),
        ("SUPABASE_ANON_KEY", "{anon_key}"),
        ("SUPABASE_SERVICE_ROLE_KEY", "{service_role_key}"),
        ("NEXT_PUBLIC_SUPABASE_URL", "{project_url}"),
        ("NEXT_PUBLIC_SUPABASE_ANON_KEY", "{anon_key}"),
    ]));

    add(ServiceDefinition::external(
        "neon",
        "Neon",
        "Serverless PostgreSQL with branching and autoscaling",
        "database",
        AuthType::ConnectionString,
    )
    .credentials(vec![CredentialField::required(
        "connection_string",
        "Connection String",
    )])
    .template(&[("DATABASE_URL", "{connection_string}")]));

    add(ServiceDefinition::external(
        "planetscale",
        "PlanetScale",
        "Serverless MySQL platform with branching and zero-downtime schema changes",
        "database",
        AuthType::ConnectionString,
    )
    .credentials(vec![CredentialField::required(
        "connection_string",
        "Connection String",
    )])
    .template(&[("DATABASE_URL", "{connection_string}")]));

    add(ServiceDefinition::external(
        "openai",
        "OpenAI",
        "OpenAI API for GPT models, embeddings and images",
        "ai",
        AuthType::ApiKey,
    )
    .credentials(vec![CredentialField::required("api_key", "API Key")])
    .template(&[("OPENAI_API_KEY", "{api_key}")]));

    add(ServiceDefinition::external(
        "anthropic",
        "Anthropic",
        "Anthropic API for Claude models",
        "ai",
        AuthType::ApiKey,
    )
    .credentials(vec![CredentialField::required("api_key", "API Key")])
    .template(&[("ANTHROPIC_API_KEY", "{api_key}")]));

    add(ServiceDefinition::external(
        "stripe",
        "Stripe",
        "Payments infrastructure for the internet",
        "payments",
        AuthType::ApiKey,
    )
    .credentials(vec![
        CredentialField::required("secret_key", "Secret Key"),
        CredentialField::optional("publishable_key", "Publishable Key"),
        CredentialField::optional("webhook_secret", "Webhook Secret"),
    ])
    .template(&[
        ("STRIPE_SECRET_KEY", "{secret_key}"),
        ("STRIPE_PUBLISHABLE_KEY", "{publishable_key}"),
        ("STRIPE_WEBHOOK_SECRET", "{webhook_secret}"),
    ]));

    add(ServiceDefinition::external(
        "resend",
        "Resend",
        "Email API for developers",
        "email",
        AuthType::ApiKey,
    )
    .credentials(vec![CredentialField::required("api_key", "API Key")])
    .template(&[("RESEND_API_KEY", "{api_key}")]));

    add(ServiceDefinition::external(
        "clerk",
        "Clerk",
        "Authentication and user management",
        "auth",
        AuthType::ApiKey,
    )
    .credentials(vec![
        CredentialField::required("publishable_key", "Publishable Key"),
        CredentialField::required("secret_key", "Secret Key"),
    ])
    .template(&[
        ("NEXT_PUBLIC_CLERK_PUBLISHABLE_KEY", "{publishable_key}"),
        ("CLERK_SECRET_KEY", "{secret_key}"),
    ]));

    services
}

fn catalog() -> &'static BTreeMap<&'static str, ServiceDefinition> {
    static CATALOG: OnceLock<BTreeMap<&'static str, ServiceDefinition>> = OnceLock::new();
    CATALOG.get_or_init(build_catalog)
}

/// Look up a service definition by slug.
pub fn get_service(slug: &str) -> Option<&'static ServiceDefinition> {
    catalog().get(slug)
}

/// All services.
pub fn all_services() -> impl Iterator<Item = &'static ServiceDefinition> {
    catalog().values()
}

/// All services in a category.
pub fn services_by_category(category: &str) -> Vec<&'static ServiceDefinition> {
    catalog().values().filter(|s| s.category == category).collect()
}

/// All container-deployable services.
pub fn container_services() -> Vec<&'static ServiceDefinition> {
    catalog()
        .values()
        .filter(|s| matches!(s.service_type, ServiceType::Container | ServiceType::Hybrid))
        .collect()
}

/// All external cloud services.
pub fn external_services() -> Vec<&'static ServiceDefinition> {
    catalog()
        .values()
        .filter(|s| matches!(s.service_type, ServiceType::External | ServiceType::Hybrid))
        .collect()
}

/// Expand a service's connection template into concrete env vars.
///
/// Placeholders resolve, in order, against: the service's own default env
/// vars, the sanitized container name (`{container_name}`), the internal
/// port (`{internal_port}`), and user-supplied credentials. Entries whose
/// placeholders cannot all be resolved are dropped rather than injected
/// half-expanded.
pub fn expand_connection_template(
    def: &ServiceDefinition,
    container_name: &str,
    credentials: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    'entries: for (target, template) in &def.connection_template {
        let mut value = String::with_capacity(template.len());
        let mut rest = *template;

        while let Some(start) = rest.find('{') {
            value.push_str(&rest[..start]);
            let Some(end) = rest[start..].find('}') else {
                value.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let token = &rest[start + 1..start + end];
            let resolved = match token {
                "container_name" => Some(container_name.to_string()),
                "internal_port" => def.internal_port.map(|p| p.to_string()),
                key => def
                    .environment_vars
                    .get(key)
                    .map(|v| v.to_string())
                    .or_else(|| credentials.get(key).cloned()),
            };
            match resolved {
                Some(v) => value.push_str(&v),
                None => continue 'entries,
            }
            rest = &rest[start + end + 1..];
        }
        value.push_str(rest);

        out.insert(target.to_string(), value);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let pg = get_service("postgres").unwrap();
        assert_eq!(pg.internal_port, Some(5432));
        assert_eq!(pg.service_type, ServiceType::Container);
        assert!(get_service("does-not-exist").is_none());
    }

    #[test]
    fn test_routability() {
        assert!(!get_service("postgres").unwrap().is_routable());
        assert!(!get_service("redis").unwrap().is_routable());
        assert!(get_service("nginx").unwrap().is_routable());
        assert!(get_service("minio").unwrap().is_routable());
        assert!(get_service("elasticsearch").unwrap().is_routable());
    }

    #[test]
    fn test_postgres_template_expansion() {
        let pg = get_service("postgres").unwrap();
        let env = expand_connection_template(pg, "db", &BTreeMap::new());
        assert_eq!(
            env.get("DATABASE_URL").unwrap(),
            "postgresql://postgres:postgres@db:5432/app"
        );
        assert_eq!(env.get("POSTGRES_HOST").unwrap(), "db");
        assert_eq!(env.get("POSTGRES_PORT").unwrap(), "5432");
    }

    #[test]
    fn test_external_template_uses_credentials() {
        let supabase = get_service("supabase").unwrap();
        let creds: BTreeMap<String, String> = [
            ("project_url".to_string(), "https://x.supabase.co".to_string()),
            ("anon_key".to_string(), "anon123".to_string()),
        ]
        .into();
        let env = expand_connection_template(supabase, "supabase", &creds);
        assert_eq!(env.get("SUPABASE_URL").unwrap(), "https://x.supabase.co");
        assert_eq!(env.get("NEXT_PUBLIC_SUPABASE_ANON_KEY").unwrap(), "anon123");
        // service_role_key was not supplied: entry is dropped, not half-expanded
        assert!(!env.contains_key("SUPABASE_SERVICE_ROLE_KEY"));
    }

    #[test]
    fn test_every_container_service_has_image_and_port() {
        for def in container_services() {
            assert!(!def.docker_image.is_empty(), "{} missing image", def.slug);
            assert!(def.internal_port.is_some(), "{} missing port", def.slug);
        }
    }

    #[test]
    fn test_every_external_service_has_credentials() {
        for def in external_services() {
            assert!(
                !def.credential_fields.is_empty(),
                "{} missing credential fields",
                def.slug
            );
            assert!(def.auth_type.is_some());
        }
    }
}
