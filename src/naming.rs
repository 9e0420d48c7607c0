//! Deterministic, DNS-safe resource naming
//!
//! Project slugs follow the Vercel/Railway pattern: a human-readable prefix
//! plus a short random hash ("my-awesome-app-k3x8n2"). Every name produced
//! here must satisfy RFC-1123 label rules: lowercase alphanumeric + '-',
//! not starting or ending with '-', at most 63 chars per label.

use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

const SLUG_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SLUG_HASH_LENGTH: usize = 6;
const SLUG_MAX_BASE: usize = 50;
/// DNS-1123 label limit.
const LABEL_MAX: usize = 63;

fn slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("valid regex"))
}

/// Convert text to a URL-safe slug: lowercase, runs of non-alphanumerics
/// collapse to a single hyphen, no leading/trailing hyphens. Falls back to
/// "project" when nothing survives.
pub fn slugify(text: &str, max_length: usize) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_dash = true; // swallow leading separators

    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }

    let mut slug: String = slug.chars().take(max_length).collect();
    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        slug = "project".to_string();
    }
    slug
}

/// Generate a short lowercase-base36 hash suffix.
///
/// Six characters give ~2.2B combinations; collision probability stays
/// around 1% at 100k projects (birthday bound). Insert conflicts are
/// handled by regenerating, see `ProjectStore::create_project`.
pub fn short_hash(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| SLUG_ALPHABET[rng.gen_range(0..SLUG_ALPHABET.len())] as char)
        .collect()
}

/// Unique project slug: "{slugified-name}-{6-char hash}".
pub fn generate_project_slug(project_name: &str) -> String {
    format!(
        "{}-{}",
        slugify(project_name, SLUG_MAX_BASE),
        short_hash(SLUG_HASH_LENGTH)
    )
}

/// Unique username slug from a display name or the email local part.
pub fn generate_username_slug(username: Option<&str>, email: Option<&str>) -> String {
    let base = match (username, email) {
        (Some(name), _) if !name.is_empty() => slugify(name, SLUG_MAX_BASE),
        (_, Some(email)) if !email.is_empty() => {
            let local = email.split('@').next().unwrap_or(email);
            slugify(local, SLUG_MAX_BASE)
        }
        _ => "user".to_string(),
    };
    format!("{}-{}", base, short_hash(SLUG_HASH_LENGTH))
}

/// True if `slug` is lowercase alphanumeric + hyphens, starting and ending
/// with an alphanumeric.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= LABEL_MAX && slug_pattern().is_match(slug)
}

/// Sanitize a service/container name for Compose service naming and
/// intra-project DNS: lowercase, `_`/space/`.` become `-`, doubles collapse,
/// truncated to the DNS-1123 label limit.
pub fn sanitize_service_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_dash = true;

    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_dash = false;
        } else if matches!(ch, '_' | ' ' | '.' | '-') && !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }

    let mut out: String = out.chars().take(LABEL_MAX).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Kubernetes namespace for a project: `proj-{project-id}`.
pub fn project_namespace(project_id: &uuid::Uuid) -> String {
    format!("proj-{}", project_id)
}

/// Per-container Kubernetes resource name: `dev-{sanitized-directory}`,
/// capped at the DNS-1123 label limit.
pub fn container_resource_name(container_directory: &str) -> String {
    let sanitized = sanitize_service_name(container_directory);
    let mut name = format!("dev-{}", sanitized);
    name.truncate(LABEL_MAX);
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// Workload hostname: `{project-slug}-{sanitized-directory}.{app-domain}`.
///
/// Exactly one subdomain label beyond the app domain, so a single wildcard
/// certificate covers every workload.
pub fn container_hostname(project_slug: &str, container_directory: &str, app_domain: &str) -> String {
    format!(
        "{}-{}.{}",
        project_slug,
        sanitize_service_name(container_directory),
        app_domain
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("My Awesome App!", 50), "my-awesome-app");
        assert_eq!(slugify("Hello_World 123", 50), "hello-world-123");
        assert_eq!(slugify("Émojis 🎉 Test", 50), "mojis-test");
    }

    #[test]
    fn test_slugify_empty_falls_back() {
        assert_eq!(slugify("", 50), "project");
        assert_eq!(slugify("!!!", 50), "project");
    }

    #[test]
    fn test_slugify_truncation_strips_trailing_dash() {
        let slug = slugify("aaaa bbbb", 5);
        assert_eq!(slug, "aaaa");
    }

    #[test]
    fn test_project_slug_shape() {
        let slug = generate_project_slug("My App");
        let pattern = Regex::new(r"^my-app-[a-z0-9]{6}$").unwrap();
        assert!(pattern.is_match(&slug), "unexpected slug: {}", slug);
    }

    #[test]
    fn test_generated_slugs_are_valid() {
        for name in ["My App", "x", "--weird--input--", "日本語プロジェクト"] {
            let slug = generate_project_slug(name);
            assert!(is_valid_slug(&slug), "invalid slug from {:?}: {}", name, slug);
            assert!(slug.len() <= 63);
        }
    }

    #[test]
    fn test_username_slug_from_email() {
        let slug = generate_username_slug(None, Some("ernest@example.com"));
        assert!(slug.starts_with("ernest-"));

        let slug = generate_username_slug(None, None);
        assert!(slug.starts_with("user-"));
    }

    #[test]
    fn test_sanitize_service_name() {
        assert_eq!(sanitize_service_name("My Backend_API.v2"), "my-backend-api-v2");
        assert_eq!(sanitize_service_name("frontend"), "frontend");
        assert_eq!(sanitize_service_name("__x__"), "x");

        let long = "a".repeat(100);
        assert_eq!(sanitize_service_name(&long).len(), 63);
    }

    #[test]
    fn test_container_resource_name() {
        assert_eq!(container_resource_name("frontend"), "dev-frontend");
        assert!(container_resource_name(&"b".repeat(100)).len() <= 63);
    }

    #[test]
    fn test_hostname_single_label() {
        let host = container_hostname("my-app-k3x8n2", "backend", "tesslate.app");
        assert_eq!(host, "my-app-k3x8n2-backend.tesslate.app");

        // exactly one label beyond the app domain
        let extra = host.strip_suffix(".tesslate.app").unwrap();
        assert!(!extra.contains('.'));
        assert!(is_valid_slug(extra));
    }

    #[test]
    fn test_namespace_format() {
        let id = uuid::Uuid::new_v4();
        let ns = project_namespace(&id);
        assert!(ns.starts_with("proj-"));
        assert_eq!(ns.len(), 5 + 36);
    }

    #[test]
    fn test_short_hash_collision_bound() {
        // 2k draws from a 36^6 space should essentially never collide; this
        // guards against alphabet/length regressions rather than probing the
        // full 1% @ 100k property.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2000 {
            seen.insert(short_hash(6));
        }
        assert!(seen.len() >= 1999);
    }
}
