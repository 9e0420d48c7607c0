//! Marketplace base cache (Docker backend only)
//!
//! Pre-clones and pre-installs every active marketplace base into a shared
//! volume at process start, so adding a container to a project is a local
//! directory copy instead of a network clone plus install. A pure
//! performance optimization: the Kubernetes backend clones at
//! container-init time inside the file-manager pod instead.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::{Settings, GIT_CLONE_TIMEOUT};
use crate::domain::MarketplaceBase;
use crate::fsops;
use crate::tools::get_tool_path;

pub struct BaseCacheManager {
    cache_dir: PathBuf,
    cache_volume: String,
    devserver_image: String,
    initialized: AtomicBool,
}

/// A cache entry is valid when it carries at least one recognized
/// dependency manifest; anything else is a partial clone worth redoing.
async fn cache_entry_is_valid(path: &Path) -> bool {
    for marker in ["package.json", "requirements.txt", "go.mod"] {
        if path.join(marker).exists() {
            return true;
        }
    }
    false
}

impl BaseCacheManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cache_dir: settings.base_cache_dir.clone(),
            cache_volume: settings.base_cache_volume.clone(),
            devserver_image: settings.devserver_image.clone(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Path to a cached base, if present.
    pub fn base_path(&self, base_slug: &str) -> Option<PathBuf> {
        let path = self.cache_dir.join(base_slug);
        path.exists().then_some(path)
    }

    pub fn is_cached(&self, base_slug: &str) -> bool {
        self.base_path(base_slug).is_some()
    }

    /// Clone and install every active base not already cached. Failures on
    /// one base never block the others.
    pub async fn initialize(&self, bases: &[MarketplaceBase]) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("base cache already initialized, skipping");
            return Ok(());
        }

        fsops::create_dir_all(self.cache_dir.clone()).await?;

        if bases.is_empty() {
            warn!("no active marketplace bases to cache");
            return Ok(());
        }
        info!("caching {} marketplace bases", bases.len());

        for base in bases {
            if let Err(e) = self.process_base(base).await {
                error!("failed to cache base {}: {:#}", base.slug, e);
                // Leave nothing half-built behind.
                let _ = fsops::remove_tree(self.cache_dir.join(&base.slug)).await;
            }
        }

        info!("base cache initialization complete");
        Ok(())
    }

    async fn process_base(&self, base: &MarketplaceBase) -> Result<()> {
        let base_path = self.cache_dir.join(&base.slug);

        if base_path.exists() {
            if cache_entry_is_valid(&base_path).await {
                info!("base {} already cached", base.slug);
                return Ok(());
            }
            warn!("base {} cache is invalid, re-cloning", base.slug);
            fsops::remove_tree(base_path.clone()).await?;
        }

        let Some(repo_url) = &base.git_repo_url else {
            bail!("base {} has no git repository URL", base.slug);
        };

        info!("caching base {}...", base.slug);
        self.clone_repository(repo_url, &base.default_branch, &base_path)
            .await?;
        self.install_dependencies(&base_path, &base.slug).await?;
        info!("base {} cached", base.slug);
        Ok(())
    }

    async fn clone_repository(&self, repo_url: &str, branch: &str, destination: &Path) -> Result<()> {
        debug!("cloning {} (branch {})", repo_url, branch);

        let clone = Command::new(get_tool_path("git"))
            .args([
                "clone",
                "--depth",
                "1",
                "--branch",
                branch,
                "--single-branch",
                repo_url,
            ])
            .arg(destination)
            .output();

        let output = tokio::time::timeout(GIT_CLONE_TIMEOUT, clone)
            .await
            .context("git clone timed out")??;

        if !output.status.success() {
            bail!(
                "git clone failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn install_dependencies(&self, base_path: &Path, label: &str) -> Result<()> {
        // Multi-directory bases install each ecosystem where it lives.
        let frontend = base_path.join("frontend");
        let backend = base_path.join("backend");

        if frontend.exists() || backend.exists() {
            if frontend.exists() {
                self.install_in_directory(&frontend, &format!("{}/frontend", label))
                    .await?;
            }
            if backend.exists() {
                self.install_in_directory(&backend, &format!("{}/backend", label))
                    .await?;
            }
        } else {
            self.install_in_directory(base_path, label).await?;
        }
        Ok(())
    }

    async fn install_in_directory(&self, directory: &Path, label: &str) -> Result<()> {
        let mut commands: Vec<String> = Vec::new();

        if directory.join("package.json").exists() {
            commands.push("npm install --unsafe-perm".to_string());
        }
        if directory.join("requirements.txt").exists() {
            commands.extend([
                "python3 -m venv .venv".to_string(),
                ".venv/bin/pip install --upgrade pip".to_string(),
                ".venv/bin/pip install -r requirements.txt".to_string(),
            ]);
        }
        if directory.join("go.mod").exists() {
            commands.push("go mod download".to_string());
        }

        if commands.is_empty() {
            debug!("no dependencies to install for {}", label);
            return Ok(());
        }

        self.run_in_container(directory, &commands, label).await
    }

    /// Run install commands inside a throwaway dev-server container that
    /// mounts the cache volume. Runs as root because user projects copy
    /// these files and chown to 1000:1000 afterwards.
    async fn run_in_container(
        &self,
        directory: &Path,
        commands: &[String],
        label: &str,
    ) -> Result<()> {
        let relative = directory
            .strip_prefix(&self.cache_dir)
            .context("install directory escapes the cache dir")?;
        let working_dir = format!("/cache/{}", relative.display());

        debug!("installing dependencies for {} in {}", label, working_dir);
        let output = Command::new(get_tool_path("docker"))
            .args([
                "run",
                "--rm",
                "--user",
                "root",
                "-v",
                &format!("{}:/cache", self.cache_volume),
                "-w",
                &working_dir,
            ])
            .arg(&self.devserver_image)
            .args(["sh", "-c", &commands.join(" && ")])
            .output()
            .await?;

        if !output.status.success() {
            // Install failures leave a usable clone; the startup command
            // reinstalls at first run.
            warn!(
                "install failed for {}: {}",
                label,
                String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .chars()
                    .take(500)
                    .collect::<String>()
            );
            return Ok(());
        }

        debug!("install complete for {}", label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn base(slug: &str, url: Option<&str>) -> MarketplaceBase {
        MarketplaceBase {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: slug.to_string(),
            git_repo_url: url.map(|u| u.to_string()),
            default_branch: "main".to_string(),
            is_active: true,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_cache_entry_validity() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!cache_entry_is_valid(dir.path()).await);

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert!(cache_entry_is_valid(dir.path()).await);
    }

    #[tokio::test]
    async fn test_valid_entry_skips_reclone() {
        let cache_root = tempfile::tempdir().unwrap();
        let mut settings = test_settings();
        settings.base_cache_dir = cache_root.path().to_path_buf();

        let manager = BaseCacheManager::new(&settings);
        let entry = cache_root.path().join("nextjs-15");
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("package.json"), "{}").unwrap();

        // Already-valid entry means no git/docker invocation is attempted.
        manager
            .process_base(&base("nextjs-15", Some("https://example.com/x.git")))
            .await
            .unwrap();
        assert!(manager.is_cached("nextjs-15"));
    }

    #[tokio::test]
    async fn test_base_without_repo_is_an_error() {
        let cache_root = tempfile::tempdir().unwrap();
        let mut settings = test_settings();
        settings.base_cache_dir = cache_root.path().to_path_buf();

        let manager = BaseCacheManager::new(&settings);
        assert!(manager.process_base(&base("empty", None)).await.is_err());
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let cache_root = tempfile::tempdir().unwrap();
        let mut settings = test_settings();
        settings.base_cache_dir = cache_root.path().to_path_buf();

        let manager = BaseCacheManager::new(&settings);
        manager.initialize(&[]).await.unwrap();
        // Second call is a no-op.
        manager.initialize(&[]).await.unwrap();
    }
}
