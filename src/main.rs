use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use tesslate_orchestrator::activity::ActivityTracker;
use tesslate_orchestrator::base_cache::BaseCacheManager;
use tesslate_orchestrator::config::Settings;
use tesslate_orchestrator::domain::DeploymentMode;
use tesslate_orchestrator::object_store::ProjectArchiveStore;
use tesslate_orchestrator::orchestrator::{BackendDeps, OrchestratorFactory};
use tesslate_orchestrator::proxy::ProxyRegistry;
use tesslate_orchestrator::reaper::IdleReaper;
use tesslate_orchestrator::store::{MemoryStore, ProjectLocks, ProjectStore};

#[derive(Parser)]
#[command(
    name = "tesslate-orchestrator",
    about = "Orchestration core for Tesslate Studio project environments"
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the idle reaper loop against the configured backend
    Serve {
        /// Seconds between reaper passes
        #[arg(long, default_value = "300")]
        interval: u64,
    },
    /// Run a single idle-cleanup pass and exit
    Cleanup {
        /// Idle threshold in minutes (0 uses the configured default)
        #[arg(long, default_value = "0")]
        idle_minutes: i64,
    },
    /// Pre-clone and pre-install marketplace bases (Docker mode)
    WarmCache,
}

async fn build_factory(settings: Arc<Settings>) -> Result<OrchestratorFactory> {
    let store: Arc<dyn ProjectStore> = Arc::new(MemoryStore::new());
    let archive_store = match settings.deployment_mode {
        DeploymentMode::Kubernetes => {
            Some(Arc::new(ProjectArchiveStore::connect(&settings.s3).await?))
        }
        DeploymentMode::Docker => None,
    };

    Ok(OrchestratorFactory::new(BackendDeps {
        settings: Arc::clone(&settings),
        store,
        activity: Arc::new(ActivityTracker::new()),
        locks: Arc::new(ProjectLocks::new()),
        proxies: Arc::new(ProxyRegistry::new(settings.regional_compose_dir.clone())),
        archive_store,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // LOGGING=debug,info,warn,error or just LOGGING=debug
    let log_level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if cli.verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_ansi(false)
        .init();

    let settings = Arc::new(Settings::from_env()?);
    tracing::info!(
        "deployment mode: {}, app domain: {}",
        settings.deployment_mode,
        settings.app_domain
    );

    match cli.command {
        Commands::Serve { interval } => {
            let factory = build_factory(Arc::clone(&settings)).await?;
            let orchestrator = factory.get().await?;
            let reaper = IdleReaper::new(
                orchestrator,
                Duration::from_secs(interval),
                settings.idle_timeout_minutes,
            );
            reaper.run().await;
        }
        Commands::Cleanup { idle_minutes } => {
            let factory = build_factory(Arc::clone(&settings)).await?;
            let orchestrator = factory.get().await?;
            let minutes = if idle_minutes > 0 {
                idle_minutes
            } else {
                settings.idle_timeout_minutes
            };
            let acted_on = orchestrator.cleanup_idle_environments(minutes).await?;
            println!("cleaned up {} environments", acted_on.len());
            for key in acted_on {
                println!("  {}", key);
            }
        }
        Commands::WarmCache => {
            if settings.deployment_mode != DeploymentMode::Docker {
                anyhow::bail!("the base cache is only used in docker mode");
            }
            let store = MemoryStore::new();
            let bases = store.active_bases().await?;
            let cache = BaseCacheManager::new(&settings);
            cache.initialize(&bases).await?;
            println!("base cache warmed ({} bases)", bases.len());
        }
    }

    Ok(())
}
