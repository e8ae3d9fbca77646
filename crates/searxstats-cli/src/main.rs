//! searxstats - health prober for public searx / SearXNG instances
//!
//! ## Commands
//!
//! - `run`: probe every instance and write the snapshot plus a health report
//! - `instances`: print the normalized instance list

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};

use searxstats_core::{
    open_store, BackendSet, HealthReport, InstanceRegistry, ProbeConfig, ProbeScheduler,
    ResultCache, Snapshot,
};

#[derive(Parser)]
#[command(name = "searxstats")]
#[command(version = searxstats_core::VERSION)]
#[command(about = "Probe public searx / SearXNG instances", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every instance and report fleet health
    Run {
        /// Instance list (JSON array or one URL per line)
        #[arg(short, long)]
        instances: PathBuf,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop the run after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Maximum concurrent probes
        #[arg(long)]
        concurrency: Option<usize>,

        /// Reach clearnet instances through Tor only
        #[arg(long)]
        no_direct: bool,
    },

    /// Print the normalized instance list
    Instances {
        /// Instance list (JSON array or one URL per line)
        #[arg(short, long)]
        instances: PathBuf,
    },
}

/// Command-line overrides, applied after the config file and environment.
#[derive(Debug, Default)]
struct Overrides {
    deadline_secs: Option<u64>,
    concurrency: Option<usize>,
    no_direct: bool,
}

#[derive(Serialize)]
struct RunOutput {
    snapshot: Snapshot,
    health: HealthReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    searxstats_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            instances,
            config,
            output,
            deadline_secs,
            concurrency,
            no_direct,
        } => {
            let overrides = Overrides {
                deadline_secs,
                concurrency,
                no_direct,
            };
            cmd_run(&instances, config.as_deref(), output.as_deref(), &overrides).await
        }
        Commands::Instances { instances } => cmd_instances(&instances),
    }
}

/// Config file (or defaults), then environment, then flags.
fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<ProbeConfig> {
    let mut config = match path {
        Some(path) => ProbeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => ProbeConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid configuration in environment")?;

    if let Some(secs) = overrides.deadline_secs {
        config.scheduler.run_deadline_secs = Some(secs);
    }
    if let Some(concurrency) = overrides.concurrency {
        config.scheduler.concurrency = concurrency;
    }
    if overrides.no_direct {
        config.backends.allow_direct = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load_registry(path: &Path) -> Result<InstanceRegistry> {
    InstanceRegistry::load(path).with_context(|| format!("Failed to load instances {:?}", path))
}

async fn cmd_run(
    instances: &Path,
    config_path: Option<&Path>,
    output: Option<&Path>,
    overrides: &Overrides,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let registry = load_registry(instances)?;
    let backends = BackendSet::from_config(&config.backends)
        .await
        .context("Failed to initialize backends")?;

    let result = probe(&config, &registry, backends).await?;
    info!(
        healthy = result.health.healthy_count(),
        degraded = result.health.degraded_count(),
        dead = result.health.dead_count(),
        deadline_hit = result.snapshot.deadline_hit,
        "Probe run complete"
    );

    let rendered = serde_json::to_string_pretty(&result)?;
    if let Some(path) = output {
        std::fs::write(path, &rendered).with_context(|| format!("Failed to write to {:?}", path))?;
        println!(
            "Wrote {} results for {} instances to {:?}",
            result.snapshot.len(),
            registry.len(),
            path
        );
    } else {
        println!("{}", rendered);
    }
    Ok(())
}

async fn probe(
    config: &ProbeConfig,
    registry: &InstanceRegistry,
    backends: BackendSet,
) -> Result<RunOutput> {
    let store = open_store(&config.cache).context("Failed to open result cache")?;
    let cache = Arc::new(ResultCache::new(store, config.cache.ttl()));
    let scheduler = ProbeScheduler::from_config(config, backends, cache)
        .context("Failed to build check runners")?;

    let snapshot = scheduler.run(registry).await;
    let health = HealthReport::from_snapshot(&snapshot, registry);
    Ok(RunOutput { snapshot, health })
}

fn cmd_instances(path: &Path) -> Result<()> {
    let registry = load_registry(path)?;
    for instance in registry.list_instances() {
        println!("{}\t{:?}", instance.base_url, instance.network);
    }
    println!("{} instances", registry.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use searxstats_core::fakes::{Reply, ScriptedTransport, HEALTHY_PAGE};
    use searxstats_core::{BackendKind, CheckKind, HealthStatus};

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("searxstats.toml");
        std::fs::write(
            &path,
            "[scheduler]\nconcurrency = 4\nrun_deadline_secs = 600\n",
        )
        .unwrap();

        let config = load_config(
            Some(&path),
            &Overrides {
                deadline_secs: Some(60),
                concurrency: None,
                no_direct: true,
            },
        )
        .unwrap();
        assert_eq!(config.scheduler.concurrency, 4);
        assert_eq!(config.scheduler.run_deadline_secs, Some(60));
        assert!(!config.backends.allow_direct);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let result = load_config(
            None,
            &Overrides {
                concurrency: Some(0),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let result = load_config(
            Some(Path::new("/nonexistent/searxstats.toml")),
            &Overrides::default(),
        );
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Failed to load config"));
    }

    #[test]
    fn test_cmd_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.txt");
        std::fs::write(&path, "# fleet\nhttps://a.example\nhttp://abcdefgh.onion/\n").unwrap();
        assert!(cmd_instances(&path).is_ok());
        assert!(cmd_instances(&dir.path().join("missing.txt")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_builds_report() {
        let config = ProbeConfig::default();
        let registry =
            InstanceRegistry::from_urls(["https://a.example/", "https://b.example/"]).unwrap();
        let transport = Arc::new(
            ScriptedTransport::new(BackendKind::Direct)
                .with_script("a.example", [Reply::ok(HEALTHY_PAGE)])
                .with_script(
                    "a.example/config",
                    [Reply::ok(r#"{"engines":[{"name":"duckduckgo"}]}"#)],
                )
                .with_script("b.example", [Reply::status(404, "not found")]),
        );

        let output = probe(&config, &registry, BackendSet::new().with(transport))
            .await
            .unwrap();
        assert_eq!(output.snapshot.len(), 6);

        let a = &registry.list_instances()[0].id;
        assert!(output
            .snapshot
            .get(a, CheckKind::CapabilityProbe)
            .unwrap()
            .outcome
            .is_success());
        assert_eq!(output.health.get(a).unwrap().status, HealthStatus::Healthy);
        assert_eq!(output.health.unhealthy_instances.len(), 1);

        let rendered = serde_json::to_value(&output).unwrap();
        assert!(rendered["snapshot"]["results"].is_object());
        assert_eq!(rendered["health"]["all_healthy"], false);
    }
}
