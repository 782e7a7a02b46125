//! Vagrant Sandbox - Entry Point
//!
//! Maintenance CLI: host checks, workspace listing and orphan cleanup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use vagrant_sandbox::workspace::{WorkspaceMetadata, WorkspacePaths, list_workspaces};
use vagrant_sandbox::{ManagerConfig, SandboxManager, system};

/// Vagrant Sandbox - per-sample VM sandboxes for evaluation harnesses.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache root holding sandbox workspaces
    #[arg(long, global = true, env = "VAGRANT_SANDBOX_CACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Vagrant binary to use
    #[arg(long, global = true, default_value = "vagrant")]
    vagrant: PathBuf,

    /// Skip host requirements checks
    #[arg(long, global = true, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Destroy orphaned workspaces and machines under the cache root
    Cleanup {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Leave workspaces without metadata alone until they are this old
        #[arg(long, value_name = "SECS")]
        grace_secs: Option<u64>,
    },
    /// List workspaces under the cache root
    List,
    /// Print the cache root
    CacheRoot,
    /// Run host requirements checks and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so report output on stdout stays parseable
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = ManagerConfig::from_env()?.with_vagrant_program(&args.vagrant);
    if let Some(root) = &args.cache_root {
        config = config.with_cache_root(root);
    }

    match args.command {
        Command::CacheRoot => {
            println!("{}", config.cache_root.display());
            Ok(())
        }
        Command::List => list(&config),
        Command::Check => {
            check(&config)?;
            Ok(())
        }
        Command::Cleanup { json, grace_secs } => {
            if let Some(secs) = grace_secs {
                config = config.with_untracked_grace(Duration::from_secs(secs));
            }
            if args.skip_checks {
                warn!("Skipping host requirements checks (--skip-checks)");
            } else {
                check(&config)?;
            }
            cleanup(config, json).await
        }
    }
}

fn check(config: &ManagerConfig) -> Result<()> {
    info!("Checking host requirements...");
    match system::check_all(&config.vagrant_program, &config.cache_root) {
        Ok(reqs) => {
            info!(
                "Host requirements satisfied: vagrant {}, cache root {}",
                reqs.vagrant_version,
                reqs.cache_root.display()
            );
            Ok(())
        }
        Err(e) => {
            error!("Host requirements check failed");
            Err(e.into())
        }
    }
}

fn list(config: &ManagerConfig) -> Result<()> {
    for dir in list_workspaces(&config.cache_root) {
        let paths = WorkspacePaths::from_root(dir.clone());
        match WorkspaceMetadata::load(&paths.meta_file) {
            Ok(meta) => println!(
                "{}\t{}\t{}\tpid {}",
                dir.display(),
                meta.sample_id,
                meta.state,
                meta.owner_pid
            ),
            Err(_) => println!("{}\t-\tunknown\t-", dir.display()),
        }
    }
    Ok(())
}

async fn cleanup(config: ManagerConfig, json: bool) -> Result<()> {
    let manager = SandboxManager::new(config)?;
    let report = manager.sweep().await;

    if json {
        let out = serde_json::to_string_pretty(&report).into_diagnostic()?;
        println!("{out}");
    } else {
        for outcome in &report.outcomes {
            println!("{}: {}", outcome.target, outcome.result);
        }
        println!("cache root: {}", report.cache_root.display());
    }

    if !report.is_clean() {
        warn!(
            "{} cleanup target(s) failed; inspect {}",
            report.failed().count(),
            report.cache_root.display()
        );
    }
    Ok(())
}
