//! Command-line front end for the cloud_converge library.
//!
//! Converges a desired-state document against the sandbox provider, whose
//! world is kept in a JSON file between runs.
//!
//! ## Usage
//!
//! 1. Optionally create a `.env` file with `CONVERGE_*` settings
//! 2. Run: `cloud_converge add-zone example.com.` for each hosted zone you reference
//! 3. Run: `cloud_converge apply infra.json` (or `destroy`, `verify`)

#![allow(clippy::print_stdout)] // The binary reports outcomes on stdout

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cloud_converge::{
    ConvergeConfig, ConvergeOrchestrator, ConvergenceReport, DesiredDocument, EntryStore,
    JsonFileEntryStore, SandboxCloud,
};

/// Account id of the sandbox when none is configured.
const SANDBOX_ACCOUNT_ID: &str = "123456789012";

#[derive(Debug, Parser)]
#[command(name = "cloud_converge", version, about = "Converge declared cloud resources")]
struct Cli {
    /// Sandbox world file (overrides CONVERGE_SANDBOX_PATH).
    #[arg(long, global = true)]
    sandbox: Option<PathBuf>,

    /// Managed-entry file (overrides CONVERGE_STATE_PATH).
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or update every declared resource.
    Apply {
        /// Desired-state document.
        file: PathBuf,
    },
    /// Delete every declared resource, last declared first.
    Destroy {
        /// Desired-state document.
        file: PathBuf,
    },
    /// Apply twice and fail unless the second pass changes nothing.
    Verify {
        /// Desired-state document.
        file: PathBuf,
    },
    /// Create a hosted zone in the sandbox and print its id.
    AddZone {
        /// Zone domain, e.g. `example.com.`
        domain: String,
    },
}

fn print_report(title: &str, report: &ConvergenceReport) {
    println!("{title}:");
    for outcome in report.outcomes() {
        println!("  {outcome}");
        for action in &outcome.actions {
            println!("    - {action}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from environment
    let mut cfg = ConvergeConfig::from_env()?;
    if let Some(path) = cli.sandbox {
        cfg.sandbox_path = path;
    }
    if let Some(path) = cli.state {
        cfg.state_path = path;
    }

    let filter = EnvFilter::try_new(&cfg.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let account_id = cfg
        .account_id
        .clone()
        .unwrap_or_else(|| SANDBOX_ACCOUNT_ID.to_string());
    let cloud = SandboxCloud::open(&cfg.sandbox_path, &cfg.region, account_id)?;
    if cloud.region() != cfg.region {
        warn!(sandbox = %cloud.region(), configured = %cfg.region, "sandbox was created for another region");
    }
    let store = JsonFileEntryStore::new(&cfg.state_path);
    let mut entries = store.load()?.unwrap_or_default();
    info!(sandbox = %cfg.sandbox_path.display(), state = %store.path().display(), "state loaded");

    let orchestrator = ConvergeOrchestrator::new(&cloud, &cfg);
    let failures = match &cli.command {
        Command::Apply { file } => {
            let doc = DesiredDocument::from_path(file)?;
            let report = orchestrator.apply(&doc, &mut entries).await;
            print_report("apply", &report);
            report.failures().count()
        }
        Command::Destroy { file } => {
            let doc = DesiredDocument::from_path(file)?;
            let report = orchestrator.destroy(&doc, &mut entries).await;
            print_report("destroy", &report);
            report.failures().count()
        }
        Command::Verify { file } => {
            let doc = DesiredDocument::from_path(file)?;
            let (first, second) = orchestrator.verify(&doc, &mut entries).await;
            print_report("first pass", &first);
            print_report("second pass", &second);
            let drift = usize::from(!second.is_idempotent());
            first.failures().count() + drift
        }
        Command::AddZone { domain } => {
            let id = cloud
                .hosted_zone_for(domain)
                .unwrap_or_else(|| cloud.create_hosted_zone(domain));
            println!("{id}");
            0
        }
    };

    // Persist whatever happened, including partial progress.
    cloud.save(&cfg.sandbox_path)?;
    store.save(&entries)?;

    if failures > 0 {
        return Err(format!("{failures} declaration(s) did not converge").into());
    }
    Ok(())
}
