use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chaos_tester::client::ClusterClient;
use chaos_tester::cluster::{self, ClusterContext, Lifecycle};
use chaos_tester::config::{Args, RunConfig};
use chaos_tester::error::Error;
use chaos_tester::nemesis::FaultRegistry;
use chaos_tester::orchestrator::{RunOutcome, RunPlan, TestOrchestrator};
use chaos_tester::report;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    report::print_banner("🧪 JOB RECOVERY CHAOS TEST");

    // Reject bad options before anything touches the cluster
    let faults = FaultRegistry::builtin();
    let config = match RunConfig::from_args(&args, &faults) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n{} invalid configuration: {e}", "✗".red());
            std::process::exit(1);
        }
    };

    let outcome = match run(&config, &faults).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("\n{} {e}", "✗".red());
            std::process::exit(1);
        }
    };

    report::print_outcome(&config, &outcome);
    if let Some(path) = &config.out {
        match report::write_results(path, &config, &outcome) {
            Ok(()) => info!(path = %path.display(), "results written"),
            Err(e) => eprintln!("{} {e}", "✗".red()),
        }
    }

    if !outcome.report.verdict.is_pass() {
        std::process::exit(1);
    }
}

async fn run(config: &RunConfig, faults: &FaultRegistry) -> Result<RunOutcome, Error> {
    let plan = RunPlan::from_config(config, faults)?;
    let client = Arc::new(ClusterClient::new(&config.url, &config.control_url)?);

    // Ensure the control agent is reachable before provisioning
    client.health().await?;

    let cluster = cluster::from_spec(&config.test_spec, client.clone());
    let ctx = ClusterContext {
        ha_storage_dir: config.ha_storage_dir.clone(),
        job: config.test_spec.job.clone(),
    };
    info!(components = cluster.len(), "provisioning cluster");
    cluster.start(&ctx).await?;

    let outcome = TestOrchestrator::new(plan)
        .run(client.as_ref(), client.as_ref())
        .await;

    if let Err(e) = cluster.teardown(&ctx).await {
        warn!(error = %e, "cluster teardown failed");
    }
    outcome
}
