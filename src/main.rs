use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::Style;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docforge::anthropic::AnthropicClient;
use docforge::cli::{Cli, Command};
use docforge::config::DocforgeConfig;
use docforge::lock::{DEFAULT_STALE_AFTER, LockManager};
use docforge::orchestrator::{MigrationOrchestrator, RunOptions, estimate};
use docforge::plan::MigrationPlan;
use docforge::rate_limiter::RateLimiter;
use docforge::state::{Stage, WorkflowStateManager};
use docforge::ui::{RunProgress, print_estimate, print_lock, print_report, print_status};
use docforge::worker::AnthropicWorker;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", Style::new().red().bold().apply_to("error:"));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "docforge=debug" } else { "docforge=warn" };
    let filter = EnvFilter::try_from_env("DOCFORGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = DocforgeConfig::load(&cli.project_dir)?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    match &cli.command {
        Command::Migrate { plan, resume, .. } => migrate(&config, plan, *resume).await,
        Command::Estimate { plan } => {
            let plan = MigrationPlan::load(plan)?;
            let model = config.model.api_id();
            let estimate = estimate(&plan, model, config.max_cost);
            print_estimate(&estimate, model);
            Ok(if estimate.exceeds_budget() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Status => {
            let mut manager = WorkflowStateManager::new(&config.state_dir);
            let path = manager.path().to_path_buf();
            manager
                .load()
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let lock = LockManager::new(&config.state_dir).read_record().ok().flatten();
            print_status(manager.state(), manager.can_resume(), lock.as_ref());
            Ok(ExitCode::SUCCESS)
        }
        Command::Unlock { force } => unlock(&config.state_dir, *force),
    }
}

async fn migrate(config: &DocforgeConfig, plan_path: &Path, resume: bool) -> Result<ExitCode> {
    if config.api_key.is_empty() {
        bail!("No API key: set ANTHROPIC_API_KEY or api_key in docforge.toml");
    }
    let plan = MigrationPlan::load(plan_path)?;

    let client = AnthropicClient::new(config.api_key.clone())?;
    let worker = AnthropicWorker::new(client, config.model, config.max_tokens, config.retry_config());
    let limiter = Arc::new(RateLimiter::new(config.effective_tier()));
    info!(
        tier = %limiter.tier(),
        model = config.model.api_id(),
        concurrency = config.max_concurrent,
        max_cost = ?config.max_cost,
        "starting docforge"
    );

    let orchestrator = MigrationOrchestrator::new(
        worker,
        limiter,
        &config.state_dir,
        config.max_concurrent,
        config.max_cost,
    );
    let options = RunOptions {
        resume,
        stop_on_error: config.stop_on_error,
    };

    let progress = RunProgress::start(plan.tasks.len());
    // Dropping the run future releases the lock and cancels pending documents.
    let outcome = tokio::select! {
        report = orchestrator.run(&plan, options, progress.callbacks()) => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    progress.finish();

    let Some(report) = outcome else {
        warn!("interrupted");
        eprintln!("Interrupted. Run again with --resume to continue.");
        return Ok(ExitCode::from(130));
    };
    let report = report?;
    print_report(&report);
    Ok(if report.stage == Stage::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn unlock(state_dir: &Path, force: bool) -> Result<ExitCode> {
    let mut lock = LockManager::new(state_dir);
    match lock.read_record() {
        Ok(None) => {
            println!("  No migration lock is held.");
            return Ok(ExitCode::SUCCESS);
        }
        Ok(Some(record)) => {
            print_lock(&record);
            if !force && record.age() <= DEFAULT_STALE_AFTER {
                println!("  The lock is still fresh; pass --force to remove it anyway.");
                return Ok(ExitCode::FAILURE);
            }
        }
        Err(e) => warn!(error = %e, "lock file is unreadable, removing it"),
    }
    lock.force_remove()?;
    println!("  Lock removed.");
    Ok(ExitCode::SUCCESS)
}
