//! Drives one guarded migration run end to end.
//!
//! lock → load or create state → skip finished documents → checkpoint
//! `migrating` → execute → final checkpoint → unlock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing::{error, info, warn};

use crate::cost::{CostSummary, CostTracker, TokenUsage};
use crate::error::{BudgetExceeded, DocforgeError, ExecutorError, StateError};
use crate::executor::{
    ExecutorCallbacks, ExecutorState, MigrationExecutor, MigrationResult, StopHandle, TaskResult,
};
use crate::lock::LockManager;
use crate::plan::{MigrationPlan, MigrationTask};
use crate::rate_limiter::RateLimiter;
use crate::state::{Stage, WorkflowStateManager};
use crate::worker::Worker;

/// Migrated documents come out roughly as long as their sources.
const OUTPUT_TO_INPUT_RATIO: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Continue the persisted run instead of starting a new one.
    pub resume: bool,
    pub stop_on_error: bool,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: MigrationResult,
    /// Stage the persisted run ended in.
    pub stage: Stage,
    /// Tasks already completed by an earlier run.
    pub skipped: usize,
    pub cost: CostSummary,
    /// Set when the budget ceiling stopped the run.
    pub halted: Option<BudgetExceeded>,
}

/// Pre-flight numbers for a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub tasks: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub max_cost: Option<f64>,
}

impl Estimate {
    pub fn exceeds_budget(&self) -> bool {
        self.max_cost.is_some_and(|max| self.cost > max)
    }
}

/// Prices a plan without running it.
pub fn estimate(plan: &MigrationPlan, model: &str, max_cost: Option<f64>) -> Estimate {
    let input_tokens = plan.total_estimated_tokens();
    let output_tokens = (input_tokens as f64 * OUTPUT_TO_INPUT_RATIO).round() as u64;
    let tracker = CostTracker::new(max_cost);
    let cost = tracker.estimate_cost(model, &TokenUsage::new(input_tokens, output_tokens));
    Estimate {
        tasks: plan.tasks.len(),
        input_tokens,
        output_tokens,
        cost,
        max_cost,
    }
}

pub struct MigrationOrchestrator<W: Worker> {
    worker: Arc<W>,
    limiter: Arc<RateLimiter>,
    state_dir: PathBuf,
    max_concurrent: usize,
    max_cost: Option<f64>,
}

impl<W: Worker> MigrationOrchestrator<W> {
    pub fn new(
        worker: W,
        limiter: Arc<RateLimiter>,
        state_dir: impl Into<PathBuf>,
        max_concurrent: usize,
        max_cost: Option<f64>,
    ) -> Self {
        Self {
            worker: Arc::new(worker),
            limiter,
            state_dir: state_dir.into(),
            max_concurrent,
            max_cost,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Runs `plan` under the migration lock.
    ///
    /// `observer` receives the executor's events after they have been
    /// persisted. A budget halt is reported through [`RunReport::halted`];
    /// lock contention, state errors and resume mismatches are errors.
    pub async fn run(
        &self,
        plan: &MigrationPlan,
        options: RunOptions,
        observer: ExecutorCallbacks,
    ) -> Result<RunReport> {
        let mut lock = LockManager::new(&self.state_dir);
        lock.acquire().context("Failed to acquire migration lock")?;

        let mut manager = WorkflowStateManager::new(&self.state_dir);
        if options.resume {
            let Some(state) = manager.load().context("Failed to load workflow state")? else {
                return Err(DocforgeError::NotResumable(format!(
                    "no saved run in {}",
                    self.state_dir.display()
                ))
                .into());
            };
            if state.current_stage.is_terminal() {
                let stage = state.current_stage;
                return Err(DocforgeError::NotResumable(format!("the last run is {stage}")).into());
            }
        } else {
            manager
                .create(self.max_cost)
                .context("Failed to create workflow state")?;
        }

        let (budget, pending, skipped) = {
            let Some(state) = manager.state() else {
                bail!(StateError::NotInitialized);
            };
            let pending: Vec<MigrationTask> = plan
                .tasks
                .iter()
                .filter(|t| !state.is_task_completed(&t.key()))
                .cloned()
                .collect();
            let skipped = plan.tasks.len() - pending.len();
            (state.remaining_budget(), pending, skipped)
        };
        if skipped > 0 {
            info!(skipped, "skipping documents completed by an earlier run");
        }

        manager.checkpoint(
            Stage::Migrating,
            format!("migrating {} documents", pending.len()),
            Some(json!({ "tasks": pending.len(), "skipped": skipped })),
        )?;
        manager.mark_in_progress(&pending)?;

        let manager = Arc::new(Mutex::new(manager));
        let persist_error: Arc<Mutex<Option<StateError>>> = Arc::new(Mutex::new(None));

        let cost = Arc::new(CostTracker::new(budget));
        let executor = MigrationExecutor::new(
            Arc::clone(&self.worker),
            Arc::clone(&self.limiter),
            Arc::clone(&cost),
            self.max_concurrent,
            options.stop_on_error,
        );
        let callbacks =
            persisting_callbacks(&manager, &persist_error, executor.stop_handle(), observer);
        let executor = executor.with_callbacks(callbacks);

        let outcome = executor.execute(&MigrationPlan::new(pending)).await;
        let cancelled = executor.state() == ExecutorState::Cancelled;
        drop(executor);

        if let Some(e) = persist_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(e).context("Failed to persist task progress");
        }

        let mut manager = manager.lock().unwrap_or_else(PoisonError::into_inner);
        let (result, halted) = match outcome {
            Ok(result) => (result, None),
            Err(ExecutorError::BudgetExceeded { error, partial }) => (*partial, Some(error)),
            Err(e) => return Err(e.into()),
        };

        if let Some(budget) = &halted {
            manager.checkpoint(Stage::Failed, budget.to_string(), None)?;
        } else if result.failed.is_empty() && !cancelled {
            manager.checkpoint(
                Stage::Completed,
                format!("migrated {} documents", result.completed.len() + skipped),
                None,
            )?;
        } else {
            warn!(failed = result.failed.len(), "run finished with failures, resume to retry them");
            manager.checkpoint(
                Stage::Migrating,
                format!("{} documents failed", result.failed.len()),
                Some(json!({ "failed": result.failed.iter().map(|t| t.key()).collect::<Vec<_>>() })),
            )?;
        }
        let stage = manager
            .state()
            .map_or(Stage::Migrating, |s| s.current_stage);
        drop(manager);

        lock.release().context("Failed to release migration lock")?;

        Ok(RunReport {
            result,
            stage,
            skipped,
            cost: cost.summary(),
            halted,
        })
    }
}

/// Persists every settlement before handing it to `observer`.
///
/// The first failed save stops the run: a completion that is not on disk
/// would be paid for again on resume.
fn persisting_callbacks(
    manager: &Arc<Mutex<WorkflowStateManager>>,
    persist_error: &Arc<Mutex<Option<StateError>>>,
    stop: StopHandle,
    observer: ExecutorCallbacks,
) -> ExecutorCallbacks {
    let observer = Arc::new(observer);
    let remember = {
        let persist_error = Arc::clone(persist_error);
        move |e: StateError| {
            let dropped = stop.stop();
            error!(error = %e, dropped, "failed to persist workflow state, stopping the run");
            persist_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(e);
        }
    };

    let on_complete = {
        let manager = Arc::clone(manager);
        let observer = Arc::clone(&observer);
        let remember = remember.clone();
        move |result: &TaskResult| {
            let saved = manager
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_completed(result);
            if let Err(e) = saved {
                remember(e);
            }
            observer.task_complete(result);
        }
    };
    let on_error = {
        let manager = Arc::clone(manager);
        let observer = Arc::clone(&observer);
        move |task: &MigrationTask, message: &str| {
            let saved = manager
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_failed(task, message);
            if let Err(e) = saved {
                remember(e);
            }
            observer.task_error(task, message);
        }
    };

    ExecutorCallbacks::new()
        .on_task_complete(on_complete)
        .on_task_error(on_error)
        .on_progress(move |settled, total, task| observer.progress(settled, total, task))
}
