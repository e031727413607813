//! Runs a migration plan through the request queue.
//!
//! The executor sorts tasks by priority and hands each one to the
//! [`RequestQueue`]. A dispatched task settles itself before giving up its
//! slot: successful output is priced by the [`CostTracker`], callbacks fire,
//! and a rejected price (or a failure under `stop_on_error`) clears the
//! pending tasks. Worker failures stay local to their task.
//!
//! ```text
//! Idle -> Running <-> Paused
//!           |
//!           +-> Completed | Cancelled
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cost::{CostTracker, TokenUsage};
use crate::error::{BudgetExceeded, ExecutorError, QueueError, WorkerError};
use crate::plan::{MigrationPlan, MigrationTask, TaskStatus};
use crate::queue::{QueueCanceller, RequestQueue};
use crate::rate_limiter::RateLimiter;
use crate::worker::{Worker, WorkerOutput};

type TaskOutcome = Result<WorkerOutput, WorkerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Paused,
    Cancelled,
    Completed,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutorState::Idle => "idle",
            ExecutorState::Running => "running",
            ExecutorState::Paused => "paused",
            ExecutorState::Cancelled => "cancelled",
            ExecutorState::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// A task that finished successfully, with its priced usage.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task: MigrationTask,
    pub output_path: PathBuf,
    pub model: String,
    pub usage: TokenUsage,
    pub tokens_used: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationResult {
    pub completed: Vec<TaskResult>,
    /// Failed tasks carry their error message, including tasks cancelled before dispatch.
    pub failed: Vec<MigrationTask>,
    pub total_time: Duration,
    pub total_cost: f64,
    pub total_tokens: u64,
}

type ProgressFn = Box<dyn Fn(usize, usize, Option<&MigrationTask>) + Send + Sync>;
type CompleteFn = Box<dyn Fn(&TaskResult) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&MigrationTask, &str) + Send + Sync>;

/// Hooks fired synchronously as each task settles.
#[derive(Default)]
pub struct ExecutorCallbacks {
    on_progress: Option<ProgressFn>,
    on_task_complete: Option<CompleteFn>,
    on_task_error: Option<ErrorFn>,
}

impl ExecutorCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `f(settled, total, current_task)`
    pub fn on_progress(
        mut self,
        f: impl Fn(usize, usize, Option<&MigrationTask>) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_task_complete(mut self, f: impl Fn(&TaskResult) + Send + Sync + 'static) -> Self {
        self.on_task_complete = Some(Box::new(f));
        self
    }

    pub fn on_task_error(
        mut self,
        f: impl Fn(&MigrationTask, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_task_error = Some(Box::new(f));
        self
    }

    pub(crate) fn progress(&self, settled: usize, total: usize, task: Option<&MigrationTask>) {
        if let Some(f) = &self.on_progress {
            f(settled, total, task);
        }
    }

    pub(crate) fn task_complete(&self, result: &TaskResult) {
        if let Some(f) = &self.on_task_complete {
            f(result);
        }
    }

    pub(crate) fn task_error(&self, task: &MigrationTask, error: &str) {
        if let Some(f) = &self.on_task_error {
            f(task, error);
        }
    }
}

/// Drops the executor's pending tasks without cancelling the executor.
///
/// Callbacks run while the settling task still holds its queue slot, so a
/// callback that calls [`stop`](Self::stop) keeps every later task from
/// starting.
#[derive(Clone)]
pub struct StopHandle {
    pending: QueueCanceller<()>,
}

impl StopHandle {
    /// Returns how many pending tasks were dropped.
    pub fn stop(&self) -> usize {
        self.pending.clear()
    }
}

#[derive(Default)]
struct Ledger {
    settled: usize,
    result: MigrationResult,
    halt: Option<BudgetExceeded>,
}

/// Settlement state of one `execute` call, shared by its dispatched tasks.
struct Settlement {
    total: usize,
    stop_on_error: bool,
    cost: Arc<CostTracker>,
    callbacks: Arc<ExecutorCallbacks>,
    pending: QueueCanceller<()>,
    ledger: Mutex<Ledger>,
}

impl Settlement {
    /// Prices, records and reports one task. Dispatched tasks call this
    /// before returning, so a halt clears the queue before their slot frees.
    fn settle(&self, mut task: MigrationTask, outcome: Result<TaskOutcome, QueueError>) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.settled += 1;
        let completed = match outcome {
            Ok(Ok(output)) => match self.cost.record_usage(&output.model, &output.usage) {
                Ok(cost) => {
                    task.status = TaskStatus::Completed;
                    Some(TaskResult {
                        task: task.clone(),
                        tokens_used: output.tokens_used(),
                        output_path: output.output_path,
                        model: output.model,
                        usage: output.usage,
                        cost,
                    })
                }
                Err(budget) => {
                    fail(&mut task, budget.to_string());
                    if ledger.halt.is_none() {
                        let dropped = self.pending.clear();
                        error!(%budget, dropped, "budget ceiling reached, halting migration");
                        ledger.halt = Some(budget);
                    }
                    None
                }
            },
            Ok(Err(err)) => {
                fail(&mut task, err.to_string());
                warn!(target = %task.target_path.display(), error = %err, "task failed");
                if self.stop_on_error {
                    let dropped = self.pending.clear();
                    if dropped > 0 {
                        warn!(dropped, "stop-on-error: pending tasks cancelled");
                    }
                }
                None
            }
            Err(err) => {
                fail(&mut task, err.to_string());
                None
            }
        };

        let settled = ledger.settled;
        match completed {
            Some(done) => {
                ledger.result.total_cost += done.cost;
                ledger.result.total_tokens += done.tokens_used;
                self.callbacks.task_complete(&done);
                self.callbacks.progress(settled, self.total, Some(&done.task));
                ledger.result.completed.push(done);
            }
            None => {
                self.callbacks
                    .task_error(&task, task.error.as_deref().unwrap_or_default());
                self.callbacks.progress(settled, self.total, Some(&task));
                ledger.result.failed.push(task);
            }
        }
    }

    fn finish(&self) -> Ledger {
        std::mem::take(&mut *self.ledger.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

pub struct MigrationExecutor<W: Worker> {
    worker: Arc<W>,
    queue: RequestQueue<()>,
    cost: Arc<CostTracker>,
    stop_on_error: bool,
    callbacks: Arc<ExecutorCallbacks>,
    state: Mutex<ExecutorState>,
}

impl<W: Worker> MigrationExecutor<W> {
    /// Builds the executor and its request queue. Must be called inside a Tokio runtime.
    pub fn new(
        worker: Arc<W>,
        limiter: Arc<RateLimiter>,
        cost: Arc<CostTracker>,
        max_concurrent: usize,
        stop_on_error: bool,
    ) -> Self {
        Self {
            worker,
            queue: RequestQueue::new(limiter, max_concurrent),
            cost,
            stop_on_error,
            callbacks: Arc::new(ExecutorCallbacks::default()),
            state: Mutex::new(ExecutorState::Idle),
        }
    }

    pub fn with_callbacks(mut self, callbacks: ExecutorCallbacks) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }

    pub fn state(&self) -> ExecutorState {
        *self.lock_state()
    }

    pub fn cost_tracker(&self) -> &CostTracker {
        &self.cost
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            pending: self.queue.canceller(),
        }
    }

    pub fn queue_length(&self) -> usize {
        self.queue.queue_length()
    }

    pub fn active_count(&self) -> usize {
        self.queue.active_count()
    }

    pub fn pause(&self) {
        let mut state = self.lock_state();
        if *state == ExecutorState::Running {
            *state = ExecutorState::Paused;
            self.queue.pause();
        }
    }

    pub fn resume(&self) {
        let mut state = self.lock_state();
        if *state == ExecutorState::Paused {
            *state = ExecutorState::Running;
            self.queue.resume();
        }
    }

    /// Drops every pending task and refuses further plans. In-flight tasks finish.
    pub fn cancel(&self) {
        *self.lock_state() = ExecutorState::Cancelled;
        let dropped = self.queue.clear();
        info!(dropped, "migration cancelled");
    }

    pub async fn execute(&self, plan: &MigrationPlan) -> Result<MigrationResult, ExecutorError> {
        {
            let mut state = self.lock_state();
            match *state {
                ExecutorState::Cancelled => return Err(ExecutorError::Cancelled),
                ExecutorState::Running | ExecutorState::Paused => {
                    return Err(ExecutorError::AlreadyRunning);
                }
                ExecutorState::Idle | ExecutorState::Completed => *state = ExecutorState::Running,
            }
            // A pause that outlived the previous run must not hold this one.
            if self.queue.is_paused() {
                self.queue.resume();
            }
        }

        let started = Instant::now();
        let mut tasks = plan.tasks.clone();
        // Stable: discovery order breaks priority ties.
        tasks.sort_by_key(|t| t.priority);
        let total = tasks.len();
        info!(total, concurrency = self.queue.max_concurrent(), "starting migration");

        let run = Arc::new(Settlement {
            total,
            stop_on_error: self.stop_on_error,
            cost: Arc::clone(&self.cost),
            callbacks: Arc::clone(&self.callbacks),
            pending: self.queue.canceller(),
            ledger: Mutex::new(Ledger::default()),
        });

        let mut handles = Vec::with_capacity(total);
        for mut task in tasks {
            task.status = TaskStatus::Pending;
            task.error = None;
            let worker = Arc::clone(&self.worker);
            let settlement = Arc::clone(&run);
            let job = task.clone();
            let handle = self.queue.enqueue(
                async move {
                    let outcome = worker.execute(&job).await;
                    settlement.settle(job, Ok(outcome));
                },
                task.estimated_tokens,
                task.priority,
            );
            handles.push((task, handle));
        }

        // Dispatched tasks settle themselves; only dropped ones are settled here.
        for (task, handle) in handles {
            if let Err(err) = handle.await {
                run.settle(task, Err(err));
            }
        }

        let Ledger {
            mut result, halt, ..
        } = run.finish();
        result.total_time = started.elapsed();
        {
            let mut state = self.lock_state();
            if *state != ExecutorState::Cancelled {
                *state = ExecutorState::Completed;
            }
        }
        info!(
            completed = result.completed.len(),
            failed = result.failed.len(),
            cost = result.total_cost,
            tokens = result.total_tokens,
            "migration finished"
        );

        match halt {
            Some(error) => Err(ExecutorError::BudgetExceeded {
                error,
                partial: Box::new(result),
            }),
            None => Ok(result),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fail(task: &mut MigrationTask, error: String) {
    task.status = TaskStatus::Failed;
    task.error = Some(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::Tier;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const SONNET: &str = "claude-sonnet-4-5-20250929";

    #[derive(Default)]
    struct MockWorker {
        failing: HashSet<String>,
        delays: HashMap<String, Duration>,
        usage: TokenUsage,
        starts: Mutex<Vec<String>>,
    }

    impl MockWorker {
        fn failing(mut self, target: &str) -> Self {
            self.failing.insert(target.to_string());
            self
        }

        fn delay(mut self, target: &str, delay: Duration) -> Self {
            self.delays.insert(target.to_string(), delay);
            self
        }

        fn usage(mut self, usage: TokenUsage) -> Self {
            self.usage = usage;
            self
        }

        fn starts(&self) -> Vec<String> {
            self.starts.lock().unwrap().clone()
        }
    }

    impl Worker for MockWorker {
        async fn execute(&self, task: &MigrationTask) -> Result<WorkerOutput, WorkerError> {
            let key = task.key();
            self.starts.lock().unwrap().push(key.clone());
            let delay = self
                .delays
                .get(&key)
                .copied()
                .unwrap_or(Duration::from_millis(100));
            sleep(delay).await;
            if self.failing.contains(&key) {
                return Err(WorkerError::Other(format!("could not migrate {key}")));
            }
            Ok(WorkerOutput {
                output_path: task.target_path.clone(),
                model: SONNET.to_string(),
                usage: self.usage,
            })
        }
    }

    fn task(target: &str, priority: i32) -> MigrationTask {
        MigrationTask::new(format!("src/{target}"), target, "guide")
            .with_priority(priority)
            .with_estimated_tokens(100)
    }

    fn executor(worker: MockWorker, max: usize, stop_on_error: bool) -> MigrationExecutor<MockWorker> {
        executor_with_budget(worker, max, stop_on_error, None)
    }

    fn executor_with_budget(
        worker: MockWorker,
        max: usize,
        stop_on_error: bool,
        budget: Option<f64>,
    ) -> MigrationExecutor<MockWorker> {
        MigrationExecutor::new(
            Arc::new(worker),
            Arc::new(RateLimiter::new(Tier::custom(10_000, 10_000_000))),
            Arc::new(CostTracker::new(budget)),
            max,
            stop_on_error,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn empty_plan_settles_immediately() {
        let exec = executor(MockWorker::default(), 2, false);
        let result = exec.execute(&MigrationPlan::default()).await.unwrap();
        assert!(result.completed.is_empty());
        assert!(result.failed.is_empty());
        assert_eq!(result.total_cost, 0.0);
        assert_eq!(result.total_tokens, 0);
        assert_eq!(exec.state(), ExecutorState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_tasks_in_priority_order() {
        let exec = executor(MockWorker::default(), 1, false);
        let plan = MigrationPlan::new(vec![
            task("c.md", 3),
            task("a.md", 1),
            task("b.md", 2),
            task("a2.md", 1),
        ]);
        exec.execute(&plan).await.unwrap();
        assert_eq!(exec.worker.starts(), vec!["a.md", "a2.md", "b.md", "c.md"]);
    }

    #[tokio::test(start_paused = true)]
    async fn separates_completed_and_failed_and_fires_callbacks() {
        let progress = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let callbacks = {
            let progress = Arc::clone(&progress);
            let completes = Arc::clone(&completes);
            let errors = Arc::clone(&errors);
            ExecutorCallbacks::new()
                .on_progress(move |done, total, current| {
                    progress
                        .lock()
                        .unwrap()
                        .push((done, total, current.map(|t| t.key())));
                })
                .on_task_complete(move |_| {
                    completes.fetch_add(1, Ordering::SeqCst);
                })
                .on_task_error(move |task, error| {
                    errors.lock().unwrap().push((task.key(), error.to_string()));
                })
        };

        let worker = MockWorker::default()
            .failing("b.md")
            .usage(TokenUsage::new(1000, 1000));
        let exec = executor(worker, 2, false).with_callbacks(callbacks);
        let plan = MigrationPlan::new(vec![task("a.md", 0), task("b.md", 0), task("c.md", 0)]);

        let result = exec.execute(&plan).await.unwrap();

        assert_eq!(result.completed.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].status, TaskStatus::Failed);
        assert_eq!(result.failed[0].error.as_deref(), Some("could not migrate b.md"));
        assert!(result.completed.iter().all(|r| r.task.status == TaskStatus::Completed));
        assert_eq!(result.total_tokens, 4000);
        // (1000 * 3 + 1000 * 15) / 1M per task
        assert!((result.total_cost - 0.036).abs() < 1e-9);
        assert!((exec.cost_tracker().total_cost() - 0.036).abs() < 1e-9);

        let progress = progress.lock().unwrap();
        assert_eq!(progress.len(), 3);
        assert_eq!(
            progress.iter().map(|(done, total, _)| (*done, *total)).collect::<Vec<_>>(),
            vec![(1, 3), (2, 3), (3, 3)]
        );
        assert!(progress.iter().all(|(_, _, current)| current.is_some()));
        assert_eq!(completes.load(Ordering::SeqCst), 2);
        assert_eq!(errors.lock().unwrap()[0].0, "b.md");
    }

    fn cancelled(result: &MigrationResult) -> HashSet<String> {
        result
            .failed
            .iter()
            .filter(|t| t.error.as_deref() == Some("request cancelled before dispatch"))
            .map(|t| t.key())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn stop_on_error_cancels_pending_tasks() {
        let worker = MockWorker::default().failing("a.md");
        let exec = executor(worker, 1, true);
        let plan = MigrationPlan::new(vec![task("a.md", 0), task("b.md", 1), task("c.md", 2)]);

        let result = exec.execute(&plan).await.unwrap();

        assert!(result.completed.is_empty());
        assert_eq!(result.failed.len(), 3);
        assert_eq!(result.failed[0].key(), "a.md");
        // The failure clears the queue before a.md gives up its slot.
        assert_eq!(
            cancelled(&result),
            HashSet::from(["b.md".to_string(), "c.md".to_string()])
        );
        assert_eq!(exec.worker.starts(), vec!["a.md"]);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_fire_before_the_next_task_starts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = Arc::new(MockWorker::default());
        let callbacks = {
            let seen = Arc::clone(&seen);
            let worker = Arc::clone(&worker);
            ExecutorCallbacks::new().on_task_complete(move |result| {
                seen.lock()
                    .unwrap()
                    .push((result.task.key(), worker.starts().len()));
            })
        };
        let exec = MigrationExecutor::new(
            worker,
            Arc::new(RateLimiter::new(Tier::custom(10_000, 10_000_000))),
            Arc::new(CostTracker::new(None)),
            1,
            false,
        )
        .with_callbacks(callbacks);
        let plan = MigrationPlan::new(vec![task("a.md", 0), task("b.md", 1), task("c.md", 2)]);

        exec.execute(&plan).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("a.md".to_string(), 1),
                ("b.md".to_string(), 2),
                ("c.md".to_string(), 3)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_handle_from_a_callback_keeps_later_tasks_out() {
        let exec = executor(MockWorker::default(), 1, false);
        let stop = exec.stop_handle();
        let exec = exec.with_callbacks(ExecutorCallbacks::new().on_task_complete(move |_| {
            stop.stop();
        }));
        let plan = MigrationPlan::new(vec![task("a.md", 0), task("b.md", 1), task("c.md", 2)]);

        let result = exec.execute(&plan).await.unwrap();

        assert_eq!(result.completed.len(), 1);
        assert_eq!(cancelled(&result).len(), 2);
        assert_eq!(exec.worker.starts(), vec!["a.md"]);
        assert_eq!(exec.state(), ExecutorState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_on_error_lets_in_flight_tasks_finish() {
        let worker = MockWorker::default()
            .failing("fast-fail.md")
            .delay("fast-fail.md", Duration::from_millis(10))
            .delay("slow.md", Duration::from_secs(2));
        let exec = executor(worker, 2, true);
        let plan = MigrationPlan::new(vec![
            task("fast-fail.md", 0),
            task("slow.md", 0),
            task("next.md", 1),
            task("later.md", 2),
        ]);

        let result = exec.execute(&plan).await.unwrap();

        assert!(result.completed.iter().any(|r| r.task.key() == "slow.md"));
        assert!(result.failed.iter().any(|t| t.key() == "fast-fail.md"));
        assert_eq!(
            cancelled(&result),
            HashSet::from(["next.md".to_string(), "later.md".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn budget_ceiling_halts_the_run() {
        // 1M sonnet input tokens cost $3 per task.
        let worker = MockWorker::default().usage(TokenUsage::new(1_000_000, 0));
        let exec = executor_with_budget(worker, 1, false, Some(7.0));
        let plan = MigrationPlan::new(
            (1..=5).map(|i| task(&format!("{i}.md"), i)).collect(),
        );

        let err = exec.execute(&plan).await.unwrap_err();
        let ExecutorError::BudgetExceeded { error, partial } = err else {
            panic!("expected budget halt");
        };
        assert_eq!(error.limit, 7.0);
        assert!((error.attempted - 9.0).abs() < 1e-9);
        assert_eq!(partial.completed.len(), 2);
        assert_eq!(partial.failed.len(), 3);
        assert!((partial.total_cost - 6.0).abs() < 1e-9);
        assert!((exec.cost_tracker().total_cost() - 6.0).abs() < 1e-9);
        assert_eq!(exec.worker.starts(), vec!["1.md", "2.md", "3.md"]);
        assert_eq!(exec.state(), ExecutorState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drains_pending_and_rejects_further_plans() {
        let worker = MockWorker::default()
            .delay("1.md", Duration::from_secs(1))
            .delay("2.md", Duration::from_secs(1));
        let exec = executor(worker, 1, false);
        let plan = MigrationPlan::new(vec![task("1.md", 0), task("2.md", 1), task("3.md", 2)]);

        let (result, ()) = tokio::join!(exec.execute(&plan), async {
            sleep(Duration::from_millis(500)).await;
            exec.cancel();
        });
        let result = result.unwrap();

        assert_eq!(result.completed.len(), 1);
        assert_eq!(result.failed.len(), 2);
        assert_eq!(exec.state(), ExecutorState::Cancelled);
        assert!(matches!(
            exec.execute(&plan).await,
            Err(ExecutorError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_dispatch_until_resume() {
        let settled = Arc::new(AtomicUsize::new(0));
        let callbacks = {
            let settled = Arc::clone(&settled);
            ExecutorCallbacks::new().on_progress(move |done, _, _| {
                settled.store(done, Ordering::SeqCst);
            })
        };
        let worker = MockWorker::default()
            .delay("1.md", Duration::from_secs(1))
            .delay("2.md", Duration::from_secs(1))
            .delay("3.md", Duration::from_secs(1));
        let exec = executor(worker, 1, false).with_callbacks(callbacks);
        let plan = MigrationPlan::new(vec![task("1.md", 0), task("2.md", 1), task("3.md", 2)]);

        let (result, ()) = tokio::join!(exec.execute(&plan), async {
            sleep(Duration::from_millis(500)).await;
            exec.pause();
            assert_eq!(exec.state(), ExecutorState::Paused);
            sleep(Duration::from_secs(10)).await;
            assert_eq!(settled.load(Ordering::SeqCst), 1);
            assert_eq!(exec.queue_length(), 2);
            assert_eq!(exec.active_count(), 0);
            exec.resume();
        });

        assert_eq!(result.unwrap().completed.len(), 3);
        assert_eq!(exec.state(), ExecutorState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_left_over_from_a_finished_run_does_not_hold_the_next() {
        let exec = executor(
            MockWorker::default().delay("a.md", Duration::from_secs(1)),
            1,
            false,
        );
        let plan = MigrationPlan::new(vec![task("a.md", 0)]);

        let (first, ()) = tokio::join!(exec.execute(&plan), async {
            sleep(Duration::from_millis(200)).await;
            exec.pause();
        });
        assert_eq!(first.unwrap().completed.len(), 1);
        assert_eq!(exec.state(), ExecutorState::Completed);
        exec.resume();

        let second = tokio::time::timeout(Duration::from_secs(3600), exec.execute(&plan))
            .await
            .expect("second run settles");
        assert_eq!(second.unwrap().completed.len(), 1);
        assert_eq!(exec.worker.starts(), vec!["a.md", "a.md"]);
    }

    #[tokio::test(start_paused = true)]
    async fn executor_can_run_again_after_completion() {
        let exec = executor(MockWorker::default(), 2, false);
        let plan = MigrationPlan::new(vec![task("a.md", 0)]);
        exec.execute(&plan).await.unwrap();
        let again = exec.execute(&plan).await.unwrap();
        assert_eq!(again.completed.len(), 1);
    }
}
