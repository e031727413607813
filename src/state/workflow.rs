use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::migration::{CURRENT_VERSION, MigrationRegistry};
use crate::error::StateError;
use crate::executor::TaskResult;
use crate::plan::{MigrationTask, TaskStatus};

/// File name of the persisted run state inside the state directory.
pub const STATE_FILE: &str = "workflow-state.json";

/// Stages of a documentation run.
///
/// not_started → analyzing → designing → implementing → migrating → completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    Analyzing,
    Designing,
    Implementing,
    Migrating,
    Completed,
    Failed,
}

impl Stage {
    fn rank(self) -> u8 {
        match self {
            Stage::NotStarted => 0,
            Stage::Analyzing => 1,
            Stage::Designing => 2,
            Stage::Implementing => 3,
            Stage::Migrating => 4,
            Stage::Completed | Stage::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Stages only move forward. Repeating the current stage is allowed so a
    /// resumed run can checkpoint again; terminal stages accept nothing.
    pub fn can_transition_to(self, next: Stage) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    fn parse(s: &str) -> Option<Stage> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::NotStarted => "not_started",
            Stage::Analyzing => "analyzing",
            Stage::Designing => "designing",
            Stage::Implementing => "implementing",
            Stage::Migrating => "migrating",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Per-document outcome kept across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub source_path: PathBuf,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    /// Keyed by target path.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRecord>,
}

impl MigrationProgress {
    pub fn is_completed(&self, key: &str) -> bool {
        self.tasks
            .get(key)
            .is_some_and(|r| r.status == TaskStatus::Completed)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|r| r.status == status).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_stage: Stage,
    pub checkpoints: Vec<Checkpoint>,
    pub api_call_count: u64,
    pub total_cost: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationProgress>,
}

impl WorkflowState {
    pub fn new(max_cost: Option<f64>) -> Self {
        let now = Utc::now();
        Self {
            version: CURRENT_VERSION.to_string(),
            started_at: now,
            updated_at: now,
            current_stage: Stage::NotStarted,
            checkpoints: Vec::new(),
            api_call_count: 0,
            total_cost: 0.0,
            total_tokens: 0,
            max_cost,
            analysis: None,
            design: None,
            implementation: None,
            migration: None,
        }
    }

    /// Budget left under the run's ceiling, `None` when unlimited.
    pub fn remaining_budget(&self) -> Option<f64> {
        self.max_cost.map(|max| (max - self.total_cost).max(0.0))
    }

    pub fn is_task_completed(&self, key: &str) -> bool {
        self.migration.as_ref().is_some_and(|m| m.is_completed(key))
    }

    fn progress_mut(&mut self) -> &mut MigrationProgress {
        self.migration.get_or_insert_with(MigrationProgress::default)
    }
}

/// Structural check of a raw state document.
pub fn validate_state(candidate: &Value) -> Result<(), StateError> {
    let invalid = |msg: String| Err(StateError::Invalid(msg));
    let Some(object) = candidate.as_object() else {
        return invalid("state must be a JSON object".into());
    };

    for field in ["version", "startedAt", "updatedAt", "currentStage"] {
        match object.get(field) {
            Some(Value::String(_)) => {}
            Some(_) => return invalid(format!("`{field}` must be a string")),
            None => return invalid(format!("missing `{field}`")),
        }
    }
    if let Some(stage) = object.get("currentStage").and_then(Value::as_str)
        && Stage::parse(stage).is_none()
    {
        return invalid(format!("unknown stage `{stage}`"));
    }

    match object.get("apiCallCount") {
        Some(v) if v.is_u64() => {}
        Some(_) => return invalid("`apiCallCount` must be a non-negative integer".into()),
        None => return invalid("missing `apiCallCount`".into()),
    }
    match object.get("totalCost") {
        Some(v) if v.is_number() => {}
        Some(_) => return invalid("`totalCost` must be a number".into()),
        None => return invalid("missing `totalCost`".into()),
    }
    if let Some(v) = object.get("totalTokens")
        && !v.is_u64()
    {
        return invalid("`totalTokens` must be a non-negative integer".into());
    }
    if let Some(v) = object.get("maxCost")
        && !(v.is_number() || v.is_null())
    {
        return invalid("`maxCost` must be a number".into());
    }

    let Some(checkpoints) = object.get("checkpoints").and_then(Value::as_array) else {
        return invalid("`checkpoints` must be an array".into());
    };
    for (i, checkpoint) in checkpoints.iter().enumerate() {
        let stage = checkpoint.get("stage").and_then(Value::as_str);
        let timestamp = checkpoint.get("timestamp").and_then(Value::as_str);
        let description = checkpoint.get("description").and_then(Value::as_str);
        if stage.and_then(Stage::parse).is_none() || timestamp.is_none() || description.is_none() {
            return invalid(format!("checkpoint {i} is malformed"));
        }
    }
    Ok(())
}

/// Owns the persisted run state.
///
/// Every mutation is written straight back to disk. Writes go to a temporary
/// file in the same directory that is then renamed over `workflow-state.json`,
/// so readers never observe a partially written document.
pub struct WorkflowStateManager {
    path: PathBuf,
    registry: MigrationRegistry,
    state: Option<WorkflowState>,
}

impl WorkflowStateManager {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(STATE_FILE),
            registry: MigrationRegistry::default(),
            state: None,
        }
    }

    pub fn with_registry(mut self, registry: MigrationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn state(&self) -> Option<&WorkflowState> {
        self.state.as_ref()
    }

    /// Starts a fresh run and persists it, replacing any previous state.
    pub fn create(&mut self, max_cost: Option<f64>) -> Result<&WorkflowState, StateError> {
        self.state = Some(WorkflowState::new(max_cost));
        self.save()?;
        info!(path = %self.path.display(), "created workflow state");
        self.current()
    }

    /// Loads the persisted state, upgrading older schema versions first.
    ///
    /// Returns `Ok(None)` when no state file exists. A corrupt or invalid file
    /// is an error, never a silent reset.
    pub fn load(&mut self) -> Result<Option<&WorkflowState>, StateError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.state = None;
                return Ok(None);
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let corrupt = |source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        };
        let raw: Value = serde_json::from_str(&contents).map_err(corrupt)?;
        let migrated = self.registry.migrate(raw, CURRENT_VERSION)?;
        validate_state(&migrated)?;
        let state: WorkflowState = serde_json::from_value(migrated).map_err(corrupt)?;

        debug!(stage = %state.current_stage, checkpoints = state.checkpoints.len(), "loaded workflow state");
        self.state = Some(state);
        Ok(self.state.as_ref())
    }

    /// Validates and atomically writes the current state.
    pub fn save(&self) -> Result<(), StateError> {
        let state = self.state.as_ref().ok_or(StateError::NotInitialized)?;
        let raw = serde_json::to_value(state)
            .map_err(|e| StateError::Invalid(format!("state is not serializable: {e}")))?;
        validate_state(&raw)?;
        let bytes = serde_json::to_vec_pretty(&raw)
            .map_err(|e| StateError::Invalid(format!("state is not serializable: {e}")))?;

        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_err)?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(&bytes).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    /// Appends a checkpoint, moves the run to `stage` and persists.
    pub fn checkpoint(
        &mut self,
        stage: Stage,
        description: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        if !state.current_stage.can_transition_to(stage) {
            return Err(StateError::InvalidTransition {
                from: state.current_stage,
                to: stage,
            });
        }
        let description = description.into();
        let now = Utc::now();
        info!(from = %state.current_stage, to = %stage, %description, "checkpoint");
        state.checkpoints.push(Checkpoint {
            stage,
            timestamp: now,
            description,
            data,
        });
        state.current_stage = stage;
        state.updated_at = now;
        self.save()
    }

    /// Stores the output of one of the planning stages.
    pub fn set_stage_record(&mut self, stage: Stage, record: Value) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        match stage {
            Stage::Analyzing => state.analysis = Some(record),
            Stage::Designing => state.design = Some(record),
            Stage::Implementing => state.implementation = Some(record),
            other => {
                return Err(StateError::Invalid(format!(
                    "stage `{other}` has no stage record"
                )));
            }
        }
        state.updated_at = Utc::now();
        self.save()
    }

    /// True iff a persisted state exists and its run has not finished.
    pub fn can_resume(&self) -> bool {
        self.exists()
            && self
                .state
                .as_ref()
                .is_some_and(|s| !s.current_stage.is_terminal())
    }

    /// Marks the given tasks as handed to the executor.
    pub fn mark_in_progress<'a>(
        &mut self,
        tasks: impl IntoIterator<Item = &'a MigrationTask>,
    ) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        let now = Utc::now();
        let progress = state.progress_mut();
        for task in tasks {
            progress.tasks.insert(
                task.key(),
                TaskRecord {
                    source_path: task.source_path.clone(),
                    status: TaskStatus::InProgress,
                    error: None,
                    tokens_used: 0,
                    cost: 0.0,
                    updated_at: now,
                },
            );
        }
        state.updated_at = now;
        self.save()
    }

    /// Records a successful task along with the API call it cost.
    pub fn record_completed(&mut self, result: &TaskResult) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        let now = Utc::now();
        state.api_call_count += 1;
        state.total_cost += result.cost;
        state.total_tokens += result.tokens_used;
        state.updated_at = now;
        state.progress_mut().tasks.insert(
            result.task.key(),
            TaskRecord {
                source_path: result.task.source_path.clone(),
                status: TaskStatus::Completed,
                error: None,
                tokens_used: result.tokens_used,
                cost: result.cost,
                updated_at: now,
            },
        );
        self.save()
    }

    pub fn record_failed(&mut self, task: &MigrationTask, error: &str) -> Result<(), StateError> {
        let state = self.state.as_mut().ok_or(StateError::NotInitialized)?;
        let now = Utc::now();
        state.updated_at = now;
        state.progress_mut().tasks.insert(
            task.key(),
            TaskRecord {
                source_path: task.source_path.clone(),
                status: TaskStatus::Failed,
                error: Some(error.to_string()),
                tokens_used: 0,
                cost: 0.0,
                updated_at: now,
            },
        );
        self.save()
    }

    fn current(&self) -> Result<&WorkflowState, StateError> {
        self.state.as_ref().ok_or(StateError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::TokenUsage;
    use serde_json::json;
    use tempfile::TempDir;

    fn fresh() -> (TempDir, WorkflowStateManager) {
        let dir = TempDir::new().unwrap();
        let manager = WorkflowStateManager::new(dir.path().join(".docforge"));
        (dir, manager)
    }

    #[test]
    fn create_persists_a_valid_document() {
        let (_dir, mut manager) = fresh();
        manager.create(Some(25.0)).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(manager.path()).unwrap()).unwrap();
        validate_state(&raw).unwrap();
        assert_eq!(raw["version"], json!(CURRENT_VERSION));
        assert_eq!(raw["currentStage"], json!("not_started"));
        assert_eq!(raw["maxCost"], json!(25.0));
        assert!(raw["checkpoints"].as_array().unwrap().is_empty());
    }

    #[test]
    fn checkpoint_appends_and_reloads() {
        let (_dir, mut manager) = fresh();
        manager.create(None).unwrap();
        manager
            .checkpoint(Stage::Analyzing, "scanned sources", Some(json!({"files": 12})))
            .unwrap();
        manager
            .checkpoint(Stage::Implementing, "templates ready", None)
            .unwrap();

        let mut reloaded = WorkflowStateManager::new(manager.path().parent().unwrap());
        let state = reloaded.load().unwrap().unwrap();
        assert_eq!(state.current_stage, Stage::Implementing);
        assert_eq!(state.checkpoints.len(), 2);
        assert_eq!(state.checkpoints[0].data, Some(json!({"files": 12})));
        assert!(state.updated_at >= state.started_at);
    }

    #[test]
    fn resumability_follows_the_stage() {
        let (_dir, mut manager) = fresh();
        assert!(!manager.can_resume());
        manager.create(None).unwrap();
        manager.checkpoint(Stage::Implementing, "halfway", None).unwrap();
        assert!(manager.can_resume());
        manager.checkpoint(Stage::Completed, "done", None).unwrap();
        assert!(!manager.can_resume());

        let (_other, mut failed) = fresh();
        failed.create(None).unwrap();
        failed.checkpoint(Stage::Failed, "budget", None).unwrap();
        assert!(!failed.can_resume());
    }

    #[test]
    fn stages_only_move_forward() {
        let (_dir, mut manager) = fresh();
        manager.create(None).unwrap();
        manager.checkpoint(Stage::Migrating, "start", None).unwrap();
        manager.checkpoint(Stage::Migrating, "resume", None).unwrap();

        let err = manager
            .checkpoint(Stage::Designing, "back", None)
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: Stage::Migrating,
                to: Stage::Designing
            }
        ));

        manager.checkpoint(Stage::Completed, "done", None).unwrap();
        assert!(manager.checkpoint(Stage::Failed, "late", None).is_err());
        assert_eq!(manager.state().unwrap().checkpoints.len(), 3);
    }

    #[test]
    fn load_without_file_is_none() {
        let (_dir, mut manager) = fresh();
        assert!(manager.load().unwrap().is_none());
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let (_dir, mut manager) = fresh();
        fs::create_dir_all(manager.path().parent().unwrap()).unwrap();
        fs::write(manager.path(), "{ \"version\": ").unwrap();
        assert!(matches!(manager.load(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn structurally_invalid_state_is_an_error() {
        let (_dir, mut manager) = fresh();
        fs::create_dir_all(manager.path().parent().unwrap()).unwrap();
        fs::write(
            manager.path(),
            json!({
                "version": CURRENT_VERSION,
                "startedAt": "2025-06-01T10:00:00Z",
                "updatedAt": "2025-06-01T10:00:00Z",
                "currentStage": "migrating",
                "checkpoints": {},
                "apiCallCount": 0,
                "totalCost": 0.0
            })
            .to_string(),
        )
        .unwrap();
        let err = manager.load().unwrap_err();
        assert!(err.to_string().contains("checkpoints"));
    }

    #[test]
    fn legacy_file_is_migrated_on_load() {
        let (_dir, mut manager) = fresh();
        fs::create_dir_all(manager.path().parent().unwrap()).unwrap();
        fs::write(
            manager.path(),
            json!({
                "startedAt": "2025-06-01T10:00:00Z",
                "updatedAt": "2025-06-01T10:05:00Z",
                "currentStage": "implementing",
                "checkpoints": [
                    {"stage": "implementing", "timestamp": "2025-06-01T10:05:00Z", "description": "ready"}
                ],
                "apiCallCount": 4,
                "totalCost": 0.5,
                "design": {"sections": 3}
            })
            .to_string(),
        )
        .unwrap();

        let state = manager.load().unwrap().unwrap();
        assert_eq!(state.version, CURRENT_VERSION);
        assert_eq!(state.api_call_count, 4);
        assert_eq!(state.total_tokens, 0);
        assert_eq!(state.design, Some(json!({"sections": 3})));
        assert!(manager.can_resume());
    }

    #[test]
    fn newer_file_is_rejected() {
        let (_dir, mut manager) = fresh();
        manager.create(None).unwrap();
        let mut raw: Value = serde_json::from_str(&fs::read_to_string(manager.path()).unwrap()).unwrap();
        raw["version"] = json!("9.0.0");
        fs::write(manager.path(), raw.to_string()).unwrap();

        assert!(matches!(manager.load(), Err(StateError::Downgrade { .. })));
    }

    #[test]
    fn save_refuses_without_state() {
        let (_dir, manager) = fresh();
        assert!(matches!(manager.save(), Err(StateError::NotInitialized)));
        assert!(!manager.exists());
    }

    #[test]
    fn save_leaves_no_temporary_files() {
        let (_dir, mut manager) = fresh();
        manager.create(None).unwrap();
        manager.checkpoint(Stage::Analyzing, "a", None).unwrap();
        let entries: Vec<_> = fs::read_dir(manager.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(STATE_FILE)]);
    }

    #[test]
    fn task_records_accumulate_counters() {
        let (_dir, mut manager) = fresh();
        manager.create(Some(10.0)).unwrap();
        let a = MigrationTask::new("old/a.md", "docs/a.md", "guide");
        let b = MigrationTask::new("old/b.md", "docs/b.md", "guide");
        manager.mark_in_progress([&a, &b]).unwrap();

        let usage = TokenUsage::new(1000, 500);
        manager
            .record_completed(&TaskResult {
                task: a.clone(),
                output_path: a.target_path.clone(),
                model: "claude-sonnet-4-5-20250929".into(),
                usage,
                tokens_used: usage.total(),
                cost: 0.0105,
            })
            .unwrap();
        manager.record_failed(&b, "model returned no text content").unwrap();

        let state = manager.state().unwrap();
        assert_eq!(state.api_call_count, 1);
        assert_eq!(state.total_tokens, 1500);
        assert!((state.total_cost - 0.0105).abs() < 1e-12);
        assert!((state.remaining_budget().unwrap() - 9.9895).abs() < 1e-9);
        assert!(state.is_task_completed("docs/a.md"));
        assert!(!state.is_task_completed("docs/b.md"));
        let progress = state.migration.as_ref().unwrap();
        assert_eq!(progress.count(TaskStatus::Failed), 1);
        assert_eq!(
            progress.tasks["docs/b.md"].error.as_deref(),
            Some("model returned no text content")
        );
    }

    #[test]
    fn stage_records_are_stored() {
        let (_dir, mut manager) = fresh();
        manager.create(None).unwrap();
        manager
            .set_stage_record(Stage::Analyzing, json!({"files": 3}))
            .unwrap();
        assert!(manager.set_stage_record(Stage::Migrating, json!({})).is_err());
        assert_eq!(manager.state().unwrap().analysis, Some(json!({"files": 3})));
    }
}
