//! Migration plans handed over by the planner.
//!
//! A plan is a JSON document listing [`MigrationTask`]s. Tasks without a
//! priority default to 0 and tasks without a token estimate get one derived
//! from the size of their source document.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DocforgeError;

/// Rough bytes-per-token ratio for English prose and markdown.
const BYTES_PER_TOKEN: u64 = 4;
/// Instructions wrapped around every document.
const PROMPT_OVERHEAD_TOKENS: u64 = 400;
/// Used when the source cannot be inspected.
const FALLBACK_TASK_TOKENS: u64 = 2_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One document to migrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationTask {
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub doc_type: String,
    #[serde(default)]
    pub estimated_tokens: u64,
    /// Lower is more urgent.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationTask {
    pub fn new(
        source_path: impl Into<PathBuf>,
        target_path: impl Into<PathBuf>,
        doc_type: impl Into<String>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            target_path: target_path.into(),
            doc_type: doc_type.into(),
            estimated_tokens: 0,
            priority: 0,
            status: TaskStatus::Pending,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Identity of a task across runs: its target path.
    pub fn key(&self) -> String {
        self.target_path.display().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    pub tasks: Vec<MigrationTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimated_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
}

impl MigrationPlan {
    pub fn new(tasks: Vec<MigrationTask>) -> Self {
        Self {
            tasks,
            total_estimated_tokens: None,
            estimated_cost: None,
        }
    }

    /// Reads, validates and fills in token estimates for a plan file.
    pub fn load(path: &Path) -> Result<Self, DocforgeError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            DocforgeError::Plan(format!("cannot read plan {}: {e}", path.display()))
        })?;
        let mut plan: MigrationPlan = serde_json::from_str(&contents).map_err(|e| {
            DocforgeError::Plan(format!("plan {} is not valid JSON: {e}", path.display()))
        })?;
        plan.validate()?;
        plan.fill_estimates();
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), DocforgeError> {
        let mut targets = HashSet::new();
        for task in &self.tasks {
            if task.doc_type.trim().is_empty() {
                return Err(DocforgeError::Plan(format!(
                    "task for {} has an empty docType",
                    task.source_path.display()
                )));
            }
            if !targets.insert(task.target_path.clone()) {
                return Err(DocforgeError::Plan(format!(
                    "duplicate target path {}",
                    task.target_path.display()
                )));
            }
        }
        Ok(())
    }

    /// Estimates tokens for every task that arrived without an estimate.
    pub fn fill_estimates(&mut self) {
        for task in self.tasks.iter_mut().filter(|t| t.estimated_tokens == 0) {
            task.estimated_tokens = estimate_tokens(&task.source_path);
        }
    }

    /// The planner's total when it supplied one, otherwise the sum of task estimates.
    pub fn total_estimated_tokens(&self) -> u64 {
        self.total_estimated_tokens
            .unwrap_or_else(|| self.tasks.iter().map(|t| t.estimated_tokens).sum())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Input-token estimate for migrating the document at `source`.
pub fn estimate_tokens(source: &Path) -> u64 {
    match fs::metadata(source) {
        Ok(meta) => meta.len().div_ceil(BYTES_PER_TOKEN) + PROMPT_OVERHEAD_TOKENS,
        Err(_) => FALLBACK_TASK_TOKENS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_planner_json_with_defaults() {
        let json = r#"{
            "tasks": [
                {"sourcePath": "old/README.md", "targetPath": "docs/overview.md", "docType": "overview", "estimatedTokens": 1200, "priority": 1},
                {"sourcePath": "old/api.md", "targetPath": "docs/api.md", "docType": "reference", "estimatedTokens": 900}
            ],
            "estimatedCost": 0.42
        }"#;
        let plan: MigrationPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].priority, 0);
        assert_eq!(plan.tasks[1].status, TaskStatus::Pending);
        assert_eq!(plan.estimated_cost, Some(0.42));
        assert_eq!(plan.total_estimated_tokens(), 2100);
    }

    #[test]
    fn load_estimates_missing_token_counts() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("guide.md");
        fs::write(&source, "x".repeat(4000)).unwrap();
        let plan_path = dir.path().join("plan.json");
        let plan = MigrationPlan::new(vec![
            MigrationTask::new(&source, dir.path().join("out/guide.md"), "guide"),
            MigrationTask::new(dir.path().join("missing.md"), dir.path().join("out/m.md"), "guide"),
        ]);
        fs::write(&plan_path, serde_json::to_string(&plan).unwrap()).unwrap();

        let loaded = MigrationPlan::load(&plan_path).unwrap();
        assert_eq!(loaded.tasks[0].estimated_tokens, 1000 + PROMPT_OVERHEAD_TOKENS);
        assert_eq!(loaded.tasks[1].estimated_tokens, FALLBACK_TASK_TOKENS);
    }

    #[test]
    fn rejects_duplicate_targets() {
        let plan = MigrationPlan::new(vec![
            MigrationTask::new("a.md", "docs/x.md", "guide"),
            MigrationTask::new("b.md", "docs/x.md", "guide"),
        ]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate target"));
    }

    #[test]
    fn rejects_blank_doc_type() {
        let plan = MigrationPlan::new(vec![MigrationTask::new("a.md", "docs/a.md", "  ")]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn load_reports_invalid_json() {
        let dir = TempDir::new().unwrap();
        let plan_path = dir.path().join("plan.json");
        fs::write(&plan_path, "{ not json").unwrap();
        let err = MigrationPlan::load(&plan_path).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn task_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, r#""in_progress""#);
    }
}
