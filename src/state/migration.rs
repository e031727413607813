//! Schema upgrades for persisted workflow state.
//!
//! Migrations operate on raw JSON so that a state written by an older build
//! can be upgraded before it is deserialized. Each step is a pure function
//! registered under `"<from>-to-<to>"`; [`MigrationRegistry::migrate`] finds a
//! chain of steps from the stored version to the requested one.

use std::collections::{BTreeMap, HashMap, VecDeque};

use semver::Version;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StateError;

/// Schema version written by this build.
pub const CURRENT_VERSION: &str = "1.1.0";

/// Version assumed for state files written before the `version` field existed.
pub const LEGACY_VERSION: &str = "1.0.0";

type MigrationFn = fn(Value) -> Result<Value, String>;

/// The version recorded in a raw state document.
pub fn stored_version(state: &Value) -> &str {
    state
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or(LEGACY_VERSION)
}

pub struct MigrationRegistry {
    migrations: BTreeMap<String, MigrationFn>,
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(LEGACY_VERSION, "1.1.0", add_version_field);
        registry
    }
}

impl MigrationRegistry {
    pub fn empty() -> Self {
        Self {
            migrations: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, from: &str, to: &str, migrate: MigrationFn) {
        self.migrations.insert(migration_key(from, to), migrate);
    }

    /// Versions that appear on either side of a registered step.
    fn known_versions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.migrations.keys().filter_map(|k| k.split_once("-to-"))
    }

    fn is_known(&self, version: &str) -> bool {
        version == CURRENT_VERSION
            || self
                .known_versions()
                .any(|(from, to)| from == version || to == version)
    }

    /// Breadth-first search for the shortest chain of steps.
    fn find_path(&self, from: &str, to: &str) -> Option<Vec<(String, String)>> {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for (a, b) in self.known_versions() {
            edges.entry(a).or_default().push(b);
        }

        let mut previous: HashMap<&str, &str> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(version) = queue.pop_front() {
            if version == to {
                let mut path = Vec::new();
                let mut cursor = to;
                while let Some(&prev) = previous.get(cursor) {
                    path.push((prev.to_string(), cursor.to_string()));
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            for &next in edges.get(version).into_iter().flatten() {
                if next != from && !previous.contains_key(next) {
                    previous.insert(next, version);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Upgrades `state` to `target`, returning it untouched when already there.
    pub fn migrate(&self, mut state: Value, target: &str) -> Result<Value, StateError> {
        let from = stored_version(&state).to_string();
        if from == target {
            return Ok(state);
        }

        let from_semver =
            Version::parse(&from).map_err(|_| StateError::UnknownVersion(from.clone()))?;
        let target_semver =
            Version::parse(target).map_err(|_| StateError::UnknownVersion(target.to_string()))?;
        if from_semver > target_semver {
            return Err(StateError::Downgrade {
                from,
                to: target.to_string(),
            });
        }
        if !self.is_known(&from) {
            return Err(StateError::UnknownVersion(from));
        }

        let path = self
            .find_path(&from, target)
            .ok_or_else(|| StateError::NoMigrationPath {
                from: from.clone(),
                to: target.to_string(),
            })?;

        for (step_from, step_to) in path {
            let key = migration_key(&step_from, &step_to);
            let Some(migrate) = self.migrations.get(&key) else {
                return Err(StateError::NoMigrationPath {
                    from: step_from,
                    to: step_to,
                });
            };
            debug!(%key, "applying state migration");
            state = migrate(state).map_err(|reason| StateError::MigrationFailed {
                key: key.clone(),
                reason,
            })?;
            match state.as_object_mut() {
                Some(object) => {
                    object.insert("version".to_string(), Value::String(step_to));
                }
                None => {
                    return Err(StateError::MigrationFailed {
                        key,
                        reason: "migration did not produce an object".to_string(),
                    });
                }
            }
        }

        info!(%from, to = target, "migrated workflow state");
        Ok(state)
    }
}

fn migration_key(from: &str, to: &str) -> String {
    format!("{from}-to-{to}")
}

/// 1.0.0 files are structurally identical apart from the missing version.
fn add_version_field(mut state: Value) -> Result<Value, String> {
    let object = state
        .as_object_mut()
        .ok_or_else(|| "state is not a JSON object".to_string())?;
    object.insert("version".to_string(), Value::String("1.1.0".to_string()));
    Ok(state)
}
