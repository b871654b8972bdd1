//! Schema migration for persisted snapshots.
//!
//! Snapshots are migrated as JSON objects through an ordered chain of
//! single-version steps (`v1 -> v2 -> v3 ...`). Every intermediate step runs,
//! even when it changes nothing for a given snapshot. Steps fill missing
//! fields with defaults and only fail on structurally invalid input.
//!
//! # Versions
//!
//! - **v1**: `totalPoints`, `quizzesTaken`, `answeredQuestions`,
//!   `quizHistory` entries `{quizId, score, total, date}`, achievements as a
//!   list or as a `{id: bool}` map.
//! - **v2**: adds `totalXP` (default 0) and `questionTracking` (default `{}`);
//!   achievements normalised to a sorted, de-duplicated list.
//! - **v3**: adds `missions` (default `{}`); history entries renamed to
//!   `{quizId, score, totalQuestions, xpEarned, takenAt}`.

use serde_json::{Map, Value};
use tracing::debug;

use crate::model::ProgressSnapshot;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Instant assigned to legacy history entries with no date.
const LEGACY_EPOCH: &str = "1970-01-01T00:00:00Z";

/// Errors raised while migrating a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("Unsupported schema version {found} (current is {current})")]
    UnsupportedVersion { found: u64, current: u32 },

    #[error("Structurally invalid snapshot at v{version}: {reason}")]
    Structural { version: u32, reason: String },

    #[error("Snapshot decode failed: {0}")]
    Decode(String),
}

/// Result type for migration.
pub type Result<T> = std::result::Result<T, MigrationError>;

type StepFn = fn(Map<String, Value>) -> std::result::Result<Map<String, Value>, String>;

/// One `vN -> vN+1` transform.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub from: u32,
    pub description: &'static str,
    apply: StepFn,
}

impl MigrationStep {
    pub const fn new(from: u32, description: &'static str, apply: StepFn) -> Self {
        Self {
            from,
            description,
            apply,
        }
    }
}

/// Applies the migration chain.
#[derive(Clone)]
pub struct Migrator {
    steps: Vec<MigrationStep>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self {
            steps: vec![
                MigrationStep::new(1, "add XP and question tracking", v1_to_v2),
                MigrationStep::new(2, "add missions, normalise history", v2_to_v3),
            ],
        }
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a migrator from an explicit chain.
    pub fn with_steps(steps: Vec<MigrationStep>) -> Self {
        Self { steps }
    }

    /// Decode persisted bytes and migrate them to the current version.
    pub fn decode(&self, bytes: &[u8]) -> Result<ProgressSnapshot> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| MigrationError::Decode(e.to_string()))?;
        self.migrate_value(value)
    }

    /// Migrate a typed snapshot. Current-version input is returned as is.
    pub fn migrate(&self, snapshot: ProgressSnapshot) -> Result<ProgressSnapshot> {
        if snapshot.schema_version == CURRENT_SCHEMA_VERSION {
            return Ok(snapshot);
        }
        let value =
            serde_json::to_value(&snapshot).map_err(|e| MigrationError::Decode(e.to_string()))?;
        self.migrate_value(value)
    }

    /// Migrate an untyped snapshot and decode it.
    pub fn migrate_value(&self, value: Value) -> Result<ProgressSnapshot> {
        let Value::Object(mut object) = value else {
            return Err(MigrationError::Structural {
                version: 0,
                reason: "snapshot is not an object".to_string(),
            });
        };

        let found = match object.get("schemaVersion") {
            None | Some(Value::Null) => 1,
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| MigrationError::Structural {
                version: 0,
                reason: format!("schemaVersion {} is not an unsigned integer", n),
            })?,
            Some(other) => {
                return Err(MigrationError::Structural {
                    version: 0,
                    reason: format!("schemaVersion has type {}", type_name(other)),
                })
            }
        }
        .max(1);

        if found > u64::from(CURRENT_SCHEMA_VERSION) {
            return Err(MigrationError::UnsupportedVersion {
                found,
                current: CURRENT_SCHEMA_VERSION,
            });
        }

        let mut version = found as u32;
        while version < CURRENT_SCHEMA_VERSION {
            let step = self
                .steps
                .iter()
                .find(|s| s.from == version)
                .ok_or_else(|| MigrationError::Structural {
                    version,
                    reason: format!("no migration step from v{}", version),
                })?;
            object = (step.apply)(object).map_err(|reason| MigrationError::Structural {
                version,
                reason,
            })?;
            version += 1;
            object.insert("schemaVersion".to_string(), Value::from(version));
            debug!(to = version, step = step.description, "Applied migration step");
        }

        serde_json::from_value(Value::Object(object))
            .map_err(|e| MigrationError::Decode(e.to_string()))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Insert `default` when `key` is missing or null; reject other types.
fn default_field(
    object: &mut Map<String, Value>,
    key: &str,
    default: Value,
    accept: fn(&Value) -> bool,
) -> std::result::Result<(), String> {
    match object.get(key) {
        None | Some(Value::Null) => {
            object.insert(key.to_string(), default);
            Ok(())
        }
        Some(value) if accept(value) => Ok(()),
        Some(value) => Err(format!("{} has type {}", key, type_name(value))),
    }
}

fn v1_to_v2(mut object: Map<String, Value>) -> std::result::Result<Map<String, Value>, String> {
    default_field(&mut object, "totalPoints", Value::from(0), Value::is_u64)?;
    default_field(&mut object, "quizzesTaken", Value::from(0), Value::is_u64)?;
    default_field(&mut object, "answeredQuestions", Value::Array(vec![]), Value::is_array)?;
    default_field(&mut object, "quizHistory", Value::Array(vec![]), Value::is_array)?;
    default_field(&mut object, "totalXP", Value::from(0), Value::is_u64)?;
    default_field(
        &mut object,
        "questionTracking",
        Value::Object(Map::new()),
        Value::is_object,
    )?;

    let achievements = match object.remove("achievements") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(id) => Ok(id),
                other => Err(format!("achievement has type {}", type_name(&other))),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?,
        // Legacy `{id: unlocked}` map.
        Some(Value::Object(map)) => map
            .into_iter()
            .filter(|(_, unlocked)| unlocked.as_bool().unwrap_or(false))
            .map(|(id, _)| id)
            .collect(),
        Some(other) => return Err(format!("achievements has type {}", type_name(&other))),
    };
    let mut achievements = achievements;
    achievements.sort();
    achievements.dedup();
    object.insert(
        "achievements".to_string(),
        Value::Array(achievements.into_iter().map(Value::String).collect()),
    );

    Ok(object)
}

fn v2_to_v3(mut object: Map<String, Value>) -> std::result::Result<Map<String, Value>, String> {
    default_field(&mut object, "missions", Value::Object(Map::new()), Value::is_object)?;

    if let Some(Value::Array(entries)) = object.get_mut("quizHistory") {
        for entry in entries.iter_mut() {
            let Value::Object(attempt) = entry else {
                return Err("quizHistory entry is not an object".to_string());
            };
            if let Some(total) = attempt.remove("total") {
                attempt.entry("totalQuestions").or_insert(total);
            }
            if let Some(date) = attempt.remove("date") {
                attempt.entry("takenAt").or_insert(date);
            }
            attempt
                .entry("quizId")
                .or_insert_with(|| Value::from("unknown"));
            attempt.entry("score").or_insert_with(|| Value::from(0));
            attempt
                .entry("totalQuestions")
                .or_insert_with(|| Value::from(0));
            attempt.entry("xpEarned").or_insert_with(|| Value::from(0));
            attempt
                .entry("takenAt")
                .or_insert_with(|| Value::from(LEGACY_EPOCH));
        }
    }

    Ok(object)
}
