//! Persisted progress data model.
//!
//! `ProgressSnapshot` is the aggregate the coordinator owns; everything else
//! receives clones. `HeadPointer` is the small record kept in the fast store
//! that names the authoritative snapshot and its checksum.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::migrate::CURRENT_SCHEMA_VERSION;
use crate::storage::RecordId;

/// One completed quiz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    pub quiz_id: String,
    pub score: u32,
    pub total_questions: u32,
    #[serde(default)]
    pub xp_earned: u64,
    pub taken_at: DateTime<Utc>,
}

/// Per-question tracking record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRecord {
    pub attempts: u32,
    pub correct: u32,
    #[serde(default)]
    pub last_correct: bool,
    /// Cumulative answer time in milliseconds.
    #[serde(default)]
    pub total_time_ms: u64,
}

/// State of one mission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionState {
    pub progress: u32,
    pub target: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub claimed: bool,
}

/// Canonical user-progress aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total_points: u64,
    #[serde(rename = "totalXP")]
    pub total_xp: u64,
    pub quizzes_taken: u32,
    pub quiz_history: Vec<QuizAttempt>,
    pub answered_questions: Vec<String>,
    pub achievements: BTreeSet<String>,
    pub question_tracking: BTreeMap<String, QuestionRecord>,
    pub missions: BTreeMap<String, MissionState>,
    pub schema_version: u32,
    /// Integrity checksum, empty until the coordinator stamps it.
    #[serde(default)]
    pub checksum: String,
    /// Capture instant. Excluded from the fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            total_points: 0,
            total_xp: 0,
            quizzes_taken: 0,
            quiz_history: Vec::new(),
            answered_questions: Vec::new(),
            achievements: BTreeSet::new(),
            question_tracking: BTreeMap::new(),
            missions: BTreeMap::new(),
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: String::new(),
            last_updated: None,
        }
    }
}

impl ProgressSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter used heavily by tests and the import path.
    pub fn with_points(mut self, points: u64) -> Self {
        self.total_points = points;
        self
    }

    pub fn with_quizzes_taken(mut self, quizzes: u32) -> Self {
        self.quizzes_taken = quizzes;
        self
    }

    pub fn with_achievement(mut self, id: impl Into<String>) -> Self {
        self.achievements.insert(id.into());
        self
    }

    pub fn with_mission(mut self, id: impl Into<String>, state: MissionState) -> Self {
        self.missions.insert(id.into(), state);
        self
    }

    pub fn with_question(mut self, id: impl Into<String>, record: QuestionRecord) -> Self {
        self.question_tracking.insert(id.into(), record);
        self
    }
}

/// Where the snapshot referenced by a head pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SnapshotLocation {
    /// A record in the durable store's snapshot collection.
    Durable { id: RecordId },
    /// The single degraded-mode snapshot key in the fast store.
    Fast,
}

/// Small record in the fast store naming the authoritative snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadPointer {
    pub schema_version: u32,
    pub checksum: String,
    pub location: SnapshotLocation,
    /// Bumped on every committed write.
    pub revision: u64,
    pub written_at: DateTime<Utc>,
}
