//! Change-detection and corruption-detection hashes over progress snapshots.
//!
//! Two hashes with different jobs:
//! - [`fingerprint`] covers only business-relevant counters and sets and is
//!   used to skip redundant writes. It never includes a clock component.
//! - [`checksum`] covers the whole serialized snapshot (minus its own
//!   checksum field) and is re-verified on every read and before overwrite.
//!
//! Neither function fails. Input that cannot be serialized gets a unique
//! value so it never compares equal to anything and always forces a save.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::model::ProgressSnapshot;

/// Bytes of the SHA-256 digest kept for fingerprints.
const FINGERPRINT_BYTES: usize = 16;

/// Dedup hash over business-relevant fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Full-content hash, hex encoded.
pub type Checksum = String;

/// Compute the dedup fingerprint of a snapshot.
///
/// Sets and maps are ordered collections, so iteration order is canonical
/// and the digest is independent of insertion order.
pub fn fingerprint(snapshot: &ProgressSnapshot) -> Fingerprint {
    let mut hasher = Sha256::new();

    field(&mut hasher, b"points", &snapshot.total_points.to_le_bytes());
    field(&mut hasher, b"xp", &snapshot.total_xp.to_le_bytes());
    field(&mut hasher, b"quizzes", &snapshot.quizzes_taken.to_le_bytes());
    field(
        &mut hasher,
        b"history",
        &(snapshot.quiz_history.len() as u64).to_le_bytes(),
    );
    field(
        &mut hasher,
        b"answered",
        &(snapshot.answered_questions.len() as u64).to_le_bytes(),
    );

    hasher.update(b"achievements");
    for id in &snapshot.achievements {
        field(&mut hasher, b"a", id.as_bytes());
    }

    hasher.update(b"missions");
    for (id, mission) in &snapshot.missions {
        field(&mut hasher, b"m", id.as_bytes());
        hasher.update(mission.progress.to_le_bytes());
        hasher.update([u8::from(mission.completed), u8::from(mission.claimed)]);
    }

    let attempts: u64 = snapshot
        .question_tracking
        .values()
        .map(|r| u64::from(r.attempts))
        .sum();
    field(
        &mut hasher,
        b"tracked",
        &(snapshot.question_tracking.len() as u64).to_le_bytes(),
    );
    field(&mut hasher, b"attempts", &attempts.to_le_bytes());

    let digest = hasher.finalize();
    Fingerprint(hex::encode(&digest[..FINGERPRINT_BYTES]))
}

/// Length-prefixed field so adjacent fields cannot alias each other.
fn field(hasher: &mut Sha256, tag: &[u8], value: &[u8]) {
    hasher.update(tag);
    hasher.update((value.len() as u32).to_le_bytes());
    hasher.update(value);
}

/// Compute the integrity checksum of a snapshot.
///
/// The snapshot's own `checksum` field is blanked before hashing so the
/// value can be stored inside the record it protects.
pub fn checksum(snapshot: &ProgressSnapshot) -> Checksum {
    match serde_json::to_value(snapshot) {
        Ok(value) => checksum_value(&value),
        Err(e) => {
            warn!(error = %e, "Snapshot not serializable, using unique checksum");
            unhashable()
        }
    }
}

/// Checksum of an untyped snapshot as read from storage.
///
/// Hashes the canonical (key-sorted) JSON encoding with the `checksum`
/// field removed, so records written at older schema versions verify
/// without being decoded into the current model.
pub fn checksum_value(value: &Value) -> Checksum {
    let mut unstamped = value.clone();
    if let Value::Object(object) = &mut unstamped {
        object.remove("checksum");
    }
    match serde_json::to_vec(&unstamped) {
        Ok(bytes) => checksum_bytes(&bytes),
        Err(e) => {
            warn!(error = %e, "Snapshot not serializable, using unique checksum");
            unhashable()
        }
    }
}

/// Parse stored bytes and return them only if the embedded checksum holds.
pub fn verified_value(bytes: &[u8]) -> Option<Value> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let stored = value.get("checksum")?.as_str()?;
    (!stored.is_empty() && checksum_value(&value) == stored).then_some(value)
}

/// SHA-256 of raw bytes, hex encoded.
pub fn checksum_bytes(bytes: &[u8]) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Whether a snapshot's embedded checksum matches its content.
pub fn verify(snapshot: &ProgressSnapshot) -> bool {
    !snapshot.checksum.is_empty() && checksum(snapshot) == snapshot.checksum
}

fn unhashable() -> Checksum {
    format!("unhashable-{}", Uuid::new_v4())
}
