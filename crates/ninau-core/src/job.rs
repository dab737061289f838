//! Job records: the one entity every component reads and writes.
//!
//! In process, a job's lifecycle is an explicit [`JobState`] so code switches
//! on a tag instead of probing optional fields. On the wire the record is the
//! sparse document stores index on: `pending`, `processing` and `processed`
//! markers with their companion fields. [`JobRecord`] serializes through that
//! document form, and decoding rejects any document whose markers do not
//! describe exactly one state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dedup::DedupKey;

/// Name a dispatch falls back to when the caller does not pick one.
pub const DEFAULT_NAME: &str = "default";

/// Unique identity of a job record.
///
/// Time-ordered (UUID v7), so identity order follows creation order and gives
/// stores a deterministic tie-break between records created in the same
/// instant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(uuid::Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Random token marking which process owns a claim.
///
/// Generated once per worker and passed to the builder explicitly, so a test
/// harness can hand several workers the same token or distinct ones on
/// purpose. Reaping releases every claim held under one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimantId(uuid::Uuid);

impl ClaimantId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ClaimantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Failure payload recorded on a job whose handler did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Top-level error message.
    pub message: String,
    /// Joined source chain, when the error had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl JobFailure {
    /// Capture an error together with its source chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let message = error.to_string();
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        let trace = if causes.is_empty() {
            None
        } else {
            Some(causes.join(": "))
        };
        Self { message, trace }
    }
}

/// Lifecycle position of a job record.
///
/// Transitions are monotonic: `Pending` to `Claimed` to `Done`/`Failed`, with
/// the single exception of reaping, which returns a `Claimed` record to
/// `Pending`. Terminal records are never mutated again, only disposed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    /// Waiting to be claimed.
    Pending,
    /// Exclusively owned by one worker process.
    Claimed {
        claimant: ClaimantId,
        started_at: DateTime<Utc>,
    },
    /// Completed; the published output is immutable.
    Done {
        output: Value,
        ended_at: DateTime<Utc>,
    },
    /// Completed with a recorded failure instead of an output.
    Failed {
        error: JobFailure,
        ended_at: DateTime<Utc>,
    },
}

/// One unit of dispatched work and everything ever published about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobDocument", into = "JobDocument")]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub input: Value,
    pub dedup_key: DedupKey,
    pub created_at: DateTime<Utc>,
    /// Stamped by the reaper when a claim was recovered from a dead process.
    pub abandoned_at: Option<DateTime<Utc>>,
    pub state: JobState,
}

impl JobRecord {
    pub fn is_pending(&self) -> bool {
        matches!(self.state, JobState::Pending)
    }

    pub fn is_processing(&self) -> bool {
        matches!(self.state, JobState::Claimed { .. })
    }

    /// Whether an output or an error has been published.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Done { .. } | JobState::Failed { .. })
    }

    /// Token of the process currently holding the claim, if any.
    pub fn claimant(&self) -> Option<ClaimantId> {
        match self.state {
            JobState::Claimed { claimant, .. } => Some(claimant),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.state {
            JobState::Done { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobFailure> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Sparse-field document form of a [`JobRecord`].
///
/// Exactly one of the `pending`, `processing` and `processed` markers may be
/// present, and `claimant_id` travels with `processing`. Stores index the
/// marker fields, so absent means absent, never `false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDocument {
    id: JobId,
    name: String,
    input: Value,
    dedup_key: DedupKey,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claimant_id: Option<ClaimantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    processing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    processed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JobFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    abandoned_at: Option<DateTime<Utc>>,
}

/// A document whose sparse markers do not describe exactly one state.
#[derive(Debug)]
pub struct InvalidDocument {
    reason: &'static str,
}

impl InvalidDocument {
    fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

impl std::fmt::Display for InvalidDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid job document: {}", self.reason)
    }
}

impl std::error::Error for InvalidDocument {}

impl TryFrom<JobDocument> for JobRecord {
    type Error = InvalidDocument;

    fn try_from(doc: JobDocument) -> Result<Self, InvalidDocument> {
        let state = match (doc.pending, doc.processing, doc.processed) {
            (Some(true), None, None) => JobState::Pending,
            (None, Some(true), None) => JobState::Claimed {
                claimant: doc
                    .claimant_id
                    .ok_or_else(|| InvalidDocument::new("processing without claimant_id"))?,
                started_at: doc
                    .started_at
                    .ok_or_else(|| InvalidDocument::new("processing without started_at"))?,
            },
            (None, None, Some(true)) => {
                let ended_at = doc
                    .ended_at
                    .ok_or_else(|| InvalidDocument::new("processed without ended_at"))?;
                match doc.error {
                    Some(error) => JobState::Failed { error, ended_at },
                    // A null output is still an output; the `processed`
                    // marker disambiguates it from a missing field.
                    None => JobState::Done {
                        output: doc.output.unwrap_or(Value::Null),
                        ended_at,
                    },
                }
            }
            _ => {
                return Err(InvalidDocument::new(
                    "markers must describe exactly one of pending, processing, processed",
                ));
            }
        };

        Ok(JobRecord {
            id: doc.id,
            name: doc.name,
            input: doc.input,
            dedup_key: doc.dedup_key,
            created_at: doc.created_at,
            abandoned_at: doc.abandoned_at,
            state,
        })
    }
}

impl From<JobRecord> for JobDocument {
    fn from(record: JobRecord) -> Self {
        let mut doc = JobDocument {
            id: record.id,
            name: record.name,
            input: record.input,
            dedup_key: record.dedup_key,
            created_at: record.created_at,
            pending: None,
            claimant_id: None,
            started_at: None,
            processing: None,
            processed: None,
            ended_at: None,
            output: None,
            error: None,
            abandoned_at: record.abandoned_at,
        };
        match record.state {
            JobState::Pending => doc.pending = Some(true),
            JobState::Claimed {
                claimant,
                started_at,
            } => {
                doc.claimant_id = Some(claimant);
                doc.started_at = Some(started_at);
                doc.processing = Some(true);
            }
            JobState::Done { output, ended_at } => {
                doc.processed = Some(true);
                doc.ended_at = Some(ended_at);
                doc.output = Some(output);
            }
            JobState::Failed { error, ended_at } => {
                doc.processed = Some(true);
                doc.ended_at = Some(ended_at);
                doc.error = Some(error);
            }
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(state: JobState) -> JobRecord {
        let input = json!({"n": 1});
        JobRecord {
            id: JobId::generate(),
            name: "demo".to_owned(),
            dedup_key: DedupKey::compute("demo", &input),
            input,
            created_at: Utc::now(),
            abandoned_at: None,
            state,
        }
    }

    #[test]
    fn pending_document_is_sparse() {
        let encoded = serde_json::to_value(record(JobState::Pending)).unwrap();
        assert_eq!(encoded["pending"], json!(true));
        let object = encoded.as_object().unwrap();
        assert!(!object.contains_key("processing"));
        assert!(!object.contains_key("processed"));
        assert!(!object.contains_key("claimant_id"));
        assert!(!object.contains_key("output"));
        assert!(!object.contains_key("error"));
    }

    #[test]
    fn each_state_round_trips() {
        let states = [
            JobState::Pending,
            JobState::Claimed {
                claimant: ClaimantId::generate(),
                started_at: Utc::now(),
            },
            JobState::Done {
                output: json!([1, 2, 3]),
                ended_at: Utc::now(),
            },
            JobState::Failed {
                error: JobFailure {
                    message: "boom".to_owned(),
                    trace: Some("io error".to_owned()),
                },
                ended_at: Utc::now(),
            },
        ];
        for state in states {
            let original = record(state);
            let encoded = serde_json::to_string(&original).unwrap();
            let decoded: JobRecord = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn null_output_still_decodes_as_done() {
        let original = record(JobState::Done {
            output: Value::Null,
            ended_at: Utc::now(),
        });
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: JobRecord = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.is_terminal());
        assert_eq!(decoded.output(), Some(&Value::Null));
    }

    #[test]
    fn conflicting_markers_are_rejected() {
        let mut encoded = serde_json::to_value(record(JobState::Pending)).unwrap();
        encoded["processing"] = json!(true);
        let decoded: Result<JobRecord, _> = serde_json::from_value(encoded);
        assert!(decoded.is_err());
    }

    #[test]
    fn claimed_without_token_is_rejected() {
        let source = record(JobState::Claimed {
            claimant: ClaimantId::generate(),
            started_at: Utc::now(),
        });
        let mut encoded = serde_json::to_value(source).unwrap();
        encoded.as_object_mut().unwrap().remove("claimant_id");
        let decoded: Result<JobRecord, _> = serde_json::from_value(encoded);
        assert!(decoded.is_err());
    }

    #[test]
    fn state_helpers_follow_the_tag() {
        let pending = record(JobState::Pending);
        assert!(pending.is_pending() && !pending.is_processing() && !pending.is_terminal());

        let claimant = ClaimantId::generate();
        let claimed = record(JobState::Claimed {
            claimant,
            started_at: Utc::now(),
        });
        assert!(claimed.is_processing());
        assert_eq!(claimed.claimant(), Some(claimant));

        let failed = record(JobState::Failed {
            error: JobFailure {
                message: "boom".to_owned(),
                trace: None,
            },
            ended_at: Utc::now(),
        });
        assert!(failed.is_terminal());
        assert_eq!(failed.error().map(|e| e.message.as_str()), Some("boom"));
        assert!(failed.output().is_none());
    }

    #[test]
    fn failure_captures_source_chain() {
        let inner = std::io::Error::other("disk on fire");
        let failure = JobFailure::from_error(&inner);
        assert_eq!(failure.message, "disk on fire");
        assert!(failure.trace.is_none());
    }
}
