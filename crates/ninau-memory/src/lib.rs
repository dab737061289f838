//! In-process document store adapter for the job protocol.
//!
//! Reference adapter and test harness. One mutex over the record map makes
//! every operation a single atomic read-modify-write, which is exactly what
//! the protocol asks of a real document store's find-and-update primitive.
//! Semantics mirror what a network-backed adapter must provide: sorted
//! claims with a deterministic tie-break, dedup scoped to the pending state,
//! adapter-stamped timestamps.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use ninau_core::dedup::DedupKey;
use ninau_core::job::{ClaimantId, JobFailure, JobId, JobRecord, JobState};
use ninau_core::store::JobStore;
use parking_lot::Mutex;
use serde_json::Value;

/// Failures the in-memory adapter can produce.
///
/// There is no network and no serialization here; what remains are protocol
/// violations a correct caller never commits.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is not claimed")]
    NotClaimed(JobId),
}

/// Document store living in process memory.
///
/// Clones share the same map, the way two pool handles share one database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<JobId, JobRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, in any state.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl JobStore for MemoryStore {
    type Error = StoreError;

    async fn dispatch(
        &self,
        name: &str,
        input: &Value,
        dedup_key: DedupKey,
    ) -> Result<JobRecord, StoreError> {
        let mut jobs = self.inner.lock();
        let existing = jobs
            .values()
            .filter(|job| job.is_pending() && job.name == name && job.dedup_key == dedup_key)
            .min_by_key(|job| (job.created_at, job.id));
        if let Some(job) = existing {
            return Ok(job.clone());
        }
        let record = JobRecord {
            id: JobId::generate(),
            name: name.to_owned(),
            input: input.clone(),
            dedup_key,
            created_at: Utc::now(),
            abandoned_at: None,
            state: JobState::Pending,
        };
        jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn claim(
        &self,
        names: &[String],
        claimant: ClaimantId,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut jobs = self.inner.lock();
        let oldest = jobs
            .values()
            .filter(|job| job.is_pending() && names.contains(&job.name))
            .min_by_key(|job| (job.created_at, job.id))
            .map(|job| job.id);
        let Some(id) = oldest else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Claimed {
            claimant,
            started_at: Utc::now(),
        };
        Ok(Some(job.clone()))
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.inner.lock().get(&id).cloned())
    }

    async fn latest(
        &self,
        name: &str,
        dedup_key: DedupKey,
    ) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.inner.lock();
        Ok(jobs
            .values()
            .filter(|job| job.name == name && job.dedup_key == dedup_key)
            .max_by_key(|job| (job.created_at, job.id))
            .cloned())
    }

    async fn succeed(&self, id: JobId, output: Value) -> Result<(), StoreError> {
        let mut jobs = self.inner.lock();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !job.is_processing() {
            return Err(StoreError::NotClaimed(id));
        }
        job.state = JobState::Done {
            output,
            ended_at: Utc::now(),
        };
        Ok(())
    }

    async fn fail(&self, id: JobId, failure: JobFailure) -> Result<(), StoreError> {
        let mut jobs = self.inner.lock();
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !job.is_processing() {
            return Err(StoreError::NotClaimed(id));
        }
        job.state = JobState::Failed {
            error: failure,
            ended_at: Utc::now(),
        };
        Ok(())
    }

    async fn remove(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.inner.lock().remove(&id))
    }

    async fn count_pending(&self) -> Result<u64, StoreError> {
        let jobs = self.inner.lock();
        Ok(jobs.values().filter(|job| job.is_pending()).count() as u64)
    }

    async fn count_processing(&self) -> Result<u64, StoreError> {
        let jobs = self.inner.lock();
        Ok(jobs.values().filter(|job| job.is_processing()).count() as u64)
    }

    async fn release(&self, claimant: ClaimantId) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.inner.lock();
        let mut released = 0;
        for job in jobs.values_mut() {
            if job.claimant() == Some(claimant) {
                job.state = JobState::Pending;
                job.abandoned_at = Some(now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        // The contract carries the index requirement for document stores; a
        // map in memory has nothing to build.
        Ok(())
    }
}
