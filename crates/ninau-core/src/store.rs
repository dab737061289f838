//! Store adapter contract: the atomic primitives the protocol rides on.
//!
//! The queue never sees the store's wire protocol or query language. It asks
//! for a handful of operations, and the one property everything else depends
//! on is that each mutating call is a single atomic read-modify-write at the
//! store. In particular, [`JobStore::claim`] must guarantee that of any
//! number of concurrent callers, at most one observes a given record's
//! transition out of pending.

mod tmp {
    use serde_json::Value;

    use crate::dedup::DedupKey;
    use crate::job::{ClaimantId, JobFailure, JobId, JobRecord};

    /// Document-store adapter the queue coordinates through.
    ///
    /// Implementations stamp `created_at`, `started_at`, `ended_at` and
    /// `abandoned_at` themselves, inside the same atomic step as the state
    /// transition they belong to.
    ///
    /// Finalization calls (`succeed`, `fail`) are only made by the worker
    /// holding the claim; applying one to a record that is not currently
    /// claimed is a protocol violation an adapter should reject.
    #[trait_variant::make(JobStore: Send)]
    pub trait LocalJobStore {
        type Error: std::error::Error + Send + 'static;

        /// Atomic find-or-create on `{name, dedup_key, pending}`.
        ///
        /// While an equivalent record is still pending, returns it; otherwise
        /// creates a fresh pending record. This is the only deduplication the
        /// protocol offers: records that left the pending state never absorb
        /// new dispatches.
        async fn dispatch(
            &self,
            name: &str,
            input: &Value,
            dedup_key: DedupKey,
        ) -> Result<JobRecord, Self::Error>;

        /// Atomically claim the oldest pending record whose name is in
        /// `names` and return its post-claim form.
        ///
        /// Oldest means smallest `(created_at, id)`; the id is the
        /// deterministic tie-break. `None` when nothing matches.
        async fn claim(
            &self,
            names: &[String],
            claimant: ClaimantId,
        ) -> Result<Option<JobRecord>, Self::Error>;

        async fn get(&self, id: JobId) -> Result<Option<JobRecord>, Self::Error>;

        /// Newest record matching `(name, dedup_key)` regardless of state.
        async fn latest(
            &self,
            name: &str,
            dedup_key: DedupKey,
        ) -> Result<Option<JobRecord>, Self::Error>;

        /// Publish a successful result: claimed to done.
        async fn succeed(&self, id: JobId, output: Value) -> Result<(), Self::Error>;

        /// Publish a failure: claimed to failed.
        async fn fail(&self, id: JobId, failure: JobFailure) -> Result<(), Self::Error>;

        /// Atomic find-and-remove, used by dispose-on-success workers.
        async fn remove(&self, id: JobId) -> Result<Option<JobRecord>, Self::Error>;

        async fn count_pending(&self) -> Result<u64, Self::Error>;

        async fn count_processing(&self) -> Result<u64, Self::Error>;

        /// Return every record claimed under `claimant` to the pending pool,
        /// stamping `abandoned_at`. Returns how many records were released.
        ///
        /// This is the crash-recovery primitive: the only path by which work
        /// orphaned by a dead process becomes claimable again.
        async fn release(&self, claimant: ClaimantId) -> Result<u64, Self::Error>;

        /// Create the sparse, background-built indexes the claim and count
        /// queries filter on: one over the pending marker, one over the
        /// processing marker. A no-op where the backing store needs none.
        async fn ensure_indexes(&self) -> Result<(), Self::Error>;
    }
}

pub use tmp::JobStore;
