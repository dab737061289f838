pub use ninau_core::{
    Client, ClaimantId, DEFAULT_NAME, DedupKey, InlineSpawner, JobFailure, JobId, JobRecord,
    JobState, JobStore, TokioSpawner, Worker, WorkerBuilder, WorkerWithGracefulShutdown,
};
pub use ninau_core::{client, dedup, job, store, utils, worker};

#[cfg(feature = "memory")]
pub use ninau_memory::MemoryStore;
