//! Job coordination over a shared document store, with no broker in between.
//!
//! Independent processes pull work from one mutable store that offers a
//! single primitive worth trusting: an atomic find-one-and-update. On top of
//! that this crate builds the whole job lifecycle:
//!
//! - [`Client::dispatch`] creates a pending record, or returns the existing
//!   one when equivalent work is already pending (dedup by name + canonical
//!   input digest);
//! - [`Worker`] claims pending records atomically, so exactly one process
//!   wins each job, runs the registered handler under a local concurrency
//!   cap, and publishes the output or the failure back onto the record;
//! - [`Client::poll_by_id`] / [`Client::poll_latest`] block any process,
//!   dispatcher or observer, until a record turns terminal;
//! - [`worker::reap`] returns claims orphaned by a stopped process to the
//!   pending pool.
//!
//! The store itself stays behind the [`store::JobStore`] trait; adapters own
//! atomicity, timestamps and the sparse-field document encoding.

pub mod client;
pub mod dedup;
pub mod job;
pub mod store;
pub mod utils;
pub mod worker;

#[cfg(feature = "rt-tokio")]
mod tokio_spawner;
#[cfg(feature = "rt-tokio")]
pub use tokio_spawner::TokioSpawner;

pub use client::Client;
pub use dedup::DedupKey;
pub use job::{ClaimantId, DEFAULT_NAME, JobFailure, JobId, JobRecord, JobState};
pub use store::JobStore;
pub use worker::{InlineSpawner, Worker, WorkerBuilder, WorkerWithGracefulShutdown};
