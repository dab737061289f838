//! Client surface: dispatch jobs, look them up, poll for results, count.
//!
//! A client is a thin handle over the store adapter. It validates what the
//! caller hands over, computes dedup keys, and otherwise delegates straight
//! to the store's atomic operations; store failures propagate to the caller
//! untouched.

use serde_json::Value;

use crate::dedup::DedupKey;
use crate::job::{DEFAULT_NAME, JobId, JobRecord};
use crate::store::JobStore;
use crate::utils::{DEFAULT_DELAY, IntervalError, IntoInterval};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categories of failures a client call can surface.
pub enum ErrorKind {
    /// The caller supplied a name, payload or interval the queue cannot use.
    Input,
    /// The underlying store call failed.
    Store,
}

/// Error type returned by [`Client`] operations.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn input(message: &'static str) -> Self {
        Self {
            kind: ErrorKind::Input,
            inner: Box::new(InputViolation(message)),
        }
    }

    fn store<E>(error: E) -> Self
    where
        E: std::error::Error + Send + 'static,
    {
        Self {
            kind: ErrorKind::Store,
            inner: Box::new(error),
        }
    }
}

impl From<IntervalError> for Error {
    fn from(error: IntervalError) -> Self {
        Self {
            kind: ErrorKind::Input,
            inner: Box::new(error),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct InputViolation(&'static str);

impl std::fmt::Display for InputViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for InputViolation {}

/// Handle for dispatching jobs and observing their results.
///
/// Holds exactly one store handle, fixed at construction. Cheap to clone
/// when the store handle is.
#[derive(Debug, Clone)]
pub struct Client<S> {
    store: S,
    delay: std::time::Duration,
}

impl<S> Client<S> {
    /// Bind a client to its store handle.
    pub fn new(store: S) -> Self {
        Self {
            store,
            delay: DEFAULT_DELAY,
        }
    }

    /// Set the interval the plain poll calls sleep between fetches.
    /// Defaults to one second.
    pub fn delay(self, interval: impl IntoInterval) -> Result<Self, Error> {
        Ok(Self {
            delay: interval.into_interval()?,
            ..self
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> Client<S>
where
    S: JobStore + Sync,
{
    /// Dispatch a job under `name`, or return the pending record an
    /// equivalent earlier dispatch already created.
    ///
    /// Deduplication only spans the pending state: once the earlier record
    /// is claimed or terminal, an equivalent dispatch creates a new record.
    pub async fn dispatch(&self, name: &str, input: Value) -> Result<JobRecord, Error> {
        let dedup_key = check_args(name, &input)?;
        self.store
            .dispatch(name, &input, dedup_key)
            .await
            .map_err(Error::store)
    }

    /// Dispatch under the default handler name.
    pub async fn dispatch_default(&self, input: Value) -> Result<JobRecord, Error> {
        self.dispatch(DEFAULT_NAME, input).await
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, Error> {
        self.store.get(id).await.map_err(Error::store)
    }

    /// Newest record matching `(name, input)` regardless of state.
    pub async fn latest(&self, name: &str, input: &Value) -> Result<Option<JobRecord>, Error> {
        let dedup_key = check_args(name, input)?;
        self.store
            .latest(name, dedup_key)
            .await
            .map_err(Error::store)
    }

    /// Block until the record carries an output or an error, fetching every
    /// configured delay. Never gives up; bounding the wait is the caller's
    /// responsibility.
    pub async fn poll_by_id(&self, id: JobId) -> Result<JobRecord, Error> {
        self.poll_by_id_every(id, self.delay).await
    }

    /// Like [`Client::poll_by_id`] with an explicit interval.
    pub async fn poll_by_id_every(
        &self,
        id: JobId,
        interval: impl IntoInterval,
    ) -> Result<JobRecord, Error> {
        let interval = interval.into_interval()?;
        loop {
            if let Some(job) = self.get(id).await? {
                if job.is_terminal() {
                    return Ok(job);
                }
            }
            futures_timer::Delay::new(interval).await;
        }
    }

    /// Block until the newest record for `(name, input)` is terminal.
    pub async fn poll_latest(&self, name: &str, input: &Value) -> Result<JobRecord, Error> {
        self.poll_latest_every(name, input, self.delay).await
    }

    /// Like [`Client::poll_latest`] with an explicit interval.
    pub async fn poll_latest_every(
        &self,
        name: &str,
        input: &Value,
        interval: impl IntoInterval,
    ) -> Result<JobRecord, Error> {
        let interval = interval.into_interval()?;
        let dedup_key = check_args(name, input)?;
        loop {
            let found = self
                .store
                .latest(name, dedup_key)
                .await
                .map_err(Error::store)?;
            if let Some(job) = found {
                if job.is_terminal() {
                    return Ok(job);
                }
            }
            futures_timer::Delay::new(interval).await;
        }
    }

    /// Number of records currently pending.
    pub async fn count_pending(&self) -> Result<u64, Error> {
        self.store.count_pending().await.map_err(Error::store)
    }

    /// Number of records currently claimed and unfinished.
    pub async fn count_processing(&self) -> Result<u64, Error> {
        self.store.count_processing().await.map_err(Error::store)
    }

    /// Ask the store to build the sparse marker indexes.
    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        self.store.ensure_indexes().await.map_err(Error::store)
    }
}

/// Validate a dispatch/lookup argument pair and derive its dedup key.
fn check_args(name: &str, input: &Value) -> Result<DedupKey, Error> {
    if name.is_empty() {
        return Err(Error::input("job name must not be empty"));
    }
    if !input.is_object() && !input.is_array() {
        return Err(Error::input(
            "job input must be a structured payload (object or array)",
        ));
    }
    Ok(DedupKey::compute(name, input))
}
