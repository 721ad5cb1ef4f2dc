//! Storage drivers for queued jobs.
//!
//! A [`QueueDriver`] persists job payloads and hands them out to workers.
//! Drivers guarantee that a record is claimed by at most one worker at a
//! time; a claim older than the connection's `retry_after` is considered
//! abandoned and the record becomes claimable again. Delivery is therefore
//! at-least-once.
//!
//! The crate ships four drivers:
//!
//! - [`SyncDriver`] runs jobs immediately, in the dispatching task.
//! - [`MemoryDriver`] keeps records in process memory.
//! - [`DatabaseDriver`] keeps records in the PostgreSQL `jobs` table.
//! - [`NullDriver`] discards everything.

use std::sync::Arc;

use async_trait::async_trait;
use jiff::{Span, Timestamp};
use serde_json::Value;
use uuid::Uuid;

pub use self::{
    database::DatabaseDriver,
    memory::MemoryDriver,
    null::NullDriver,
    sync::{SyncDriver, SyncExecutor},
};
pub(crate) use self::sync::run_in_process;
use crate::{
    job::{self, new_id, Delay, Id, Job, JobHandler, Options, RegisteredJob},
    payload::{JobPayload, StoredJob},
};

mod database;
mod memory;
mod null;
mod sync;

/// A type alias for driver results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Driver errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate when encoding a payload.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error returned by the `jiff` crate when computing availability.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// A job run by the sync driver failed.
    #[error(transparent)]
    Job(#[from] job::Error),
}

/// A job wrapped for dispatch.
///
/// The job is serialized as soon as it is wrapped; dispatch options and
/// batch or chain membership are attached before it reaches a driver.
#[derive(Clone)]
pub struct QueuedJob {
    pub(crate) id: Id,
    pub(crate) handler: Arc<dyn JobHandler>,
    pub(crate) data: Value,
    pub(crate) options: Options,
    pub(crate) batch_id: Option<Uuid>,
    pub(crate) chain_id: Option<Uuid>,
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob")
            .field("id", &self.id)
            .field("job", &self.handler.name())
            .field("options", &self.options)
            .field("batch_id", &self.batch_id)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl QueuedJob {
    /// Wraps `job` with the options it declares.
    pub fn new<J: Job>(job: J) -> serde_json::Result<Self> {
        Self::from_handler(Arc::new(RegisteredJob::new(job)))
    }

    pub(crate) fn from_handler(handler: Arc<dyn JobHandler>) -> serde_json::Result<Self> {
        let data = handler.data()?;
        let options = handler.options();
        Ok(Self {
            id: new_id(),
            handler,
            data,
            options,
            batch_id: None,
            chain_id: None,
        })
    }

    /// The identifier the job keeps for its whole life.
    pub fn id(&self) -> Id {
        self.id
    }

    /// The job's registered name.
    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    /// Dispatch options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// The job as data, without its identity or membership.
    pub(crate) fn stored(&self) -> StoredJob {
        StoredJob {
            job: self.handler.name().to_string(),
            data: self.data.clone(),
            options: self.options.clone(),
        }
    }

    /// Builds the envelope pushed to storage.
    pub fn payload(&self) -> JobPayload {
        JobPayload {
            uuid: self.id,
            display_name: self.handler.display_name(),
            job: self.handler.name().to_string(),
            data: self.data.clone(),
            max_tries: self.options.tries,
            max_exceptions: self.options.max_exceptions,
            fail_on_timeout: self.options.fail_on_timeout,
            backoff: self.options.backoff.clone(),
            timeout: self.options.timeout,
            retry_until: self.options.retry_until,
            attempts: 0,
            after_commit: self.options.after_commit.unwrap_or(false),
            pushed_at: Timestamp::now(),
            batch_id: self.batch_id,
            chain_id: self.chain_id,
        }
    }
}

/// Options for [`QueueDriver::push_raw`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PushOptions {
    /// When the record becomes claimable; immediately when unset.
    pub available_at: Option<Timestamp>,

    /// Attempts already made.
    pub attempts: u32,
}

/// A record claimed by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserved {
    /// Storage id of the record.
    pub id: i64,
    /// Queue the record was claimed from.
    pub queue: String,
    /// Encoded [`JobPayload`].
    pub payload: String,
    /// Attempts made, including the current claim.
    pub attempts: u32,
    /// When the record was claimed.
    pub reserved_at: Timestamp,
    /// When the record became claimable.
    pub available_at: Timestamp,
    /// When the record was first stored.
    pub created_at: Timestamp,
}

/// Storage backend for queued jobs.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Stores a job for immediate processing and returns its id.
    async fn push(&self, job: QueuedJob, queue: Option<&str>) -> Result<Id> {
        let id = job.id();
        let payload = job.payload().encode()?;
        self.push_raw(payload, queue, PushOptions::default()).await?;
        Ok(id)
    }

    /// Stores an already-serialized payload.
    async fn push_raw(&self, payload: String, queue: Option<&str>, options: PushOptions)
        -> Result;

    /// Stores a job which becomes claimable after `delay`.
    async fn later(&self, delay: Delay, job: QueuedJob, queue: Option<&str>) -> Result<Id> {
        let id = job.id();
        let payload = job.payload().encode()?;
        let available_at = delay.available_at(Timestamp::now())?;
        self.push_raw(
            payload,
            queue,
            PushOptions {
                available_at: Some(available_at),
                attempts: 0,
            },
        )
        .await?;
        Ok(id)
    }

    /// Stores several jobs.
    async fn bulk(&self, jobs: Vec<QueuedJob>, queue: Option<&str>) -> Result<Vec<Id>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.push(job, queue).await?);
        }
        Ok(ids)
    }

    /// Claims the oldest eligible record on `queue`, incrementing its
    /// attempts.
    async fn pop(&self, queue: Option<&str>) -> Result<Option<Reserved>>;

    /// Unclaims a record, making it claimable again after `delay`.
    async fn release(&self, id: i64, delay: Span) -> Result;

    /// Removes a record.
    async fn delete(&self, id: i64) -> Result;

    /// Removes every record on `queue`, returning how many were removed.
    async fn clear(&self, queue: Option<&str>) -> Result<u64>;

    /// Number of records on `queue`, claimed or not.
    async fn size(&self, queue: Option<&str>) -> Result<u64>;
}
