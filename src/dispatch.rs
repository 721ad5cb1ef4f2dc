//! Builders for dispatching jobs and chains.
//!
//! [`PendingDispatch`] collects per-dispatch overrides before sending a single
//! job; it is awaited directly:
//!
//! ```rust,no_run
//! # use serde::{Deserialize, Serialize};
//! # use stevedore::{job::{self, Context, Job}, QueueManager};
//! # #[derive(Deserialize, Serialize)]
//! # struct ResizeImage { path: String }
//! # impl Job for ResizeImage {
//! #     const NAME: &'static str = "resize-image";
//! #     async fn handle(&self, _cx: &mut Context) -> job::Result { Ok(()) }
//! # }
//! # async fn run(manager: QueueManager) -> stevedore::manager::Result {
//! let job = ResizeImage { path: "cats.png".into() };
//! manager
//!     .dispatch(job)
//!     .on_queue("images")
//!     .tries(5)
//!     .backoff(vec![1, 10, 60])
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! A chain runs its links one after the other. Only the first link is pushed;
//! the rest of the chain and its callbacks wait in the manager's store until
//! the previous link completes.

use std::future::IntoFuture;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    driver::QueuedJob,
    job::{new_id, Backoff, Delay, Id, Job},
    manager::{Error, QueueManager, Result},
    middleware::BoxFuture,
    payload::StoredJob,
};

/// A job about to be dispatched.
///
/// Nothing is sent until the builder is awaited or
/// [`dispatch`](Self::dispatch)ed.
#[must_use = "a pending dispatch does nothing until awaited"]
#[derive(Debug)]
pub struct PendingDispatch {
    manager: QueueManager,
    job: serde_json::Result<QueuedJob>,
}

impl PendingDispatch {
    pub(crate) fn new(manager: QueueManager, job: serde_json::Result<QueuedJob>) -> Self {
        Self { manager, job }
    }

    fn with(mut self, f: impl FnOnce(&mut QueuedJob)) -> Self {
        if let Ok(job) = &mut self.job {
            f(job);
        }
        self
    }

    /// Sends the job to `connection` instead of the default one.
    pub fn on_connection(self, connection: impl Into<String>) -> Self {
        let connection = connection.into();
        self.with(|job| job.options_mut().connection = Some(connection))
    }

    /// Sends the job to `queue` instead of the connection's default.
    pub fn on_queue(self, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        self.with(|job| job.options_mut().queue = Some(queue))
    }

    /// Delays the job by a span or until a timestamp.
    pub fn delay(self, delay: impl Into<Delay>) -> Self {
        let delay = delay.into();
        self.with(|job| job.options_mut().delay = Some(delay))
    }

    /// Attempts allowed before the job fails. Zero allows any number.
    pub fn tries(self, tries: u32) -> Self {
        self.with(|job| job.options_mut().tries = Some(tries))
    }

    /// Errors allowed before the job fails, however many tries remain.
    pub fn max_exceptions(self, max_exceptions: u32) -> Self {
        self.with(|job| job.options_mut().max_exceptions = Some(max_exceptions))
    }

    /// Execution timeout, in seconds.
    pub fn timeout(self, seconds: u64) -> Self {
        self.with(|job| job.options_mut().timeout = Some(seconds))
    }

    /// Seconds to wait before each retry.
    pub fn backoff(self, backoff: impl Into<Backoff>) -> Self {
        let backoff = backoff.into();
        self.with(|job| job.options_mut().backoff = Some(backoff))
    }

    /// Stops retrying the job after `deadline`.
    pub fn retry_until(self, deadline: Timestamp) -> Self {
        self.with(|job| job.options_mut().retry_until = Some(deadline))
    }

    /// Holds the job until open transactions commit.
    pub fn after_commit(self) -> Self {
        self.with(|job| job.options_mut().after_commit = Some(true))
    }

    /// Pushes the job even when transactions are open.
    pub fn before_commit(self) -> Self {
        self.with(|job| job.options_mut().after_commit = Some(false))
    }

    /// Sends the job to its connection.
    pub async fn dispatch(self) -> Result<Id> {
        self.manager.enqueue(self.job?).await
    }
}

impl IntoFuture for PendingDispatch {
    type Output = Result<Id>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.dispatch())
    }
}

/// The stored remainder of a chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ChainRecord {
    pub(crate) remaining: Vec<StoredJob>,
    #[serde(default)]
    pub(crate) catch: Vec<StoredJob>,
    #[serde(default)]
    pub(crate) finally: Vec<StoredJob>,
}

fn chain_key(id: Uuid) -> String {
    format!("chain:{id}")
}

/// Jobs run one after the other.
///
/// When a link fails permanently the rest of the chain is dropped and the
/// `catch` jobs are dispatched. The `finally` jobs are dispatched once the
/// chain ends either way.
#[must_use = "a pending chain does nothing until dispatched"]
#[derive(Debug)]
pub struct PendingChain {
    manager: QueueManager,
    links: Vec<serde_json::Result<QueuedJob>>,
    catch: Vec<serde_json::Result<QueuedJob>>,
    finally: Vec<serde_json::Result<QueuedJob>>,
    connection: Option<String>,
    queue: Option<String>,
    delay: Option<Delay>,
}

impl PendingChain {
    pub(crate) fn new(manager: QueueManager) -> Self {
        Self {
            manager,
            links: Vec::new(),
            catch: Vec::new(),
            finally: Vec::new(),
            connection: None,
            queue: None,
            delay: None,
        }
    }

    /// Appends a job to the chain.
    pub fn link<J: Job>(mut self, job: J) -> Self {
        self.links.push(QueuedJob::new(job));
        self
    }

    /// Dispatches `job` when a link fails permanently.
    pub fn catch<J: Job>(mut self, job: J) -> Self {
        self.catch.push(QueuedJob::new(job));
        self
    }

    /// Dispatches `job` when the chain ends.
    pub fn finally<J: Job>(mut self, job: J) -> Self {
        self.finally.push(QueuedJob::new(job));
        self
    }

    /// Connection for links which don't name one.
    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    /// Queue for links which don't name one.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Delays the first link.
    pub fn delay(mut self, delay: impl Into<Delay>) -> Self {
        self.delay = Some(delay.into());
        self
    }

    fn stored(&self, jobs: Vec<serde_json::Result<QueuedJob>>) -> Result<Vec<StoredJob>> {
        jobs.into_iter()
            .map(|job| {
                let mut job = job?;
                self.apply_defaults(&mut job);
                Ok(job.stored())
            })
            .collect()
    }

    fn apply_defaults(&self, job: &mut QueuedJob) {
        let options = job.options_mut();
        if options.connection.is_none() {
            options.connection.clone_from(&self.connection);
        }
        if options.queue.is_none() {
            options.queue.clone_from(&self.queue);
        }
    }

    /// Stores the chain and pushes its first link.
    #[instrument(skip(self), fields(chain.id = tracing::field::Empty), err)]
    pub async fn dispatch(mut self) -> Result<Id> {
        let mut links = std::mem::take(&mut self.links).into_iter();
        let Some(first) = links.next() else {
            return Err(Error::EmptyChain);
        };
        let mut first = first?;
        self.apply_defaults(&mut first);

        let catch = std::mem::take(&mut self.catch);
        let finally = std::mem::take(&mut self.finally);
        let record = ChainRecord {
            remaining: self.stored(links.collect())?,
            catch: self.stored(catch)?,
            finally: self.stored(finally)?,
        };

        let chain_id = new_id();
        tracing::Span::current().record("chain.id", chain_id.to_string());

        self.manager
            .store()
            .put(&chain_key(chain_id), serde_json::to_value(&record)?, None)
            .await?;

        first.chain_id = Some(chain_id);
        if let Some(delay) = self.delay {
            first.options_mut().delay = Some(delay);
        }

        self.manager.enqueue(first).await
    }
}

async fn load_chain(manager: &QueueManager, chain_id: Uuid) -> Result<Option<ChainRecord>> {
    match manager.store().get(&chain_key(chain_id)).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

async fn dispatch_all(manager: &QueueManager, jobs: &[StoredJob]) -> Result {
    for job in jobs {
        manager.dispatch_stored(job).await?;
    }
    Ok(())
}

/// Pushes the next link of a chain whose current link completed, or runs the
/// `finally` jobs after the last one.
#[instrument(skip(manager), err)]
pub(crate) async fn advance_chain(manager: &QueueManager, chain_id: Uuid) -> Result {
    let Some(mut record) = load_chain(manager, chain_id).await? else {
        tracing::warn!("Chain record is missing; nothing to advance");
        return Ok(());
    };

    if record.remaining.is_empty() {
        manager.store().forget(&chain_key(chain_id)).await?;
        tracing::debug!("Chain completed");
        return dispatch_all(manager, &record.finally).await;
    }

    let next = record.remaining.remove(0);
    manager
        .store()
        .put(&chain_key(chain_id), serde_json::to_value(&record)?, None)
        .await?;

    let mut job = manager.queued_from(&next)?;
    job.chain_id = Some(chain_id);
    manager.enqueue(job).await?;

    Ok(())
}

/// Drops the rest of a chain whose current link failed permanently and
/// dispatches its `catch` and `finally` jobs.
#[instrument(skip(manager), err)]
pub(crate) async fn fail_chain(manager: &QueueManager, chain_id: Uuid) -> Result {
    let Some(record) = load_chain(manager, chain_id).await? else {
        return Ok(());
    };
    manager.store().forget(&chain_key(chain_id)).await?;

    tracing::debug!(dropped = record.remaining.len(), "Chain failed");
    dispatch_all(manager, &record.catch).await?;
    dispatch_all(manager, &record.finally).await
}
