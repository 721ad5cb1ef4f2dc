//! Groups of jobs tracked as a unit.
//!
//! A batch counts its pending and failed jobs in a [`BatchRepository`]. As
//! workers finish batched jobs they report back through
//! [`Batch::record_successful_job`] and [`Batch::record_failed_job`], which
//! dispatch the batch's callbacks:
//!
//! - `catch` jobs after each failure,
//! - `then` jobs once every job has run without failures,
//! - `finally` jobs once every job has run, whatever the outcome.
//!
//! Callbacks are jobs themselves, so they run wherever workers run.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use jiff::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, PgPool};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    driver::{self, QueuedJob},
    job::{new_id, Id, Job},
    manager::{self, QueueManager},
    payload::StoredJob,
};

/// A type alias for batch repository results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Batch errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),

    /// The batch was deleted or never stored.
    #[error("Batch `{0}` does not exist.")]
    NotFound(Uuid),
}

/// Callbacks and failure policy of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchOptions {
    /// Keep running the batch after a job fails.
    pub allow_failures: bool,
    /// Dispatched once every job ran without failures.
    pub then: Vec<StoredJob>,
    /// Dispatched after each failed job.
    pub catch: Vec<StoredJob>,
    /// Dispatched once every job ran, whatever the outcome.
    pub finally: Vec<StoredJob>,
}

/// Counters after a job was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    /// Jobs which have not reported back yet.
    pub pending_jobs: u32,
    /// Jobs which failed.
    pub failed_jobs: u32,
}

/// A batch as last read from its repository.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Unique batch id.
    pub id: Uuid,
    /// Name given when the batch was dispatched.
    pub name: String,
    /// Jobs dispatched with the batch.
    pub total_jobs: u32,
    /// Jobs which have not reported back yet.
    pub pending_jobs: u32,
    /// Jobs which failed.
    pub failed_jobs: u32,
    /// Ids of the failed jobs, in the order they failed.
    pub failed_job_ids: Vec<Id>,
    /// Callbacks and failure policy.
    pub options: BatchOptions,
    /// When the batch was stored.
    pub created_at: Timestamp,
    /// When the batch was cancelled, if it was.
    pub cancelled_at: Option<Timestamp>,
    /// When every job had reported back, if they all have.
    pub finished_at: Option<Timestamp>,
}

impl Batch {
    fn new(name: String, total_jobs: u32, options: BatchOptions) -> Self {
        Self {
            id: new_id(),
            name,
            total_jobs,
            pending_jobs: total_jobs,
            failed_jobs: 0,
            failed_job_ids: Vec::new(),
            options,
            created_at: Timestamp::now(),
            cancelled_at: None,
            finished_at: None,
        }
    }

    /// Jobs which ran, successfully or not.
    pub fn processed_jobs(&self) -> u32 {
        self.total_jobs.saturating_sub(self.pending_jobs)
    }

    /// Percentage of processed jobs, rounded down.
    pub fn progress(&self) -> u32 {
        if self.total_jobs == 0 {
            return 0;
        }
        self.processed_jobs() * 100 / self.total_jobs
    }

    /// Returns `true` once every job has reported back.
    pub fn finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Returns `true` if the batch was cancelled.
    pub fn cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    /// Returns `true` if any job failed.
    pub fn has_failures(&self) -> bool {
        self.failed_jobs > 0
    }

    /// Returns `true` if the batch keeps running after failures.
    pub fn allows_failures(&self) -> bool {
        self.options.allow_failures
    }

    /// Re-reads the batch.
    pub async fn fresh(&self, repository: &dyn BatchRepository) -> Result<Self> {
        repository
            .find(self.id)
            .await?
            .ok_or(Error::NotFound(self.id))
    }

    /// Cancels the batch. Jobs of a cancelled batch still waiting on a queue
    /// are skipped by workers.
    pub async fn cancel(&self, repository: &dyn BatchRepository) -> Result {
        repository.cancel(self.id).await
    }

    /// Removes the batch. Returns `true` if it existed.
    pub async fn delete(&self, repository: &dyn BatchRepository) -> Result<bool> {
        repository.delete(self.id).await
    }

    /// Records a job which completed and dispatches `then` and `finally` when
    /// it was the last one.
    #[instrument(skip(self, manager), fields(batch.id = %self.id), err)]
    pub async fn record_successful_job(&self, manager: &QueueManager, job_id: Id) -> manager::Result {
        let repository = manager.batches();
        let counts = repository.record_success(self.id, job_id).await?;

        if counts.pending_jobs == 0 && repository.mark_as_finished(self.id).await? {
            let batch = self.fresh(repository.as_ref()).await?;
            tracing::info!(failed = batch.failed_jobs, "Batch finished");

            if !batch.has_failures() && !batch.cancelled() {
                dispatch_callbacks(manager, "then", &batch.options.then).await;
            }
            dispatch_callbacks(manager, "finally", &batch.options.finally).await;
        }

        Ok(())
    }

    /// Records a job which failed permanently, cancelling the batch unless it
    /// allows failures.
    #[instrument(skip(self, manager), fields(batch.id = %self.id), err)]
    pub async fn record_failed_job(&self, manager: &QueueManager, job_id: Id) -> manager::Result {
        let repository = manager.batches();

        if !self.allows_failures() {
            repository.cancel(self.id).await?;
        }

        let counts = repository.record_failure(self.id, job_id).await?;
        dispatch_callbacks(manager, "catch", &self.options.catch).await;

        if counts.pending_jobs == 0 && repository.mark_as_finished(self.id).await? {
            tracing::info!(failed = counts.failed_jobs, "Batch finished");
            dispatch_callbacks(manager, "finally", &self.options.finally).await;
        }

        Ok(())
    }
}

async fn dispatch_callbacks(manager: &QueueManager, kind: &str, jobs: &[StoredJob]) {
    for job in jobs {
        if let Err(err) = manager.dispatch_stored(job).await {
            tracing::error!(callback = kind, job = %job.job, %err, "Failed to dispatch batch callback");
        }
    }
}

/// Storage for batch state.
///
/// Counter updates must be atomic: workers on different machines report
/// into the same batch concurrently.
#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// Stores a new batch.
    async fn store(&self, batch: &Batch) -> Result;

    /// Returns the batch, if it exists.
    async fn find(&self, id: Uuid) -> Result<Option<Batch>>;

    /// Decrements the pending count.
    async fn record_success(&self, id: Uuid, job_id: Id) -> Result<Counts>;

    /// Decrements the pending count and records the failed job.
    async fn record_failure(&self, id: Uuid, job_id: Id) -> Result<Counts>;

    /// Sets the finish time. Returns `true` only for the call which set it.
    async fn mark_as_finished(&self, id: Uuid) -> Result<bool>;

    /// Sets the cancellation time, unless already set.
    async fn cancel(&self, id: Uuid) -> Result;

    /// Removes the batch. Returns `true` if it existed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Removes batches which finished before `before`.
    async fn prune(&self, before: Timestamp) -> Result<u64>;
}

/// A [`BatchRepository`] in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBatchRepository {
    batches: Arc<Mutex<HashMap<Uuid, Batch>>>,
}

impl MemoryBatchRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut Batch) -> T) -> Result<T> {
        let mut batches = self.batches.lock();
        let batch = batches.get_mut(&id).ok_or(Error::NotFound(id))?;
        Ok(f(batch))
    }
}

#[async_trait]
impl BatchRepository for MemoryBatchRepository {
    async fn store(&self, batch: &Batch) -> Result {
        self.batches.lock().insert(batch.id, batch.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Batch>> {
        Ok(self.batches.lock().get(&id).cloned())
    }

    async fn record_success(&self, id: Uuid, _job_id: Id) -> Result<Counts> {
        self.update(id, |batch| {
            batch.pending_jobs = batch.pending_jobs.saturating_sub(1);
            Counts {
                pending_jobs: batch.pending_jobs,
                failed_jobs: batch.failed_jobs,
            }
        })
    }

    async fn record_failure(&self, id: Uuid, job_id: Id) -> Result<Counts> {
        self.update(id, |batch| {
            batch.pending_jobs = batch.pending_jobs.saturating_sub(1);
            batch.failed_jobs += 1;
            batch.failed_job_ids.push(job_id);
            Counts {
                pending_jobs: batch.pending_jobs,
                failed_jobs: batch.failed_jobs,
            }
        })
    }

    async fn mark_as_finished(&self, id: Uuid) -> Result<bool> {
        self.update(id, |batch| {
            if batch.finished_at.is_some() {
                return false;
            }
            batch.finished_at = Some(Timestamp::now());
            true
        })
    }

    async fn cancel(&self, id: Uuid) -> Result {
        self.update(id, |batch| {
            batch.cancelled_at.get_or_insert_with(Timestamp::now);
        })
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.batches.lock().remove(&id).is_some())
    }

    async fn prune(&self, before: Timestamp) -> Result<u64> {
        let mut batches = self.batches.lock();
        let len = batches.len();
        batches.retain(|_, batch| batch.finished_at.map_or(true, |at| at >= before));
        Ok((len - batches.len()) as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    name: String,
    total_jobs: i32,
    pending_jobs: i32,
    failed_jobs: i32,
    failed_job_ids: Json<Vec<Uuid>>,
    options: Json<BatchOptions>,
    created_at: i64,
    cancelled_at: Option<i64>,
    finished_at: Option<i64>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = jiff::Error;

    fn try_from(row: BatchRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            total_jobs: row.total_jobs.max(0) as u32,
            pending_jobs: row.pending_jobs.max(0) as u32,
            failed_jobs: row.failed_jobs.max(0) as u32,
            failed_job_ids: row.failed_job_ids.0,
            options: row.options.0,
            created_at: Timestamp::from_second(row.created_at)?,
            cancelled_at: row.cancelled_at.map(Timestamp::from_second).transpose()?,
            finished_at: row.finished_at.map(Timestamp::from_second).transpose()?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CountsRow {
    pending_jobs: i32,
    failed_jobs: i32,
}

impl From<CountsRow> for Counts {
    fn from(row: CountsRow) -> Self {
        Self {
            pending_jobs: row.pending_jobs.max(0) as u32,
            failed_jobs: row.failed_jobs.max(0) as u32,
        }
    }
}

/// A [`BatchRepository`] backed by the `job_batches` table.
#[derive(Debug, Clone)]
pub struct DatabaseBatchRepository {
    pool: PgPool,
}

impl DatabaseBatchRepository {
    /// Creates a repository over the `job_batches` table.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchRepository for DatabaseBatchRepository {
    #[instrument(skip(self, batch), fields(batch.id = %batch.id), err)]
    async fn store(&self, batch: &Batch) -> Result {
        sqlx::query(
            r#"
            insert into job_batches (
              id,
              name,
              total_jobs,
              pending_jobs,
              failed_jobs,
              failed_job_ids,
              options,
              created_at
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(batch.id)
        .bind(&batch.name)
        .bind(batch.total_jobs as i32)
        .bind(batch.pending_jobs as i32)
        .bind(batch.failed_jobs as i32)
        .bind(Json(&batch.failed_job_ids))
        .bind(Json(&batch.options))
        .bind(batch.created_at.as_second())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn find(&self, id: Uuid) -> Result<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            select
              id,
              name,
              total_jobs,
              pending_jobs,
              failed_jobs,
              failed_job_ids,
              options,
              created_at,
              cancelled_at,
              finished_at
            from job_batches
            where id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Batch::try_from).transpose()?)
    }

    #[instrument(skip(self), err)]
    async fn record_success(&self, id: Uuid, _job_id: Id) -> Result<Counts> {
        let row = sqlx::query_as::<_, CountsRow>(
            r#"
            update job_batches
            set pending_jobs = greatest(pending_jobs - 1, 0)
            where id = $1
            returning pending_jobs, failed_jobs
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Counts::from).ok_or(Error::NotFound(id))
    }

    #[instrument(skip(self), err)]
    async fn record_failure(&self, id: Uuid, job_id: Id) -> Result<Counts> {
        let row = sqlx::query_as::<_, CountsRow>(
            r#"
            update job_batches
            set pending_jobs = greatest(pending_jobs - 1, 0),
                failed_jobs = failed_jobs + 1,
                failed_job_ids = failed_job_ids || to_jsonb($2::text)
            where id = $1
            returning pending_jobs, failed_jobs
            "#,
        )
        .bind(id)
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Counts::from).ok_or(Error::NotFound(id))
    }

    #[instrument(skip(self), err)]
    async fn mark_as_finished(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            update job_batches
            set finished_at = $2
            where id = $1 and finished_at is null
            "#,
        )
        .bind(id)
        .bind(Timestamp::now().as_second())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: Uuid) -> Result {
        sqlx::query(
            r#"
            update job_batches
            set cancelled_at = coalesce(cancelled_at, $2)
            where id = $1
            "#,
        )
        .bind(id)
        .bind(Timestamp::now().as_second())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("delete from job_batches where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn prune(&self, before: Timestamp) -> Result<u64> {
        let result = sqlx::query(
            r#"
            delete from job_batches
            where finished_at is not null and finished_at < $1
            "#,
        )
        .bind(before.as_second())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// A batch about to be dispatched.
#[must_use = "a pending batch does nothing until dispatched"]
#[derive(Debug)]
pub struct PendingBatch {
    manager: QueueManager,
    name: String,
    jobs: Vec<serde_json::Result<QueuedJob>>,
    then: Vec<serde_json::Result<QueuedJob>>,
    catch: Vec<serde_json::Result<QueuedJob>>,
    finally: Vec<serde_json::Result<QueuedJob>>,
    allow_failures: bool,
    connection: Option<String>,
    queue: Option<String>,
}

impl PendingBatch {
    pub(crate) fn new(manager: QueueManager, name: String) -> Self {
        Self {
            manager,
            name,
            jobs: Vec::new(),
            then: Vec::new(),
            catch: Vec::new(),
            finally: Vec::new(),
            allow_failures: false,
            connection: None,
            queue: None,
        }
    }

    /// Adds `job` to the batch.
    pub fn add<J: Job>(mut self, job: J) -> Self {
        self.jobs.push(QueuedJob::new(job));
        self
    }

    /// Dispatches `job` once every job ran without failures.
    pub fn then<J: Job>(mut self, job: J) -> Self {
        self.then.push(QueuedJob::new(job));
        self
    }

    /// Dispatches `job` after each failure.
    pub fn catch<J: Job>(mut self, job: J) -> Self {
        self.catch.push(QueuedJob::new(job));
        self
    }

    /// Dispatches `job` once every job ran.
    pub fn finally<J: Job>(mut self, job: J) -> Self {
        self.finally.push(QueuedJob::new(job));
        self
    }

    /// Keep running the batch after a job fails.
    pub fn allow_failures(mut self) -> Self {
        self.allow_failures = true;
        self
    }

    /// Connection for jobs and callbacks which don't name one.
    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    /// Queue for jobs and callbacks which don't name one.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
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

    fn stored(&self, jobs: Vec<serde_json::Result<QueuedJob>>) -> manager::Result<Vec<StoredJob>> {
        jobs.into_iter()
            .map(|job| {
                let mut job = job?;
                self.apply_defaults(&mut job);
                Ok(job.stored())
            })
            .collect()
    }

    /// Stores the batch and dispatches every job in it.
    #[instrument(skip(self), fields(batch.name = %self.name, batch.id = tracing::field::Empty), err)]
    pub async fn dispatch(mut self) -> manager::Result<Batch> {
        if self.jobs.is_empty() {
            return Err(manager::Error::EmptyBatch);
        }

        let jobs = std::mem::take(&mut self.jobs)
            .into_iter()
            .collect::<serde_json::Result<Vec<_>>>()?;

        let then = std::mem::take(&mut self.then);
        let catch = std::mem::take(&mut self.catch);
        let finally = std::mem::take(&mut self.finally);
        let options = BatchOptions {
            allow_failures: self.allow_failures,
            then: self.stored(then)?,
            catch: self.stored(catch)?,
            finally: self.stored(finally)?,
        };

        let batch = Batch::new(self.name.clone(), jobs.len() as u32, options);
        tracing::Span::current().record("batch.id", batch.id.to_string());

        let repository = self.manager.batches();
        repository.store(&batch).await?;

        for mut job in jobs {
            self.apply_defaults(&mut job);
            job.batch_id = Some(batch.id);
            match self.manager.enqueue(job).await {
                Ok(_) => {}
                // Jobs run on push have already reported their failure to the
                // batch, so the remaining jobs still go out.
                Err(manager::Error::Driver(driver::Error::Job(err))) => {
                    tracing::warn!(batch.id = %batch.id, %err, "Batched job failed while running synchronously");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(repository.find(batch.id).await?.unwrap_or(batch))
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;
    use crate::{
        job::{self, Context},
        manager::{Config, ConnectionConfig},
        payload::JobPayload,
    };

    #[derive(Debug, Deserialize, Serialize)]
    struct Import(u32);

    impl Job for Import {
        const NAME: &'static str = "import";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Ok(())
        }
    }

    #[derive(Debug, Deserialize, Serialize)]
    struct Notify(String);

    impl Job for Notify {
        const NAME: &'static str = "notify";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Ok(())
        }
    }

    fn manager() -> QueueManager {
        let config = Config::new("memory").connection("memory", ConnectionConfig::new("memory"));
        QueueManager::builder(config)
            .register::<Import>()
            .register::<Notify>()
            .build()
    }

    async fn drain(manager: &QueueManager, queue: &str) -> Vec<JobPayload> {
        let driver = manager.connection(None).unwrap();
        let mut payloads = Vec::new();
        while let Some(record) = driver.pop(Some(queue)).await.unwrap() {
            driver.delete(record.id).await.unwrap();
            payloads.push(JobPayload::decode(&record.payload).unwrap());
        }
        payloads
    }

    fn callbacks(payloads: &[JobPayload]) -> Vec<String> {
        payloads
            .iter()
            .filter(|payload| payload.job == "notify")
            .filter_map(|payload| payload.data.as_str().map(str::to_string))
            .collect()
    }

    async fn dispatch_imports(manager: &QueueManager, allow_failures: bool) -> Batch {
        let mut pending = manager
            .batch("imports")
            .add(Import(1))
            .add(Import(2))
            .then(Notify("then".into()))
            .catch(Notify("catch".into()))
            .finally(Notify("finally".into()))
            .on_queue("imports");
        if allow_failures {
            pending = pending.allow_failures();
        }
        pending.dispatch().await.unwrap()
    }

    #[tokio::test]
    async fn empty_batch_is_an_error() {
        let manager = manager();
        assert!(matches!(
            manager.batch("empty").dispatch().await,
            Err(manager::Error::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn jobs_are_tagged_with_the_batch() -> manager::Result {
        let manager = manager();
        let batch = dispatch_imports(&manager, false).await;

        assert_eq!(batch.total_jobs, 2);
        assert_eq!(batch.pending_jobs, 2);
        assert_eq!(batch.progress(), 0);

        let payloads = drain(&manager, "imports").await;
        assert_eq!(payloads.len(), 2);
        assert!(payloads
            .iter()
            .all(|payload| payload.batch_id == Some(batch.id)));

        Ok(())
    }

    #[tokio::test]
    async fn successful_batch_runs_then_and_finally_once() -> manager::Result {
        let manager = manager();
        let batch = dispatch_imports(&manager, false).await;
        let jobs = drain(&manager, "imports").await;

        batch.record_successful_job(&manager, jobs[0].uuid).await?;
        let halfway = batch.fresh(manager.batches().as_ref()).await?;
        assert_eq!(halfway.progress(), 50);
        assert!(!halfway.finished());

        batch.record_successful_job(&manager, jobs[1].uuid).await?;
        // A duplicate report after finishing changes nothing.
        batch.record_successful_job(&manager, jobs[1].uuid).await?;

        let finished = batch.fresh(manager.batches().as_ref()).await?;
        assert!(finished.finished());
        assert_eq!(finished.pending_jobs, 0);
        assert_eq!(
            callbacks(&drain(&manager, "imports").await),
            vec!["then", "finally"]
        );

        Ok(())
    }

    #[tokio::test]
    async fn failure_cancels_and_skips_then() -> manager::Result {
        let manager = manager();
        let batch = dispatch_imports(&manager, false).await;
        let jobs = drain(&manager, "imports").await;

        batch.record_failed_job(&manager, jobs[0].uuid).await?;
        let failed = batch.fresh(manager.batches().as_ref()).await?;
        assert!(failed.cancelled());
        assert_eq!(failed.failed_job_ids, vec![jobs[0].uuid]);
        assert_eq!(callbacks(&drain(&manager, "imports").await), vec!["catch"]);

        batch.record_successful_job(&manager, jobs[1].uuid).await?;
        assert_eq!(callbacks(&drain(&manager, "imports").await), vec!["finally"]);

        Ok(())
    }

    #[tokio::test]
    async fn allowed_failures_keep_the_batch_running() -> manager::Result {
        let manager = manager();
        let batch = dispatch_imports(&manager, true).await;
        let jobs = drain(&manager, "imports").await;

        batch.record_failed_job(&manager, jobs[0].uuid).await?;
        assert!(!batch.fresh(manager.batches().as_ref()).await?.cancelled());

        batch.record_failed_job(&manager, jobs[1].uuid).await?;
        let finished = batch.fresh(manager.batches().as_ref()).await?;
        assert_eq!(finished.failed_jobs, 2);
        assert_eq!(finished.progress(), 100);
        assert_eq!(
            callbacks(&drain(&manager, "imports").await),
            vec!["catch", "catch", "finally"]
        );

        Ok(())
    }

    static SYNC_RUNS: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

    #[derive(Debug, Deserialize, Serialize)]
    struct Step(String);

    impl Job for Step {
        const NAME: &'static str = "step";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            SYNC_RUNS.lock().push(self.0.clone());
            if self.0 == "broken" {
                return Err(job::Error::failed("broken step"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn sync_batch_keeps_going_after_a_failure() -> manager::Result {
        let manager = QueueManager::builder(Config::default())
            .register::<Step>()
            .build();

        let batch = manager
            .batch("steps")
            .add(Step("first".into()))
            .add(Step("broken".into()))
            .add(Step("last".into()))
            .finally(Step("finally".into()))
            .dispatch()
            .await?;

        assert_eq!(
            *SYNC_RUNS.lock(),
            vec!["first", "broken", "last", "finally"]
        );
        assert_eq!(batch.pending_jobs, 0);
        assert_eq!(batch.failed_jobs, 1);
        assert!(batch.cancelled());
        assert!(batch.finished());

        Ok(())
    }

    #[tokio::test]
    async fn prune_removes_finished_batches() -> Result {
        let repository = MemoryBatchRepository::new();
        let batch = Batch::new("old".into(), 1, BatchOptions::default());
        repository.store(&batch).await?;

        assert_eq!(repository.prune(Timestamp::now()).await?, 0);
        repository.mark_as_finished(batch.id).await?;
        assert!(!repository.mark_as_finished(batch.id).await?);

        let later = Timestamp::now() + jiff::Span::new().seconds(1);
        assert_eq!(repository.prune(later).await?, 1);
        assert!(repository.find(batch.id).await?.is_none());

        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn database_repository_counts(pool: PgPool) -> Result {
        let repository = DatabaseBatchRepository::new(pool);
        let batch = Batch::new("reports".into(), 2, BatchOptions::default());
        repository.store(&batch).await?;

        let counts = repository.record_failure(batch.id, new_id()).await?;
        assert_eq!(counts, Counts { pending_jobs: 1, failed_jobs: 1 });

        let counts = repository.record_success(batch.id, new_id()).await?;
        assert_eq!(counts.pending_jobs, 0);

        assert!(repository.mark_as_finished(batch.id).await?);
        assert!(!repository.mark_as_finished(batch.id).await?);

        let stored = repository.find(batch.id).await?.expect("the batch");
        assert_eq!(stored.failed_job_ids.len(), 1);
        assert!(stored.finished());

        assert!(repository.delete(batch.id).await?);

        Ok(())
    }
}
