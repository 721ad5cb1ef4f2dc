//! Workers pull jobs off queues and run them.
//!
//! Until a worker is run, dispatched jobs remain on their connection, waiting
//! to be processed. A worker claims the oldest available record, rebuilds the
//! job through the manager's registry, and runs it through its middleware
//! under a timeout.
//!
//! Each attempt ends in one of a few ways:
//!
//! - the job succeeds and its record is deleted;
//! - the job asks to be released and goes back on the queue after a delay;
//! - the job errors and is released again according to its backoff;
//! - the job fails permanently, is archived by the [`FailedJobProvider`],
//!   and its `failed` hook runs.
//!
//! A job fails permanently when the error is fatal, when it timed out and
//! asked to fail on timeout, when it exhausted its tries or exceptions, or
//! when its retry deadline has passed.
//!
//! # Running workers
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use sqlx::PgPool;
//! use stevedore::{
//!     failed::DatabaseFailedJobProvider,
//!     worker::{Worker, WorkerOptions},
//!     Config, ConnectionConfig, DatabaseDriver, QueueManager,
//! };
//!
//! # async fn run(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new("database").connection("database", ConnectionConfig::new("database"));
//! let manager = QueueManager::builder(config)
//!     .extend("database", DatabaseDriver::factory(pool.clone()))
//!     .build();
//!
//! let worker = Worker::new(manager, Arc::new(DatabaseFailedJobProvider::new(pool)))
//!     .options(WorkerOptions::default().tries(3).max_jobs(1_000));
//! worker.listen_for_signals();
//!
//! // Process the `high` queue before `default`.
//! let reason = worker.daemon(None, "high,default").await?;
//! println!("worker stopped: {reason:?}");
//! # Ok(())
//! # }
//! ```
//!
//! # Scaling job processing
//!
//! Workers hold no state of their own besides their options, so any number of
//! them may run against the same connection, in one process or many.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use jiff::{Span, Timestamp};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    driver::{self, QueueDriver, Reserved},
    failed::{self, FailedJobProvider},
    job::{self, seconds, Backoff, Context, JobHandler, Status},
    manager::{self, JobEvent, LoopEvent, QueueManager},
    middleware::Next,
    payload::JobPayload,
    store::{self, RateLimiter},
};

/// A type alias for worker results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Worker errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned from manager operations.
    #[error(transparent)]
    Manager(#[from] manager::Error),

    /// Error returned from driver operations.
    #[error(transparent)]
    Driver(#[from] driver::Error),

    /// Error returned while archiving a failed job.
    #[error(transparent)]
    FailedJobs(#[from] failed::Error),

    /// Error returned from the store.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// Window over which a job's exceptions are counted.
const EXCEPTION_WINDOW_SECONDS: u64 = 24 * 60 * 60;

fn exceptions_key(payload: &JobPayload) -> String {
    format!("job-exceptions:{}", payload.uuid)
}

/// How a worker runs.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Worker name, for logs.
    pub name: String,

    /// Time to wait when no job is available.
    pub sleep: Span,

    /// Tries for jobs which don't declare their own. Zero means unlimited.
    pub tries: u32,

    /// Timeout, in seconds, for jobs which don't declare their own. Zero
    /// disables the timeout.
    pub timeout: u64,

    /// Backoff for jobs which don't declare their own.
    pub backoff: Backoff,

    /// Resident memory limit, in megabytes. Zero disables the check.
    pub memory: u64,

    /// Stop after this many jobs. Zero means no limit.
    pub max_jobs: u64,

    /// Stop after running this long.
    pub max_time: Option<Span>,

    /// Stop once the queues are empty.
    pub stop_when_empty: bool,

    /// Time to wait after each job.
    pub rest: Span,

    /// Keep processing while paused.
    pub force: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            sleep: seconds(3),
            tries: 1,
            timeout: 60,
            backoff: Backoff::default(),
            memory: 128,
            max_jobs: 0,
            max_time: None,
            stop_when_empty: false,
            rest: Span::new(),
            force: false,
        }
    }
}

impl WorkerOptions {
    /// Sets the worker name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the time to wait when no job is available.
    pub fn sleep(mut self, sleep: Span) -> Self {
        self.sleep = sleep;
        self
    }

    /// Sets the default tries. Zero means unlimited.
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    /// Sets the default timeout, in seconds.
    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Sets the default backoff.
    pub fn backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.backoff = backoff.into();
        self
    }

    /// Sets the resident memory limit, in megabytes.
    pub fn memory(mut self, megabytes: u64) -> Self {
        self.memory = megabytes;
        self
    }

    /// Stops the worker after `max_jobs` jobs.
    pub fn max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    /// Stops the worker after running for `max_time`.
    pub fn max_time(mut self, max_time: Span) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Stops the worker once its queues are empty.
    pub fn stop_when_empty(mut self) -> Self {
        self.stop_when_empty = true;
        self
    }

    /// Sets the time to wait after each job.
    pub fn rest(mut self, rest: Span) -> Self {
        self.rest = rest;
        self
    }

    /// Keeps processing while paused.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Why [`Worker::daemon`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The worker was asked to stop.
    Interrupted,

    /// The worker processed its maximum number of jobs.
    MaxJobs,

    /// The worker ran for its maximum time.
    MaxTime,

    /// The process went over its memory limit.
    Memory,

    /// A restart was broadcast through [`QueueManager::restart`].
    Restart,

    /// The queues were empty and the worker stops when empty.
    Empty,
}

/// What happened to a processed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job ran and its record was deleted.
    Completed,

    /// The job asked to be released.
    Released,

    /// The job asked for its record to be deleted.
    Deleted,

    /// The job errored and was released for another attempt.
    RetryScheduled,

    /// The job failed permanently and was archived.
    Failed,

    /// The job's batch was cancelled; the job did not run.
    Skipped,
}

/// A record being processed, with everything derived from it.
struct Attempt<'a> {
    connection: &'a str,
    driver: &'a dyn QueueDriver,
    record: &'a Reserved,
    payload: &'a JobPayload,
    handler: &'a dyn JobHandler,
    event: JobEvent,
}

impl Attempt<'_> {
    fn tries(&self, default: u32) -> u32 {
        self.payload.max_tries.unwrap_or(default)
    }
}

/// A worker processing jobs from the queues of one connection.
#[derive(Clone)]
pub struct Worker {
    manager: QueueManager,
    failer: Arc<dyn FailedJobProvider>,
    options: WorkerOptions,
    shutdown_token: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("options", &self.options)
            .field("paused", &self.paused.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a worker with default options.
    pub fn new(manager: QueueManager, failer: Arc<dyn FailedJobProvider>) -> Self {
        Self {
            manager,
            failer,
            options: WorkerOptions::default(),
            shutdown_token: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the worker's options.
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Token cancelled when the worker is asked to stop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Stops the daemon once its current job is done.
    pub fn stop(&self) {
        self.shutdown_token.cancel();
    }

    /// Stops claiming jobs until [`resume`](Self::resume)d.
    pub fn pause(&self) {
        tracing::info!(worker = %self.options.name, "Pausing worker");
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes a paused worker.
    pub fn resume(&self) {
        tracing::info!(worker = %self.options.name, "Resuming worker");
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Returns `true` while the worker is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stops the worker on `SIGTERM`, `SIGINT`, or `SIGUSR2`.
    ///
    /// Signals are only observed between jobs; the job in flight always
    /// finishes.
    #[cfg(unix)]
    pub fn listen_for_signals(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let worker = self.clone();
        tokio::spawn(async move {
            let signals = (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::user_defined2()),
            );
            let (Ok(mut term), Ok(mut int), Ok(mut usr2)) = signals else {
                tracing::error!("Failed to install signal handlers");
                return;
            };

            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
                _ = usr2.recv() => {}
                _ = worker.shutdown_token.cancelled() => return,
            }

            tracing::info!(worker = %worker.options.name, "Received shutdown signal");
            worker.stop();
        });
    }

    /// Processes jobs until a stop condition is met.
    ///
    /// `queues` is a comma-separated list, polled in order.
    #[instrument(skip(self), fields(worker = %self.options.name), err)]
    pub async fn daemon(&self, connection: Option<&str>, queues: &str) -> Result<StopReason> {
        let connection = connection
            .unwrap_or(&self.manager.config().default)
            .to_string();
        let driver = self.manager.connection(Some(&connection))?;

        let last_restart = self.manager.last_restart().await?;
        let deadline = self
            .options
            .max_time
            .map(|max_time| Timestamp::now().checked_add(max_time))
            .transpose()?;
        let mut jobs_processed = 0;

        tracing::info!(%connection, queues, "Worker started");

        loop {
            if !self.daemon_should_run(&connection, queues) {
                self.sleep(self.options.sleep).await?;
                if let Some(reason) = self.stop_requested(last_restart).await {
                    return Ok(self.stopping(reason));
                }
                continue;
            }

            let record = self.next_record(driver.as_ref(), queues).await;
            let found = record.is_some();

            if let Some(record) = record {
                jobs_processed += 1;
                if let Err(err) = self.process(&connection, driver.as_ref(), record).await {
                    tracing::error!(%err, "Failed to process job");
                }

                if self.options.rest.is_positive() {
                    self.sleep(self.options.rest).await?;
                }
            } else {
                self.sleep(self.options.sleep).await?;
            }

            if let Some(reason) = self.stop_requested(last_restart).await {
                return Ok(self.stopping(reason));
            }
            if self.options.stop_when_empty && !found {
                return Ok(self.stopping(StopReason::Empty));
            }
            if deadline.is_some_and(|deadline| Timestamp::now() >= deadline) {
                return Ok(self.stopping(StopReason::MaxTime));
            }
            if self.options.max_jobs > 0 && jobs_processed >= self.options.max_jobs {
                return Ok(self.stopping(StopReason::MaxJobs));
            }
        }
    }

    /// Processes the next available job, if there is one.
    ///
    /// Returns `None` when the queues are empty.
    pub async fn run_next_job(&self, connection: Option<&str>, queues: &str) -> Result<Option<Outcome>> {
        let connection = connection
            .unwrap_or(&self.manager.config().default)
            .to_string();
        let driver = self.manager.connection(Some(&connection))?;

        let mut record = None;
        for queue in queue_names(queues) {
            record = driver.pop(Some(queue)).await?;
            if record.is_some() {
                break;
            }
        }

        match record {
            Some(record) => Ok(Some(self.process(&connection, driver.as_ref(), record).await?)),
            None => Ok(None),
        }
    }

    fn daemon_should_run(&self, connection: &str, queues: &str) -> bool {
        self.manager.fire_looping(&LoopEvent {
            connection: connection.to_string(),
            queues: queues.to_string(),
        });

        self.options.force || !self.is_paused()
    }

    fn stopping(&self, reason: StopReason) -> StopReason {
        tracing::info!(worker = %self.options.name, ?reason, "Worker stopping");
        reason
    }

    async fn stop_requested(&self, last_restart: Option<i64>) -> Option<StopReason> {
        if self.shutdown_token.is_cancelled() {
            return Some(StopReason::Interrupted);
        }

        if self.options.memory > 0
            && memory_usage_mb().is_some_and(|used| used >= self.options.memory)
        {
            return Some(StopReason::Memory);
        }

        match self.manager.last_restart().await {
            Ok(restart) if restart != last_restart => Some(StopReason::Restart),
            Ok(_) => None,
            Err(err) => {
                tracing::error!(%err, "Failed to read the restart signal");
                None
            }
        }
    }

    /// Sleeps, waking early when the worker is stopped.
    async fn sleep(&self, span: Span) -> Result {
        let duration: Duration = span.try_into()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown_token.cancelled() => {}
        }
        Ok(())
    }

    async fn next_record(&self, driver: &dyn QueueDriver, queues: &str) -> Option<Reserved> {
        for queue in queue_names(queues) {
            match driver.pop(Some(queue)).await {
                Ok(Some(record)) => return Some(record),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(queue, %err, "Failed to claim the next job");
                    return None;
                }
            }
        }
        None
    }

    #[instrument(
        skip(self, driver, record),
        fields(
            queue = %record.queue,
            attempts = record.attempts,
            job.id = tracing::field::Empty,
            job.name = tracing::field::Empty
        ),
        err
    )]
    async fn process(
        &self,
        connection: &str,
        driver: &dyn QueueDriver,
        record: Reserved,
    ) -> Result<Outcome> {
        let payload = match JobPayload::decode(&record.payload) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%err, "Job payload is unreadable");
                return self
                    .archive(connection, driver, &record, &job::Error::Json(err))
                    .await;
            }
        };

        let span = tracing::Span::current();
        span.record("job.id", payload.uuid.to_string());
        span.record("job.name", payload.display_name.as_str());

        let handler = match self.manager.resolve(&payload.job, payload.data.clone()) {
            Ok(handler) => handler,
            Err(err) => {
                tracing::error!(%err, "Job cannot be resolved");
                let outcome = self
                    .archive(connection, driver, &record, &job::Error::other(err))
                    .await?;
                self.manager.job_failed(&payload).await;
                return Ok(outcome);
            }
        };

        let attempt = Attempt {
            connection,
            driver,
            record: &record,
            payload: &payload,
            handler: handler.as_ref(),
            event: JobEvent::new(connection, &record.queue, &payload, record.attempts),
        };
        self.manager.fire_before(&attempt.event);

        if let Some(err) = self.preflight(&attempt) {
            return self.fail_job(&attempt, err).await;
        }

        if self.batch_cancelled(&payload).await {
            tracing::info!("Skipping job of a cancelled batch");
            driver.delete(record.id).await?;
            self.manager.job_completed(&payload).await;
            return Ok(Outcome::Skipped);
        }

        let mut cx = Context::for_record(connection, &record, &payload, self.manager.store());
        let timeout = payload.timeout.unwrap_or(self.options.timeout);
        let middleware = handler.middleware();

        let result = Next::new(handler.as_ref(), &middleware, Some(timeout))
            .run(&mut cx)
            .await;

        match result {
            Ok(()) => match cx.status().clone() {
                Status::Released(delay) => {
                    tracing::debug!(?delay, "Job released");
                    driver.release(record.id, delay).await?;
                    Ok(Outcome::Released)
                }

                Status::Deleted => {
                    driver.delete(record.id).await?;
                    self.forget_exceptions(&payload).await;
                    self.manager.fire_after(&attempt.event);
                    self.manager.job_completed(&payload).await;
                    Ok(Outcome::Deleted)
                }

                Status::Failed(reason) => self.fail_job(&attempt, job::Error::Failed(reason)).await,

                Status::Pending => {
                    driver.delete(record.id).await?;
                    tracing::info!("Job completed");
                    self.forget_exceptions(&payload).await;
                    self.manager.fire_after(&attempt.event);
                    self.manager.job_completed(&payload).await;
                    Ok(Outcome::Completed)
                }
            },

            Err(err) => self.handle_exception(&attempt, &cx, err).await,
        }
    }

    /// Fails a job picked up after it ran out of tries or time.
    fn preflight(&self, attempt: &Attempt<'_>) -> Option<job::Error> {
        let payload = attempt.payload;
        let tries = attempt.tries(self.options.tries);

        let exhausted = tries > 0 && attempt.record.attempts > tries;
        if exhausted || payload.retry_deadline_passed(Timestamp::now()) {
            return Some(job::Error::MaxAttemptsExceeded(payload.display_name.clone()));
        }

        None
    }

    async fn batch_cancelled(&self, payload: &JobPayload) -> bool {
        let Some(batch_id) = payload.batch_id else {
            return false;
        };

        match self.manager.find_batch(batch_id).await {
            Ok(batch) => batch.is_some_and(|batch| batch.cancelled()),
            Err(err) => {
                tracing::error!(%batch_id, %err, "Failed to look up batch");
                false
            }
        }
    }

    async fn handle_exception(
        &self,
        attempt: &Attempt<'_>,
        cx: &Context,
        err: job::Error,
    ) -> Result<Outcome> {
        tracing::error!(err = %err, "Job execution encountered an error");
        self.manager.fire_failing(&attempt.event, &err);

        let payload = attempt.payload;
        let attempts = attempt.record.attempts;

        // Short-circuit on fatal errors.
        if matches!(err, job::Error::Fatal(_)) {
            return self.fail_job(attempt, err).await;
        }

        if err.is_timeout() && payload.fail_on_timeout {
            return self.fail_job(attempt, err).await;
        }

        if let Some(max_exceptions) = payload.max_exceptions.filter(|max| *max > 0) {
            let store = self.manager.store();
            let exceptions = RateLimiter::new(store.as_ref())
                .hit(&exceptions_key(payload), EXCEPTION_WINDOW_SECONDS)
                .await?;
            if exceptions >= max_exceptions {
                tracing::warn!(exceptions, "Job exhausted its exceptions");
                let err = job::Error::TooManyExceptions(payload.display_name.clone());
                return self.fail_job(attempt, err).await;
            }
        }

        let tries = attempt.tries(self.options.tries);
        if (tries > 0 && attempts >= tries)
            || payload.retry_deadline_passed(Timestamp::now())
            || cx.has_failed()
        {
            return self.fail_job(attempt, err).await;
        }

        let delay = match cx.status() {
            Status::Released(delay) => *delay,
            _ => seconds(
                payload
                    .backoff_for(attempts)
                    .unwrap_or_else(|| self.options.backoff.delay_for(attempts)),
            ),
        };

        tracing::info!(?delay, "Scheduling retry");
        attempt.driver.release(attempt.record.id, delay).await?;

        Ok(Outcome::RetryScheduled)
    }

    /// Archives a job which failed permanently and runs its failure hooks.
    async fn fail_job(&self, attempt: &Attempt<'_>, err: job::Error) -> Result<Outcome> {
        tracing::info!("Job failed permanently");

        let outcome = self
            .archive(attempt.connection, attempt.driver, attempt.record, &err)
            .await?;

        if let Err(hook_err) = attempt.handler.failed(&err).await {
            tracing::error!(err = %hook_err, "Job failure hook returned an error");
        }

        self.manager.job_failed(attempt.payload).await;
        self.forget_exceptions(attempt.payload).await;

        Ok(outcome)
    }

    /// Drops the exception counter of a job which is done for good.
    async fn forget_exceptions(&self, payload: &JobPayload) {
        if payload.max_exceptions.is_none() {
            return;
        }

        if let Err(err) = self.manager.store().forget(&exceptions_key(payload)).await {
            tracing::warn!(%err, "Failed to forget job exceptions");
        }
    }

    async fn archive(
        &self,
        connection: &str,
        driver: &dyn QueueDriver,
        record: &Reserved,
        err: &job::Error,
    ) -> Result<Outcome> {
        self.failer
            .log(connection, &record.queue, &record.payload, err)
            .await?;
        driver.delete(record.id).await?;
        Ok(Outcome::Failed)
    }
}

fn queue_names(queues: &str) -> impl Iterator<Item = &str> {
    queues
        .split(',')
        .map(str::trim)
        .filter(|queue| !queue.is_empty())
}

/// Resident memory of the current process, in megabytes.
#[cfg(target_os = "linux")]
fn memory_usage_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    resident_mb(&status)
}

/// Parses the `VmRSS` line of a `/proc/<pid>/status` file, which is in kB.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn resident_mb(status: &str) -> Option<u64> {
    let kilobytes = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kilobytes / 1024)
}

#[cfg(not(target_os = "linux"))]
fn memory_usage_mb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use jiff::ToSpan;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        driver::{MemoryDriver, PushOptions, QueuedJob},
        failed::MemoryFailedJobProvider,
        job::{Delay, Id, Job},
        manager::{Config, ConnectionConfig, DriverFactory},
    };

    #[derive(Debug, Default)]
    struct DriverCalls {
        pops: AtomicUsize,
        releases: AtomicUsize,
        deletes: AtomicUsize,
    }

    // Counts the calls a worker makes.
    struct CountingDriver {
        inner: MemoryDriver,
        calls: Arc<DriverCalls>,
    }

    #[async_trait]
    impl QueueDriver for CountingDriver {
        async fn push(&self, job: QueuedJob, queue: Option<&str>) -> driver::Result<Id> {
            self.inner.push(job, queue).await
        }

        async fn push_raw(
            &self,
            payload: String,
            queue: Option<&str>,
            options: PushOptions,
        ) -> driver::Result {
            self.inner.push_raw(payload, queue, options).await
        }

        async fn later(&self, delay: Delay, job: QueuedJob, queue: Option<&str>) -> driver::Result<Id> {
            self.inner.later(delay, job, queue).await
        }

        async fn pop(&self, queue: Option<&str>) -> driver::Result<Option<Reserved>> {
            let record = self.inner.pop(queue).await?;
            if record.is_some() {
                self.calls.pops.fetch_add(1, Ordering::SeqCst);
            }
            Ok(record)
        }

        async fn release(&self, id: i64, delay: Span) -> driver::Result {
            self.calls.releases.fetch_add(1, Ordering::SeqCst);
            self.inner.release(id, delay).await
        }

        async fn delete(&self, id: i64) -> driver::Result {
            self.calls.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(id).await
        }

        async fn clear(&self, queue: Option<&str>) -> driver::Result<u64> {
            self.inner.clear(queue).await
        }

        async fn size(&self, queue: Option<&str>) -> driver::Result<u64> {
            self.inner.size(queue).await
        }
    }

    static FLAKY_HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Deserialize, Serialize)]
    struct AlwaysFails;

    impl Job for AlwaysFails {
        const NAME: &'static str = "always-fails";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Err(job::Error::failed("upstream unavailable"))
        }

        async fn failed(&self, _error: &job::Error) -> job::Result {
            FLAKY_HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn tries(&self) -> Option<u32> {
            Some(3)
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Unstable;

    impl Job for Unstable {
        const NAME: &'static str = "unstable";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Err(job::Error::failed("connection reset"))
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Recovers;

    impl Job for Recovers {
        const NAME: &'static str = "recovers";

        async fn handle(&self, cx: &mut Context) -> job::Result {
            if cx.attempts() == 1 {
                return Err(job::Error::failed("cold cache"));
            }
            Ok(())
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Succeeds;

    impl Job for Succeeds {
        const NAME: &'static str = "succeeds";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Ok(())
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Breaks;

    impl Job for Breaks {
        const NAME: &'static str = "breaks";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Err(job::Error::fatal("corrupt input"))
        }

        fn tries(&self) -> Option<u32> {
            Some(5)
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Sleepy;

    impl Job for Sleepy {
        const NAME: &'static str = "sleepy";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn tries(&self) -> Option<u32> {
            Some(5)
        }

        fn timeout(&self) -> Option<u64> {
            Some(1)
        }

        fn fail_on_timeout(&self) -> bool {
            true
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Unregistered;

    impl Job for Unregistered {
        const NAME: &'static str = "unregistered";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Ok(())
        }
    }

    struct Harness {
        manager: QueueManager,
        failer: Arc<MemoryFailedJobProvider>,
        calls: Arc<DriverCalls>,
        worker: Worker,
    }

    fn harness() -> Harness {
        let calls = Arc::new(DriverCalls::default());
        let factory: DriverFactory = {
            let calls = calls.clone();
            Arc::new(
                move |_name: &str, config: &ConnectionConfig| -> manager::Result<Arc<dyn QueueDriver>> {
                    Ok(Arc::new(CountingDriver {
                        inner: MemoryDriver::new(config.queue.clone(), config.retry_after),
                        calls: calls.clone(),
                    }))
                },
            )
        };

        let config = Config::new("counting").connection("counting", ConnectionConfig::new("counting"));
        let manager = QueueManager::builder(config)
            .extend("counting", factory)
            .register::<AlwaysFails>()
            .register::<Unstable>()
            .register::<Recovers>()
            .register::<Succeeds>()
            .register::<Breaks>()
            .register::<Sleepy>()
            .build();

        let failer = Arc::new(MemoryFailedJobProvider::new());
        let worker = Worker::new(manager.clone(), failer.clone())
            .options(WorkerOptions::default().sleep(Span::new()).timeout(5));

        Harness {
            manager,
            failer,
            calls,
            worker,
        }
    }

    async fn drain(harness: &Harness) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = harness.worker.run_next_job(None, "default").await.unwrap() {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn retries_until_tries_are_exhausted() -> Result {
        let harness = harness();
        harness.manager.dispatch(AlwaysFails).await?;

        let outcomes = drain(&harness).await;
        assert_eq!(
            outcomes,
            vec![Outcome::RetryScheduled, Outcome::RetryScheduled, Outcome::Failed]
        );

        assert_eq!(harness.calls.pops.load(Ordering::SeqCst), 3);
        assert_eq!(harness.calls.releases.load(Ordering::SeqCst), 2);
        assert_eq!(harness.calls.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(harness.failer.count(None, None).await?, 1);
        assert_eq!(FLAKY_HOOK_CALLS.load(Ordering::SeqCst), 1);

        let failed = harness.failer.all().await?;
        assert!(failed[0].exception.starts_with("Failed: upstream unavailable"));

        Ok(())
    }

    #[tokio::test]
    async fn successful_jobs_are_deleted_and_reported() -> Result {
        let harness = harness();
        let after = Arc::new(AtomicUsize::new(0));
        {
            let after = after.clone();
            harness.manager.after(move |event| {
                assert_eq!(event.name, "succeeds");
                after.fetch_add(1, Ordering::SeqCst);
            });
        }

        harness.manager.dispatch(Succeeds).await?;
        assert_eq!(drain(&harness).await, vec![Outcome::Completed]);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(harness.manager.size(None, None).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn fatal_errors_skip_remaining_tries() -> Result {
        let harness = harness();
        let failing = Arc::new(AtomicUsize::new(0));
        {
            let failing = failing.clone();
            harness.manager.failing(move |_, err| {
                assert!(matches!(err, job::Error::Fatal(_)));
                failing.fetch_add(1, Ordering::SeqCst);
            });
        }

        harness.manager.dispatch(Breaks).await?;
        assert_eq!(drain(&harness).await, vec![Outcome::Failed]);
        assert_eq!(failing.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[tokio::test]
    async fn max_exceptions_fail_before_tries() -> Result {
        let harness = harness();
        harness
            .manager
            .dispatch(Unstable)
            .tries(10)
            .max_exceptions(2)
            .await?;

        assert_eq!(
            drain(&harness).await,
            vec![Outcome::RetryScheduled, Outcome::Failed]
        );
        let failed = harness.failer.all().await?;
        assert!(failed[0].exception.starts_with("TooManyExceptions"));

        Ok(())
    }

    #[tokio::test]
    async fn exception_counters_are_dropped_on_success() -> Result {
        let harness = harness();
        let id = harness
            .manager
            .dispatch(Recovers)
            .tries(5)
            .max_exceptions(3)
            .await?;

        assert_eq!(
            drain(&harness).await,
            vec![Outcome::RetryScheduled, Outcome::Completed]
        );
        let key = format!("job-exceptions:{id}");
        assert_eq!(harness.manager.store().get(&key).await?, None);

        Ok(())
    }

    #[test]
    fn resident_memory_is_read_from_status() {
        let status = "Name:\tstevedore\nVmPeak:\t  900000 kB\nVmRSS:\t  262144 kB\nThreads:\t8\n";
        assert_eq!(resident_mb(status), Some(256));
        assert_eq!(resident_mb("Name:\tstevedore\n"), None);
    }

    #[tokio::test]
    async fn passed_deadlines_fail_without_running() -> Result {
        let harness = harness();
        harness
            .manager
            .dispatch(Succeeds)
            .retry_until(Timestamp::now() - 1.minute())
            .await?;

        assert_eq!(drain(&harness).await, vec![Outcome::Failed]);
        let failed = harness.failer.all().await?;
        assert!(failed[0].exception.starts_with("MaxAttemptsExceeded"));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_can_fail_permanently() -> Result {
        let harness = harness();
        harness.manager.dispatch(Sleepy).await?;

        assert_eq!(drain(&harness).await, vec![Outcome::Failed]);
        let failed = harness.failer.all().await?;
        assert!(failed[0].exception.starts_with("TimedOut"));

        Ok(())
    }

    #[tokio::test]
    async fn unknown_jobs_are_archived() -> Result {
        let harness = harness();
        harness.manager.dispatch(Unregistered).await?;

        assert_eq!(drain(&harness).await, vec![Outcome::Failed]);
        assert_eq!(harness.failer.count(None, Some("default")).await?, 1);

        Ok(())
    }

    #[tokio::test]
    async fn chains_advance_as_links_complete() -> Result {
        let harness = harness();
        harness
            .manager
            .chain()
            .link(Succeeds)
            .link(Succeeds)
            .link(Succeeds)
            .dispatch()
            .await?;

        assert_eq!(harness.manager.size(None, None).await?, 1);
        assert_eq!(
            drain(&harness).await,
            vec![Outcome::Completed, Outcome::Completed, Outcome::Completed]
        );

        Ok(())
    }

    #[tokio::test]
    async fn failed_link_drops_the_rest_of_the_chain() -> Result {
        let harness = harness();
        harness
            .manager
            .chain()
            .link(Breaks)
            .link(Succeeds)
            .catch(Succeeds)
            .dispatch()
            .await?;

        // The catch job runs; the second link never does.
        assert_eq!(
            drain(&harness).await,
            vec![Outcome::Failed, Outcome::Completed]
        );

        Ok(())
    }

    #[tokio::test]
    async fn batches_track_outcomes() -> Result {
        let harness = harness();
        let batch = harness
            .manager
            .batch("mixed")
            .add(Succeeds)
            .add(Breaks)
            .add(Succeeds)
            .finally(Succeeds)
            .dispatch()
            .await?;

        let outcomes = drain(&harness).await;
        assert_eq!(
            outcomes,
            vec![
                Outcome::Completed,
                Outcome::Failed,
                Outcome::Skipped,
                Outcome::Completed,
            ]
        );

        let batch = harness
            .manager
            .find_batch(batch.id)
            .await?
            .expect("the batch");
        assert!(batch.finished());
        assert!(batch.cancelled());
        assert_eq!(batch.failed_jobs, 1);
        assert_eq!(batch.pending_jobs, 0);

        Ok(())
    }

    #[tokio::test]
    async fn concurrent_workers_claim_each_record_once() -> Result {
        let harness = harness();
        for _ in 0..20 {
            harness.manager.dispatch(Succeeds).await?;
        }

        let outcomes = futures::future::join_all((0..4).map(|_| drain(&harness))).await;
        assert_eq!(outcomes.iter().map(Vec::len).sum::<usize>(), 20);
        assert_eq!(harness.calls.pops.load(Ordering::SeqCst), 20);

        Ok(())
    }

    #[tokio::test]
    async fn daemon_stops_when_empty() -> Result {
        let harness = harness();
        harness.manager.dispatch(Succeeds).await?;

        let worker = harness.worker.clone().options(
            WorkerOptions::default()
                .sleep(Span::new())
                .memory(0)
                .stop_when_empty(),
        );
        assert_eq!(worker.daemon(None, "default").await?, StopReason::Empty);
        assert_eq!(harness.manager.size(None, None).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn daemon_stops_after_max_jobs() -> Result {
        let harness = harness();
        for _ in 0..3 {
            harness.manager.dispatch(Succeeds).await?;
        }

        let worker = harness.worker.clone().options(
            WorkerOptions::default()
                .sleep(Span::new())
                .memory(0)
                .max_jobs(2),
        );
        assert_eq!(worker.daemon(None, "default").await?, StopReason::MaxJobs);
        assert_eq!(harness.manager.size(None, None).await?, 1);

        Ok(())
    }

    #[tokio::test]
    async fn stopped_daemon_reports_interruption() -> Result {
        let harness = harness();
        let worker = harness
            .worker
            .clone()
            .options(WorkerOptions::default().sleep(1.hour()).memory(0));

        worker.stop();
        assert_eq!(worker.daemon(None, "default").await?, StopReason::Interrupted);

        Ok(())
    }

    #[tokio::test]
    async fn restart_signal_stops_the_daemon() -> Result {
        let harness = harness();
        let worker = harness
            .worker
            .clone()
            .options(WorkerOptions::default().sleep(10.milliseconds()).memory(0));

        let daemon = tokio::spawn({
            let worker = worker.clone();
            async move { worker.daemon(None, "default").await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.manager.restart().await?;

        let reason = tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .expect("daemon stops")
            .expect("daemon task")?;
        assert_eq!(reason, StopReason::Restart);

        Ok(())
    }
}
