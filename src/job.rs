//! Jobs are the units of work processed by workers.
//!
//! A job is any serializable type implementing [`Job`]. Its fields are the
//! job's business data: they're serialized into a [`JobPayload`] when the job
//! is dispatched and deserialized again, by way of the job's registered
//! [`NAME`](Job::NAME), when a worker picks it up.
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use stevedore::job::{self, Backoff, Context, Job};
//!
//! #[derive(Deserialize, Serialize)]
//! struct SendWelcomeEmail {
//!     user_id: i64,
//! }
//!
//! impl Job for SendWelcomeEmail {
//!     const NAME: &'static str = "send-welcome-email";
//!
//!     async fn handle(&self, _cx: &mut Context) -> job::Result {
//!         println!("Sending welcome email to user {}", self.user_id);
//!         Ok(())
//!     }
//!
//!     fn tries(&self) -> Option<u32> {
//!         Some(3)
//!     }
//!
//!     fn backoff(&self) -> Option<Backoff> {
//!         Some(Backoff::Steps(vec![10, 60, 300]))
//!     }
//! }
//! ```
//!
//! # Releasing, deleting, and failing
//!
//! Besides returning an error, a job may decide the outcome of an attempt
//! through its [`Context`]. Releasing puts the job back on its queue after a
//! delay, deleting drops it, and failing archives it without further retries.
//! Only the first such request within an attempt takes effect.
//!
//! [`JobPayload`]: crate::payload::JobPayload

use std::{fmt, future::Future, str::FromStr, sync::Arc};

use jiff::{Span, Timestamp, ToSpan};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use uuid::Uuid;

use crate::{
    driver::Reserved,
    middleware::Middleware,
    payload::JobPayload,
    store::{Error as StoreError, Store},
};

pub(crate) use self::registry::{JobHandler, RegisteredJob};
pub use self::registry::{Error as RegistryError, Registry};

mod registry;

/// A type alias for job identifiers.
pub type Id = Uuid;

/// A type alias for job execution results.
pub type Result = std::result::Result<(), Error>;

pub(crate) fn new_id() -> Id {
    Ulid::new().into()
}

/// Job execution errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The job failed and may be retried.
    #[error("{0}")]
    Failed(String),

    /// The job encountered an unrecoverable state and must not be retried.
    #[error("{0}")]
    Fatal(String),

    /// The job lost its race against the execution timeout.
    #[error("Job `{name}` ran too long (timeout of {timeout}s).")]
    TimedOut {
        /// Display name of the job.
        name: String,

        /// Effective timeout, in seconds.
        timeout: u64,
    },

    /// The job was picked up again after exhausting its tries or passing its
    /// retry deadline.
    #[error("Job `{0}` has been attempted too many times.")]
    MaxAttemptsExceeded(String),

    /// The job raised more unhandled errors than it allows.
    #[error("Job `{0}` has thrown too many exceptions.")]
    TooManyExceptions(String),

    /// Error returned by the key-value store used by middleware.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Any other error raised by job code.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Creates a retryable failure from a message.
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    /// Creates a fatal failure from a message.
    pub fn fatal(message: impl fmt::Display) -> Self {
        Self::Fatal(message.to_string())
    }

    /// Wraps an arbitrary error.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Box::new(err))
    }

    /// Returns `true` when the error came from the execution timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// A short name for the kind of error, used in failed-job records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "Failed",
            Self::Fatal(_) => "Fatal",
            Self::TimedOut { .. } => "TimedOut",
            Self::MaxAttemptsExceeded(_) => "MaxAttemptsExceeded",
            Self::TooManyExceptions(_) => "TooManyExceptions",
            Self::Store(_) => "Store",
            Self::Database(_) => "Database",
            Self::Json(_) => "Json",
            Self::Other(_) => "Other",
        }
    }
}

/// Delay applied before a retry, in seconds.
///
/// A fixed backoff always waits the same amount of time. A stepped backoff
/// picks the step matching the attempt that just failed and reuses the last
/// step once the attempts outnumber the steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Backoff {
    /// The same delay after every attempt.
    Fixed(u64),

    /// Per-attempt delays.
    Steps(Vec<u64>),
}

impl Backoff {
    /// Returns the delay, in seconds, to wait after the given attempt.
    ///
    /// Attempts are numbered from one.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        match self {
            Self::Fixed(seconds) => *seconds,
            Self::Steps(steps) => {
                let Some(last) = steps.len().checked_sub(1) else {
                    return 0;
                };
                let index = (attempt.saturating_sub(1) as usize).min(last);
                steps[index]
            }
        }
    }

    /// Same as [`delay_for`](Backoff::delay_for), as a span.
    pub fn span_for(&self, attempt: u32) -> Span {
        seconds(self.delay_for(attempt))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed(0)
    }
}

impl From<u64> for Backoff {
    fn from(seconds: u64) -> Self {
        Self::Fixed(seconds)
    }
}

impl From<Vec<u64>> for Backoff {
    fn from(steps: Vec<u64>) -> Self {
        Self::Steps(steps)
    }
}

/// Parses the command-line form: `"10"` or `"1,5,10"`.
impl FromStr for Backoff {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let steps = s
            .split(',')
            .map(|step| step.trim().parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(match steps.as_slice() {
            [seconds] => Self::Fixed(*seconds),
            _ => Self::Steps(steps),
        })
    }
}

/// When a dispatched job becomes available to workers.
#[derive(Debug, Clone, Copy)]
pub enum Delay {
    /// Available once the span has elapsed.
    ///
    /// Spans are added to timestamps, so they may not contain calendar units
    /// of days or larger.
    For(Span),

    /// Available from the given instant.
    Until(Timestamp),
}

impl Delay {
    /// Resolves the delay against `now`.
    pub fn available_at(&self, now: Timestamp) -> std::result::Result<Timestamp, jiff::Error> {
        match self {
            Self::For(span) => now.checked_add(*span),
            Self::Until(timestamp) => Ok(*timestamp),
        }
    }
}

impl From<Span> for Delay {
    fn from(span: Span) -> Self {
        Self::For(span)
    }
}

impl From<Timestamp> for Delay {
    fn from(timestamp: Timestamp) -> Self {
        Self::Until(timestamp)
    }
}

/// Dispatch options of a job.
///
/// Defaults come from the [`Job`] implementation and are overridden by the
/// dispatch builders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Options {
    /// Target connection; the manager's default when unset.
    pub connection: Option<String>,

    /// Target queue; the connection's default when unset.
    pub queue: Option<String>,

    /// Delay before the job becomes available.
    #[serde(skip)]
    pub delay: Option<Delay>,

    /// Maximum attempts; the worker's default when unset. Zero means
    /// unlimited.
    pub tries: Option<u32>,

    /// Maximum number of unhandled errors before the job fails.
    pub max_exceptions: Option<u32>,

    /// Execution timeout in seconds; the worker's default when unset.
    pub timeout: Option<u64>,

    /// Retry backoff; the worker's default when unset.
    pub backoff: Option<Backoff>,

    /// Instant after which the job is no longer retried.
    pub retry_until: Option<Timestamp>,

    /// Fail without retrying when the job times out.
    pub fail_on_timeout: bool,

    /// Hold the dispatch until the surrounding transaction commits; the
    /// connection's default when unset.
    pub after_commit: Option<bool>,
}

impl Options {
    pub(crate) fn for_job<J: Job>(job: &J) -> Self {
        Self {
            connection: job.connection(),
            queue: job.queue(),
            delay: None,
            tries: job.tries(),
            max_exceptions: job.max_exceptions(),
            timeout: job.timeout(),
            backoff: job.backoff(),
            retry_until: job.retry_until(),
            fail_on_timeout: job.fail_on_timeout(),
            after_commit: None,
        }
    }
}

/// A unit of work which can be dispatched to a queue.
///
/// Implementors are serialized with `serde` when dispatched, so any state the
/// job needs at execution time must be part of its fields.
pub trait Job: DeserializeOwned + Serialize + Send + Sync + 'static {
    /// Stable name used to find the job type again when a worker
    /// deserializes it.
    const NAME: &'static str;

    /// Performs the work.
    ///
    /// Returning an error makes the attempt count as failed: the job is
    /// released for a retry or, once its tries are exhausted, archived as a
    /// failed job.
    fn handle(&self, cx: &mut Context) -> impl Future<Output = Result> + Send;

    /// Called once after the job has permanently failed.
    ///
    /// Errors returned here are logged and otherwise ignored.
    fn failed(&self, error: &Error) -> impl Future<Output = Result> + Send {
        let _ = error;
        async { Ok(()) }
    }

    /// Middleware wrapping [`handle`](Job::handle), outermost first.
    fn middleware(&self) -> Vec<Arc<dyn Middleware>> {
        Vec::new()
    }

    /// Name shown in logs and used as the default throttling key.
    fn display_name(&self) -> String {
        Self::NAME.to_string()
    }

    /// Default connection for this job.
    fn connection(&self) -> Option<String> {
        None
    }

    /// Default queue for this job.
    fn queue(&self) -> Option<String> {
        None
    }

    /// Maximum number of attempts.
    fn tries(&self) -> Option<u32> {
        None
    }

    /// Maximum number of unhandled errors.
    fn max_exceptions(&self) -> Option<u32> {
        None
    }

    /// Execution timeout in seconds.
    fn timeout(&self) -> Option<u64> {
        None
    }

    /// Delay between retries.
    fn backoff(&self) -> Option<Backoff> {
        None
    }

    /// Deadline after which the job is no longer retried.
    fn retry_until(&self) -> Option<Timestamp> {
        None
    }

    /// Whether a timeout fails the job outright.
    fn fail_on_timeout(&self) -> bool {
        false
    }
}

/// Outcome requested for the current attempt.
#[derive(Debug, Clone, Default)]
pub enum Status {
    /// Nothing requested; success unless the job errors.
    #[default]
    Pending,

    /// Put back on the queue after the given delay.
    Released(Span),

    /// Dropped without being archived.
    Deleted,

    /// Archived as a failed job, with the given reason.
    Failed(String),
}

impl Status {
    /// Returns `true` once a terminal state has been requested.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Runtime state of a single attempt of a job.
///
/// # Timeouts
///
/// Timeouts are cooperative. When a job exceeds its timeout, its future is
/// dropped, which stops it at its next `.await`, and the
/// [cancellation token](Context::cancellation_token) is cancelled. Blocking or
/// CPU-bound work moved off the async runtime keeps running unless it polls
/// that token.
pub struct Context {
    id: Id,
    record_id: Option<i64>,
    display_name: String,
    attempts: u32,
    connection: String,
    queue: String,
    batch_id: Option<Uuid>,
    status: Status,
    store: Arc<dyn Store>,
    cancellation_token: CancellationToken,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("record_id", &self.record_id)
            .field("display_name", &self.display_name)
            .field("attempts", &self.attempts)
            .field("connection", &self.connection)
            .field("queue", &self.queue)
            .field("batch_id", &self.batch_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(id: Id, display_name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            id,
            record_id: None,
            display_name: display_name.into(),
            attempts: 1,
            connection: String::new(),
            queue: String::new(),
            batch_id: None,
            status: Status::Pending,
            store,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub(crate) fn for_record(
        connection: &str,
        record: &Reserved,
        payload: &JobPayload,
        store: Arc<dyn Store>,
    ) -> Self {
        let mut cx = Self::new(payload.uuid, payload.display_name.clone(), store);
        cx.record_id = Some(record.id);
        cx.attempts = record.attempts;
        cx.connection = connection.to_owned();
        cx.queue = record.queue.clone();
        cx.batch_id = payload.batch_id;
        cx
    }

    pub(crate) fn on(mut self, connection: &str, queue: &str) -> Self {
        self.connection = connection.to_owned();
        self.queue = queue.to_owned();
        self
    }

    pub(crate) fn in_batch(mut self, batch_id: Option<Uuid>) -> Self {
        self.batch_id = batch_id;
        self
    }

    /// The job's unique identifier.
    pub fn id(&self) -> Id {
        self.id
    }

    /// The identifier of the driver record, when the job came from a queue.
    pub fn record_id(&self) -> Option<i64> {
        self.record_id
    }

    /// The job's display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Number of times the job has been attempted, including this attempt.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Connection the job was pulled from.
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Queue the job was pulled from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Batch the job belongs to, if any.
    pub fn batch_id(&self) -> Option<Uuid> {
        self.batch_id
    }

    /// Key-value store shared by middleware.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Token cancelled when the attempt runs out of time.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Returns `true` once the attempt has run out of time.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// The outcome requested so far.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Puts the job back on its queue once `delay` has elapsed.
    pub fn release(&mut self, delay: Span) {
        self.transition(Status::Released(delay));
    }

    /// Drops the job without archiving it.
    pub fn delete(&mut self) {
        self.transition(Status::Deleted);
    }

    /// Archives the job as failed without further retries.
    pub fn fail(&mut self, reason: impl fmt::Display) {
        self.transition(Status::Failed(reason.to_string()));
    }

    /// Returns `true` if the job asked to be released.
    pub fn is_released(&self) -> bool {
        matches!(self.status, Status::Released(_))
    }

    /// Returns `true` if the job asked to be deleted.
    pub fn is_deleted(&self) -> bool {
        matches!(self.status, Status::Deleted)
    }

    /// Returns `true` if the job asked to be failed.
    pub fn has_failed(&self) -> bool {
        matches!(self.status, Status::Failed(_))
    }

    pub(crate) fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    fn transition(&mut self, status: Status) {
        if self.status.is_terminal() {
            tracing::warn!(
                job.id = %self.id,
                current = ?self.status,
                requested = ?status,
                "Job already reached a terminal state, ignoring"
            );
            return;
        }

        self.status = status;
    }
}

pub(crate) fn seconds(seconds: u64) -> Span {
    i64::try_from(seconds).unwrap_or(i64::MAX).seconds()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed(30);
        for attempt in 1..10 {
            assert_eq!(backoff.delay_for(attempt), 30);
        }
    }

    #[test]
    fn stepped_backoff_clamps_to_last_step() {
        let backoff = Backoff::Steps(vec![1, 5, 10]);
        assert_eq!(backoff.delay_for(1), 1);
        assert_eq!(backoff.delay_for(2), 5);
        assert_eq!(backoff.delay_for(3), 10);
        assert_eq!(backoff.delay_for(5), 10);
    }

    #[test]
    fn empty_steps_mean_no_delay() {
        assert_eq!(Backoff::Steps(Vec::new()).delay_for(3), 0);
    }

    #[test]
    fn backoff_from_str() {
        assert_eq!("15".parse::<Backoff>().unwrap(), Backoff::Fixed(15));
        assert_eq!(
            "1, 5,10".parse::<Backoff>().unwrap(),
            Backoff::Steps(vec![1, 5, 10])
        );
        assert!("1,five".parse::<Backoff>().is_err());
    }

    #[test]
    fn backoff_serializes_as_number_or_list() {
        assert_eq!(serde_json::to_string(&Backoff::Fixed(3)).unwrap(), "3");
        assert_eq!(
            serde_json::from_str::<Backoff>("[1,2]").unwrap(),
            Backoff::Steps(vec![1, 2])
        );
    }

    #[test]
    fn delay_resolves_against_now() {
        let now: Timestamp = "2024-10-16T12:00:00Z".parse().unwrap();
        let at = Delay::For(90.seconds()).available_at(now).unwrap();
        assert_eq!(at.as_second() - now.as_second(), 90);

        let later: Timestamp = "2024-10-17T00:00:00Z".parse().unwrap();
        assert_eq!(Delay::Until(later).available_at(now).unwrap(), later);
    }

    #[test]
    fn only_first_terminal_request_counts() {
        let mut cx = Context::new(new_id(), "example", Arc::new(MemoryStore::new()));
        assert!(!cx.status().is_terminal());

        cx.release(10.seconds());
        cx.delete();
        cx.fail("nope");

        assert!(cx.is_released());
        assert!(!cx.is_deleted());
        assert!(!cx.has_failed());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }
}
