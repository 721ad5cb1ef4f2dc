//! Archive of permanently failed jobs.
//!
//! Once a job exhausts its tries, passes its retry deadline, or fails
//! fatally, the worker logs it to a [`FailedJobProvider`]. Records are never
//! mutated; they are retried through
//! [`QueueManager::retry_failed`](crate::QueueManager::retry_failed) or removed
//! with [`forget`](FailedJobProvider::forget),
//! [`flush`](FailedJobProvider::flush), or
//! [`prune`](FailedJobProvider::prune).

use std::{error::Error as StdError, sync::Arc};

use async_trait::async_trait;
use jiff::{Timestamp, ToSpan};
use parking_lot::Mutex;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    job::{self, new_id},
    payload::JobPayload,
};

/// A type alias for failed job provider results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Failed job provider errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `jiff` crate.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
}

/// A permanently failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    /// Storage id of the record.
    pub id: i64,
    /// Id of the job, as dispatched.
    pub uuid: Uuid,
    /// Connection the job ran on.
    pub connection: String,
    /// Queue the job ran on.
    pub queue: String,
    /// Encoded payload, ready to be pushed again.
    pub payload: String,
    /// The final error, as formatted by [`format_exception`].
    pub exception: String,
    /// When the job failed.
    pub failed_at: Timestamp,
}

/// Formats an error as `<kind>: <message>`, followed by its sources.
pub fn format_exception(error: &job::Error) -> String {
    let mut exception = format!("{}: {error}", error.kind());
    let mut source = error.source();
    while let Some(cause) = source {
        exception.push_str(&format!("\nCaused by: {cause}"));
        source = cause.source();
    }
    exception
}

fn uuid_of(payload: &str) -> Uuid {
    JobPayload::decode(payload)
        .map(|payload| payload.uuid)
        .unwrap_or_else(|_| new_id())
}

/// Storage for failed jobs.
#[async_trait]
pub trait FailedJobProvider: Send + Sync {
    /// Archives a failed job and returns the new record's id.
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        error: &job::Error,
    ) -> Result<i64>;

    /// Every record, newest first.
    async fn all(&self) -> Result<Vec<FailedJob>>;

    /// Returns the record, if it exists.
    async fn find(&self, id: i64) -> Result<Option<FailedJob>>;

    /// Removes a record. Returns `true` if it existed.
    async fn forget(&self, id: i64) -> Result<bool>;

    /// Removes every record, or only those older than `hours`.
    async fn flush(&self, hours: Option<u32>) -> Result<u64>;

    /// Number of records, optionally filtered by connection and queue.
    async fn count(&self, connection: Option<&str>, queue: Option<&str>) -> Result<u64>;

    /// Removes records which failed before `before`.
    async fn prune(&self, before: Timestamp) -> Result<u64>;

    /// Ids of every record, optionally on a single queue, newest first.
    async fn ids(&self, queue: Option<&str>) -> Result<Vec<i64>>;
}

fn flush_cutoff(hours: Option<u32>) -> Result<Option<Timestamp>> {
    Ok(hours
        .map(|hours| Timestamp::now().checked_sub(i64::from(hours).hours()))
        .transpose()?)
}

#[derive(Debug, Default)]
struct Records {
    next_id: i64,
    jobs: Vec<FailedJob>,
}

/// A [`FailedJobProvider`] living in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryFailedJobProvider {
    records: Arc<Mutex<Records>>,
}

impl MemoryFailedJobProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FailedJobProvider for MemoryFailedJobProvider {
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        error: &job::Error,
    ) -> Result<i64> {
        let mut records = self.records.lock();
        records.next_id += 1;
        let id = records.next_id;
        records.jobs.push(FailedJob {
            id,
            uuid: uuid_of(payload),
            connection: connection.to_string(),
            queue: queue.to_string(),
            payload: payload.to_string(),
            exception: format_exception(error),
            failed_at: Timestamp::now(),
        });
        Ok(id)
    }

    async fn all(&self) -> Result<Vec<FailedJob>> {
        Ok(self.records.lock().jobs.iter().rev().cloned().collect())
    }

    async fn find(&self, id: i64) -> Result<Option<FailedJob>> {
        Ok(self
            .records
            .lock()
            .jobs
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn forget(&self, id: i64) -> Result<bool> {
        let mut records = self.records.lock();
        let before = records.jobs.len();
        records.jobs.retain(|job| job.id != id);
        Ok(records.jobs.len() < before)
    }

    async fn flush(&self, hours: Option<u32>) -> Result<u64> {
        let cutoff = flush_cutoff(hours)?;
        let mut records = self.records.lock();
        let before = records.jobs.len();
        records
            .jobs
            .retain(|job| cutoff.is_some_and(|cutoff| job.failed_at > cutoff));
        Ok((before - records.jobs.len()) as u64)
    }

    async fn count(&self, connection: Option<&str>, queue: Option<&str>) -> Result<u64> {
        Ok(self
            .records
            .lock()
            .jobs
            .iter()
            .filter(|job| connection.map_or(true, |connection| job.connection == connection))
            .filter(|job| queue.map_or(true, |queue| job.queue == queue))
            .count() as u64)
    }

    async fn prune(&self, before: Timestamp) -> Result<u64> {
        let mut records = self.records.lock();
        let count = records.jobs.len();
        records.jobs.retain(|job| job.failed_at >= before);
        Ok((count - records.jobs.len()) as u64)
    }

    async fn ids(&self, queue: Option<&str>) -> Result<Vec<i64>> {
        Ok(self
            .records
            .lock()
            .jobs
            .iter()
            .rev()
            .filter(|job| queue.map_or(true, |queue| job.queue == queue))
            .map(|job| job.id)
            .collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FailedJobRow {
    id: i64,
    uuid: Uuid,
    connection: String,
    queue: String,
    payload: String,
    exception: String,
    failed_at: i64,
}

impl TryFrom<FailedJobRow> for FailedJob {
    type Error = jiff::Error;

    fn try_from(row: FailedJobRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            uuid: row.uuid,
            connection: row.connection,
            queue: row.queue,
            payload: row.payload,
            exception: row.exception,
            failed_at: Timestamp::from_second(row.failed_at)?,
        })
    }
}

const SELECT_FAILED_JOBS: &str = r#"
    select
        id,
        uuid,
        connection,
        queue,
        payload,
        exception,
        extract(epoch from failed_at)::bigint as failed_at
    from failed_jobs
"#;

/// A [`FailedJobProvider`] backed by the `failed_jobs` table.
#[derive(Debug, Clone)]
pub struct DatabaseFailedJobProvider {
    pool: PgPool,
}

impl DatabaseFailedJobProvider {
    /// Creates a provider over the `failed_jobs` table.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailedJobProvider for DatabaseFailedJobProvider {
    #[instrument(skip(self, payload, error), fields(job.id = tracing::field::Empty), err)]
    async fn log(
        &self,
        connection: &str,
        queue: &str,
        payload: &str,
        error: &job::Error,
    ) -> Result<i64> {
        let uuid = uuid_of(payload);
        tracing::Span::current().record("job.id", uuid.to_string());

        // A job reclaimed after a crash may fail twice; keep the latest.
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            insert into failed_jobs (uuid, connection, queue, payload, exception, failed_at)
            values ($1, $2, $3, $4, $5, to_timestamp($6))
            on conflict (uuid) do update
            set exception = excluded.exception,
                failed_at = excluded.failed_at
            returning id
            "#,
        )
        .bind(uuid)
        .bind(connection)
        .bind(queue)
        .bind(payload)
        .bind(format_exception(error))
        .bind(Timestamp::now().as_second() as f64)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn all(&self) -> Result<Vec<FailedJob>> {
        let rows = sqlx::query_as::<_, FailedJobRow>(&format!(
            "{SELECT_FAILED_JOBS} order by id desc"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(FailedJob::try_from)
            .collect::<std::result::Result<_, _>>()?)
    }

    #[instrument(skip(self), err)]
    async fn find(&self, id: i64) -> Result<Option<FailedJob>> {
        let row = sqlx::query_as::<_, FailedJobRow>(&format!("{SELECT_FAILED_JOBS} where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(FailedJob::try_from).transpose()?)
    }

    #[instrument(skip(self), err)]
    async fn forget(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            delete from failed_jobs
            where id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn flush(&self, hours: Option<u32>) -> Result<u64> {
        let result = match flush_cutoff(hours)? {
            Some(cutoff) => {
                sqlx::query(
                    r#"
                    delete from failed_jobs
                    where failed_at <= to_timestamp($1)
                    "#,
                )
                .bind(cutoff.as_second() as f64)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("delete from failed_jobs")
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn count(&self, connection: Option<&str>, queue: Option<&str>) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            select count(*)
            from failed_jobs
            where ($1::text is null or connection = $1)
              and ($2::text is null or queue = $2)
            "#,
        )
        .bind(connection)
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    #[instrument(skip(self), err)]
    async fn prune(&self, before: Timestamp) -> Result<u64> {
        let result = sqlx::query(
            r#"
            delete from failed_jobs
            where failed_at < to_timestamp($1)
            "#,
        )
        .bind(before.as_second() as f64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn ids(&self, queue: Option<&str>) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            select id
            from failed_jobs
            where ($1::text is null or queue = $1)
            order by id desc
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error() -> job::Error {
        job::Error::other(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "mail server unreachable",
        ))
    }

    #[test]
    fn exception_text_names_the_kind() {
        let exception = format_exception(&job::Error::failed("boom"));
        assert_eq!(exception, "Failed: boom");

        let exception = format_exception(&error());
        assert!(exception.starts_with("Other: mail server unreachable"));
    }

    #[tokio::test]
    async fn memory_provider_lifecycle() -> Result {
        let provider = MemoryFailedJobProvider::new();

        let first = provider.log("database", "default", "{}", &error()).await?;
        let second = provider.log("database", "emails", "{}", &error()).await?;

        assert_eq!(provider.count(None, None).await?, 2);
        assert_eq!(provider.count(Some("database"), Some("emails")).await?, 1);
        assert_eq!(provider.ids(None).await?, vec![second, first]);
        assert_eq!(provider.all().await?[0].id, second);

        let record = provider.find(first).await?.expect("a record");
        assert_eq!(record.queue, "default");
        assert!(record.exception.contains("mail server unreachable"));

        assert!(provider.forget(first).await?);
        assert!(!provider.forget(first).await?);
        assert_eq!(provider.flush(Some(1)).await?, 0);
        assert_eq!(provider.flush(None).await?, 1);
        assert_eq!(provider.count(None, None).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn prune_removes_older_records() -> Result {
        let provider = MemoryFailedJobProvider::new();
        provider.log("sync", "default", "{}", &error()).await?;

        assert_eq!(provider.prune(Timestamp::now().checked_sub(1.hour())?).await?, 0);
        assert_eq!(provider.prune(Timestamp::now().checked_add(1.hour())?).await?, 1);

        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a PostgreSQL database"]
    async fn database_provider_lifecycle(pool: PgPool) -> Result {
        let provider = DatabaseFailedJobProvider::new(pool);

        let id = provider.log("database", "default", "{}", &error()).await?;
        let record = provider.find(id).await?.expect("a record");
        assert_eq!(record.connection, "database");
        assert_eq!(provider.count(Some("database"), None).await?, 1);
        assert_eq!(provider.ids(Some("default")).await?, vec![id]);

        assert!(provider.forget(id).await?);
        assert_eq!(provider.all().await?, Vec::new());

        Ok(())
    }
}
