use std::sync::Arc;

use async_trait::async_trait;
use jiff::{Span, Timestamp};
use sqlx::PgPool;
use tracing::instrument;

use super::{PushOptions, QueueDriver, Reserved, Result};
use crate::{
    job::seconds,
    manager::{self, ConnectionConfig, DriverFactory},
};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    queue: String,
    payload: String,
    attempts: i32,
    reserved_at: Option<i64>,
    available_at: i64,
    created_at: i64,
}

impl TryFrom<JobRow> for Reserved {
    type Error = jiff::Error;

    fn try_from(row: JobRow) -> std::result::Result<Self, Self::Error> {
        let available_at = Timestamp::from_second(row.available_at)?;
        Ok(Self {
            id: row.id,
            queue: row.queue,
            payload: row.payload,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            reserved_at: row
                .reserved_at
                .map(Timestamp::from_second)
                .transpose()?
                .unwrap_or(available_at),
            available_at,
            created_at: Timestamp::from_second(row.created_at)?,
        })
    }
}

/// A driver backed by the PostgreSQL `jobs` table.
///
/// Claims are made with a single `update ... for update skip locked`
/// statement, so concurrent workers never claim the same record.
#[derive(Debug, Clone)]
pub struct DatabaseDriver {
    pool: PgPool,
    default_queue: String,
    retry_after: u64,
}

impl DatabaseDriver {
    /// Creates a driver with the given default queue and reservation expiry,
    /// in seconds.
    pub fn new(pool: PgPool, default_queue: impl Into<String>, retry_after: u64) -> Self {
        Self {
            pool,
            default_queue: default_queue.into(),
            retry_after,
        }
    }

    /// A factory building database drivers on `pool`, for
    /// [`QueueManager::extend`](crate::QueueManager::extend).
    pub fn factory(pool: PgPool) -> DriverFactory {
        Arc::new(
            move |_name: &str, config: &ConnectionConfig| -> manager::Result<Arc<dyn QueueDriver>> {
                Ok(Arc::new(DatabaseDriver::new(
                    pool.clone(),
                    config.queue.clone(),
                    config.retry_after,
                )))
            },
        )
    }

    fn queue<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.default_queue)
    }
}

#[async_trait]
impl QueueDriver for DatabaseDriver {
    #[instrument(skip(self, payload), fields(queue = self.queue(queue)), err)]
    async fn push_raw(&self, payload: String, queue: Option<&str>, options: PushOptions) -> Result {
        let now = Timestamp::now();
        let available_at = options.available_at.unwrap_or(now);

        sqlx::query(
            r#"
            insert into jobs (queue, payload, attempts, reserved_at, available_at, created_at)
            values ($1, $2, $3, null, $4, $5)
            "#,
        )
        .bind(self.queue(queue))
        .bind(payload)
        .bind(i32::try_from(options.attempts).unwrap_or(i32::MAX))
        .bind(available_at.as_second())
        .bind(now.as_second())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(queue = self.queue(queue), job.record_id = tracing::field::Empty), err)]
    async fn pop(&self, queue: Option<&str>) -> Result<Option<Reserved>> {
        let now = Timestamp::now();
        let expired_before = now.checked_sub(seconds(self.retry_after))?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            update jobs
            set reserved_at = $2,
                attempts = attempts + 1
            where id = (
                select id
                from jobs
                where queue = $1
                  and (
                      -- Unclaimed and due.
                      (reserved_at is null and available_at <= $2)
                      -- Claimed by a worker which has since gone quiet.
                      or reserved_at <= $3
                  )
                order by id
                limit 1
                for update skip locked
            )
            returning id, queue, payload, attempts, reserved_at, available_at, created_at
            "#,
        )
        .bind(self.queue(queue))
        .bind(now.as_second())
        .bind(expired_before.as_second())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        tracing::Span::current().record("job.record_id", row.id);

        Ok(Some(row.try_into()?))
    }

    #[instrument(skip(self), err)]
    async fn release(&self, id: i64, delay: Span) -> Result {
        let available_at = Timestamp::now().checked_add(delay)?;

        sqlx::query(
            r#"
            update jobs
            set reserved_at = null,
                available_at = $2
            where id = $1
            "#,
        )
        .bind(id)
        .bind(available_at.as_second())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, id: i64) -> Result {
        sqlx::query(
            r#"
            delete from jobs
            where id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(queue = self.queue(queue)), err)]
    async fn clear(&self, queue: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            delete from jobs
            where queue = $1
            "#,
        )
        .bind(self.queue(queue))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(queue = self.queue(queue)), err)]
    async fn size(&self, queue: Option<&str>) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            select count(*)
            from jobs
            where queue = $1
            "#,
        )
        .bind(self.queue(queue))
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
