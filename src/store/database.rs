use async_trait::async_trait;
use jiff::{Span, Timestamp};
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;

use super::{expires_at, Result, Store};

/// A [`Store`] backed by the `cache` table.
///
/// Expiry is stored as unix seconds and checked on read; expired rows are
/// overwritten in place by later writes.
#[derive(Debug, Clone)]
pub struct DatabaseStore {
    pool: PgPool,
}

impl DatabaseStore {
    /// Creates a store over the `cache` table.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Deletes every expired row, returning how many were removed.
    #[instrument(skip(self), err)]
    pub async fn prune(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            delete from cache
            where expires_at is not null
              and expires_at <= $1
            "#,
        )
        .bind(Timestamp::now().as_second())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn seconds(timestamp: Option<Timestamp>) -> Option<i64> {
    timestamp.map(|timestamp| timestamp.as_second())
}

#[async_trait]
impl Store for DatabaseStore {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let value = sqlx::query_scalar::<_, Value>(
            r#"
            select value
            from cache
            where key = $1
              and (expires_at is null or expires_at > $2)
            "#,
        )
        .bind(key)
        .bind(Timestamp::now().as_second())
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    #[instrument(skip(self, value), err)]
    async fn put(&self, key: &str, value: Value, ttl: Option<Span>) -> Result {
        let expires_at = expires_at(Timestamp::now(), ttl)?;
        sqlx::query(
            r#"
            insert into cache (key, value, expires_at)
            values ($1, $2, $3)
            on conflict (key) do update
            set value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(seconds(expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, value), err)]
    async fn add(&self, key: &str, value: Value, ttl: Option<Span>) -> Result<bool> {
        let now = Timestamp::now();
        let expires_at = expires_at(now, ttl)?;
        let result = sqlx::query(
            r#"
            insert into cache (key, value, expires_at)
            values ($1, $2, $3)
            on conflict (key) do update
            set value = excluded.value,
                expires_at = excluded.expires_at
            where cache.expires_at is not null
              and cache.expires_at <= $4
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(seconds(expires_at))
        .bind(now.as_second())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, current, new), err)]
    async fn compare_and_swap(
        &self,
        key: &str,
        current: &Value,
        new: Value,
        ttl: Option<Span>,
    ) -> Result<bool> {
        let now = Timestamp::now();
        let expires_at = expires_at(now, ttl)?;
        let result = sqlx::query(
            r#"
            update cache
            set value = $2,
                expires_at = $3
            where key = $1
              and value = $4
              and (expires_at is null or expires_at > $5)
            "#,
        )
        .bind(key)
        .bind(new)
        .bind(seconds(expires_at))
        .bind(current)
        .bind(now.as_second())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn forget(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            delete from cache
            where key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, current), err)]
    async fn forget_if(&self, key: &str, current: &Value) -> Result<bool> {
        let result = sqlx::query(
            r#"
            delete from cache
            where key = $1
              and value = $2
              and (expires_at is null or expires_at > $3)
            "#,
        )
        .bind(key)
        .bind(current)
        .bind(Timestamp::now().as_second())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
