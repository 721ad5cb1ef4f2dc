use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use jiff::{Span, Timestamp};
use parking_lot::Mutex;

use super::{PushOptions, QueueDriver, Reserved, Result};
use crate::job::seconds;

#[derive(Debug, Clone)]
struct Row {
    queue: String,
    payload: String,
    attempts: u32,
    reserved_at: Option<Timestamp>,
    available_at: Timestamp,
    created_at: Timestamp,
}

impl Row {
    fn is_claimable(&self, now: Timestamp, expired_before: Timestamp) -> bool {
        match self.reserved_at {
            None => self.available_at <= now,
            Some(reserved_at) => reserved_at <= expired_before,
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, Row>,
}

/// A driver keeping records in process memory.
///
/// Records follow the same claim rules as the database driver, so it is a
/// stand-in for tests and for single-process deployments that can afford to
/// lose queued jobs on restart.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    table: Arc<Mutex<Table>>,
    default_queue: String,
    retry_after: u64,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new("default", 90)
    }
}

impl MemoryDriver {
    /// Creates a driver with the given default queue and reservation expiry,
    /// in seconds.
    pub fn new(default_queue: impl Into<String>, retry_after: u64) -> Self {
        Self {
            table: Arc::default(),
            default_queue: default_queue.into(),
            retry_after,
        }
    }

    fn queue<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or(&self.default_queue)
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    async fn push_raw(&self, payload: String, queue: Option<&str>, options: PushOptions) -> Result {
        let now = Timestamp::now();
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.rows.insert(
            id,
            Row {
                queue: self.queue(queue).to_string(),
                payload,
                attempts: options.attempts,
                reserved_at: None,
                available_at: options.available_at.unwrap_or(now),
                created_at: now,
            },
        );
        Ok(())
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Reserved>> {
        let queue = self.queue(queue);
        let now = Timestamp::now();
        let expired_before = now.checked_sub(seconds(self.retry_after))?;

        let mut table = self.table.lock();
        let Some((&id, row)) = table
            .rows
            .iter_mut()
            .find(|(_, row)| row.queue == queue && row.is_claimable(now, expired_before))
        else {
            return Ok(None);
        };

        row.reserved_at = Some(now);
        row.attempts += 1;

        Ok(Some(Reserved {
            id,
            queue: row.queue.clone(),
            payload: row.payload.clone(),
            attempts: row.attempts,
            reserved_at: now,
            available_at: row.available_at,
            created_at: row.created_at,
        }))
    }

    async fn release(&self, id: i64, delay: Span) -> Result {
        let available_at = Timestamp::now().checked_add(delay)?;
        if let Some(row) = self.table.lock().rows.get_mut(&id) {
            row.reserved_at = None;
            row.available_at = available_at;
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result {
        self.table.lock().rows.remove(&id);
        Ok(())
    }

    async fn clear(&self, queue: Option<&str>) -> Result<u64> {
        let queue = self.queue(queue);
        let mut table = self.table.lock();
        let before = table.rows.len();
        table.rows.retain(|_, row| row.queue != queue);
        Ok((before - table.rows.len()) as u64)
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64> {
        let queue = self.queue(queue);
        Ok(self
            .table
            .lock()
            .rows
            .values()
            .filter(|row| row.queue == queue)
            .count() as u64)
    }
}
