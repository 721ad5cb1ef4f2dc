use async_trait::async_trait;
use jiff::Span;

use super::{PushOptions, QueueDriver, Reserved, Result};

/// A driver which discards every job.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDriver;

#[async_trait]
impl QueueDriver for NullDriver {
    async fn push_raw(&self, _payload: String, _queue: Option<&str>, _options: PushOptions) -> Result {
        Ok(())
    }

    async fn pop(&self, _queue: Option<&str>) -> Result<Option<Reserved>> {
        Ok(None)
    }

    async fn release(&self, _id: i64, _delay: Span) -> Result {
        Ok(())
    }

    async fn delete(&self, _id: i64) -> Result {
        Ok(())
    }

    async fn clear(&self, _queue: Option<&str>) -> Result<u64> {
        Ok(0)
    }

    async fn size(&self, _queue: Option<&str>) -> Result<u64> {
        Ok(0)
    }
}
