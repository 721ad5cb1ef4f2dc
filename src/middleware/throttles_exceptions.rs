use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::{Middleware, Next};
use crate::{
    job::{self, seconds, Context},
    store::RateLimiter,
};

type Predicate = Arc<dyn Fn(&job::Error) -> bool + Send + Sync>;

/// Backs off a job which keeps failing.
///
/// Each error counts against a window of `decay_seconds` keyed by the job's
/// display name (or a custom key). Once `max_exceptions` errors have been
/// counted, further attempts don't run: they are released until the window
/// resets, or deleted when configured with
/// [`delete_when_throttled`](ThrottlesExceptions::delete_when_throttled).
/// A success clears the count.
#[derive(Clone)]
pub struct ThrottlesExceptions {
    max_exceptions: u32,
    decay_seconds: u64,
    key: Option<String>,
    backoff: Option<u64>,
    delete_when_throttled: bool,
    when: Option<Predicate>,
}

impl fmt::Debug for ThrottlesExceptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottlesExceptions")
            .field("max_exceptions", &self.max_exceptions)
            .field("decay_seconds", &self.decay_seconds)
            .field("key", &self.key)
            .field("backoff", &self.backoff)
            .field("delete_when_throttled", &self.delete_when_throttled)
            .finish_non_exhaustive()
    }
}

impl ThrottlesExceptions {
    /// Creates a throttle allowing `max_exceptions` errors every `decay_seconds`.
    pub fn new(max_exceptions: u32, decay_seconds: u64) -> Self {
        Self {
            max_exceptions,
            decay_seconds,
            key: None,
            backoff: None,
            delete_when_throttled: false,
            when: None,
        }
    }

    /// Count errors under `key` instead of the job's display name.
    pub fn by(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Release throttled jobs for a fixed number of seconds instead of until
    /// the window resets.
    pub fn backoff(mut self, seconds: u64) -> Self {
        self.backoff = Some(seconds);
        self
    }

    /// Delete throttled jobs instead of releasing them.
    pub fn delete_when_throttled(mut self) -> Self {
        self.delete_when_throttled = true;
        self
    }

    /// Only count errors matching `predicate`.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&job::Error) -> bool + Send + Sync + 'static,
    {
        self.when = Some(Arc::new(predicate));
        self
    }

    fn cache_key(&self, cx: &Context) -> String {
        let key = self.key.as_deref().unwrap_or(cx.display_name());
        format!("throttles-exceptions:{key}")
    }
}

#[async_trait]
impl Middleware for ThrottlesExceptions {
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> job::Result {
        let key = self.cache_key(cx);
        let store = cx.store().clone();
        let limiter = RateLimiter::new(store.as_ref());

        if let Some(retry_in) = limiter.too_many_attempts(&key, self.max_exceptions).await? {
            tracing::debug!(job.id = %cx.id(), %key, retry_in, "Job throttled after repeated errors");
            if self.delete_when_throttled {
                cx.delete();
            } else {
                cx.release(seconds(self.backoff.unwrap_or(retry_in)));
            }
            return Ok(());
        }

        match next.run(cx).await {
            Ok(()) => {
                limiter.clear(&key).await?;
                Ok(())
            }

            Err(err) => {
                if self.when.as_ref().map_or(true, |when| when(&err)) {
                    limiter.hit(&key, self.decay_seconds).await?;
                }
                Err(err)
            }
        }
    }
}
