use async_trait::async_trait;

use super::{Middleware, Next};
use crate::{
    job::{self, seconds, Context},
    store::{Attempt, RateLimiter},
};

/// Limits how often jobs sharing a key may run.
///
/// At most `max_attempts` executions are allowed per window of
/// `decay_seconds`. Jobs over the limit are released until the window resets,
/// or deleted when configured with [`dont_release`](RateLimited::dont_release).
#[derive(Debug, Clone)]
pub struct RateLimited {
    key: String,
    max_attempts: u32,
    decay_seconds: u64,
    release_after: Option<u64>,
    dont_release: bool,
}

impl RateLimited {
    /// Creates a limiter allowing `max_attempts` runs every `decay_seconds`.
    pub fn new(key: impl Into<String>, max_attempts: u32, decay_seconds: u64) -> Self {
        Self {
            key: key.into(),
            max_attempts,
            decay_seconds,
            release_after: None,
            dont_release: false,
        }
    }

    /// Release limited jobs for a fixed number of seconds instead of until
    /// the window resets.
    pub fn release_after(mut self, seconds: u64) -> Self {
        self.release_after = Some(seconds);
        self
    }

    /// Delete limited jobs instead of releasing them.
    pub fn dont_release(mut self) -> Self {
        self.dont_release = true;
        self
    }

    fn cache_key(&self) -> String {
        format!("rate-limited:{}", self.key)
    }
}

#[async_trait]
impl Middleware for RateLimited {
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> job::Result {
        let key = self.cache_key();
        let attempt = RateLimiter::new(cx.store().as_ref())
            .attempt(&key, self.max_attempts, self.decay_seconds)
            .await?;

        match attempt {
            Attempt::Allowed { .. } => next.run(cx).await,

            Attempt::Limited { retry_in } => {
                tracing::debug!(job.id = %cx.id(), key = %self.key, retry_in, "Job rate limited");
                if self.dont_release {
                    cx.delete();
                } else {
                    cx.release(seconds(self.release_after.unwrap_or(retry_in)));
                }
                Ok(())
            }
        }
    }
}
