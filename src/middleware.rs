//! Interceptors wrapping job execution.
//!
//! A job's middleware forms a chain of responsibility around its `handle`
//! method. The first middleware in the list is the outermost: it runs first
//! and sees the result last. A middleware may short-circuit the chain by not
//! calling [`Next::run`], typically after releasing or deleting the job
//! through its [`Context`].
//!
//! ```rust
//! use async_trait::async_trait;
//! use stevedore::{
//!     job::{self, Context},
//!     middleware::{Middleware, Next},
//! };
//!
//! struct LogAttempts;
//!
//! #[async_trait]
//! impl Middleware for LogAttempts {
//!     async fn handle(&self, cx: &mut Context, next: Next<'_>) -> job::Result {
//!         println!("{} attempt {}", cx.display_name(), cx.attempts());
//!         next.run(cx).await
//!     }
//! }
//! ```

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;

pub use self::{
    rate_limited::RateLimited, throttles_exceptions::ThrottlesExceptions,
    without_overlapping::WithoutOverlapping,
};
use crate::job::{self, Context, JobHandler};

mod rate_limited;
mod throttles_exceptions;
mod without_overlapping;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Intercepts the execution of a job.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handles the job, calling `next` to continue down the chain.
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> job::Result;
}

/// The rest of the middleware chain, ending with the job itself.
pub struct Next<'a> {
    job: &'a dyn JobHandler,
    middleware: &'a [Arc<dyn Middleware>],
    timeout: Option<u64>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        job: &'a dyn JobHandler,
        middleware: &'a [Arc<dyn Middleware>],
        timeout: Option<u64>,
    ) -> Self {
        Self {
            job,
            middleware,
            timeout,
        }
    }

    /// Runs the remaining middleware and then the job.
    pub fn run<'b>(self, cx: &'b mut Context) -> BoxFuture<'b, job::Result>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.middleware.split_first() {
                Some((first, rest)) => {
                    let next = Next {
                        job: self.job,
                        middleware: rest,
                        timeout: self.timeout,
                    };
                    first.handle(cx, next).await
                }
                None => execute(self.job, cx, self.timeout).await,
            }
        })
    }
}

/// Races the job against its timeout, when it has one.
async fn execute(job: &dyn JobHandler, cx: &mut Context, timeout: Option<u64>) -> job::Result {
    let Some(timeout) = timeout.filter(|timeout| *timeout > 0) else {
        return job.handle(cx).await;
    };

    let name = cx.display_name().to_string();
    let cancellation_token = cx.cancellation_token();

    tokio::select! {
        result = job.handle(cx) => result,

        _ = tokio::time::sleep(Duration::from_secs(timeout)) => {
            cancellation_token.cancel();
            tracing::warn!(job.name = %name, timeout, "Job timed out");
            Err(job::Error::TimedOut { name, timeout })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        job::{new_id, Job, RegisteredJob},
        store::{MemoryStore, Store},
    };

    /// Runs `job` once through `middleware` with a fresh context on `store`.
    pub(crate) async fn run_with<J: Job>(
        job: J,
        middleware: Vec<Arc<dyn Middleware>>,
        store: Arc<dyn Store>,
    ) -> (Context, job::Result) {
        let handler = RegisteredJob::new(job);
        let mut cx = Context::new(new_id(), J::NAME, store);
        let result = Next::new(&handler, &middleware, None).run(&mut cx).await;
        (cx, result)
    }

    struct Record {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Record {
        async fn handle(&self, cx: &mut Context, next: Next<'_>) -> job::Result {
            self.log.lock().push(format!("{} before", self.label));
            let result = next.run(cx).await;
            self.log.lock().push(format!("{} after", self.label));
            result
        }
    }

    struct Skip;

    #[async_trait]
    impl Middleware for Skip {
        async fn handle(&self, cx: &mut Context, _next: Next<'_>) -> job::Result {
            cx.delete();
            Ok(())
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Noop;

    impl Job for Noop {
        const NAME: &'static str = "noop";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Ok(())
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Unreachable;

    impl Job for Unreachable {
        const NAME: &'static str = "unreachable";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            panic!("short-circuited jobs must not run");
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
    }

    #[tokio::test]
    async fn first_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middleware: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Record {
                label: "outer",
                log: log.clone(),
            }),
            Arc::new(Record {
                label: "inner",
                log: log.clone(),
            }),
        ];

        let (_, result) = run_with(Noop, middleware, Arc::new(MemoryStore::new())).await;
        assert!(result.is_ok());
        assert_eq!(
            *log.lock(),
            vec!["outer before", "inner before", "inner after", "outer after"]
        );
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let (cx, result) = run_with(
            Unreachable,
            vec![Arc::new(Skip) as Arc<dyn Middleware>],
            Arc::new(MemoryStore::new()),
        )
        .await;

        assert!(result.is_ok());
        assert!(cx.is_deleted());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_cancel_the_job() {
        let handler = RegisteredJob::new(Sleepy);
        let mut cx = Context::new(new_id(), "sleepy", Arc::new(MemoryStore::new()));

        let result = Next::new(&handler, &[], Some(5)).run(&mut cx).await;

        assert!(matches!(
            result,
            Err(job::Error::TimedOut { timeout: 5, .. })
        ));
        assert!(cx.is_cancelled());
    }
}
