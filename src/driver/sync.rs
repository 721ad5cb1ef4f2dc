use std::sync::Arc;

use async_trait::async_trait;
use jiff::Span;

use super::{PushOptions, QueueDriver, QueuedJob, Reserved, Result};
use crate::{
    job::{self, Context, Delay, Id},
    middleware::{BoxFuture, Next},
    store::{MemoryStore, Store},
};

/// Runs a job pushed to a [`SyncDriver`], on the given queue.
pub type SyncExecutor =
    Arc<dyn Fn(QueuedJob, String) -> BoxFuture<'static, job::Result> + Send + Sync>;

/// Runs `job` in the current task through its middleware, without a timeout.
///
/// A job which asks to be failed is reported as an error. The job's `failed`
/// hook is invoked on error; errors from the hook itself are logged.
pub(crate) async fn run_in_process(
    job: &QueuedJob,
    store: Arc<dyn Store>,
    connection: &str,
    queue: &str,
) -> (Context, job::Result) {
    let mut cx = Context::new(job.id(), job.handler.display_name(), store)
        .on(connection, queue)
        .in_batch(job.batch_id);

    let middleware = job.handler.middleware();
    let mut result = Next::new(&*job.handler, &middleware, None)
        .run(&mut cx)
        .await;

    if result.is_ok() {
        if let job::Status::Failed(reason) = cx.status() {
            result = Err(job::Error::Failed(reason.clone()));
        }
    }

    if let Err(err) = &result {
        if let Err(hook_err) = job.handler.failed(err).await {
            tracing::error!(job.id = %job.id(), err = %hook_err, "Job failure hook returned an error");
        }
    }

    (cx, result)
}

/// A driver which runs jobs as soon as they are pushed.
///
/// Nothing is stored: delays are ignored, a failing job's error is returned
/// from the push, and there is never anything to pop.
#[derive(Clone)]
pub struct SyncDriver {
    default_queue: String,
    executor: SyncExecutor,
}

impl std::fmt::Debug for SyncDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDriver")
            .field("default_queue", &self.default_queue)
            .finish_non_exhaustive()
    }
}

impl Default for SyncDriver {
    fn default() -> Self {
        Self::new("default")
    }
}

impl SyncDriver {
    /// Creates a driver running jobs with a private in-memory store.
    pub fn new(default_queue: impl Into<String>) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let executor: SyncExecutor = Arc::new(
            move |job: QueuedJob, queue: String| -> BoxFuture<'static, job::Result> {
                let store = store.clone();
                Box::pin(async move {
                    let (_, result) = run_in_process(&job, store, "sync", &queue).await;
                    result
                })
            },
        );

        Self::with_executor(default_queue, executor)
    }

    /// Creates a driver handing jobs to `executor`.
    pub fn with_executor(default_queue: impl Into<String>, executor: SyncExecutor) -> Self {
        Self {
            default_queue: default_queue.into(),
            executor,
        }
    }
}

#[async_trait]
impl QueueDriver for SyncDriver {
    async fn push(&self, job: QueuedJob, queue: Option<&str>) -> Result<Id> {
        let id = job.id();
        let queue = queue.unwrap_or(&self.default_queue).to_string();
        (self.executor)(job, queue).await?;
        Ok(id)
    }

    async fn push_raw(&self, _payload: String, _queue: Option<&str>, _options: PushOptions) -> Result {
        tracing::warn!("The sync driver cannot run raw payloads; discarding");
        Ok(())
    }

    async fn later(&self, _delay: Delay, job: QueuedJob, queue: Option<&str>) -> Result<Id> {
        self.push(job, queue).await
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
