use async_trait::async_trait;
use serde_json::json;

use super::{Middleware, Next};
use crate::job::{self, seconds, Context};

/// Prevents jobs sharing a key from running at the same time.
///
/// The lock lives in the context's store. A job finding it held is released
/// for `release_after` seconds, or deleted when configured with
/// [`dont_release`](WithoutOverlapping::dont_release). The lock is removed
/// once the job finishes, whatever its result; set
/// [`expire_after`](WithoutOverlapping::expire_after) so a crashed worker
/// can't hold it forever.
#[derive(Debug, Clone)]
pub struct WithoutOverlapping {
    key: String,
    release_after: u64,
    expire_after: Option<u64>,
    dont_release: bool,
}

impl WithoutOverlapping {
    /// Creates a lock over `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            release_after: 1,
            expire_after: None,
            dont_release: false,
        }
    }

    /// Seconds to wait before retrying a job which found the lock held.
    pub fn release_after(mut self, seconds: u64) -> Self {
        self.release_after = seconds;
        self
    }

    /// Seconds after which the lock expires on its own.
    ///
    /// A job outliving its lock leaves alone whatever lock another job has
    /// taken since.
    pub fn expire_after(mut self, seconds: u64) -> Self {
        self.expire_after = Some(seconds);
        self
    }

    /// Delete jobs which found the lock held instead of releasing them.
    pub fn dont_release(mut self) -> Self {
        self.dont_release = true;
        self
    }

    fn lock_key(&self) -> String {
        format!("overlap:{}", self.key)
    }
}

#[async_trait]
impl Middleware for WithoutOverlapping {
    async fn handle(&self, cx: &mut Context, next: Next<'_>) -> job::Result {
        let lock_key = self.lock_key();
        let store = cx.store().clone();
        let owner = json!({ "job": cx.id() });

        if !store
            .add(&lock_key, owner.clone(), self.expire_after.map(seconds))
            .await?
        {
            tracing::debug!(job.id = %cx.id(), key = %self.key, "Job overlaps a running job");
            if self.dont_release {
                cx.delete();
            } else {
                cx.release(seconds(self.release_after));
            }
            return Ok(());
        }

        let result = next.run(cx).await;

        // An expired lock may have been taken over; only remove our own.
        match store.forget_if(&lock_key, &owner).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job.id = %cx.id(), key = %self.key, "Overlap lock expired while the job ran");
            }
            Err(err) => {
                tracing::error!(key = %self.key, %err, "Failed to release overlap lock");
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};
    use tokio::sync::{oneshot, Notify};

    use super::*;
    use crate::{
        job::{Job, Status},
        middleware::tests::run_with,
        store::{MemoryStore, Store},
    };

    #[derive(Deserialize, Serialize)]
    struct Quick;

    impl Job for Quick {
        const NAME: &'static str = "quick";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Ok(())
        }
    }

    #[derive(Deserialize, Serialize)]
    struct Failing;

    impl Job for Failing {
        const NAME: &'static str = "failing";

        async fn handle(&self, _cx: &mut Context) -> job::Result {
            Err(job::Error::failed("boom"))
        }
    }

    fn exclusive() -> Vec<Arc<dyn Middleware>> {
        vec![Arc::new(WithoutOverlapping::new("invoices").release_after(5))]
    }

    struct Gate {
        started: Option<oneshot::Sender<()>>,
        finish: Arc<Notify>,
    }

    // Holds the lock until the test lets it go.
    struct Blocking(parking_lot::Mutex<Gate>);

    #[async_trait]
    impl Middleware for Blocking {
        async fn handle(&self, cx: &mut Context, next: Next<'_>) -> job::Result {
            let (started, finish) = {
                let mut gate = self.0.lock();
                (gate.started.take(), gate.finish.clone())
            };
            if let Some(started) = started {
                let _ = started.send(());
            }
            finish.notified().await;
            next.run(cx).await
        }
    }

    #[tokio::test]
    async fn overlapping_jobs_are_released_until_the_lock_is_freed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let (started_tx, started_rx) = oneshot::channel();
        let finish = Arc::new(Notify::new());

        let holder: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(WithoutOverlapping::new("invoices")),
            Arc::new(Blocking(parking_lot::Mutex::new(Gate {
                started: Some(started_tx),
                finish: finish.clone(),
            }))),
        ];
        let running = tokio::spawn(run_with(Quick, holder, store.clone()));
        started_rx.await.unwrap();

        let (cx, result) = run_with(Quick, exclusive(), store.clone()).await;
        assert!(result.is_ok());
        assert!(matches!(cx.status(), Status::Released(delay) if delay.get_seconds() == 5));

        finish.notify_one();
        let (cx, result) = running.await.unwrap();
        assert!(result.is_ok());
        assert!(!cx.status().is_terminal());

        let (cx, _) = run_with(Quick, exclusive(), store.clone()).await;
        assert!(!cx.status().is_terminal());
    }

    #[tokio::test]
    async fn lock_is_freed_on_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let (_, result) = run_with(Failing, exclusive(), store.clone()).await;
        assert!(result.is_err());
        assert_eq!(store.get("overlap:invoices").await.unwrap(), None);
    }

    // Takes over the lock mid-run, as a second job would once it expired.
    struct Takeover;

    #[async_trait]
    impl Middleware for Takeover {
        async fn handle(&self, cx: &mut Context, next: Next<'_>) -> job::Result {
            cx.store()
                .put("overlap:invoices", json!({ "job": "successor" }), None)
                .await?;
            next.run(cx).await
        }
    }

    #[tokio::test]
    async fn expired_lock_taken_over_is_left_alone() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let middleware: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(WithoutOverlapping::new("invoices").expire_after(1)),
            Arc::new(Takeover),
        ];

        let (_, result) = run_with(Quick, middleware, store.clone()).await;
        assert!(result.is_ok());
        assert_eq!(
            store.get("overlap:invoices").await.unwrap(),
            Some(json!({ "job": "successor" }))
        );

        let (cx, _) = run_with(Quick, exclusive(), store.clone()).await;
        assert!(matches!(cx.status(), Status::Released(_)));
    }

    #[tokio::test]
    async fn dont_release_deletes() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .add("overlap:invoices", json!({}), None)
            .await
            .unwrap();

        let middleware: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(WithoutOverlapping::new("invoices").dont_release())];
        let (cx, _) = run_with(Quick, middleware, store).await;
        assert!(cx.is_deleted());
    }
}
