use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde_json::Value;

use super::{Context, Error as JobError, Job, Options, Result as JobResult};
use crate::middleware::Middleware;

/// A type alias for registry results.
pub type Result<T> = std::result::Result<T, Error>;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The payload names a job which was never registered.
    #[error("No job is registered under `{0}`.")]
    UnknownJob(String),

    /// The job's data could not be deserialized into the registered type.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Object-safe view of a deserialized [`Job`].
pub(crate) trait JobHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn display_name(&self) -> String;

    fn data(&self) -> serde_json::Result<Value>;

    fn options(&self) -> Options;

    fn middleware(&self) -> Vec<Arc<dyn Middleware>>;

    fn handle<'a>(
        &'a self,
        cx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = JobResult> + Send + 'a>>;

    fn failed<'a>(
        &'a self,
        error: &'a JobError,
    ) -> Pin<Box<dyn Future<Output = JobResult> + Send + 'a>>;
}

pub(crate) struct RegisteredJob<J: Job> {
    inner: J,
}

impl<J: Job> RegisteredJob<J> {
    pub(crate) fn new(inner: J) -> Self {
        Self { inner }
    }
}

impl<J: Job> JobHandler for RegisteredJob<J> {
    fn name(&self) -> &'static str {
        J::NAME
    }

    fn display_name(&self) -> String {
        self.inner.display_name()
    }

    fn data(&self) -> serde_json::Result<Value> {
        serde_json::to_value(&self.inner)
    }

    fn options(&self) -> Options {
        Options::for_job(&self.inner)
    }

    fn middleware(&self) -> Vec<Arc<dyn Middleware>> {
        self.inner.middleware()
    }

    fn handle<'a>(
        &'a self,
        cx: &'a mut Context,
    ) -> Pin<Box<dyn Future<Output = JobResult> + Send + 'a>> {
        Box::pin(self.inner.handle(cx))
    }

    fn failed<'a>(
        &'a self,
        error: &'a JobError,
    ) -> Pin<Box<dyn Future<Output = JobResult> + Send + 'a>> {
        Box::pin(self.inner.failed(error))
    }
}

type Resolver = fn(Value) -> serde_json::Result<Arc<dyn JobHandler>>;

fn resolve_job<J: Job>(data: Value) -> serde_json::Result<Arc<dyn JobHandler>> {
    let job: J = serde_json::from_value(data)?;
    Ok(Arc::new(RegisteredJob::new(job)))
}

/// Maps job names to the types they deserialize into.
///
/// Workers can only run jobs whose type has been registered here; payloads
/// naming anything else are discarded.
#[derive(Clone, Default)]
pub struct Registry {
    resolvers: HashMap<&'static str, Resolver>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.resolvers.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("Registry").field("jobs", &names).finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job type under its [`NAME`](Job::NAME).
    pub fn register<J: Job>(&mut self) -> &mut Self {
        if self.resolvers.insert(J::NAME, resolve_job::<J>).is_some() {
            tracing::warn!(job.name = J::NAME, "Job registered more than once");
        }
        self
    }

    /// Returns `true` if a job type is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    pub(crate) fn resolve(&self, name: &str, data: Value) -> Result<Arc<dyn JobHandler>> {
        let resolver = self
            .resolvers
            .get(name)
            .ok_or_else(|| Error::UnknownJob(name.to_string()))?;

        Ok(resolver(data)?)
    }
}
