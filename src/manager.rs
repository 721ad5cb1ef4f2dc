//! Connections, dispatching, and worker callbacks.
//!
//! The [`QueueManager`] is the entry point for producers. It owns the named
//! connections configured in [`Config`], builds their drivers lazily through
//! registered [`DriverFactory`] functions, and routes dispatched jobs to them.
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use stevedore::{
//!     job::{self, Context, Job},
//!     Config, ConnectionConfig, QueueManager,
//! };
//!
//! #[derive(Deserialize, Serialize)]
//! struct PruneSessions;
//!
//! impl Job for PruneSessions {
//!     const NAME: &'static str = "prune-sessions";
//!
//!     async fn handle(&self, _cx: &mut Context) -> job::Result {
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new("memory").connection("memory", ConnectionConfig::new("memory"));
//! let manager = QueueManager::builder(config)
//!     .register::<PruneSessions>()
//!     .build();
//!
//! manager.dispatch(PruneSessions).on_queue("maintenance").await?;
//! assert_eq!(manager.size(None, Some("maintenance")).await?, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Transactions
//!
//! Jobs dispatched with `after_commit` while a transaction is open are held
//! back until the outermost transaction commits, and dropped if it rolls back.
//! Transactions are tracked per manager, not per task.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use jiff::Timestamp;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    batch::{self, Batch, BatchRepository, MemoryBatchRepository, PendingBatch},
    dispatch::{self, PendingChain, PendingDispatch},
    driver::{
        self, MemoryDriver, NullDriver, PushOptions, QueueDriver, QueuedJob, SyncDriver,
        SyncExecutor,
    },
    failed::{self, FailedJobProvider},
    job::{self, Id, Job, JobHandler, Registry, RegistryError},
    middleware::BoxFuture,
    payload::{JobPayload, StoredJob},
    store::{self, MemoryStore, Store},
};

/// A type alias for manager results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Queue manager errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No connection with this name is configured.
    #[error("Queue connection `{0}` is not configured.")]
    UnknownConnection(String),

    /// The connection names a driver no factory was registered for.
    #[error("Queue connection `{connection}` uses unsupported driver `{driver}`.")]
    UnsupportedDriver {
        /// Name of the connection.
        connection: String,

        /// Driver the connection asked for.
        driver: String,
    },

    /// A chain was dispatched without links.
    #[error("Cannot dispatch an empty chain.")]
    EmptyChain,

    /// A batch was dispatched without jobs.
    #[error("Cannot dispatch an empty batch.")]
    EmptyBatch,

    /// A transaction was committed or rolled back without being begun.
    #[error("No transaction is open.")]
    NoTransaction,

    /// No failed job record has this id.
    #[error("Failed job `{0}` does not exist.")]
    FailedJobNotFound(i64),

    /// Error returned by a connection's driver.
    #[error(transparent)]
    Driver(#[from] driver::Error),

    /// Error returned by the shared store.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Error returned by the batch repository.
    #[error(transparent)]
    Batch(#[from] batch::Error),

    /// Error returned by the failed job provider.
    #[error(transparent)]
    FailedJobs(#[from] failed::Error),

    /// Error returned when resolving a stored job.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Error returned by the `serde_json` crate when encoding a job.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error returned by a job run in process.
    #[error(transparent)]
    Job(#[from] job::Error),
}

const RESTART_KEY: &str = "stevedore:restart";

fn default_connection() -> String {
    "sync".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

const fn default_retry_after() -> u64 {
    90
}

/// Queue configuration: a default connection and the named connections.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Connection used when a job doesn't name one.
    #[serde(default = "default_connection")]
    pub default: String,

    /// Connections by name.
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(default_connection()).connection("sync", ConnectionConfig::new("sync"))
    }
}

impl Config {
    /// Creates a configuration with no connections, defaulting to `default`.
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            connections: HashMap::new(),
        }
    }

    /// Adds a named connection.
    pub fn connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }
}

/// Settings of a single connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Name of the driver factory building this connection.
    pub driver: String,

    /// Queue used when a job doesn't name one.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Seconds after which a claimed record is considered abandoned.
    #[serde(default = "default_retry_after")]
    pub retry_after: u64,

    /// Whether jobs on this connection wait for open transactions to commit.
    #[serde(default)]
    pub after_commit: bool,
}

impl ConnectionConfig {
    /// Creates settings for a connection using `driver`.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            queue: default_queue(),
            retry_after: default_retry_after(),
            after_commit: false,
        }
    }

    /// Sets the default queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the seconds after which claimed records are reclaimed.
    pub const fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = seconds;
        self
    }

    /// Sets whether jobs wait for open transactions to commit.
    pub const fn after_commit(mut self, after_commit: bool) -> Self {
        self.after_commit = after_commit;
        self
    }
}

/// Builds the driver of a named connection.
pub type DriverFactory =
    Arc<dyn Fn(&str, &ConnectionConfig) -> Result<Arc<dyn QueueDriver>> + Send + Sync>;

/// What a worker is doing with a job, for callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    /// Connection the job came from.
    pub connection: String,
    /// Queue the job came from.
    pub queue: String,
    /// Id of the job, as dispatched.
    pub id: Id,
    /// Display name of the job.
    pub name: String,
    /// Attempts made, including the current one.
    pub attempts: u32,
}

impl JobEvent {
    pub(crate) fn new(connection: &str, queue: &str, payload: &JobPayload, attempts: u32) -> Self {
        Self {
            connection: connection.to_string(),
            queue: queue.to_string(),
            id: payload.uuid,
            name: payload.display_name.clone(),
            attempts,
        }
    }
}

/// A worker about to poll for its next job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopEvent {
    /// Connection the worker polls.
    pub connection: String,
    /// Comma separated queues the worker polls, in priority order.
    pub queues: String,
}

type JobCallback = Arc<dyn Fn(&JobEvent) + Send + Sync>;
type FailingCallback = Arc<dyn Fn(&JobEvent, &job::Error) + Send + Sync>;
type LoopingCallback = Arc<dyn Fn(&LoopEvent) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    before: Vec<JobCallback>,
    after: Vec<JobCallback>,
    failing: Vec<FailingCallback>,
    looping: Vec<LoopingCallback>,
}

struct Inner {
    config: Config,
    factories: RwLock<HashMap<String, DriverFactory>>,
    drivers: RwLock<HashMap<String, Arc<dyn QueueDriver>>>,
    registry: RwLock<Registry>,
    callbacks: RwLock<Callbacks>,
    store: Arc<dyn Store>,
    batches: Arc<dyn BatchRepository>,
    transactions: Mutex<Vec<Vec<QueuedJob>>>,
}

/// Builder for [`QueueManager`].
pub struct Builder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    batches: Option<Arc<dyn BatchRepository>>,
    registry: Registry,
    factories: Vec<(String, DriverFactory)>,
}

impl Builder {
    /// Sets the store shared by middleware and chains. Defaults to a
    /// [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the batch repository. Defaults to a [`MemoryBatchRepository`].
    pub fn batches(mut self, batches: Arc<dyn BatchRepository>) -> Self {
        self.batches = Some(batches);
        self
    }

    /// Registers a job type.
    pub fn register<J: Job>(mut self) -> Self {
        self.registry.register::<J>();
        self
    }

    /// Registers a driver factory under `driver`.
    pub fn extend(mut self, driver: impl Into<String>, factory: DriverFactory) -> Self {
        self.factories.push((driver.into(), factory));
        self
    }

    /// Builds the manager.
    pub fn build(self) -> QueueManager {
        let Builder {
            config,
            store,
            batches,
            registry,
            factories,
        } = self;

        let inner = Arc::new_cyclic(|manager: &Weak<Inner>| {
            let mut drivers = built_in_factories(manager.clone());
            drivers.extend(factories);

            Inner {
                config,
                factories: RwLock::new(drivers),
                drivers: RwLock::new(HashMap::new()),
                registry: RwLock::new(registry),
                callbacks: RwLock::new(Callbacks::default()),
                store: store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                batches: batches.unwrap_or_else(|| Arc::new(MemoryBatchRepository::new())),
                transactions: Mutex::new(Vec::new()),
            }
        });

        QueueManager { inner }
    }
}

fn built_in_factories(manager: Weak<Inner>) -> HashMap<String, DriverFactory> {
    let sync: DriverFactory = Arc::new(
        move |name: &str, config: &ConnectionConfig| -> Result<Arc<dyn QueueDriver>> {
            let manager = manager.clone();
            let connection = name.to_string();
            let executor: SyncExecutor = Arc::new(
                move |job: QueuedJob, queue: String| -> BoxFuture<'static, job::Result> {
                    let manager = manager.clone();
                    let connection = connection.clone();
                    Box::pin(async move {
                        let Some(inner) = manager.upgrade() else {
                            return Err(job::Error::failed("The queue manager has been dropped."));
                        };
                        QueueManager { inner }
                            .run_now(&connection, &queue, job)
                            .await
                    })
                },
            );
            Ok(Arc::new(SyncDriver::with_executor(
                config.queue.clone(),
                executor,
            )))
        },
    );

    let memory: DriverFactory = Arc::new(
        |_name: &str, config: &ConnectionConfig| -> Result<Arc<dyn QueueDriver>> {
            Ok(Arc::new(MemoryDriver::new(
                config.queue.clone(),
                config.retry_after,
            )))
        },
    );

    let null: DriverFactory = Arc::new(
        |_name: &str, _config: &ConnectionConfig| -> Result<Arc<dyn QueueDriver>> {
            Ok(Arc::new(NullDriver))
        },
    );

    HashMap::from([
        ("sync".to_string(), sync),
        ("memory".to_string(), memory),
        ("null".to_string(), null),
    ])
}

/// Routes jobs to connections and coordinates chains, batches, and workers.
///
/// Cloning is cheap: clones share the same connections, registry, and
/// callbacks.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.inner.config)
            .field("registry", &*self.inner.registry.read())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates a manager with default collaborators.
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    /// Returns a builder for a manager over `config`.
    pub fn builder(config: Config) -> Builder {
        Builder {
            config,
            store: None,
            batches: None,
            registry: Registry::new(),
            factories: Vec::new(),
        }
    }

    /// The configuration the manager was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Registers a job type so workers can run it.
    pub fn register<J: Job>(&self) -> &Self {
        self.inner.registry.write().register::<J>();
        self
    }

    /// Registers a driver factory under `driver`.
    ///
    /// Connections already built keep their drivers.
    pub fn extend(&self, driver: impl Into<String>, factory: DriverFactory) -> &Self {
        self.inner.factories.write().insert(driver.into(), factory);
        self
    }

    /// The store shared by middleware and chains.
    pub fn store(&self) -> Arc<dyn Store> {
        self.inner.store.clone()
    }

    /// The batch repository.
    pub fn batches(&self) -> Arc<dyn BatchRepository> {
        self.inner.batches.clone()
    }

    fn connection_config(&self, name: &str) -> Result<&ConnectionConfig> {
        self.inner
            .config
            .connections
            .get(name)
            .ok_or_else(|| Error::UnknownConnection(name.to_string()))
    }

    /// Returns the driver of the named connection, or of the default
    /// connection, building it on first use.
    pub fn connection(&self, name: Option<&str>) -> Result<Arc<dyn QueueDriver>> {
        let name = name.unwrap_or(&self.inner.config.default);
        if let Some(driver) = self.inner.drivers.read().get(name) {
            return Ok(driver.clone());
        }

        let config = self.connection_config(name)?;
        let factory = self
            .inner
            .factories
            .read()
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| Error::UnsupportedDriver {
                connection: name.to_string(),
                driver: config.driver.clone(),
            })?;

        let mut drivers = self.inner.drivers.write();
        if let Some(driver) = drivers.get(name) {
            return Ok(driver.clone());
        }
        let driver = factory(name, config)?;
        drivers.insert(name.to_string(), driver.clone());
        tracing::debug!(connection = name, driver = %config.driver, "Queue connection established");

        Ok(driver)
    }

    /// Starts building a dispatch of `job`.
    pub fn dispatch<J: Job>(&self, job: J) -> PendingDispatch {
        PendingDispatch::new(self.clone(), QueuedJob::new(job))
    }

    /// Runs `job` immediately in the current task.
    ///
    /// The job's `failed` hook runs on error and the error is returned.
    pub async fn dispatch_sync<J: Job>(&self, job: J) -> Result {
        let job = QueuedJob::new(job)?;
        let connection = job
            .options()
            .connection
            .clone()
            .unwrap_or_else(|| "sync".to_string());
        let queue = job.options().queue.clone().unwrap_or_else(default_queue);

        self.run_now(&connection, &queue, job).await?;
        Ok(())
    }

    /// Starts building a chain.
    pub fn chain(&self) -> PendingChain {
        PendingChain::new(self.clone())
    }

    /// Starts building a batch.
    pub fn batch(&self, name: impl Into<String>) -> PendingBatch {
        PendingBatch::new(self.clone(), name.into())
    }

    /// Looks up a batch.
    pub async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        Ok(self.inner.batches.find(id).await?)
    }

    /// Registers a callback run before each job a worker processes.
    pub fn before<F>(&self, callback: F) -> &Self
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().before.push(Arc::new(callback));
        self
    }

    /// Registers a callback run after each job a worker completes.
    pub fn after<F>(&self, callback: F) -> &Self
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().after.push(Arc::new(callback));
        self
    }

    /// Registers a callback run whenever a job a worker processes errors.
    pub fn failing<F>(&self, callback: F) -> &Self
    where
        F: Fn(&JobEvent, &job::Error) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().failing.push(Arc::new(callback));
        self
    }

    /// Registers a callback run before a worker polls for its next job.
    pub fn looping<F>(&self, callback: F) -> &Self
    where
        F: Fn(&LoopEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().looping.push(Arc::new(callback));
        self
    }

    pub(crate) fn fire_before(&self, event: &JobEvent) {
        let callbacks = self.inner.callbacks.read().before.clone();
        for callback in callbacks {
            callback(event);
        }
    }

    pub(crate) fn fire_after(&self, event: &JobEvent) {
        let callbacks = self.inner.callbacks.read().after.clone();
        for callback in callbacks {
            callback(event);
        }
    }

    pub(crate) fn fire_failing(&self, event: &JobEvent, error: &job::Error) {
        let callbacks = self.inner.callbacks.read().failing.clone();
        for callback in callbacks {
            callback(event, error);
        }
    }

    pub(crate) fn fire_looping(&self, event: &LoopEvent) {
        let callbacks = self.inner.callbacks.read().looping.clone();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Opens a (possibly nested) transaction.
    pub fn begin_transaction(&self) {
        self.inner.transactions.lock().push(Vec::new());
    }

    /// Commits the innermost transaction.
    ///
    /// Jobs held back by it move to the enclosing transaction, or are pushed
    /// when it was the outermost.
    pub async fn commit(&self) -> Result {
        let jobs = {
            let mut transactions = self.inner.transactions.lock();
            let jobs = transactions.pop().ok_or(Error::NoTransaction)?;
            match transactions.last_mut() {
                Some(parent) => {
                    parent.extend(jobs);
                    return Ok(());
                }
                None => jobs,
            }
        };

        for job in jobs {
            self.push(job).await?;
        }

        Ok(())
    }

    /// Rolls back the innermost transaction, dropping the jobs it held back.
    pub fn rollback(&self) -> Result {
        let jobs = self
            .inner
            .transactions
            .lock()
            .pop()
            .ok_or(Error::NoTransaction)?;
        tracing::debug!(discarded = jobs.len(), "Transaction rolled back");
        Ok(())
    }

    /// Signals every worker sharing this manager's store to stop after its
    /// current job.
    pub async fn restart(&self) -> Result {
        let now = Timestamp::now().as_millisecond();
        self.inner.store.put(RESTART_KEY, json!(now), None).await?;
        tracing::info!("Broadcasting queue restart signal");
        Ok(())
    }

    pub(crate) async fn last_restart(&self) -> Result<Option<i64>> {
        Ok(self
            .inner
            .store
            .get(RESTART_KEY)
            .await?
            .as_ref()
            .and_then(Value::as_i64))
    }

    /// Number of records on a queue.
    pub async fn size(&self, connection: Option<&str>, queue: Option<&str>) -> Result<u64> {
        Ok(self.connection(connection)?.size(queue).await?)
    }

    /// Removes every record on a queue.
    pub async fn clear(&self, connection: Option<&str>, queue: Option<&str>) -> Result<u64> {
        let cleared = self.connection(connection)?.clear(queue).await?;
        tracing::info!(cleared, ?connection, ?queue, "Queue cleared");
        Ok(cleared)
    }

    /// Pushes a failed job back onto its queue with a fresh attempt count and
    /// removes it from `failer`.
    pub async fn retry_failed(&self, failer: &dyn FailedJobProvider, id: i64) -> Result<Id> {
        let record = failer
            .find(id)
            .await?
            .ok_or(Error::FailedJobNotFound(id))?;

        let mut payload = JobPayload::decode(&record.payload)?;
        payload.attempts = 0;
        payload.retry_until = self
            .resolve(&payload.job, payload.data.clone())
            .ok()
            .and_then(|handler| handler.options().retry_until);

        self.connection(Some(&record.connection))?
            .push_raw(payload.encode()?, Some(&record.queue), PushOptions::default())
            .await?;
        failer.forget(id).await?;

        tracing::info!(job.id = %payload.uuid, "Failed job pushed back onto the queue");
        Ok(payload.uuid)
    }

    pub(crate) fn resolve(&self, name: &str, data: Value) -> Result<Arc<dyn JobHandler>> {
        Ok(self.inner.registry.read().resolve(name, data)?)
    }

    pub(crate) fn queued_from(&self, stored: &StoredJob) -> Result<QueuedJob> {
        let handler = self.resolve(&stored.job, stored.data.clone())?;
        let mut job = QueuedJob::from_handler(handler)?;
        job.options = stored.options.clone();
        Ok(job)
    }

    pub(crate) async fn dispatch_stored(&self, stored: &StoredJob) -> Result<Id> {
        let job = self.queued_from(stored)?;
        self.enqueue(job).await
    }

    /// Sends a job to its connection, or holds it back for an open
    /// transaction.
    pub(crate) async fn enqueue(&self, mut job: QueuedJob) -> Result<Id> {
        let connection = job
            .options
            .connection
            .get_or_insert_with(|| self.inner.config.default.clone())
            .clone();
        let config = self.connection_config(&connection)?;
        let after_commit = *job.options.after_commit.get_or_insert(config.after_commit);
        let id = job.id();

        if after_commit {
            let mut transactions = self.inner.transactions.lock();
            if let Some(pending) = transactions.last_mut() {
                tracing::debug!(job.id = %id, "Holding job until the transaction commits");
                pending.push(job);
                return Ok(id);
            }
        }

        self.push(job).await
    }

    async fn push(&self, job: QueuedJob) -> Result<Id> {
        let driver = self.connection(job.options.connection.as_deref())?;
        let queue = job.options.queue.clone();
        let id = match job.options.delay {
            Some(delay) => driver.later(delay, job, queue.as_deref()).await?,
            None => driver.push(job, queue.as_deref()).await?,
        };

        tracing::debug!(job.id = %id, ?queue, "Job dispatched");
        Ok(id)
    }

    /// Runs a job in the current task, then advances its chain and batch.
    pub(crate) async fn run_now(&self, connection: &str, queue: &str, job: QueuedJob) -> job::Result {
        let payload = job.payload();
        let (cx, result) =
            driver::run_in_process(&job, self.store(), connection, queue).await;

        match &result {
            Ok(()) if !cx.is_released() => self.job_completed(&payload).await,
            Ok(()) => {}
            Err(_) => self.job_failed(&payload).await,
        }

        result
    }

    /// Advances the job's chain and records success with its batch.
    pub(crate) async fn job_completed(&self, payload: &JobPayload) {
        if let Some(chain_id) = payload.chain_id {
            if let Err(err) = dispatch::advance_chain(self, chain_id).await {
                tracing::error!(job.id = %payload.uuid, %chain_id, %err, "Failed to advance chain");
            }
        }

        if let Some(batch_id) = payload.batch_id {
            if let Err(err) = self.record_batch_outcome(batch_id, payload.uuid, true).await {
                tracing::error!(job.id = %payload.uuid, %batch_id, %err, "Failed to record batch success");
            }
        }
    }

    /// Runs the job's chain failure callbacks and records failure with its
    /// batch.
    pub(crate) async fn job_failed(&self, payload: &JobPayload) {
        if let Some(chain_id) = payload.chain_id {
            if let Err(err) = dispatch::fail_chain(self, chain_id).await {
                tracing::error!(job.id = %payload.uuid, %chain_id, %err, "Failed to run chain callbacks");
            }
        }

        if let Some(batch_id) = payload.batch_id {
            if let Err(err) = self.record_batch_outcome(batch_id, payload.uuid, false).await {
                tracing::error!(job.id = %payload.uuid, %batch_id, %err, "Failed to record batch failure");
            }
        }
    }

    async fn record_batch_outcome(&self, batch_id: Uuid, job_id: Id, succeeded: bool) -> Result {
        let Some(batch) = self.inner.batches.find(batch_id).await? else {
            tracing::warn!(%batch_id, "Batch no longer exists");
            return Ok(());
        };

        if succeeded {
            batch.record_successful_job(self, job_id).await
        } else {
            batch.record_failed_job(self, job_id).await
        }
    }
}
