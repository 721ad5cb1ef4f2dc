//! # Stevedore
//!
//! 📦 Durable background jobs with retries, chains, and batches.
//!
//! # Overview
//!
//! **Stevedore** moves slow work out of the request path. Producers dispatch
//! [jobs](crate::job) through a [`QueueManager`]; the job is serialized into a
//! payload and handed to the [driver](crate::driver) of a named connection.
//! [Workers](crate::worker) claim payloads, rebuild the job, and run it
//! through its [middleware](crate::middleware) under a timeout.
//!
//! Key Features:
//!
//! - **PostgreSQL-Backed** The database driver claims records with
//!   `FOR UPDATE SKIP LOCKED`, so any number of workers can share a queue.
//!   In-memory, synchronous, and null drivers cover tests and local
//!   development.
//! - **Retries and Backoff**: Jobs declare their tries, backoff steps, retry
//!   deadline, exception limit, and timeout. Permanently failed jobs are
//!   archived and can be retried later.
//! - **Chains and Batches**: Run jobs one after another, or track a group of
//!   jobs and react once they have all run.
//! - **Middleware**: Rate limiting, overlap prevention, and exception
//!   throttling wrap job execution.
//! - **Transaction-Aware Dispatch**: Jobs can wait for open transactions to
//!   commit before they are pushed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{env, sync::Arc};
//!
//! use serde::{Deserialize, Serialize};
//! use sqlx::PgPool;
//! use stevedore::{
//!     failed::DatabaseFailedJobProvider,
//!     job::{self, Context, Job},
//!     Config, ConnectionConfig, DatabaseDriver, QueueManager, Worker,
//! };
//!
//! #[derive(Deserialize, Serialize)]
//! struct WelcomeEmail {
//!     user_id: i32,
//!     email: String,
//! }
//!
//! impl Job for WelcomeEmail {
//!     const NAME: &'static str = "welcome-email";
//!
//!     async fn handle(&self, _cx: &mut Context) -> job::Result {
//!         println!("Sending welcome email to {} (user_id: {})", self.email, self.user_id);
//!         Ok(())
//!     }
//!
//!     fn tries(&self) -> Option<u32> {
//!         Some(3)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let database_url = &env::var("DATABASE_URL")?;
//!     let pool = PgPool::connect(database_url).await?;
//!
//!     // Run migrations.
//!     stevedore::MIGRATOR.run(&pool).await?;
//!
//!     let config = Config::new("database")
//!         .connection("database", ConnectionConfig::new("database").queue("emails"));
//!     let manager = QueueManager::builder(config)
//!         .extend("database", DatabaseDriver::factory(pool.clone()))
//!         .register::<WelcomeEmail>()
//!         .build();
//!
//!     manager
//!         .dispatch(WelcomeEmail {
//!             user_id: 42,
//!             email: "ferris@example.com".to_string(),
//!         })
//!         .await?;
//!
//!     Worker::new(manager, Arc::new(DatabaseFailedJobProvider::new(pool)))
//!         .daemon(None, "emails")
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]

use sqlx::migrate::Migrator;

pub use crate::{
    batch::{Batch, BatchRepository, DatabaseBatchRepository, MemoryBatchRepository},
    driver::{DatabaseDriver, MemoryDriver, NullDriver, QueueDriver, SyncDriver},
    failed::{DatabaseFailedJobProvider, FailedJobProvider, MemoryFailedJobProvider},
    job::{Context, Job, Registry},
    manager::{Config, ConnectionConfig, QueueManager},
    middleware::{Middleware, Next},
    payload::JobPayload,
    store::{DatabaseStore, MemoryStore, Store},
    worker::{Worker, WorkerOptions},
};

pub mod batch;
pub mod dispatch;
pub mod driver;
pub mod failed;
pub mod job;
pub mod manager;
pub mod middleware;
pub mod payload;
pub mod store;
pub mod worker;

/// A SQLx [`Migrator`] which provides the `jobs`, `failed_jobs`,
/// `job_batches`, and `cache` tables.
///
/// These migrations must be applied before the database driver, store, batch
/// repository, or failed job provider are used.
///
/// # Example
///
///```rust,no_run
/// # use tokio::runtime::Runtime;
/// use std::env;
///
/// use sqlx::PgPool;
///
/// # fn main() {
/// # let rt = Runtime::new().unwrap();
/// # rt.block_on(async {
/// let database_url = &env::var("DATABASE_URL")?;
/// let pool = PgPool::connect(database_url).await?;
///
/// stevedore::MIGRATOR.run(&pool).await?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// # }
pub static MIGRATOR: Migrator = sqlx::migrate!();
