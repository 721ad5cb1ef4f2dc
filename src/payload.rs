//! The serialized envelope stored by drivers.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::job::{Backoff, Id, Options};

/// Everything a worker needs to reconstruct and run a job.
///
/// Payloads are written once at dispatch time and never mutated afterwards;
/// the attempt count that changes between attempts lives on the driver record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    /// The job's unique identifier.
    pub uuid: Id,

    /// Human-readable job name.
    pub display_name: String,

    /// Registered job name, used to resolve the job type.
    pub job: String,

    /// The serialized job.
    pub data: Value,

    /// Attempts allowed, overriding the worker's default.
    pub max_tries: Option<u32>,

    /// Errors allowed before the job fails regardless of tries.
    pub max_exceptions: Option<u32>,

    /// Fail permanently instead of retrying after a timeout.
    pub fail_on_timeout: bool,

    /// Seconds to wait before each retry, overriding the worker's default.
    pub backoff: Option<Backoff>,

    /// Execution timeout, in seconds.
    pub timeout: Option<u64>,

    /// Deadline after which the job is no longer retried.
    pub retry_until: Option<Timestamp>,

    /// Attempts made before this payload was pushed.
    pub attempts: u32,

    /// Whether dispatch waited for open transactions to commit.
    pub after_commit: bool,

    /// When the payload was built.
    pub pushed_at: Timestamp,

    /// Batch the job belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,

    /// Chain the job belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<Uuid>,
}

impl JobPayload {
    /// Serializes the payload to JSON.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses a payload from JSON.
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Retry delay in seconds after the given attempt, or `None` when the job
    /// has no backoff of its own.
    pub fn backoff_for(&self, attempt: u32) -> Option<u64> {
        self.backoff.as_ref().map(|backoff| backoff.delay_for(attempt))
    }

    /// Returns `true` when the retry deadline has passed.
    pub fn retry_deadline_passed(&self, now: Timestamp) -> bool {
        self.retry_until.is_some_and(|deadline| now >= deadline)
    }
}

/// A job held as data, for dispatching later.
///
/// Chain continuations and batch callbacks are stored this way so they
/// outlive the process that built them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredJob {
    /// Registered job name.
    pub job: String,

    /// The serialized job.
    pub data: Value,

    /// Dispatch options.
    pub options: Options,
}
