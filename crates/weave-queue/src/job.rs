use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weave_core::config::JobBackoff;
use weave_core::types::new_id;

/// A unit of work as seen by producers and the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueItem {
    pub id: String,
    /// Routing key.
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl TaskQueueItem {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: new_id(),
            kind: kind.into(),
            payload,
            priority: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Producer-side options for a single enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Overrides the item priority. Lower values are processed first.
    pub priority: Option<u32>,
    /// Keep the job delayed for this long before it becomes eligible.
    pub delay_ms: Option<u64>,
    /// Idempotency key. Enqueueing an id that already exists is a no-op.
    pub job_id: Option<String>,
    /// Overrides the queue's default attempt count.
    pub attempts: Option<u32>,
    /// Overrides the queue's default backoff.
    pub backoff: Option<JobBackoff>,
}

impl EnqueueOptions {
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored job record.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub priority: u32,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: JobBackoff,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may run.
    pub run_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

impl Job {
    /// The item handed to the consumer.
    pub fn item(&self) -> TaskQueueItem {
        TaskQueueItem {
            id: self.id.clone(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            priority: Some(self.priority),
            timestamp: self.created_at,
        }
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// Notification published by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added {
        job_id: String,
        kind: String,
    },
    Completed {
        job_id: String,
        result: serde_json::Value,
    },
    Failed {
        job_id: String,
        error: String,
        attempts_made: u32,
        /// False once the job has used all of its attempts.
        will_retry: bool,
    },
}
