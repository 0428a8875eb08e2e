//! Durable work queue.
//!
//! Jobs live in a SQLite database so producers and the consumer may sit in
//! different processes. Delivery is at-least-once: a job whose lock expires
//! while `active` (for example because its worker died) is handed out
//! again, so consumers must be idempotent when retries are enabled.

pub mod job;
pub mod queue;
mod schema;

pub use job::{EnqueueOptions, Job, JobState, QueueCounts, QueueEvent, TaskQueueItem};
pub use queue::TaskQueue;
