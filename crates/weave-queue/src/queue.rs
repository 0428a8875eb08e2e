use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::{broadcast, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weave_core::config::QueueConfig;
use weave_core::error::{Result, WeaveError};

use crate::job::{EnqueueOptions, Job, JobState, QueueCounts, QueueEvent, TaskQueueItem};
use crate::schema::{self, job_from_row, now_ms, JOB_COLUMNS};

type JobHandler =
    Arc<dyn Fn(TaskQueueItem) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// State shared between the queue handle and its workers.
struct Shared {
    name: String,
    config: QueueConfig,
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
}

struct Consumer {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

/// A named, durable work queue with a single consumer.
pub struct TaskQueue {
    shared: Arc<Shared>,
    consumer: Mutex<Option<Consumer>>,
}

impl TaskQueue {
    /// Open or create the queue database named in `config`.
    pub fn open(config: QueueConfig) -> Result<Self> {
        let path = config.database_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeaveError::Database(format!("Failed to create queue directory: {}", e))
            })?;
        }

        let conn = Connection::open(&path).map_err(|e| WeaveError::Database(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| WeaveError::Database(e.to_string()))?;
        schema::init(&conn, true).map_err(|e| WeaveError::Database(e.to_string()))?;

        debug!(path = %path.display(), queue = %config.name, "Task queue opened");
        Ok(Self::from_connection(conn, config))
    }

    /// Open a private in-memory queue (for testing).
    pub fn in_memory(config: QueueConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| WeaveError::Database(e.to_string()))?;
        schema::init(&conn, false).map_err(|e| WeaveError::Database(e.to_string()))?;
        Ok(Self::from_connection(conn, config))
    }

    fn from_connection(conn: Connection, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                config,
                conn: Mutex::new(Some(conn)),
                closed: AtomicBool::new(false),
                wake: Notify::new(),
                events,
            }),
            consumer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Subscribe to job notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Enqueue an item. Returns the job id.
    pub async fn add(&self, item: TaskQueueItem, options: EnqueueOptions) -> Result<String> {
        self.shared.add(item, options)
    }

    /// Enqueue a payload under a routing key with default options.
    pub async fn add_task(&self, kind: &str, payload: serde_json::Value) -> Result<String> {
        self.shared
            .add(TaskQueueItem::new(kind, payload), EnqueueOptions::default())
    }

    /// Register the consumer and start its workers.
    ///
    /// The handler's error fails the current attempt. Retryable errors
    /// (see [`WeaveError::is_retryable`]) go back to the queue according to
    /// the job's attempts and backoff; any other error fails the job at once.
    ///
    /// While a handler runs, its worker renews the job's lock every half
    /// `lock_duration_ms`.
    pub fn process<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(TaskQueueItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(WeaveError::QueueClosed(self.shared.name.clone()));
        }

        let mut slot = self
            .consumer
            .lock()
            .map_err(|e| WeaveError::Queue(e.to_string()))?;
        if slot.is_some() {
            return Err(WeaveError::ConsumerAlreadyRegistered(self.shared.name.clone()));
        }

        let handler: JobHandler = Arc::new(move |item| Box::pin(handler(item)));
        let cancel = CancellationToken::new();
        let concurrency = self.shared.config.concurrency.max(1);
        let workers = (0..concurrency)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    self.shared.clone(),
                    handler.clone(),
                    cancel.clone(),
                    worker,
                ))
            })
            .collect();

        info!(queue = %self.shared.name, concurrency, "Queue consumer started");
        *slot = Some(Consumer { cancel, workers });
        Ok(())
    }

    /// Look up a job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let name = self.shared.name.clone();
        self.shared.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM jobs WHERE queue = ?1 AND id = ?2", JOB_COLUMNS),
                params![name, id],
                job_from_row,
            )
            .optional()
        })
    }

    /// Count jobs in every state.
    pub async fn counts(&self) -> Result<QueueCounts> {
        let name = self.shared.name.clone();
        let rows = self.shared.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state")?;
            let rows = stmt
                .query_map(params![name], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            match JobState::parse(&state) {
                Some(JobState::Waiting) => counts.waiting = n,
                Some(JobState::Active) => counts.active = n,
                Some(JobState::Completed) => counts.completed = n,
                Some(JobState::Failed) => counts.failed = n,
                Some(JobState::Delayed) => counts.delayed = n,
                None => warn!(queue = %self.shared.name, state = %state, "Unknown job state"),
            }
        }
        Ok(counts)
    }

    /// Stop handing out jobs. Jobs already running finish normally.
    ///
    /// The flag lives in the database, so pausing from one process holds
    /// the consumer in another.
    pub async fn pause(&self) -> Result<()> {
        self.shared.set_paused(true)?;
        info!(queue = %self.shared.name, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.shared.set_paused(false)?;
        self.shared.wake.notify_waiters();
        info!(queue = %self.shared.name, "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        let name = self.shared.name.clone();
        self.shared.with_conn(|conn| schema::is_paused(conn, &name))
    }

    /// Delete terminal jobs in `state` that finished more than `grace_ms`
    /// ago. `limit` of 0 removes all of them. Returns the number removed.
    pub async fn clean(&self, grace_ms: u64, state: JobState, limit: usize) -> Result<usize> {
        if !state.is_terminal() {
            return Err(WeaveError::Queue(format!(
                "only completed or failed jobs can be cleaned, not {}",
                state
            )));
        }
        let name = self.shared.name.clone();
        let cutoff = now_ms() - grace_ms as i64;
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let removed = self.shared.with_conn(|conn| {
            conn.execute(
                "DELETE FROM jobs WHERE rowid IN (
                    SELECT rowid FROM jobs
                    WHERE queue = ?1 AND state = ?2 AND finished_at <= ?3
                    ORDER BY finished_at ASC
                    LIMIT ?4
                )",
                params![name, state.as_str(), cutoff, limit],
            )
        })?;
        info!(queue = %self.shared.name, state = %state, removed, "Cleaned jobs");
        Ok(removed)
    }

    /// Remove every waiting job, and delayed ones too when asked.
    /// Active and terminal jobs are kept.
    pub async fn drain(&self, include_delayed: bool) -> Result<usize> {
        let name = self.shared.name.clone();
        let removed = self.shared.with_conn(|conn| {
            let sql = if include_delayed {
                "DELETE FROM jobs WHERE queue = ?1 AND state IN ('waiting', 'delayed')"
            } else {
                "DELETE FROM jobs WHERE queue = ?1 AND state = 'waiting'"
            };
            conn.execute(sql, params![name])
        })?;
        info!(queue = %self.shared.name, removed, include_delayed, "Drained queue");
        Ok(removed)
    }

    /// Stop the consumer and release the database connection.
    ///
    /// Jobs interrupted mid-run go back to `waiting`. Calling this more
    /// than once is harmless.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let consumer = match self.consumer.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(consumer) = consumer {
            consumer.cancel.cancel();
            for worker in consumer.workers {
                if let Err(e) = worker.await {
                    warn!(queue = %self.shared.name, error = %e, "Queue worker ended abnormally");
                }
            }
        }

        match self.shared.conn.lock() {
            Ok(mut conn) => drop(conn.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        info!(queue = %self.shared.name, "Queue closed");
    }
}

impl Shared {
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| WeaveError::Database(e.to_string()))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| WeaveError::QueueClosed(self.name.clone()))?;
        f(conn).map_err(schema::db_error)
    }

    fn add(&self, item: TaskQueueItem, options: EnqueueOptions) -> Result<String> {
        let defaults = &self.config.default_job_options;
        let id = options.job_id.clone().unwrap_or_else(|| item.id.clone());
        let priority = options.priority.or(item.priority).unwrap_or(0);
        let attempts = options.attempts.unwrap_or(defaults.attempts).max(1);
        let backoff = options.backoff.unwrap_or(defaults.backoff);
        let payload = serde_json::to_string(&item.payload)?;

        let now = now_ms();
        let delay = options.delay_ms.unwrap_or(0) as i64;
        let (state, run_at) = if delay > 0 {
            (JobState::Delayed, now + delay)
        } else {
            (JobState::Waiting, now)
        };

        let inserted = self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO jobs
                    (id, queue, kind, payload, priority, state, attempts_made, max_attempts,
                     backoff_kind, backoff_delay_ms, created_at, run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id,
                    self.name,
                    item.kind,
                    payload,
                    priority as i64,
                    state.as_str(),
                    attempts as i64,
                    backoff.kind.as_str(),
                    backoff.delay_ms as i64,
                    item.timestamp.timestamp_millis(),
                    run_at,
                ],
            )
        })?;

        if inserted == 0 {
            debug!(queue = %self.name, job_id = %id, "Job id already present, not enqueued again");
            return Ok(id);
        }

        debug!(queue = %self.name, job_id = %id, kind = %item.kind, priority, state = %state, "Job enqueued");
        let _ = self.events.send(QueueEvent::Added {
            job_id: id.clone(),
            kind: item.kind,
        });
        self.wake.notify_waiters();
        Ok(id)
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queue_state (queue, paused) VALUES (?1, ?2)
                 ON CONFLICT(queue) DO UPDATE SET paused = excluded.paused",
                params![self.name, paused],
            )
        })?;
        Ok(())
    }

    /// Atomically take the next eligible job and mark it active.
    /// Returns nothing while the queue is paused.
    fn claim(&self) -> Result<Option<Job>> {
        let lock_ms = self.config.lock_duration_ms as i64;
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if schema::is_paused(&tx, &self.name)? {
                return Ok(None);
            }
            let now = now_ms();

            tx.execute(
                "UPDATE jobs SET state = 'waiting'
                 WHERE queue = ?1 AND state = 'delayed' AND run_at <= ?2",
                params![self.name, now],
            )?;
            // Jobs whose lock expired are handed out again
            tx.execute(
                "UPDATE jobs SET state = 'waiting', locked_until = NULL
                 WHERE queue = ?1 AND state = 'active' AND locked_until <= ?2",
                params![self.name, now],
            )?;

            let next: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs
                     WHERE queue = ?1 AND state = 'waiting' AND run_at <= ?2
                     ORDER BY priority ASC, rowid ASC
                     LIMIT 1",
                    params![self.name, now],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = next else {
                tx.commit()?;
                return Ok(None);
            };

            let job = match tx.query_row(
                &format!("SELECT {} FROM jobs WHERE queue = ?1 AND id = ?2", JOB_COLUMNS),
                params![self.name, id],
                job_from_row,
            ) {
                Ok(job) => job,
                Err(e) => {
                    // An unreadable job is failed so the jobs behind it still run
                    tx.execute(
                        "UPDATE jobs SET state = 'failed', finished_at = ?3, last_error = ?4, locked_until = NULL
                         WHERE queue = ?1 AND id = ?2",
                        params![self.name, id, now, e.to_string()],
                    )?;
                    tx.commit()?;
                    return Err(e);
                }
            };

            tx.execute(
                "UPDATE jobs SET state = 'active', attempts_made = attempts_made + 1, locked_until = ?3
                 WHERE queue = ?1 AND id = ?2",
                params![self.name, job.id, now + lock_ms],
            )?;
            tx.commit()?;

            Ok(Some(Job {
                state: JobState::Active,
                attempts_made: job.attempts_made + 1,
                ..job
            }))
        })
    }

    /// Record the result of `job`'s attempt. Returns false when that
    /// attempt no longer holds the job, in which case nothing is written.
    fn complete(&self, job: &Job, result: &serde_json::Value) -> Result<bool> {
        let result = serde_json::to_string(result)?;
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET state = 'completed', finished_at = ?4, result = ?5, locked_until = NULL
                 WHERE queue = ?1 AND id = ?2 AND state = 'active' AND attempts_made = ?3",
                params![self.name, job.id, job.attempts_made as i64, now_ms(), result],
            )
        })?;
        if updated == 0 {
            return Ok(false);
        }
        self.trim(JobState::Completed, self.config.default_job_options.remove_on_complete)?;
        Ok(true)
    }

    /// Record a failed attempt. Returns whether the job will be retried, or
    /// `None` when the attempt no longer holds the job.
    fn fail(&self, job: &Job, error: &str, retryable: bool) -> Result<Option<bool>> {
        let now = now_ms();
        let attempt = job.attempts_made as i64;
        let will_retry = retryable && job.attempts_made < job.max_attempts;

        let updated = if will_retry {
            let delay = job.backoff.delay_for(job.attempts_made) as i64;
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE jobs SET state = 'delayed', run_at = ?4, last_error = ?5, locked_until = NULL
                     WHERE queue = ?1 AND id = ?2 AND state = 'active' AND attempts_made = ?3",
                    params![self.name, job.id, attempt, now + delay, error],
                )
            })?
        } else {
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE jobs SET state = 'failed', finished_at = ?4, last_error = ?5, locked_until = NULL
                     WHERE queue = ?1 AND id = ?2 AND state = 'active' AND attempts_made = ?3",
                    params![self.name, job.id, attempt, now, error],
                )
            })?
        };

        if updated == 0 {
            return Ok(None);
        }
        if !will_retry {
            self.trim(JobState::Failed, self.config.default_job_options.remove_on_fail)?;
        }
        Ok(Some(will_retry))
    }

    /// Extend the lock held by `job`'s attempt. Returns false when the lock
    /// was already lost.
    fn renew(&self, job: &Job) -> Result<bool> {
        let until = now_ms() + self.config.lock_duration_ms as i64;
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET locked_until = ?4
                 WHERE queue = ?1 AND id = ?2 AND state = 'active' AND attempts_made = ?3",
                params![self.name, job.id, job.attempts_made as i64, until],
            )
        })?;
        Ok(updated > 0)
    }

    /// Hand an interrupted job back without consuming the attempt.
    fn release(&self, job: &Job) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET state = 'waiting', locked_until = NULL,
                    attempts_made = MAX(attempts_made - 1, 0)
                 WHERE queue = ?1 AND id = ?2 AND state = 'active' AND attempts_made = ?3",
                params![self.name, job.id, job.attempts_made as i64],
            )
        })?;
        Ok(())
    }

    /// Keep only the `keep` most recently finished jobs in `state`.
    fn trim(&self, state: JobState, keep: usize) -> Result<()> {
        let removed = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM jobs
                 WHERE queue = ?1 AND state = ?2 AND rowid NOT IN (
                    SELECT rowid FROM jobs WHERE queue = ?1 AND state = ?2
                    ORDER BY finished_at DESC, rowid DESC
                    LIMIT ?3
                 )",
                params![self.name, state.as_str(), keep as i64],
            )
        })?;
        if removed > 0 {
            debug!(queue = %self.name, state = %state, removed, "Trimmed finished jobs");
        }
        Ok(())
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    handler: JobHandler,
    cancel: CancellationToken,
    worker: usize,
) {
    let poll = Duration::from_millis(shared.config.poll_interval_ms.max(1));
    let renew_every = Duration::from_millis((shared.config.lock_duration_ms / 2).max(1));
    debug!(queue = %shared.name, worker, "Queue worker started");

    'jobs: loop {
        if cancel.is_cancelled() {
            break;
        }

        // Register interest before checking, so an enqueue in between is not missed
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let job = match shared.claim() {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(poll) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }
            Err(WeaveError::QueueClosed(_)) => break,
            Err(e) => {
                error!(queue = %shared.name, error = %e, "Failed to claim job");
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }
        };

        debug!(queue = %shared.name, job_id = %job.id, attempt = job.attempts_made, "Processing job");
        let mut running = tokio::spawn(handler(job.item()));
        let mut renew = tokio::time::interval_at(Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                joined = &mut running => break match joined {
                    Ok(outcome) => outcome,
                    Err(e) => Err(WeaveError::Execution(format!("job handler panicked: {}", e))),
                },
                _ = renew.tick() => match shared.renew(&job) {
                    Ok(true) => {}
                    Ok(false) => warn!(queue = %shared.name, job_id = %job.id, "Job lock lost while running"),
                    Err(e) => warn!(queue = %shared.name, job_id = %job.id, error = %e, "Failed to renew job lock"),
                },
                _ = cancel.cancelled() => {
                    if let Err(e) = shared.release(&job) {
                        warn!(queue = %shared.name, job_id = %job.id, error = %e, "Failed to release job");
                    }
                    break 'jobs;
                }
            }
        };

        match outcome {
            Ok(result) => match shared.complete(&job, &result) {
                Ok(false) => warn!(
                    queue = %shared.name,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    "Job lock lost, completion discarded"
                ),
                Ok(true) => {
                    debug!(queue = %shared.name, job_id = %job.id, "Job completed");
                    let _ = shared.events.send(QueueEvent::Completed {
                        job_id: job.id.clone(),
                        result,
                    });
                }
                Err(e) => error!(queue = %shared.name, job_id = %job.id, error = %e, "Failed to record completion"),
            },
            Err(job_err) => {
                let message = job_err.to_string();
                match shared.fail(&job, &message, job_err.is_retryable()) {
                    Ok(None) => warn!(
                        queue = %shared.name,
                        job_id = %job.id,
                        attempt = job.attempts_made,
                        error = %message,
                        "Job lock lost, failure discarded"
                    ),
                    Ok(Some(will_retry)) => {
                        warn!(
                            queue = %shared.name,
                            job_id = %job.id,
                            attempt = job.attempts_made,
                            max_attempts = job.max_attempts,
                            will_retry,
                            error = %message,
                            "Job attempt failed"
                        );
                        let _ = shared.events.send(QueueEvent::Failed {
                            job_id: job.id.clone(),
                            error: message,
                            attempts_made: job.attempts_made,
                            will_retry,
                        });
                    }
                    Err(e) => error!(queue = %shared.name, job_id = %job.id, error = %e, "Failed to record failure"),
                }
            }
        }
    }

    debug!(queue = %shared.name, worker, "Queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use weave_core::config::{BackoffKind, JobBackoff, JobOptions};

    fn config(name: &str) -> QueueConfig {
        QueueConfig {
            name: name.into(),
            poll_interval_ms: 10,
            default_job_options: JobOptions {
                attempts: 3,
                backoff: JobBackoff {
                    kind: BackoffKind::Fixed,
                    delay_ms: 10,
                },
                ..JobOptions::default()
            },
            ..QueueConfig::default()
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<QueueEvent>) -> QueueEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("queue event in time")
                .expect("queue event");
            if !matches!(event, QueueEvent::Added { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn add_and_lookup() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        let id = queue
            .add_task("agent", serde_json::json!({"agentId": "a1"}))
            .await
            .unwrap();

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.kind, "agent");
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.payload["agentId"], "a1");
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
        assert!(queue.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_job_id_is_ignored() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        let opts = EnqueueOptions::default().with_job_id("order-42");
        let first = queue
            .add(TaskQueueItem::new("agent", serde_json::json!(1)), opts.clone())
            .await
            .unwrap();
        let second = queue
            .add(TaskQueueItem::new("agent", serde_json::json!(2)), opts)
            .await
            .unwrap();

        assert_eq!(first, "order-42");
        assert_eq!(second, "order-42");
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
        let job = queue.get_job("order-42").await.unwrap().unwrap();
        assert_eq!(job.payload, serde_json::json!(1));
    }

    #[tokio::test]
    async fn processes_by_priority_then_fifo() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        for (label, priority) in [("low", Some(5)), ("high", Some(1)), ("plain-a", None), ("plain-b", None)] {
            let mut item = TaskQueueItem::new("t", serde_json::json!(label));
            item.priority = priority;
            queue.add(item, EnqueueOptions::default()).await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut rx = queue.subscribe();
        let log = seen.clone();
        queue
            .process(move |item| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(item.payload.as_str().unwrap().to_string());
                    Ok(serde_json::Value::Null)
                }
            })
            .unwrap();

        for _ in 0..4 {
            assert!(matches!(next_event(&mut rx).await, QueueEvent::Completed { .. }));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["plain-a", "plain-b", "high", "low"]);
        queue.close().await;
    }

    #[tokio::test]
    async fn retries_then_completes() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        let id = queue.add_task("t", serde_json::json!({})).await.unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let mut rx = queue.subscribe();

        let counter = attempts.clone();
        queue
            .process(move |_item| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(WeaveError::Execution(format!("flaky {}", n)))
                    } else {
                        Ok(serde_json::json!({"done": n}))
                    }
                }
            })
            .unwrap();

        for expected in 1..=2 {
            match next_event(&mut rx).await {
                QueueEvent::Failed { attempts_made, will_retry, .. } => {
                    assert_eq!(attempts_made, expected);
                    assert!(will_retry);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        match next_event(&mut rx).await {
            QueueEvent::Completed { job_id, result } => {
                assert_eq!(job_id, id);
                assert_eq!(result["done"], 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.result, Some(serde_json::json!({"done": 3})));
        queue.close().await;
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_job() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        let id = queue
            .add(
                TaskQueueItem::new("t", serde_json::Value::Null),
                EnqueueOptions::default().with_attempts(2),
            )
            .await
            .unwrap();
        let mut rx = queue.subscribe();
        queue
            .process(|_item| async { Err(WeaveError::Execution("always".into())) })
            .unwrap();

        assert!(matches!(next_event(&mut rx).await, QueueEvent::Failed { will_retry: true, .. }));
        assert!(matches!(next_event(&mut rx).await, QueueEvent::Failed { will_retry: false, .. }));

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.last_error.unwrap().contains("always"));
        assert!(job.finished_at.is_some());
        assert_eq!(queue.counts().await.unwrap().failed, 1);
        queue.close().await;
    }

    #[tokio::test]
    async fn second_consumer_is_rejected() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        queue.process(|_item| async { Ok(serde_json::Value::Null) }).unwrap();
        let err = queue
            .process(|_item| async { Ok(serde_json::Value::Null) })
            .unwrap_err();
        assert!(matches!(err, WeaveError::ConsumerAlreadyRegistered(_)));
        queue.close().await;
    }

    #[tokio::test]
    async fn delayed_jobs_and_drain() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        queue
            .add(
                TaskQueueItem::new("t", serde_json::Value::Null),
                EnqueueOptions::default().with_delay_ms(60_000),
            )
            .await
            .unwrap();
        queue.add_task("t", serde_json::Value::Null).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 1);

        assert_eq!(queue.drain(false).await.unwrap(), 1);
        assert_eq!(queue.counts().await.unwrap().delayed, 1);
        assert_eq!(queue.drain(true).await.unwrap(), 1);
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn pause_holds_jobs_until_resume() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        queue.pause().await.unwrap();
        assert!(queue.is_paused().await.unwrap());
        let mut rx = queue.subscribe();
        queue.process(|_item| async { Ok(serde_json::json!("ran")) }).unwrap();
        let id = queue.add_task("t", serde_json::Value::Null).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().state, JobState::Waiting);

        queue.resume().await.unwrap();
        assert!(!queue.is_paused().await.unwrap());
        assert!(matches!(next_event(&mut rx).await, QueueEvent::Completed { .. }));
        queue.close().await;
    }

    #[tokio::test]
    async fn retention_and_clean() {
        let mut cfg = config("q");
        cfg.default_job_options.remove_on_complete = 2;
        let queue = TaskQueue::in_memory(cfg).unwrap();
        let mut rx = queue.subscribe();
        queue.process(|_item| async { Ok(serde_json::Value::Null) }).unwrap();
        for _ in 0..3 {
            queue.add_task("t", serde_json::Value::Null).await.unwrap();
        }
        for _ in 0..3 {
            assert!(matches!(next_event(&mut rx).await, QueueEvent::Completed { .. }));
        }
        assert_eq!(queue.counts().await.unwrap().completed, 2);

        assert!(queue.clean(0, JobState::Waiting, 0).await.is_err());
        assert_eq!(queue.clean(60_000, JobState::Completed, 0).await.unwrap(), 0);
        assert_eq!(queue.clean(0, JobState::Completed, 1).await.unwrap(), 1);
        assert_eq!(queue.clean(0, JobState::Completed, 0).await.unwrap(), 1);
        queue.close().await;
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimed() {
        let mut cfg = config("q");
        cfg.lock_duration_ms = 1;
        let queue = TaskQueue::in_memory(cfg).unwrap();
        let id = queue.add_task("t", serde_json::Value::Null).await.unwrap();

        let first = queue.shared.claim().unwrap().unwrap();
        assert_eq!(first.id, id);
        assert_eq!(first.attempts_made, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let again = queue.shared.claim().unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts_made, 2);
    }

    #[tokio::test]
    async fn stale_attempt_cannot_overwrite_newer_outcome() {
        let mut cfg = config("q");
        cfg.lock_duration_ms = 1;
        let queue = TaskQueue::in_memory(cfg).unwrap();
        let id = queue.add_task("t", serde_json::Value::Null).await.unwrap();

        let first = queue.shared.claim().unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = queue.shared.claim().unwrap().unwrap();
        assert_eq!(second.attempts_made, 2);

        assert!(queue.shared.complete(&second, &serde_json::json!("second")).unwrap());
        assert_eq!(queue.shared.fail(&first, "stale", true).unwrap(), None);
        assert!(!queue.shared.complete(&first, &serde_json::json!("first")).unwrap());
        assert!(!queue.shared.renew(&first).unwrap());

        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result, Some(serde_json::json!("second")));
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn running_job_keeps_its_lock() {
        let mut cfg = config("q");
        cfg.lock_duration_ms = 100;
        cfg.concurrency = 2;
        let queue = TaskQueue::in_memory(cfg).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let mut rx = queue.subscribe();

        let counter = runs.clone();
        queue
            .process(move |_item| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    Ok(serde_json::json!("slow"))
                }
            })
            .unwrap();
        let id = queue.add_task("t", serde_json::Value::Null).await.unwrap();

        match next_event(&mut rx).await {
            QueueEvent::Completed { job_id, .. } => assert_eq!(job_id, id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        queue.close().await;
    }

    #[tokio::test]
    async fn non_retryable_error_fails_at_once() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        let id = queue.add_task("t", serde_json::Value::Null).await.unwrap();
        let mut rx = queue.subscribe();
        queue
            .process(|_item| async { Err(WeaveError::WorkflowNotFound("ghost".into())) })
            .unwrap();

        match next_event(&mut rx).await {
            QueueEvent::Failed { attempts_made, will_retry, .. } => {
                assert_eq!(attempts_made, 1);
                assert!(!will_retry);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().state, JobState::Failed);
        queue.close().await;
    }

    #[tokio::test]
    async fn corrupt_payload_is_reported() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        let bad = queue.add_task("t", serde_json::Value::Null).await.unwrap();
        let good = queue.add_task("t", serde_json::json!(2)).await.unwrap();
        queue
            .shared
            .with_conn(|conn| {
                conn.execute("UPDATE jobs SET payload = '{not json' WHERE id = ?1", params![bad])
            })
            .unwrap();

        assert!(matches!(queue.get_job(&bad).await, Err(WeaveError::Json(_))));
        assert!(matches!(queue.shared.claim(), Err(WeaveError::Json(_))));
        assert_eq!(queue.counts().await.unwrap().failed, 1);

        let next = queue.shared.claim().unwrap().unwrap();
        assert_eq!(next.id, good);
    }

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = weave_test_utils::temp_dir();
        let mut cfg = config("durable");
        cfg.database = dir.path().join("queue.db").display().to_string();

        let queue = TaskQueue::open(cfg.clone()).unwrap();
        let id = queue.add_task("agent", serde_json::json!({"n": 7})).await.unwrap();
        queue.close().await;

        let reopened = TaskQueue::open(cfg).unwrap();
        let job = reopened.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.payload["n"], 7);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let queue = TaskQueue::in_memory(config("q")).unwrap();
        queue.process(|_item| async { Ok(serde_json::Value::Null) }).unwrap();
        queue.close().await;
        queue.close().await;

        let err = queue.add_task("t", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, WeaveError::QueueClosed(_)));
        assert!(matches!(
            queue.process(|_item| async { Ok(serde_json::Value::Null) }),
            Err(WeaveError::QueueClosed(_))
        ));
    }
}
