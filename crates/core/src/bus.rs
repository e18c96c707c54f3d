//! Learning event bus: bounded queue with drop-newest overflow, daily
//! write-ahead log, and topic-routed batch consumption.
//!
//! `emit` never suspends the producer beyond the WAL append. Consumers
//! wait on a notify handle inside their batch window. Ordering within a
//! topic is FIFO because a single queue feeds all topics.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use aswarm_shared::{EventTopic, LearningEvent, MetricsSink, SwarmError, SwarmResult};

/// One consume window's worth of events, split by topic. FIFO within
/// each vector.
#[derive(Debug, Default)]
pub struct ConsumedBatch {
    pub learning: Vec<LearningEvent>,
    pub promotion: Vec<LearningEvent>,
    pub federation: Vec<LearningEvent>,
}

impl ConsumedBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.learning.len() + self.promotion.len() + self.federation.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct BusInner {
    queue: VecDeque<LearningEvent>,
    wal_day: String,
    wal_file: Option<File>,
}

pub struct LearningBus {
    inner: Mutex<BusInner>,
    notify: Notify,
    capacity: usize,
    wal_dir: PathBuf,
    cluster_id: String,
    metrics: Arc<dyn MetricsSink>,
}

impl LearningBus {
    pub fn new(
        capacity: usize,
        wal_dir: PathBuf,
        cluster_id: String,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                queue: VecDeque::with_capacity(capacity.min(4096)),
                wal_day: String::new(),
                wal_file: None,
            }),
            notify: Notify::new(),
            capacity,
            wal_dir,
            cluster_id,
            metrics,
        }
    }

    /// Non-blocking emission. A full queue drops the incoming event
    /// (drop-newest) and reports it; a WAL append failure is counted but
    /// does not fail the emit; a WAL *rotation* failure does.
    pub fn emit(&self, event: LearningEvent) -> SwarmResult<()> {
        let topic = event.topic();
        let env = event.env.clone();
        let labels: [(&str, &str); 3] = [
            ("event_type", topic.as_label()),
            ("env", &env),
            ("cluster", &self.cluster_id),
        ];

        let mut inner = self.inner.lock().expect("event bus poisoned");
        if inner.queue.len() >= self.capacity {
            self.metrics.incr("events_dropped_total", &labels);
            warn!(
                event_id = %event.event_id,
                capacity = self.capacity,
                "Event queue full, dropping newest"
            );
            return Err(SwarmError::QueueFullDropped(self.capacity));
        }

        // Durability before acknowledgement: rotation failures mean we
        // cannot promise the event survives a crash, so the emit fails
        // and nothing is enqueued.
        self.rotate_wal_if_needed(&mut inner)?;
        match serde_json::to_string(&event) {
            Ok(line) => {
                let write_result = inner
                    .wal_file
                    .as_mut()
                    .map(|f| writeln!(f, "{}", line));
                if let Some(Err(e)) = write_result {
                    self.metrics.incr("wal_write_failures_total", &[]);
                    warn!(error = %e, "WAL append failed, event kept in memory only");
                }
            }
            Err(e) => {
                self.metrics.incr("wal_write_failures_total", &[]);
                warn!(error = %e, "WAL serialization failed, event kept in memory only");
            }
        }

        inner.queue.push_back(event);
        self.metrics.incr("events_processed_total", &labels);
        self.metrics
            .set_gauge("queue_size", inner.queue.len() as f64, &[]);
        self.metrics.set_gauge(
            "queue_utilization",
            inner.queue.len() as f64 / self.capacity as f64,
            &[],
        );
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Drain up to `batch_size` events within `window`, split by topic.
    /// An empty window is a normal outcome, not an error.
    pub async fn consume(&self, batch_size: usize, window: Duration) -> ConsumedBatch {
        let mut batch = ConsumedBatch::default();
        let deadline = tokio::time::Instant::now() + window;

        loop {
            {
                let mut inner = self.inner.lock().expect("event bus poisoned");
                while batch.len() < batch_size {
                    let Some(event) = inner.queue.pop_front() else { break };
                    match event.topic() {
                        EventTopic::Learning => batch.learning.push(event),
                        EventTopic::Promotion => batch.promotion.push(event),
                        EventTopic::Federation => batch.federation.push(event),
                    }
                }
                self.metrics
                    .set_gauge("queue_size", inner.queue.len() as f64, &[]);
                self.metrics.set_gauge(
                    "queue_utilization",
                    inner.queue.len() as f64 / self.capacity as f64,
                    &[],
                );
            }

            if batch.len() >= batch_size {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            if timeout(remaining, self.notify.notified()).await.is_err() {
                break;
            }
        }

        debug!(
            learning = batch.learning.len(),
            promotion = batch.promotion.len(),
            federation = batch.federation.len(),
            "Consumed event batch"
        );
        batch
    }

    /// Age of the oldest enqueued event in seconds (by its
    /// `first_seen_unix`); 0 when the queue is empty.
    pub fn queue_age_seconds(&self) -> f64 {
        let inner = self.inner.lock().expect("event bus poisoned");
        let age = inner
            .queue
            .front()
            .map_or(0.0, |e| (Utc::now().timestamp() - e.first_seen_unix).max(0) as f64);
        self.metrics.set_gauge("queue_age_seconds", age, &[]);
        age
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().expect("event bus poisoned").queue.len()
    }

    /// Path of the WAL file for the given day.
    #[must_use]
    pub fn wal_path_for(&self, day: &str) -> PathBuf {
        self.wal_dir.join(format!("events-{}.jsonl", day))
    }

    fn rotate_wal_if_needed(&self, inner: &mut BusInner) -> SwarmResult<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if inner.wal_file.is_some() && inner.wal_day == today {
            return Ok(());
        }
        std::fs::create_dir_all(&self.wal_dir).map_err(|e| {
            SwarmError::WalWriteFailed(format!(
                "creating WAL directory {}: {}",
                self.wal_dir.display(),
                e
            ))
        })?;
        let path = self.wal_path_for(&today);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                SwarmError::WalWriteFailed(format!("rotating WAL to {}: {}", path.display(), e))
            })?;
        inner.wal_day = today;
        inner.wal_file = Some(file);
        Ok(())
    }
}
