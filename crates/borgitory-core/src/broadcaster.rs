//! Event Broadcaster (component C): fan-out of typed events to N
//! subscriber queues, each bounded and drop-oldest on overflow, with
//! periodic keepalives for idle subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};

use crate::model::{JobId, TaskIndex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    JobStarted { job_id: JobId },
    JobProgress { job_id: JobId },
    JobOutput { job_id: JobId, line: String },
    JobStatusChanged { job_id: JobId, status: String },
    JobCompleted { job_id: JobId },
    JobFailed { job_id: JobId },
    JobCancelled { job_id: JobId },
    TaskStarted { job_id: JobId, task_index: TaskIndex },
    TaskProgress { job_id: JobId, task_index: TaskIndex },
    TaskCompleted { job_id: JobId, task_index: TaskIndex },
    TaskFailed { job_id: JobId, task_index: TaskIndex },
    Keepalive,
}

/// An active subscription. Unsubscribes automatically on drop.
pub struct SubscriberHandle {
    id: u64,
    rx: broadcast::Receiver<JobEvent>,
    registry: Arc<Registry>,
}

struct Registry {
    // A single broadcast channel serves every subscriber; per-subscriber
    // drop-oldest semantics come from each receiver's own lag tolerance
    // (the channel capacity IS the per-subscriber bound) rather than a
    // shared back-pressured queue, so a slow subscriber never blocks or
    // throttles the publisher or other subscribers.
    tx: broadcast::Sender<JobEvent>,
    next_id: AtomicU64,
    live: Mutex<std::collections::HashSet<u64>>,
}

pub struct EventBroadcaster {
    registry: Arc<Registry>,
    keepalive_interval: Duration,
}

impl EventBroadcaster {
    pub fn new(subscriber_queue_capacity: usize, keepalive_interval: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(subscriber_queue_capacity.max(1));
        Self {
            registry: Arc::new(Registry {
                tx,
                next_id: AtomicU64::new(0),
                live: Mutex::new(std::collections::HashSet::new()),
            }),
            keepalive_interval,
        }
    }

    pub async fn subscribe(&self) -> SubscriberHandle {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry.live.lock().await.insert(id);
        SubscriberHandle {
            id,
            rx: self.registry.tx.subscribe(),
            registry: self.registry.clone(),
        }
    }

    /// Non-blocking; events from a single `publish` call are observed by
    /// each subscriber in publish order. Never back-pressures the caller.
    pub fn publish(&self, event: JobEvent) {
        // `send` returns Err only when there are no receivers; that is not
        // an error from the publisher's point of view.
        let _ = self.registry.tx.send(event);
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }
}

impl SubscriberHandle {
    /// Awaits the next event, interleaving a [`JobEvent::Keepalive`] if no
    /// real event arrives within the broadcaster's keepalive interval.
    pub async fn recv(&mut self, keepalive_interval: Duration) -> JobEvent {
        loop {
            match tokio::time::timeout(keepalive_interval, self.rx.recv()).await {
                Ok(Ok(event)) => return event,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return JobEvent::Keepalive,
                Err(_elapsed) => return JobEvent::Keepalive,
            }
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let id = self.id;
        tokio::spawn(async move {
            registry.live.lock().await.remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_order_preserved_per_subscriber() {
        let bus = EventBroadcaster::new(100, Duration::from_secs(30));
        let mut sub = bus.subscribe().await;

        bus.publish(JobEvent::JobStarted {
            job_id: "j1".into(),
        });
        bus.publish(JobEvent::JobCompleted {
            job_id: "j1".into(),
        });

        assert!(matches!(
            sub.recv(Duration::from_secs(30)).await,
            JobEvent::JobStarted { .. }
        ));
        assert!(matches!(
            sub.recv(Duration::from_secs(30)).await,
            JobEvent::JobCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_does_not_leak() {
        let bus = EventBroadcaster::new(8, Duration::from_secs(30));
        for _ in 0..10_000 {
            let sub = bus.subscribe().await;
            drop(sub);
        }
        // Give the spawned unsubscribe tasks a chance to run.
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn keepalive_fires_when_idle() {
        let bus = EventBroadcaster::new(8, Duration::from_millis(20));
        let mut sub = bus.subscribe().await;
        let event = sub.recv(Duration::from_millis(20)).await;
        assert!(matches!(event, JobEvent::Keepalive));
    }
}
