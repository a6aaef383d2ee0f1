//! Queue & Admission (component D): a priority FIFO per job class with a
//! semaphore-style concurrency cap, polled on an interval and reporting
//! admission to the manager over a channel rather than a callback
//! (callbacks become typed channels in the async translation).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};

use crate::model::{JobClass, JobId};

#[derive(Debug, Clone)]
struct QueueEntry {
    job_id: JobId,
    priority: i32,
    enqueued_at: Instant,
}

struct ClassState {
    queue: VecDeque<QueueEntry>,
    semaphore: Arc<Semaphore>,
    active: HashMap<JobId, OwnedSemaphorePermit>,
}

impl ClassState {
    fn new(cap: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            semaphore: Arc::new(Semaphore::new(cap)),
            active: HashMap::new(),
        }
    }

    /// Same-priority FIFO; higher-priority jobs cut in front.
    fn insert(&mut self, entry: QueueEntry) -> usize {
        let pos = self
            .queue
            .iter()
            .position(|e| e.priority < entry.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, entry);
        pos
    }

    fn remove(&mut self, job_id: &JobId) -> bool {
        if let Some(pos) = self.queue.iter().position(|e| &e.job_id == job_id) {
            self.queue.remove(pos);
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_queued: usize,
    pub queue_size_by_class: HashMap<String, usize>,
    pub available_slots: HashMap<String, usize>,
}

pub struct Queue {
    backup: Mutex<ClassState>,
    operation: Mutex<ClassState>,
    admitted_tx: mpsc::UnboundedSender<JobId>,
    poll_interval: Duration,
}

impl Queue {
    pub fn new(
        max_concurrent_backups: usize,
        max_concurrent_operations: usize,
        poll_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<JobId>) {
        let (admitted_tx, admitted_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            backup: Mutex::new(ClassState::new(max_concurrent_backups)),
            operation: Mutex::new(ClassState::new(max_concurrent_operations)),
            admitted_tx,
            poll_interval,
        });
        (queue, admitted_rx)
    }

    fn state(&self, class: JobClass) -> &Mutex<ClassState> {
        match class {
            JobClass::Backup => &self.backup,
            JobClass::Operation => &self.operation,
        }
    }

    /// Returns the job's position in its class queue (0-based).
    pub async fn enqueue(&self, job_id: JobId, class: JobClass, priority: i32) -> usize {
        let mut state = self.state(class).lock().await;
        state.insert(QueueEntry {
            job_id,
            priority,
            enqueued_at: Instant::now(),
        })
    }

    /// Removes a queued job without starting it and without ever
    /// acquiring a slot. Returns whether the job was actually queued.
    pub async fn cancel_queued(&self, job_id: &JobId, class: JobClass) -> bool {
        let mut state = self.state(class).lock().await;
        state.remove(job_id)
    }

    /// Releases a previously-admitted job's slot, allowing a new head to
    /// be admitted on the next poll.
    pub async fn release(&self, job_id: &JobId, class: JobClass) {
        let mut state = self.state(class).lock().await;
        state.active.remove(job_id);
    }

    async fn try_admit_one(&self, class: JobClass) {
        let mut state = self.state(class).lock().await;
        let Some(front) = state.queue.front() else {
            return;
        };
        let Ok(permit) = state.semaphore.clone().try_acquire_owned() else {
            return;
        };
        let entry = state.queue.pop_front().expect("front checked above");
        state.active.insert(entry.job_id.clone(), permit);
        let _ = self.admitted_tx.send(entry.job_id);
    }

    pub async fn stats(&self) -> QueueStats {
        let backup = self.backup.lock().await;
        let operation = self.operation.lock().await;
        let mut queue_size_by_class = HashMap::new();
        queue_size_by_class.insert("backup".to_string(), backup.queue.len());
        queue_size_by_class.insert("operation".to_string(), operation.queue.len());
        let mut available_slots = HashMap::new();
        available_slots.insert("backup".to_string(), backup.semaphore.available_permits());
        available_slots.insert(
            "operation".to_string(),
            operation.semaphore.available_permits(),
        );
        QueueStats {
            total_queued: backup.queue.len() + operation.queue.len(),
            queue_size_by_class,
            available_slots,
        }
    }

    /// Drives admission: every `poll_interval`, if the head of a class has
    /// an available slot, admit it. Runs until the queue is dropped.
    pub async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.try_admit_one(JobClass::Backup).await;
            self.try_admit_one(JobClass::Operation).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn higher_priority_cuts_in_front() {
        let (queue, _rx) = Queue::new(1, 1, Duration::from_millis(5));
        queue
            .enqueue("low".to_string(), JobClass::Backup, 0)
            .await;
        let pos = queue
            .enqueue("high".to_string(), JobClass::Backup, 10)
            .await;
        assert_eq!(pos, 0);
    }

    #[tokio::test]
    async fn cancel_queued_removes_without_admission() {
        let (queue, mut rx) = Queue::new(0, 1, Duration::from_millis(5));
        queue
            .enqueue("j1".to_string(), JobClass::Backup, 0)
            .await;
        let removed = queue.cancel_queued(&"j1".to_string(), JobClass::Backup).await;
        assert!(removed);

        let stats = queue.stats().await;
        assert_eq!(stats.queue_size_by_class["backup"], 0);

        tokio::select! {
            _ = rx.recv() => panic!("cancelled job must never be admitted"),
            _ = tokio::time::sleep(Duration::from_millis(30)) => {}
        }
    }

    #[tokio::test]
    async fn admission_respects_concurrency_cap() {
        let (queue, mut rx) = Queue::new(1, 1, Duration::from_millis(5));
        queue.enqueue("j1".to_string(), JobClass::Backup, 0).await;
        queue.enqueue("j2".to_string(), JobClass::Backup, 0).await;

        let handle = tokio::spawn(queue.clone().run_poll_loop());

        let first = rx.recv().await.unwrap();
        assert_eq!(first, "j1");

        tokio::select! {
            _ = rx.recv() => panic!("second job must not admit before a slot frees"),
            _ = tokio::time::sleep(Duration::from_millis(30)) => {}
        }

        queue.release(&"j1".to_string(), JobClass::Backup).await;
        let second = rx.recv().await.unwrap();
        assert_eq!(second, "j2");

        handle.abort();
    }
}
