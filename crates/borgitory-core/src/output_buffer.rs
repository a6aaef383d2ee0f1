//! Output Buffer (component B): a per-job bounded ring of output lines plus
//! the latest progress snapshot, with query and live-follow access.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::executor::{OutputLine, ProgressSnapshot, StreamTag};
use crate::model::JobId;

/// A single buffered output line.
#[derive(Debug, Clone)]
pub struct OutputEntry {
    pub text: String,
    pub tag: StreamTag,
    pub timestamp: DateTime<Utc>,
    pub progress: Option<ProgressSnapshot>,
}

/// Result of [`OutputBuffer::snapshot`].
#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    pub lines: Vec<OutputEntry>,
    pub progress: Option<ProgressSnapshot>,
}

struct JobBuffer {
    lines: VecDeque<OutputEntry>,
    latest_progress: Option<ProgressSnapshot>,
    live: broadcast::Sender<OutputEntry>,
    terminal: bool,
}

/// Consumes a job's output: already-buffered lines first, then live lines,
/// with no duplication and no gaps from the moment of subscription.
pub struct Follow {
    buffered: VecDeque<OutputEntry>,
    live: Option<broadcast::Receiver<OutputEntry>>,
}

impl Follow {
    /// Returns the next entry, or `None` once the buffered backlog is
    /// drained and the job has reached a terminal state with no more live
    /// lines pending.
    pub async fn next(&mut self) -> Option<OutputEntry> {
        if let Some(entry) = self.buffered.pop_front() {
            return Some(entry);
        }
        loop {
            let live = self.live.as_mut()?;
            match live.recv().await {
                Ok(entry) => return Some(entry),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct OutputBuffer {
    jobs: RwLock<HashMap<JobId, JobBuffer>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Idempotent.
    pub async fn create(&self, job_id: &JobId) {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.clone()).or_insert_with(|| JobBuffer {
            lines: VecDeque::new(),
            latest_progress: None,
            live: broadcast::channel(256).0,
            terminal: false,
        });
    }

    /// Appends a line, dropping the oldest on overflow.
    pub async fn append(&self, job_id: &JobId, line: &OutputLine, progress: Option<ProgressSnapshot>) {
        let mut jobs = self.jobs.write().await;
        let Some(buf) = jobs.get_mut(job_id) else {
            return;
        };
        let entry = OutputEntry {
            text: line.text.clone(),
            tag: line.tag,
            timestamp: Utc::now(),
            progress: progress.clone(),
        };
        if progress.is_some() {
            buf.latest_progress = progress;
        }
        if buf.lines.len() >= self.capacity {
            buf.lines.pop_front();
        }
        buf.lines.push_back(entry.clone());
        let _ = buf.live.send(entry);
    }

    /// Returns at most `tail_n` newest lines (all lines if `None`).
    pub async fn snapshot(&self, job_id: &JobId, tail_n: Option<usize>) -> Option<BufferSnapshot> {
        let jobs = self.jobs.read().await;
        let buf = jobs.get(job_id)?;
        let lines: Vec<OutputEntry> = match tail_n {
            Some(n) => buf.lines.iter().rev().take(n).rev().cloned().collect(),
            None => buf.lines.iter().cloned().collect(),
        };
        Some(BufferSnapshot {
            lines,
            progress: buf.latest_progress.clone(),
        })
    }

    /// Subscribes to a job's output. Finite if the job is already terminal;
    /// otherwise keeps following until `mark_terminal` is called and the
    /// live backlog is drained.
    pub async fn follow(&self, job_id: &JobId) -> Option<Follow> {
        let jobs = self.jobs.read().await;
        let buf = jobs.get(job_id)?;
        let buffered: VecDeque<OutputEntry> = buf.lines.iter().cloned().collect();
        let live = if buf.terminal {
            None
        } else {
            Some(buf.live.subscribe())
        };
        Some(Follow { buffered, live })
    }

    /// Marks a job terminal: no further lines will be appended, and any
    /// live follower currently blocked on `recv` will observe channel close
    /// once buffered entries are drained.
    pub async fn mark_terminal(&self, job_id: &JobId) {
        let mut jobs = self.jobs.write().await;
        if let Some(buf) = jobs.get_mut(job_id) {
            buf.terminal = true;
            // Replacing the sender drops all existing receivers' ability to
            // receive further sends, closing the channel for subscribers.
            let (tx, _rx) = broadcast::channel(1);
            buf.live = tx;
        }
    }

    /// Releases a job's buffer (called on cleanup).
    pub async fn clear(&self, job_id: &JobId) {
        let mut jobs = self.jobs.write().await;
        jobs.remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> OutputLine {
        OutputLine {
            text: text.to_string(),
            tag: StreamTag::Stdout,
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_keeps_newest() {
        let buf = OutputBuffer::new(2);
        let job_id = "j1".to_string();
        buf.create(&job_id).await;
        buf.append(&job_id, &line("a"), None).await;
        buf.append(&job_id, &line("b"), None).await;
        buf.append(&job_id, &line("c"), None).await;

        let snap = buf.snapshot(&job_id, None).await.unwrap();
        let texts: Vec<_> = snap.lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn follow_yields_buffered_then_live_without_gap() {
        let buf = OutputBuffer::new(100);
        let job_id = "j1".to_string();
        buf.create(&job_id).await;
        buf.append(&job_id, &line("a"), None).await;

        let mut follow = buf.follow(&job_id).await.unwrap();
        assert_eq!(follow.next().await.unwrap().text, "a");

        buf.append(&job_id, &line("b"), None).await;
        assert_eq!(follow.next().await.unwrap().text, "b");

        buf.mark_terminal(&job_id).await;
        assert!(follow.next().await.is_none());
    }

    #[tokio::test]
    async fn snapshot_missing_job_is_none() {
        let buf = OutputBuffer::new(10);
        assert!(buf.snapshot(&"missing".to_string(), None).await.is_none());
    }
}
