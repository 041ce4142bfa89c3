//! Reusable backoff policy and the coordinator's retry queue.
//!
//! One `BackoffPolicy` parameterizes every retry loop in the crate — the
//! secondary-store retry queue and the external API client — instead of ad
//! hoc per-call-site loops. The queue is in-memory and best-effort by
//! design: tasks do not survive a process restart.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::BackoffConfig;
use crate::store::StoreKind;

/// Exponential backoff: base delay doubling per attempt, capped, with a
/// bounded attempt count and a small jitter to avoid thundering herds.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base_delay: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            cap: config.cap,
            max_attempts: config.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the given attempt (1-based), or `None` once the attempt
    /// budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        let delay = self.base_delay.saturating_mul(factor).min(self.cap);
        Some(delay)
    }

    /// `delay_for` with up to 10% random jitter added.
    pub fn jittered_delay_for(&self, attempt: u32) -> Option<Duration> {
        let delay = self.delay_for(attempt)?;
        let jitter_ms = (delay.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return Some(delay);
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        Some(delay + Duration::from_millis(extra))
    }
}

/// Which secondary operation to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOp {
    Upsert,
    Delete,
}

/// A queued secondary-store write that failed and is awaiting replay.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub store: StoreKind,
    pub op: RetryOp,
    pub record_id: String,
    pub group_id: String,
    pub attempt: u32,
    pub next_eligible: Instant,
}

/// Point-in-time queue statistics for the health surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RetryStats {
    pub pending: usize,
    pub permanently_failed: u64,
}

/// Shared retry queue for failed secondary-store writes.
///
/// Enqueue and dequeue are safe under concurrent use; each task is handled
/// by a single worker at a time (taken off the queue, re-enqueued only on
/// another failure). Exhausted tasks are counted and logged, never silently
/// dropped.
pub struct RetryQueue {
    tasks: Mutex<VecDeque<RetryTask>>,
    policy: BackoffPolicy,
    permanently_failed: AtomicU64,
}

impl RetryQueue {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            policy,
            permanently_failed: AtomicU64::new(0),
        }
    }

    /// Queue the first replay of a failed secondary write.
    pub fn enqueue(&self, store: StoreKind, op: RetryOp, record_id: &str, group_id: &str) {
        let delay = self
            .policy
            .jittered_delay_for(1)
            .unwrap_or(Duration::ZERO);
        let task = RetryTask {
            store,
            op,
            record_id: record_id.to_string(),
            group_id: group_id.to_string(),
            attempt: 1,
            next_eligible: Instant::now() + delay,
        };
        tracing::debug!(
            store = %store,
            record_id,
            delay_ms = delay.as_millis() as u64,
            "queued secondary-store retry"
        );
        self.push(task);
    }

    /// Remove and return every task whose backoff has elapsed.
    pub fn take_due(&self, now: Instant) -> Vec<RetryTask> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        let mut remaining = VecDeque::with_capacity(tasks.len());
        while let Some(task) = tasks.pop_front() {
            if task.next_eligible <= now {
                due.push(task);
            } else {
                remaining.push_back(task);
            }
        }
        *tasks = remaining;
        due
    }

    /// Re-queue a task after another failure. Returns `false` (and counts
    /// the task as permanently failed) once the attempt budget is spent.
    pub fn reschedule(&self, mut task: RetryTask) -> bool {
        task.attempt += 1;
        match self.policy.jittered_delay_for(task.attempt) {
            Some(delay) => {
                task.next_eligible = Instant::now() + delay;
                tracing::debug!(
                    store = %task.store,
                    record_id = %task.record_id,
                    attempt = task.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rescheduled secondary-store retry"
                );
                self.push(task);
                true
            }
            None => {
                self.permanently_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    store = %task.store,
                    record_id = %task.record_id,
                    attempts = task.attempt - 1,
                    "secondary-store write permanently failed; projection must be rebuilt"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> RetryStats {
        let pending = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        RetryStats {
            pending,
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
        }
    }

    /// Whether any pending task targets the given store.
    pub fn has_pending_for(&self, store: StoreKind) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|task| task.store == store)
    }

    fn push(&self, task: RetryTask) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(BackoffConfig {
            base_delay: Duration::from_millis(100),
            cap: Duration::from_millis(450),
            max_attempts: 4,
        })
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(450)));
        assert_eq!(policy.delay_for(5), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn take_due_respects_next_eligible() {
        let queue = RetryQueue::new(policy());
        queue.enqueue(StoreKind::Vector, RetryOp::Upsert, "r1", "default");
        // Not yet eligible: first replay waits out the base delay.
        assert!(queue.take_due(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_secs(1);
        let due = queue.take_due(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].record_id, "r1");
        assert_eq!(queue.stats().pending, 0);
    }

    #[test]
    fn reschedule_exhausts_into_permanent_failure() {
        let queue = RetryQueue::new(policy());
        queue.enqueue(StoreKind::Graph, RetryOp::Delete, "r2", "default");
        let mut task = queue
            .take_due(Instant::now() + Duration::from_secs(1))
            .pop()
            .expect("due task");

        for _ in 0..3 {
            assert!(queue.reschedule(task.clone()));
            task = queue
                .take_due(Instant::now() + Duration::from_secs(2))
                .pop()
                .expect("rescheduled task");
        }
        // Fifth attempt exceeds max_attempts = 4.
        assert!(!queue.reschedule(task));
        let stats = queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.permanently_failed, 1);
    }
}
