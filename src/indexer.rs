//! Incremental index queue.
//!
//! Re-index work is queued at three priorities, FIFO within a level and
//! strictly high→medium→low across levels. Work is keyed by normalized path:
//! a resubmission coalesces with the pending entry (upgrading its priority
//! at most), and a path currently in flight is never dispatched twice
//! concurrently — per-file operations stay totally ordered. In-flight work
//! is bounded by the worker count; queue depth is observable through
//! `activity_snapshot`.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

const LEVELS: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Reindex,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTask {
    pub path: String,
    pub priority: Priority,
    pub kind: TaskKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivitySnapshot {
    pub queued: HashMap<String, usize>,
    #[serde(rename = "inFlight")]
    pub in_flight: usize,
    pub processed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    queues: HashMap<Priority, VecDeque<IndexTask>>,
    /// Paths with a queued task, for coalescing.
    pending: HashSet<String>,
    /// Paths currently being processed.
    in_flight: HashSet<String>,
    processed: u64,
    failed: u64,
    shutdown: bool,
}

impl QueueState {
    /// Next dispatchable task: strictly high→medium→low, FIFO inside a
    /// level, skipping paths already in flight.
    fn pop_dispatchable(&mut self) -> Option<IndexTask> {
        for level in LEVELS {
            let in_flight = &self.in_flight;
            let pos = self
                .queues
                .get(&level)
                .and_then(|q| q.iter().position(|t| !in_flight.contains(&t.path)));
            if let Some(pos) = pos {
                let task = self.queues.get_mut(&level).unwrap().remove(pos).unwrap();
                self.pending.remove(&task.path);
                self.in_flight.insert(task.path.clone());
                return Some(task);
            }
        }
        None
    }
}

pub type IndexHandler = Arc<dyn Fn(&IndexTask) -> Result<(), String> + Send + Sync>;

pub struct IndexQueue {
    state: Arc<(Mutex<QueueState>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexQueue {
    /// Start the queue with `workers` threads running `handler`.
    pub fn start(workers: usize, handler: IndexHandler) -> IndexQueue {
        let state: Arc<(Mutex<QueueState>, Condvar)> =
            Arc::new((Mutex::new(QueueState::default()), Condvar::new()));
        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_id in 0..workers.max(1) {
            let state = Arc::clone(&state);
            let handler = Arc::clone(&handler);
            handles.push(std::thread::spawn(move || {
                worker_loop(worker_id, state, handler);
            }));
        }
        IndexQueue { state, workers: Mutex::new(handles) }
    }

    /// Enqueue work. A pending task for the same path coalesces: the kind is
    /// replaced and the priority only ever upgrades.
    pub fn submit(&self, path: &str, priority: Priority, kind: TaskKind) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        if state.shutdown {
            return;
        }
        if state.pending.contains(path) {
            // Find and possibly upgrade the queued entry.
            let mut existing: Option<IndexTask> = None;
            for level in LEVELS {
                if let Some(queue) = state.queues.get_mut(&level) {
                    if let Some(pos) = queue.iter().position(|t| t.path == path) {
                        existing = queue.remove(pos);
                        break;
                    }
                }
            }
            if let Some(mut task) = existing {
                task.kind = kind;
                task.priority = task.priority.min(priority);
                let level = task.priority;
                state.queues.entry(level).or_default().push_back(task);
                cvar.notify_one();
                return;
            }
        }
        state.pending.insert(path.to_string());
        state
            .queues
            .entry(priority)
            .or_default()
            .push_back(IndexTask { path: path.to_string(), priority, kind });
        cvar.notify_one();
    }

    pub fn activity_snapshot(&self) -> ActivitySnapshot {
        let (lock, _) = &*self.state;
        let state = lock.lock().unwrap();
        let mut queued = HashMap::new();
        for level in LEVELS {
            let name = match level {
                Priority::High => "high",
                Priority::Medium => "medium",
                Priority::Low => "low",
            };
            queued.insert(
                name.to_string(),
                state.queues.get(&level).map(|q| q.len()).unwrap_or(0),
            );
        }
        ActivitySnapshot {
            queued,
            in_flight: state.in_flight.len(),
            processed: state.processed,
            failed: state.failed,
        }
    }

    /// Block until the queue is drained (tests and CLI `index`).
    pub fn drain(&self) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        while !state.shutdown
            && (!state.in_flight.is_empty()
                || state.queues.values().any(|q| !q.is_empty()))
        {
            let (next, _) = cvar
                .wait_timeout(state, std::time::Duration::from_millis(20))
                .unwrap();
            state = next;
        }
    }

    /// Stop accepting work and join the workers.
    pub fn dispose(&self) {
        {
            let (lock, cvar) = &*self.state;
            let mut state = lock.lock().unwrap();
            state.shutdown = true;
            cvar.notify_all();
        }
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!("index queue disposed");
    }
}

fn worker_loop(
    worker_id: usize,
    state: Arc<(Mutex<QueueState>, Condvar)>,
    handler: IndexHandler,
) {
    loop {
        let task = {
            let (lock, cvar) = &*state;
            let mut guard = lock.lock().unwrap();
            loop {
                if guard.shutdown {
                    return;
                }
                if let Some(task) = guard.pop_dispatchable() {
                    break task;
                }
                let (next, _) = cvar
                    .wait_timeout(guard, std::time::Duration::from_millis(50))
                    .unwrap();
                guard = next;
            }
        };

        let result = handler(&task);

        let (lock, cvar) = &*state;
        let mut guard = lock.lock().unwrap();
        guard.in_flight.remove(&task.path);
        match result {
            Ok(()) => guard.processed += 1,
            Err(e) => {
                guard.failed += 1;
                warn!(worker = worker_id, path = %task.path, error = %e, "index task failed");
            }
        }
        cvar.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_levels_strictly_ordered() {
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let order_ref = Arc::clone(&order);
        let gate = Arc::new(Mutex::new(()));

        // Hold the single worker hostage until everything is queued.
        let held = gate.lock().unwrap();
        let gate_ref = Arc::clone(&gate);
        let queue = IndexQueue::start(
            1,
            Arc::new(move |task| {
                let _go = gate_ref.lock().unwrap();
                order_ref.lock().unwrap().push(task.path.clone());
                Ok(())
            }),
        );

        queue.submit("low-1", Priority::Low, TaskKind::Reindex);
        queue.submit("med-1", Priority::Medium, TaskKind::Reindex);
        queue.submit("high-1", Priority::High, TaskKind::Reindex);
        queue.submit("high-2", Priority::High, TaskKind::Reindex);
        queue.submit("med-2", Priority::Medium, TaskKind::Reindex);
        // worker may already hold one task (queued before the gate); the
        // rest must come out high→medium→low, FIFO within a level.
        drop(held);
        queue.drain();
        queue.dispose();

        let seen = order.lock().unwrap().clone();
        assert_eq!(seen.len(), 5);
        let tail: Vec<&String> = seen.iter().skip(1).collect();
        let rank = |p: &str| -> usize {
            if p.starts_with("high") {
                0
            } else if p.starts_with("med") {
                1
            } else {
                2
            }
        };
        for pair in tail.windows(2) {
            assert!(
                rank(pair[0]) <= rank(pair[1]),
                "priority inversion in {seen:?}"
            );
        }
        // FIFO within high
        let h1 = seen.iter().position(|p| p == "high-1").unwrap();
        let h2 = seen.iter().position(|p| p == "high-2").unwrap();
        assert!(h1 < h2);
    }

    #[test]
    fn test_same_path_coalesces() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_ref = Arc::clone(&counter);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let gate_ref = Arc::clone(&gate);
        let queue = IndexQueue::start(
            1,
            Arc::new(move |_| {
                let _go = gate_ref.lock().unwrap();
                counter_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        // occupy the worker with one task, then spam one path
        queue.submit("busy", Priority::High, TaskKind::Reindex);
        std::thread::sleep(std::time::Duration::from_millis(30));
        for _ in 0..5 {
            queue.submit("same", Priority::Low, TaskKind::Reindex);
        }
        queue.submit("same", Priority::High, TaskKind::Reindex);
        let snapshot = queue.activity_snapshot();
        let total_queued: usize = snapshot.queued.values().sum();
        assert_eq!(total_queued, 1, "coalesced into one pending task");

        drop(held);
        queue.drain();
        queue.dispose();
        assert_eq!(counter.load(Ordering::SeqCst), 2, "busy + same, once each");
    }

    #[test]
    fn test_failures_counted() {
        let queue = IndexQueue::start(
            2,
            Arc::new(|task| {
                if task.path.contains("bad") {
                    Err("boom".into())
                } else {
                    Ok(())
                }
            }),
        );
        queue.submit("good.rs", Priority::Medium, TaskKind::Reindex);
        queue.submit("bad.rs", Priority::Medium, TaskKind::Reindex);
        queue.drain();
        let snapshot = queue.activity_snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.in_flight, 0);
        queue.dispose();
    }

    #[test]
    fn test_submit_after_dispose_is_noop() {
        let queue = IndexQueue::start(1, Arc::new(|_| Ok(())));
        queue.dispose();
        queue.submit("late.rs", Priority::High, TaskKind::Reindex);
        let snapshot = queue.activity_snapshot();
        assert_eq!(snapshot.queued.values().sum::<usize>(), 0);
    }
}
