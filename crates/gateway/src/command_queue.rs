//! Lane-based task queue for agent turns.
//!
//! Work is grouped into lanes (one per conversation). Each lane runs at most
//! `max_concurrent` tasks at a time in FIFO order; distinct lanes run in
//! parallel. The queue publishes its active count (running + queued) on a
//! watch channel so the run loop can wait for it to reach zero.

use std::{
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{FutureExt, future::BoxFuture},
    tokio::sync::{oneshot, watch},
    tracing::{debug, warn},
};

use crate::lifecycle::{DrainOutcome, TaskAccounting};

type Job = BoxFuture<'static, ()>;

struct Lane {
    running: usize,
    max_concurrent: usize,
    pending: VecDeque<Job>,
}

impl Lane {
    fn new(max_concurrent: usize) -> Self {
        Self {
            running: 0,
            max_concurrent: max_concurrent.max(1),
            pending: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.pending.is_empty()
    }
}

#[derive(Default)]
struct LaneTable {
    generation: u64,
    lanes: HashMap<String, Lane>,
    concurrency: HashMap<String, usize>,
    active: usize,
}

struct QueueInner {
    table: Mutex<LaneTable>,
    active_tx: watch::Sender<usize>,
    default_concurrency: usize,
}

/// Snapshot of one lane for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LaneSnapshot {
    pub lane: String,
    pub running: usize,
    pub queued: usize,
}

/// Lane-based FIFO command queue.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::with_default_concurrency(1)
    }

    pub fn with_default_concurrency(max_concurrent: usize) -> Self {
        let (active_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                table: Mutex::new(LaneTable::default()),
                active_tx,
                default_concurrency: max_concurrent.max(1),
            }),
        }
    }

    /// Override concurrency for one lane. Applies to the lane's next start.
    pub fn set_lane_concurrency(&self, lane: &str, max_concurrent: usize) {
        let mut table = self.lock();
        table
            .concurrency
            .insert(lane.to_string(), max_concurrent.max(1));
        if let Some(existing) = table.lanes.get_mut(lane) {
            existing.max_concurrent = max_concurrent.max(1);
        }
        Self::pump(&self.inner, &mut table, lane);
    }

    /// Queue `task` on `lane`. The receiver yields its output, or an error if
    /// the task was discarded by a lane reset or panicked.
    pub fn enqueue<F, T>(&self, lane: &str, task: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(task.await);
        });

        let mut table = self.lock();
        let default_concurrency = self.inner.default_concurrency;
        let max = table
            .concurrency
            .get(lane)
            .copied()
            .unwrap_or(default_concurrency);
        table
            .lanes
            .entry(lane.to_string())
            .or_insert_with(|| Lane::new(max))
            .pending
            .push_back(job);
        table.active += 1;
        self.inner.active_tx.send_replace(table.active);
        debug!(lane, active = table.active, "task enqueued");

        Self::pump(&self.inner, &mut table, lane);
        rx
    }

    /// Per-lane view of running and queued work.
    #[must_use]
    pub fn lanes(&self) -> Vec<LaneSnapshot> {
        let table = self.lock();
        let mut lanes: Vec<_> = table
            .lanes
            .iter()
            .map(|(name, lane)| LaneSnapshot {
                lane: name.clone(),
                running: lane.running,
                queued: lane.pending.len(),
            })
            .collect();
        lanes.sort_by(|a, b| a.lane.cmp(&b.lane));
        lanes
    }

    fn lock(&self) -> MutexGuard<'_, LaneTable> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start queued jobs on `lane` while it has free slots.
    fn pump(inner: &Arc<QueueInner>, table: &mut LaneTable, lane: &str) {
        let generation = table.generation;
        let Some(state) = table.lanes.get_mut(lane) else {
            return;
        };
        while state.running < state.max_concurrent {
            let Some(job) = state.pending.pop_front() else {
                break;
            };
            state.running += 1;
            let inner = Arc::clone(inner);
            let lane = lane.to_string();
            tokio::spawn(async move {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    warn!(lane, "queued task panicked");
                }
                Self::finish(&inner, &lane, generation);
            });
        }
    }

    fn finish(inner: &Arc<QueueInner>, lane: &str, generation: u64) {
        let mut table = inner.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.generation != generation {
            // Completed after a lane reset; the new epoch never counted it.
            return;
        }
        if let Some(state) = table.lanes.get_mut(lane) {
            state.running = state.running.saturating_sub(1);
        }
        table.active = table.active.saturating_sub(1);
        inner.active_tx.send_replace(table.active);
        Self::pump(inner, &mut table, lane);
        if table.lanes.get(lane).is_some_and(Lane::is_idle) {
            table.lanes.remove(lane);
        }
    }
}

#[async_trait]
impl TaskAccounting for CommandQueue {
    fn active_task_count(&self) -> usize {
        *self.inner.active_tx.borrow()
    }

    async fn wait_for_active_tasks(&self, timeout: Duration) -> DrainOutcome {
        let mut rx = self.inner.active_tx.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|active| *active == 0)).await,
            Ok(Ok(_))
        );
        DrainOutcome { drained }
    }

    fn reset_all_lanes(&self) {
        let mut table = self.lock();
        table.generation += 1;
        let dropped: usize = table.lanes.values().map(|lane| lane.pending.len()).sum();
        table.lanes.clear();
        table.active = 0;
        self.inner.active_tx.send_replace(0);
        debug!(
            generation = table.generation,
            dropped_queued = dropped,
            "command lanes reset"
        );
    }
}
