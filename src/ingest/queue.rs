//! Durable task queue with per-owner FIFO dispatch.
//!
//! Tasks are relational rows; the queue survives restarts. The dispatcher
//! hands the oldest pending task per owner to a bounded worker pool, never
//! running two tasks of the same owner concurrently, so segments of one
//! owner reconcile in arrival order while owners proceed in parallel.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use super::aggregator::IngestWorker;
use crate::metrics;
use crate::store::relational::RelationalStore;
use crate::types::{OwnerId, TaskPayload, TaskRecord, TaskStatus};

/// Dispatcher wake-up interval when idle.
const DISPATCH_POLL: Duration = Duration::from_millis(500);

pub struct TaskQueue {
    relational: Arc<RelationalStore>,
    notify: Notify,
    busy_owners: Mutex<HashSet<String>>,
}

impl TaskQueue {
    pub fn new(relational: Arc<RelationalStore>) -> Self {
        Self {
            relational,
            notify: Notify::new(),
            busy_owners: Mutex::new(HashSet::new()),
        }
    }

    /// Enqueue a task durably and wake the dispatcher. Returns the stored
    /// record; its id is the handle clients poll.
    pub fn submit(&self, owner: OwnerId, payload: TaskPayload) -> Result<TaskRecord> {
        let seq = self.relational.next_task_seq()?;
        let task = TaskRecord::new(owner, payload, seq);
        self.relational.put_task(&task)?;
        metrics::TASK_QUEUE_DEPTH.inc();
        self.notify.notify_one();
        Ok(task)
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<TaskRecord>> {
        self.relational.get_task(id)
    }

    /// Re-queue tasks a previous process left RUNNING, then start the
    /// dispatcher. Call once at startup.
    pub fn recover(&self) -> Result<usize> {
        let recovered = self.relational.recover_running_tasks()?;
        if recovered > 0 {
            tracing::info!("Recovered {} in-flight tasks from previous run", recovered);
        }
        let depth = self.relational.queue_depth()? as i64;
        metrics::TASK_QUEUE_DEPTH.set(depth);
        Ok(recovered)
    }

    /// Oldest pending task whose owner has nothing in flight.
    fn next_dispatchable(&self) -> Result<Option<TaskRecord>> {
        let busy = self.busy_owners.lock();
        for task in self.relational.queued_tasks()? {
            if task.status == TaskStatus::Pending && !busy.contains(&task.owner.partition_key()) {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Run the dispatcher until the returned handle is aborted. Worker
    /// parallelism across owners is bounded by `pool_size`.
    pub fn spawn_dispatcher(
        self: Arc<Self>,
        worker: Arc<IngestWorker>,
        pool_size: usize,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self;
        let pool = Arc::new(Semaphore::new(pool_size.max(1)));

        tokio::spawn(async move {
            loop {
                let task = match queue.next_dispatchable() {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        // Sleep until a submit() or a finished task wakes us
                        let _ = tokio::time::timeout(DISPATCH_POLL, queue.notified()).await;
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("Task dispatch failed: {}", e);
                        tokio::time::sleep(DISPATCH_POLL).await;
                        continue;
                    }
                };

                let permit = match pool.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let owner_key = task.owner.partition_key();
                queue.busy_owners.lock().insert(owner_key.clone());

                let queue_for_task = Arc::clone(&queue);
                let worker_for_task = Arc::clone(&worker);
                tokio::spawn(async move {
                    worker_for_task.process_task(task).await;
                    metrics::TASK_QUEUE_DEPTH.dec();
                    queue_for_task.busy_owners.lock().remove(&owner_key);
                    queue_for_task.notify.notify_one();
                    drop(permit);
                });
            }
        })
    }

    async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn depth(&self) -> Result<usize> {
        self.relational.queue_depth()
    }
}
