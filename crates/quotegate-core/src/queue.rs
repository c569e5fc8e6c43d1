//! Priority admission queue with retry scheduling and a dead-letter lane.
//!
//! Three bounded lanes (high, medium, low) are served in strict priority
//! order; within a lane items are ordered by creation time. Admission never
//! blocks: a full lane rejects. Dequeue waits until any lane has work.
//!
//! Every admitted item stays tracked until it reaches a terminal state. The
//! tracking table holds the reply channel of the caller waiting on the item,
//! so cancellation and completion both resolve through it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::domain::{MarketPayload, Priority, WorkId, WorkItem, WorkState};
use crate::error::GatewayError;
use crate::retry::RetryPolicy;

/// What a caller receives once its work item is resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResponse {
    Data(Arc<MarketPayload>),
    /// The request was served but no provider had data for it.
    NoContent,
    Cancelled,
}

pub type WorkResult = Result<GatewayResponse, GatewayError>;

/// Handle returned on admission; resolves when the item reaches a terminal state.
#[derive(Debug)]
pub struct Submission {
    pub id: WorkId,
    pub priority: Priority,
    /// Approximate time until a worker picks the item up.
    pub estimated_wait: Duration,
    reply: oneshot::Receiver<WorkResult>,
}

impl Submission {
    pub async fn wait(self) -> WorkResult {
        self.reply.await.unwrap_or(Err(GatewayError::Shutdown))
    }
}

#[derive(Debug)]
struct Tracked {
    state: WorkState,
    reply: Option<oneshot::Sender<WorkResult>>,
}

#[derive(Debug, Default)]
struct Lanes {
    lanes: [VecDeque<WorkItem>; 3],
}

impl Lanes {
    fn lane(&self, priority: Priority) -> &VecDeque<WorkItem> {
        &self.lanes[priority.rank()]
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<WorkItem> {
        &mut self.lanes[priority.rank()]
    }

    fn pop(&mut self) -> Option<WorkItem> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Removes a queued item and marks it cancelled.
    fn withdraw(&mut self, id: WorkId) -> Option<WorkItem> {
        self.lanes.iter_mut().find_map(|lane| {
            let position = lane.iter().position(|item| item.id == id)?;
            let mut item = lane.remove(position)?;
            item.finish(WorkState::Cancelled);
            Some(item)
        })
    }
}

/// Outcome of trying to place an item in its lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Queued,
    Full,
    Closed,
    /// A retry whose request was cancelled while it waited for its backoff.
    Withdrawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LaneStats {
    pub priority: Priority,
    pub size: usize,
    pub capacity: usize,
    pub estimated_wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub lanes: Vec<LaneStats>,
    pub dead_letter: usize,
    pub in_flight: usize,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// `completed / total` as a percentage, `0.0` before the first admission.
    pub success_rate: f64,
}

impl QueueStats {
    pub fn lane(&self, priority: Priority) -> Option<&LaneStats> {
        self.lanes.iter().find(|lane| lane.priority == priority)
    }
}

#[derive(Debug)]
pub struct AdmissionQueue {
    lanes: Mutex<Lanes>,
    capacities: [usize; 3],
    ready: Notify,
    closed: AtomicBool,
    in_flight: DashMap<WorkId, Tracked>,
    dead_letters: Mutex<Vec<WorkItem>>,
    retry: RetryPolicy,
    workers: usize,
    throughput_per_worker: f64,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl AdmissionQueue {
    pub fn new(config: &QueueConfig) -> Self {
        info!(
            high = config.high_capacity,
            medium = config.medium_capacity,
            low = config.low_capacity,
            workers = config.workers,
            max_retries = config.max_retries,
            "admission queue initialized"
        );
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacities: [
                config.high_capacity,
                config.medium_capacity,
                config.low_capacity,
            ],
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            in_flight: DashMap::new(),
            dead_letters: Mutex::new(Vec::new()),
            retry: config.retry_policy(),
            workers: config.workers.max(1),
            throughput_per_worker: config.throughput_per_worker,
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self, priority: Priority) -> usize {
        self.capacities[priority.rank()]
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Appends `item` to its lane unless the lane is full. Never blocks.
    ///
    /// The first admission of an id starts tracking it and counts towards
    /// `total`; re-enqueued retries do neither, and are dropped if their
    /// request was cancelled in the meantime.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        self.admit(item, None) == Admission::Queued
    }

    /// Admits `item` and hands back a handle the caller can await.
    pub fn submit(&self, item: WorkItem) -> Result<Submission, GatewayError> {
        let (sender, reply) = oneshot::channel();
        let id = item.id;
        let priority = item.priority;

        match self.admit(item, Some(sender)) {
            Admission::Queued => Ok(Submission {
                id,
                priority,
                estimated_wait: self.estimated_wait(priority),
                reply,
            }),
            Admission::Closed => Err(GatewayError::Shutdown),
            Admission::Full | Admission::Withdrawn => Err(GatewayError::AdmissionRejected {
                priority,
                capacity: self.capacity(priority),
            }),
        }
    }

    /// Lane insertion and tracking happen under the lanes lock, so a
    /// concurrent `cancel` sees either both or neither.
    fn admit(&self, mut item: WorkItem, reply: Option<oneshot::Sender<WorkResult>>) -> Admission {
        let priority = item.priority;
        let capacity = self.capacity(priority);
        let id = item.id;
        {
            let mut lanes = self.lock_lanes();
            if self.closed.load(Ordering::Acquire) {
                return Admission::Closed;
            }
            if lanes.lane(priority).len() >= capacity {
                drop(lanes);
                warn!(priority = %priority, capacity, "queue is full, request rejected");
                return Admission::Full;
            }

            match reply {
                Some(reply) => {
                    self.in_flight.insert(
                        id,
                        Tracked {
                            state: WorkState::Queued,
                            reply: Some(reply),
                        },
                    );
                    self.total.fetch_add(1, Ordering::Relaxed);
                }
                None if item.retry_count > 0 => match self.in_flight.get_mut(&id) {
                    Some(mut tracked) => tracked.state = WorkState::Queued,
                    None => return Admission::Withdrawn,
                },
                None => {
                    let mut fresh = false;
                    self.in_flight
                        .entry(id)
                        .and_modify(|tracked| tracked.state = WorkState::Queued)
                        .or_insert_with(|| {
                            fresh = true;
                            Tracked {
                                state: WorkState::Queued,
                                reply: None,
                            }
                        });
                    if fresh {
                        self.total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            item.state = WorkState::Queued;
            let lane = lanes.lane_mut(priority);
            let position = lane.partition_point(|queued| queued.created_at <= item.created_at);
            lane.insert(position, item);
        }
        self.ready.notify_one();
        debug!(id = %id, priority = %priority, "request queued");
        Admission::Queued
    }

    /// Next item in strict priority order, without waiting.
    pub fn try_dequeue(&self) -> Option<WorkItem> {
        self.lock_lanes().pop()
    }

    /// Waits until any lane has an item and returns the highest-priority one.
    /// Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }
            notified.await;
        }
    }

    /// Marks a dequeued item as processing. `false` means it was cancelled
    /// after it left its lane and must be dropped.
    pub fn begin(&self, item: &mut WorkItem) -> bool {
        match self.in_flight.get_mut(&item.id) {
            Some(mut tracked) => {
                tracked.state = WorkState::Processing;
                item.state = WorkState::Processing;
                true
            }
            None => {
                debug!(id = %item.id, "skipping cancelled request");
                false
            }
        }
    }

    /// Resolves a successfully served item.
    pub fn complete(&self, mut item: WorkItem, response: GatewayResponse) {
        let Some((_, tracked)) = self.in_flight.remove(&item.id) else {
            item.finish(WorkState::Cancelled);
            debug!(id = %item.id, "result discarded for cancelled request");
            return;
        };
        item.finish(WorkState::Completed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        if let Some(reply) = tracked.reply {
            let _ = reply.send(Ok(response));
        }
        debug!(id = %item.id, retries = item.retry_count, "request completed");
    }

    /// Counts a failed attempt and either schedules a retry after the backoff
    /// delay or moves the item to the dead-letter lane.
    pub fn handle_failure(self: &Arc<Self>, mut item: WorkItem, error: GatewayError) {
        item.retry_count += 1;
        item.last_error = Some(error.to_string());

        if !self.in_flight.contains_key(&item.id) {
            item.finish(WorkState::Cancelled);
            debug!(id = %item.id, "failure discarded for cancelled request");
            return;
        }
        if !error.retryable() || !self.retry.allows(item.retry_count) {
            self.dead_letter(item, error);
            return;
        }

        let delay = self.retry.delay_for_retry(item.retry_count);
        item.state = WorkState::Pending;
        if let Some(mut tracked) = self.in_flight.get_mut(&item.id) {
            tracked.state = WorkState::Pending;
        }
        info!(
            id = %item.id,
            attempt = item.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "request scheduled for retry"
        );

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let id = item.id;
            let priority = item.priority;
            match queue.admit(item.clone(), None) {
                Admission::Queued => {
                    info!(id = %id, attempt = item.retry_count, "retrying request");
                }
                Admission::Withdrawn => {
                    debug!(id = %id, "retry dropped for cancelled request");
                }
                Admission::Full | Admission::Closed => {
                    let rejected = GatewayError::AdmissionRejected {
                        priority,
                        capacity: queue.capacity(priority),
                    };
                    warn!(id = %id, "retry could not be re-queued");
                    queue.dead_letter(item, rejected);
                }
            }
        });
    }

    fn dead_letter(&self, mut item: WorkItem, cause: GatewayError) {
        item.finish(WorkState::Failed);
        let Some((_, tracked)) = self.in_flight.remove(&item.id) else {
            return;
        };
        self.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            id = %item.id,
            attempts = item.retry_count,
            error = %cause,
            "request moved to dead-letter lane"
        );

        let outcome = GatewayError::RetriesExhausted {
            id: item.id,
            attempts: item.retry_count,
            last_error: item.last_error.clone().unwrap_or_else(|| cause.to_string()),
        };
        self.dead_letters
            .lock()
            .expect("dead-letter lock is not poisoned")
            .push(item);
        if let Some(reply) = tracked.reply {
            let _ = reply.send(Err(outcome));
        }
    }

    /// Cancels a tracked item. Returns `false` if it is unknown or already finished.
    ///
    /// A queued item is removed from its lane. An item already being processed
    /// keeps its upstream call; the result is discarded.
    pub fn cancel(&self, id: WorkId) -> bool {
        let (mut tracked, withdrawn) = {
            let mut lanes = self.lock_lanes();
            let Some((_, tracked)) = self.in_flight.remove(&id) else {
                return false;
            };
            (tracked, lanes.withdraw(id))
        };
        let previous = std::mem::replace(&mut tracked.state, WorkState::Cancelled);
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        if let Some(reply) = tracked.reply.take() {
            let _ = reply.send(Ok(GatewayResponse::Cancelled));
        }
        info!(
            id = %id,
            previous = ?previous,
            removed_from_lane = withdrawn.is_some(),
            "request cancelled"
        );
        true
    }

    pub fn state_of(&self, id: WorkId) -> Option<WorkState> {
        self.in_flight.get(&id).map(|tracked| tracked.state)
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.lock_lanes().lane(priority).len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_lanes().lanes.iter().all(VecDeque::is_empty)
    }

    /// `lane size / (throughput per worker * workers)`.
    pub fn estimated_wait(&self, priority: Priority) -> Duration {
        let size = self.len(priority) as f64;
        let rate = self.throughput_per_worker * self.workers as f64;
        Duration::from_millis((size / rate * 1000.0) as u64)
    }

    pub fn dead_letters(&self) -> Vec<WorkItem> {
        self.dead_letters
            .lock()
            .expect("dead-letter lock is not poisoned")
            .clone()
    }

    pub fn clear_dead_letters(&self) -> usize {
        let cleared = std::mem::take(
            &mut *self
                .dead_letters
                .lock()
                .expect("dead-letter lock is not poisoned"),
        )
        .len();
        info!(cleared, "dead-letter lane cleared");
        cleared
    }

    pub fn stats(&self) -> QueueStats {
        let sizes = {
            let lanes = self.lock_lanes();
            Priority::ALL.map(|priority| lanes.lane(priority).len())
        };
        let rate = self.throughput_per_worker * self.workers as f64;
        let total = self.total.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);

        QueueStats {
            lanes: Priority::ALL
                .iter()
                .map(|priority| {
                    let size = sizes[priority.rank()];
                    LaneStats {
                        priority: *priority,
                        size,
                        capacity: self.capacity(*priority),
                        estimated_wait_ms: (size as f64 / rate * 1000.0) as u64,
                    }
                })
                .collect(),
            dead_letter: self
                .dead_letters
                .lock()
                .expect("dead-letter lock is not poisoned")
                .len(),
            in_flight: self.in_flight.len(),
            total,
            completed,
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            success_rate: if total == 0 {
                0.0
            } else {
                completed as f64 * 100.0 / total as f64
            },
        }
    }

    /// Stops admission, wakes every waiting worker and drops pending replies,
    /// which resolve as [`GatewayError::Shutdown`].
    pub fn close(&self) {
        {
            let _lanes = self.lock_lanes();
            self.closed.store(true, Ordering::Release);
            self.in_flight.clear();
        }
        self.ready.notify_waiters();
        info!("admission queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_lanes(&self) -> std::sync::MutexGuard<'_, Lanes> {
        self.lanes.lock().expect("queue lanes lock is not poisoned")
    }
}
