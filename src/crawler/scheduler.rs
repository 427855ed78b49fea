use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::crawler::dedup::Deduplicator;
use crate::crawler::limiter::{ResourceLimiter, Slot};
use crate::crawler::request::Request;
use crate::crawler::spider::SpiderId;

/// Reasons a request can be refused by [`Scheduler::push`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("spider {0} is not registered")]
    UnknownSpider(SpiderId),

    #[error("duplicate request: {0}")]
    Duplicate(String),

    #[error("request limit of {limit} reached for spider {spider}")]
    LimitReached { spider: String, limit: usize },

    #[error("scheduler has been stopped")]
    Stopped,
}

/// A dequeued request together with the resource slot it occupies.
///
/// The slot goes back to the pool when the `Dispatch` (or the [`Slot`] taken out
/// of it) is dropped.
#[derive(Debug)]
pub struct Dispatch {
    pub request: Request,
    slot: Slot,
}

impl Dispatch {
    pub fn into_parts(self) -> (Request, Slot) {
        (self.request, self.slot)
    }
}

/// Pending requests of one spider, highest priority first, FIFO within a priority.
#[derive(Debug)]
struct SpiderQueue {
    name: String,
    limit: Option<usize>,
    accepted: usize,
    buckets: BTreeMap<i32, VecDeque<Request>>,
    len: usize,
}

impl SpiderQueue {
    fn new(name: &str, limit: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            limit,
            accepted: 0,
            buckets: BTreeMap::new(),
            len: 0,
        }
    }

    fn push(&mut self, request: Request) {
        self.buckets
            .entry(request.priority)
            .or_default()
            .push_back(request);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Request> {
        let mut bucket = self.buckets.last_entry()?;
        let request = bucket.get_mut().pop_front();
        if bucket.get().is_empty() {
            bucket.remove();
        }
        if request.is_some() {
            self.len -= 1;
        }
        request
    }

    fn drain(&mut self) -> Vec<Request> {
        self.len = 0;
        std::mem::take(&mut self.buckets)
            .into_values()
            .flatten()
            .collect()
    }
}

/// Central request scheduler shared by every crawler of a run.
///
/// Owns one queue per registered spider, the request [`Deduplicator`] and the
/// process-wide [`ResourceLimiter`]. Every operation is non-blocking and safe to
/// call from many tasks at once.
#[derive(Debug)]
pub struct Scheduler {
    queues: DashMap<SpiderId, SpiderQueue>,
    dedup: Deduplicator,
    limiter: ResourceLimiter,
    stopped: AtomicBool,
    paused: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler with `slots` concurrent in-flight requests
    pub fn new(slots: usize) -> Self {
        let limiter = ResourceLimiter::new(slots);
        info!("Scheduler initialised with {} resource slots", limiter.capacity());
        Self {
            queues: DashMap::new(),
            dedup: Deduplicator::new(),
            limiter,
            stopped: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// Record a spider as active. Registering the same id twice is a no-op.
    pub fn register_spider(&self, id: SpiderId, name: &str, limit: Option<usize>) {
        self.queues.entry(id).or_insert_with(|| {
            debug!("Registered spider {} ({})", name, id);
            SpiderQueue::new(name, limit)
        });
    }

    /// Deregister a spider and drop its queued requests.
    ///
    /// Requests already dispatched keep running. Returns how many queued requests
    /// were discarded; their fingerprints are released.
    pub fn cancel_spider(&self, id: SpiderId) -> usize {
        let Some((_, mut queue)) = self.queues.remove(&id) else {
            return 0;
        };
        let dropped = queue.drain();
        for request in &dropped {
            if !request.reloadable {
                self.dedup.remove(&request.fingerprint());
            }
        }
        debug!(
            "Cancelled spider {} ({}), {} queued requests dropped",
            queue.name,
            id,
            dropped.len()
        );
        dropped.len()
    }

    /// Enqueue a request for a registered spider
    pub fn push(&self, id: SpiderId, mut request: Request) -> Result<(), SchedulerError> {
        if self.is_stop() {
            return Err(SchedulerError::Stopped);
        }

        let mut queue = self
            .queues
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownSpider(id))?;

        if let Some(limit) = queue.limit {
            if queue.accepted >= limit {
                return Err(SchedulerError::LimitReached {
                    spider: queue.name.clone(),
                    limit,
                });
            }
        }

        if !request.reloadable && !self.dedup.insert(&request.fingerprint()) {
            return Err(SchedulerError::Duplicate(request.fingerprint()));
        }

        if request.spider.is_empty() {
            request.spider = queue.name.clone();
        }
        trace!("Enqueued {} for spider {}", request.url, queue.name);
        queue.accepted += 1;
        queue.push(request);
        Ok(())
    }

    /// Non-blocking dequeue.
    ///
    /// Acquires one resource slot for the returned request. Returns None when the
    /// queue is empty, no slot is free, or the scheduler is stopped or paused.
    pub fn use_one(&self, id: SpiderId) -> Option<Dispatch> {
        if self.is_stop() || self.is_paused() || self.is_empty(id) {
            return None;
        }

        let slot = self.limiter.try_acquire()?;
        // If another task emptied the queue meanwhile the slot is dropped here
        let request = self.queues.get_mut(&id)?.pop()?;
        Some(Dispatch { request, slot })
    }

    /// Return a slot to the shared pool
    pub fn free(&self, slot: Slot) {
        drop(slot);
        trace!("Resource slot released, {} available", self.limiter.available());
    }

    /// True if the spider has no pending requests (unknown spiders count as empty)
    pub fn is_empty(&self, id: SpiderId) -> bool {
        self.queue_len(id) == 0
    }

    pub fn queue_len(&self, id: SpiderId) -> usize {
        self.queues.get(&id).map(|queue| queue.len).unwrap_or(0)
    }

    /// Request a global stop; every crawler leaves its loop on the next poll
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Global stop requested, {} fingerprints held", self.dedup.len());
        }
    }

    pub fn is_stop(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Forget a fingerprint so the same request may be pushed again
    pub fn del_deduplication(&self, fingerprint: &str) -> bool {
        let removed = self.dedup.remove(fingerprint);
        if removed {
            trace!("Released fingerprint {}", fingerprint);
        }
        removed
    }

    pub fn has_fingerprint(&self, fingerprint: &str) -> bool {
        self.dedup.contains(fingerprint)
    }

    pub fn slot_capacity(&self) -> usize {
        self.limiter.capacity()
    }

    pub fn available_slots(&self) -> usize {
        self.limiter.available()
    }

    pub fn active_spiders(&self) -> usize {
        self.queues.len()
    }
}
