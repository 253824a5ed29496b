//! Tiered, deduplicating job queue
//!
//! One FIFO per priority tier plus a map of pending keys. A key is pending from
//! submission until its worker calls `complete`; further submissions for a
//! pending key only attach their waiter (and may promote a queued job).
//! Promotion pushes the key onto the higher tier and leaves the old position
//! behind; `next` skips such leftovers.

use super::{Completion, Priority, Waiter};
use crate::cache::CacheKey;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::error;

/// A unit of work handed to a worker
#[derive(Debug, Clone)]
pub struct Job {
    pub key: CacheKey,
    pub path: PathBuf,
    pub priority: Priority,
    /// Cache generation when the job was (last) requested
    pub generation: u64,
}

/// What `submit` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// New job queued
    Queued,
    /// Attached to a job already queued or running
    Joined,
    /// Attached to a queued job and moved it to a higher tier
    Promoted,
    /// Queue is shut down; the waiter was handed back
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Queued,
    Running,
}

struct Pending {
    path: PathBuf,
    priority: Priority,
    generation: u64,
    state: State,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
struct Inner {
    tiers: [VecDeque<CacheKey>; Priority::COUNT],
    pending: HashMap<CacheKey, Pending>,
    running: usize,
    shutdown: bool,
}

impl Inner {
    fn queued(&self) -> usize {
        self.pending.len() - self.running
    }
}

/// Queue depth snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
}

#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<Inner>,
    /// Signalled when work arrives or on shutdown
    work: Condvar,
    /// Signalled when the queue drains
    idle: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job for `key`, or attach to the pending one.
    ///
    /// On `Rejected` the waiter (if any) is returned so the caller can complete
    /// it; otherwise it is owned by the queue.
    pub fn submit(
        &self,
        key: CacheKey,
        path: PathBuf,
        priority: Priority,
        generation: u64,
        waiter: Option<Waiter>,
    ) -> (Submitted, Option<Waiter>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.shutdown {
            return (Submitted::Rejected, waiter);
        }

        if let Some(pending) = inner.pending.get_mut(&key) {
            pending.waiters.extend(waiter);
            pending.generation = pending.generation.max(generation);
            if pending.state == State::Queued && priority > pending.priority {
                pending.priority = priority;
                inner.tiers[priority.index()].push_back(key);
                self.work.notify_one();
                return (Submitted::Promoted, None);
            }
            return (Submitted::Joined, None);
        }

        inner.pending.insert(
            key,
            Pending {
                path,
                priority,
                generation,
                state: State::Queued,
                waiters: waiter.into_iter().collect(),
            },
        );
        inner.tiers[priority.index()].push_back(key);
        self.work.notify_one();
        (Submitted::Queued, None)
    }

    /// Queued or running
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.inner.lock().pending.contains_key(key)
    }

    /// Block until a job is available, highest tier first.
    /// Returns `None` once the queue has shut down.
    pub fn next(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        loop {
            if inner.shutdown {
                return None;
            }
            if let Some(job) = Self::pop(&mut inner) {
                return Some(job);
            }
            self.work.wait(&mut inner);
        }
    }

    /// Non-blocking variant of `next`
    pub fn try_next(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return None;
        }
        Self::pop(&mut inner)
    }

    fn pop(inner: &mut Inner) -> Option<Job> {
        for tier in Priority::DESCENDING {
            while let Some(key) = inner.tiers[tier.index()].pop_front() {
                let Some(pending) = inner.pending.get_mut(&key) else {
                    continue;
                };
                // Leftover from a promotion, or already taken
                if pending.state != State::Queued || pending.priority != tier {
                    continue;
                }
                pending.state = State::Running;
                let job = Job {
                    key,
                    path: pending.path.clone(),
                    priority: pending.priority,
                    generation: pending.generation,
                };
                inner.running += 1;
                return Some(job);
            }
        }
        None
    }

    /// Latest generation recorded for a running job; requests that joined
    /// after a clear raise it.
    pub fn generation_of(&self, key: &CacheKey) -> Option<u64> {
        self.inner.lock().pending.get(key).map(|p| p.generation)
    }

    /// Finish a running job and take its waiters
    pub fn complete(&self, key: &CacheKey) -> Vec<Waiter> {
        let mut inner = self.inner.lock();
        let waiters = match inner.pending.remove(key) {
            Some(pending) => {
                if pending.state == State::Running {
                    inner.running -= 1;
                }
                pending.waiters
            }
            None => Vec::new(),
        };
        if inner.pending.is_empty() {
            self.idle.notify_all();
        }
        waiters
    }

    /// Block until nothing is queued or running
    pub fn wait_idle(&self) {
        let mut inner = self.inner.lock();
        while !inner.pending.is_empty() {
            self.idle.wait(&mut inner);
        }
    }

    /// Stop handing out work. Queued jobs are dropped and their waiters
    /// returned; running jobs keep theirs and complete normally.
    pub fn shutdown(&self) -> Vec<(PathBuf, Waiter)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.shutdown = true;
        for tier in inner.tiers.iter_mut() {
            tier.clear();
        }

        let queued: Vec<CacheKey> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.state == State::Queued)
            .map(|(key, _)| *key)
            .collect();
        let mut orphaned = Vec::new();
        for key in queued {
            if let Some(pending) = inner.pending.remove(&key) {
                let path = pending.path;
                orphaned.extend(pending.waiters.into_iter().map(|w| (path.clone(), w)));
            }
        }

        self.work.notify_all();
        if inner.pending.is_empty() {
            self.idle.notify_all();
        }
        orphaned
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            queued: inner.queued(),
            running: inner.running,
        }
    }
}

/// Hand a result to every waiter
pub fn deliver(waiters: Vec<Waiter>, result: &Completion) {
    for waiter in waiters {
        notify(waiter, result.clone());
    }
}

/// Run one waiter. A panicking callback is logged and contained so that the
/// remaining waiters and the calling worker are unaffected.
pub fn notify(waiter: Waiter, result: Completion) {
    if catch_unwind(AssertUnwindSafe(move || waiter(result))).is_err() {
        error!("completion callback panicked");
    }
}
