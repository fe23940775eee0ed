// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FCFS packet scheduler: a bounded FIFO with blocking pop.
//!
//! The contract the server pipeline depends on:
//! - `push` never blocks; when the queue is full the new item is dropped
//!   (drop-newest keeps in-flight state intact) and `push` returns `false`.
//! - `pop` blocks until an item arrives or the scheduler is stopped;
//!   after `stop()` it drains nothing and returns `None`.
//! - Items come out in insertion order.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    queue: VecDeque<T>,
    stopped: bool,
}

/// Bounded first-come-first-served queue shared between pipeline workers.
pub struct FcfsScheduler<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> FcfsScheduler<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an item. Returns `false` if the scheduler is stopped or the
    /// queue is full (the item is dropped).
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.stopped || inner.queue.len() >= self.capacity {
            return false;
        }
        inner.queue.push_back(item);
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Dequeue the oldest item, blocking until one arrives or `stop()` is
    /// called.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return None;
            }
            if let Some(item) = inner.queue.pop_front() {
                return Some(item);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Dequeue with a timeout. `None` on timeout or stop.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return None;
            }
            if let Some(item) = inner.queue.pop_front() {
                return Some(item);
            }
            if self.available.wait_for(&mut inner, timeout).timed_out() {
                return None;
            }
        }
    }

    /// Wake all waiters; subsequent `pop` calls return `None`. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        inner.queue.clear();
        drop(inner);
        self.available.notify_all();
    }

    /// `true` once `stop()` has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}
