// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Asynchronous reader delivery.
//!
//! READ_DATA registers a pending read; a pool worker blocks on the
//! middleware with a short timeout and forwards each sample as a
//! [`DataNotification`] through the callback. The callback is expected to
//! enqueue the notification on a bounded queue; no worker ever touches
//! session or registry state directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{ClientKey, ObjectId};

use super::Middleware;

/// A pending read registered by a READ_DATA submessage.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub client_key: ClientKey,
    /// Stream the DATA submessages go back on.
    pub stream_id: u8,
    pub request_id: u16,
    pub object_id: ObjectId,
    /// 0 means a single sample.
    pub max_samples: u16,
    /// 0 means a single poll with the default operation timeout.
    pub max_elapsed: Duration,
}

/// One sample ready for delivery to a client.
#[derive(Debug, Clone)]
pub struct DataNotification {
    pub client_key: ClientKey,
    pub stream_id: u8,
    pub request_id: u16,
    pub object_id: ObjectId,
    pub data: Vec<u8>,
}

/// Worker pool bridging blocking middleware reads into the server's event
/// queue.
pub struct ReaderPool {
    middleware: Arc<dyn Middleware>,
    notify: Arc<dyn Fn(DataNotification) + Send + Sync>,
    poll_timeout: Duration,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReaderPool {
    pub fn new(
        middleware: Arc<dyn Middleware>,
        poll_timeout: Duration,
        notify: Arc<dyn Fn(DataNotification) + Send + Sync>,
    ) -> Self {
        Self {
            middleware,
            notify,
            poll_timeout,
            running: Arc::new(AtomicBool::new(true)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a delivery worker for one read request.
    pub fn spawn(&self, request: ReadRequest) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let middleware = Arc::clone(&self.middleware);
        let notify = Arc::clone(&self.notify);
        let running = Arc::clone(&self.running);
        let poll_timeout = self.poll_timeout;
        let handle = std::thread::Builder::new()
            .name(format!("xrce-read-{}", request.object_id))
            .spawn(move || {
                run_read(&*middleware, &*notify, &running, poll_timeout, request);
            });
        match handle {
            Ok(h) => {
                let mut workers = self.workers.lock();
                workers.retain(|w| !w.is_finished());
                workers.push(h);
            }
            Err(e) => warn!("failed to spawn reader worker: {e}"),
        }
    }

    /// Stop all workers and join them. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for ReaderPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_read(
    middleware: &dyn Middleware,
    notify: &(dyn Fn(DataNotification) + Send + Sync),
    running: &AtomicBool,
    poll_timeout: Duration,
    request: ReadRequest,
) {
    let wanted = if request.max_samples == 0 {
        1
    } else {
        u32::from(request.max_samples)
    };
    let deadline = if request.max_elapsed.is_zero() {
        Instant::now() + poll_timeout
    } else {
        Instant::now() + request.max_elapsed
    };
    let mut delivered = 0u32;

    while delivered < wanted && running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = poll_timeout.min(deadline - now);
        match middleware.read_data(request.client_key, request.object_id, wait) {
            Ok(Some(data)) => {
                delivered += 1;
                notify(DataNotification {
                    client_key: request.client_key,
                    stream_id: request.stream_id,
                    request_id: request.request_id,
                    object_id: request.object_id,
                    data,
                });
            }
            Ok(None) => {}
            Err(e) => {
                debug!(reader = %request.object_id, "read worker stopping: {e}");
                break;
            }
        }
    }
}
