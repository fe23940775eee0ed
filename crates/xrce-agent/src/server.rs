// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server runtime: receiver -> processor -> sender, one triple per
//! transport instance.
//!
//! The receiver blocks on the transport and feeds the bounded ingress
//! queue; the processor consumes events (packets and middleware reader
//! notifications), mutates agent state and fills the egress queue; the
//! sender drains egress into the transport. `stop()` is idempotent and
//! joins all three workers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::AgentContext;
use crate::error::{AgentError, TransportError};
use crate::middleware::ReaderPool;
use crate::processor::{ClientMap, Processor, ServerEvent};
use crate::protocol::Locator;
use crate::scheduler::FcfsScheduler;
use crate::transport::{OutputPacket, Transport};

/// Receiver poll granularity; bounds stop() latency.
const RECV_TIMEOUT_MS: i32 = 100;

/// Processor idle tick driving heartbeats and client reaping.
const MAINTENANCE_TICK: Duration = Duration::from_millis(50);

/// A running agent server over one transport.
pub struct Server<T: Transport> {
    transport: Arc<T>,
    processor: Arc<Processor<T::Endpoint>>,
    ingress: Arc<FcfsScheduler<ServerEvent<T::Endpoint>>>,
    egress: Arc<FcfsScheduler<OutputPacket<T::Endpoint>>>,
    reader_pool: Arc<ReaderPool>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> Server<T> {
    /// Wire up the pipeline around a transport and context. `advertised`
    /// is the locator announced in INFO/discovery answers.
    pub fn new(transport: Arc<T>, context: Arc<AgentContext>, advertised: Locator) -> Arc<Self> {
        let capacity = context.config().queue_capacity;
        let ingress = Arc::new(FcfsScheduler::new(capacity));
        let egress = Arc::new(FcfsScheduler::new(capacity));
        let clients = Arc::new(ClientMap::new());

        let reader_pool = {
            let ingress = Arc::clone(&ingress);
            Arc::new(ReaderPool::new(
                Arc::clone(context.middleware()),
                context.op_timeout(),
                Arc::new(move |notification| {
                    if !ingress.push(ServerEvent::ReaderData(notification)) {
                        debug!("ingress full, reader sample dropped");
                    }
                }),
            ))
        };

        let processor = Arc::new(Processor::new(
            context,
            clients,
            Arc::clone(&reader_pool),
            advertised,
        ));

        Arc::new(Self {
            transport,
            processor,
            ingress,
            egress,
            reader_pool,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    #[must_use]
    pub fn processor(&self) -> &Arc<Processor<T::Endpoint>> {
        &self.processor
    }

    /// Spawn the worker triple. Errors if already running.
    pub fn run(self: &Arc<Self>) -> Result<(), AgentError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(AgentError::AlreadyRunning);
        }
        let mut workers = self.workers.lock();
        workers.push(spawn_worker("xrce-receiver", {
            let this = Arc::clone(self);
            move || this.receiver_loop()
        }));
        workers.push(spawn_worker("xrce-processor", {
            let this = Arc::clone(self);
            move || this.processor_loop()
        }));
        workers.push(spawn_worker("xrce-sender", {
            let this = Arc::clone(self);
            move || this.sender_loop()
        }));
        info!("server running");
        Ok(())
    }

    /// Stop the pipeline and join every worker. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.transport.shutdown();
        self.ingress.stop();
        self.egress.stop();
        self.reader_pool.stop();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        info!("server stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Worker loops
    // -----------------------------------------------------------------------

    fn receiver_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            let step = catch_unwind(AssertUnwindSafe(|| {
                match self.transport.recv_message(RECV_TIMEOUT_MS) {
                    Ok(Some(packet)) => {
                        if !self.ingress.push(ServerEvent::Packet(packet)) {
                            debug!("ingress full, frame dropped");
                        }
                        true
                    }
                    Ok(None) => true,
                    Err(TransportError::Shutdown) => false,
                    Err(e) => {
                        warn!("transport receive error: {e}");
                        true
                    }
                }
            }));
            match step {
                Ok(keep_going) => {
                    if !keep_going {
                        break;
                    }
                }
                Err(_) => error!("receiver worker panicked; restarting loop"),
            }
        }
    }

    fn processor_loop(&self) {
        let mut last_maintenance = Instant::now();
        loop {
            let event = self.ingress.pop_timeout(MAINTENANCE_TICK);
            if self.ingress.is_stopped() {
                break;
            }
            let step = catch_unwind(AssertUnwindSafe(|| {
                if let Some(event) = event {
                    for packet in self.processor.process(event) {
                        self.push_egress(packet);
                    }
                }
                let now = Instant::now();
                if now.duration_since(last_maintenance) >= MAINTENANCE_TICK {
                    last_maintenance = now;
                    for packet in self.processor.maintenance(now) {
                        self.push_egress(packet);
                    }
                }
            }));
            if step.is_err() {
                error!("processor worker panicked; packet dropped, continuing");
            }
        }
    }

    fn sender_loop(&self) {
        while let Some(packet) = self.egress.pop() {
            let step = catch_unwind(AssertUnwindSafe(|| {
                if let Err(e) = self.transport.send_message(&packet) {
                    match e {
                        TransportError::Shutdown => false,
                        TransportError::NotConnected => {
                            debug!(destination = %packet.destination, "peer gone, packet dropped");
                            true
                        }
                        other => {
                            warn!("transport send error: {other}");
                            true
                        }
                    }
                } else {
                    true
                }
            }));
            match step {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => error!("sender worker panicked; packet dropped, continuing"),
            }
        }
    }

    /// Egress push with backpressure: the processor stalls rather than
    /// dropping replies, which throttles ACK emission toward fast peers.
    fn push_egress(&self, packet: OutputPacket<T::Endpoint>) {
        while self.running.load(Ordering::Acquire) {
            if self.egress.push(packet.clone()) {
                return;
            }
            if self.egress.is_stopped() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker<F>(name: &str, body: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .unwrap_or_else(|e| panic!("failed to spawn {name}: {e}"))
}
