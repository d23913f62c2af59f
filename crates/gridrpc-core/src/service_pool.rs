//! Bounded dispatch queue plus the worker tasks that execute service
//! handlers, decoupling connection drivers (which must never block on
//! application logic) from handler execution.
//!
//! This is the core backpressure mechanism: a saturated worker pool causes
//! the bounded queue to fill, and further calls are rejected immediately
//! with a `ServerTooBusy` response instead of queueing unboundedly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::RpcError;
use crate::message::{ErrorStatus, RemoteErrorCode};
use crate::service::{InboundCall, ServiceIf};

/// Which end of the queue worker tasks drain from.
///
/// The default services the most recently queued call first: under
/// sustained overload this favors fresh calls (whose callers are still
/// waiting) at the cost of starving old ones. It is a latency/fairness
/// tradeoff, not an ordering guarantee; switch to `OldestFirst` for strict
/// FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOrder {
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone)]
pub struct ServicePoolOptions {
    /// Number of worker tasks executing handlers.
    pub num_workers: usize,
    /// Queue capacity; the (capacity+1)-th concurrently queued call is
    /// rejected.
    pub queue_len: usize,
    pub drain_order: DrainOrder,
}

impl Default for ServicePoolOptions {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_len: 50,
            drain_order: DrainOrder::NewestFirst,
        }
    }
}

/// A pool of worker tasks that handle inbound calls for one registered
/// service, fed by a bounded queue.
pub struct ServicePool {
    service: Arc<dyn ServiceIf>,
    opts: ServicePoolOptions,
    queue: Mutex<VecDeque<InboundCall>>,
    /// One permit per queued call; closed on shutdown.
    slots: Semaphore,
    queue_overflows: AtomicU64,
    timed_out_in_queue: AtomicU64,
    closing: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServicePool {
    pub fn new(service: Arc<dyn ServiceIf>, opts: ServicePoolOptions) -> Arc<Self> {
        Arc::new(Self {
            service,
            opts,
            queue: Mutex::new(VecDeque::new()),
            slots: Semaphore::new(0),
            queue_overflows: AtomicU64::new(0),
            timed_out_in_queue: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Start the worker tasks. Must be called once before the pool is
    /// registered with a messenger.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for index in 0..self.opts.num_workers.max(1) {
            let pool = self.clone();
            workers.push(tokio::spawn(run_worker(pool, index)));
        }
    }

    pub fn service_name(&self) -> &str {
        self.service.service_name()
    }

    /// Calls rejected because the queue was full.
    pub fn queue_overflows(&self) -> u64 {
        self.queue_overflows.load(Ordering::Relaxed)
    }

    /// Calls dropped because their deadline passed while queued.
    pub fn timed_out_in_queue(&self) -> u64 {
        self.timed_out_in_queue.load(Ordering::Relaxed)
    }

    /// Queue one inbound call for handling. Returns immediately in every
    /// case: on a full queue the call is rejected with a `ServerTooBusy`
    /// error response — no blocking, no silent drop.
    pub async fn queue_inbound_call(&self, call: InboundCall) {
        if self.closing.load(Ordering::Relaxed) {
            call.respond_failure(&RpcError::ServiceUnavailable(format!(
                "{} service is shutting down",
                self.service_name()
            )));
            return;
        }

        let mut queue = self.queue.lock().await;
        if queue.len() >= self.opts.queue_len {
            drop(queue);
            self.queue_overflows.fetch_add(1, Ordering::Relaxed);
            debug!(
                "{} service queue full; rejecting call {}",
                self.service_name(),
                call.call_id()
            );
            call.respond_error_status(ErrorStatus {
                code: RemoteErrorCode::ServerTooBusy,
                message: format!(
                    "{} service queue is full ({} entries)",
                    self.service_name(),
                    self.opts.queue_len
                ),
            });
            return;
        }
        queue.push_back(call);
        drop(queue);
        self.slots.add_permits(1);
    }

    /// Drain remaining queued calls with an explicit `Unavailable` response,
    /// then join the worker tasks. Idempotent.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} service pool shutting down", self.service_name());
        self.slots.close();

        let drained: Vec<InboundCall> = self.queue.lock().await.drain(..).collect();
        for call in drained {
            call.respond_failure(&RpcError::ServiceUnavailable(format!(
                "{} service is shutting down",
                self.service_name()
            )));
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn run_worker(pool: Arc<ServicePool>, index: usize) {
    loop {
        let permit = match pool.slots.acquire().await {
            Ok(permit) => permit,
            // Semaphore closed: the pool is shutting down.
            Err(_) => break,
        };
        permit.forget();

        let call = {
            let mut queue = pool.queue.lock().await;
            match pool.opts.drain_order {
                DrainOrder::NewestFirst => queue.pop_back(),
                DrainOrder::OldestFirst => queue.pop_front(),
            }
        };
        let Some(mut call) = call else { continue };

        if call.expired() {
            // The caller's own timer has already fired; it is no longer
            // listening for this response.
            pool.timed_out_in_queue.fetch_add(1, Ordering::Relaxed);
            debug!(
                "dropping call {} ({}): deadline passed while queued",
                call.call_id(),
                call.method()
            );
            continue;
        }

        call.mark_handling_started();
        pool.service.handle(call).await;
    }
    debug!("{} service worker {} exited", pool.service_name(), index);
}
