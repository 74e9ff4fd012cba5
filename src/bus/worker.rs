//! Consumer runtime: one polling worker per queue.
//!
//! A worker reserves up to its prefetch bound, runs the handler, and settles
//! each delivery according to the error-kind policy. Batched queues process
//! their reservations concurrently, each message in its own scope, so one
//! rate-limited member cannot fail the batch. Shutdown releases reserved
//! messages for redelivery.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{recovery_action, RecoveryAction, ServiceError};

use super::{BusMessage, JobKind, SqliteBus};

/// A queue consumer. Implementations must be idempotent with respect to
/// their payload; the bus may deliver a message more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// In-flight bound per reservation cycle.
    pub prefetch: usize,
    /// Messages per batch; 1 means strictly sequential consumption.
    pub batch_size: usize,
    /// Idle poll interval.
    pub poll_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            prefetch: 4,
            batch_size: 1,
            poll_ms: 250,
        }
    }
}

/// Settle one finished delivery against the policy table.
async fn settle(bus: &SqliteBus, msg: &BusMessage, result: Result<(), ServiceError>) {
    match result {
        Ok(()) => {
            let _ = bus.ack(msg.id);
        }
        Err(err) => match recovery_action(&err) {
            RecoveryAction::Ack => {
                debug!(queue = msg.queue, id = msg.id, error = %err, "acking non-fatal failure");
                let _ = bus.ack(msg.id);
            }
            RecoveryAction::DropWarn => {
                warn!(
                    queue = msg.queue,
                    id = msg.id,
                    error = %err,
                    "dropping job after rate limit, no retry"
                );
                let _ = bus.ack(msg.id);
            }
            RecoveryAction::Retry => {
                debug!(queue = msg.queue, id = msg.id, error = %err, "scheduling retry");
                let _ = bus.nack(msg, &err.to_string());
            }
            RecoveryAction::RetryOnce => {
                if msg.attempts >= 2 {
                    let _ = bus.dead_letter(msg, &err.to_string());
                } else {
                    let _ = bus.nack(msg, &err.to_string());
                }
            }
            RecoveryAction::DeadLetter => {
                let _ = bus.dead_letter(msg, &err.to_string());
            }
        },
    }
}

/// Spawn the polling loop for one queue. Returns the task handle.
pub fn spawn_worker(
    bus: SqliteBus,
    kind: JobKind,
    handler: Arc<dyn JobHandler>,
    opts: WorkerOptions,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let queue = kind.queue_name();
    bus.register_consumer(queue);

    tokio::spawn(async move {
        info!(queue, batch = opts.batch_size, "queue worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let take = opts.prefetch.max(1).min(opts.batch_size.max(1));
            let reserved = match bus.reserve(queue, take) {
                Ok(msgs) => msgs,
                Err(e) => {
                    warn!(queue, error = %e, "reserve failed");
                    Vec::new()
                }
            };

            if reserved.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(opts.poll_ms)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            if *shutdown.borrow() {
                // Never start work we cannot finish; hand the reservations back.
                for msg in &reserved {
                    let _ = bus.release(msg.id);
                }
                break;
            }

            if opts.batch_size <= 1 {
                for msg in reserved {
                    let result = handler.handle(msg.payload.clone()).await;
                    settle(&bus, &msg, result).await;
                }
            } else {
                // Isolated scope per member; failures settle individually.
                let futures = reserved.iter().map(|msg| {
                    let handler = handler.clone();
                    let payload = msg.payload.clone();
                    async move { handler.handle(payload).await }
                });
                let results = join_all(futures).await;
                for (msg, result) in reserved.iter().zip(results) {
                    settle(&bus, msg, result).await;
                }
            }
        }
        bus.unregister_consumer(queue);
        info!(queue, "queue worker stopped");
    })
}
