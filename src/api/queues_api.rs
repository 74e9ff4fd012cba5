//! Queue inspection and destructive queue maintenance.

use axum::{extract::State, response::Json};
use serde::Serialize;
use tracing::warn;

use crate::bus::{JobKind, QueueStats};
use crate::error::ServiceError;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct QueuesStatusResponse {
    pub total_pending_messages: i64,
    pub active_queues: usize,
    pub queues: Vec<QueueStats>,
}

pub async fn get_queues_status(
    State(state): State<AppState>,
) -> Result<Json<QueuesStatusResponse>, ServiceError> {
    let mut queues = Vec::with_capacity(JobKind::ALL.len());
    let mut total = 0i64;
    let mut active = 0usize;

    for kind in JobKind::ALL {
        match state.bus.stats(kind.queue_name()) {
            Ok(stats) => {
                total += stats.messages;
                if stats.messages > 0 || stats.consumers > 0 {
                    active += 1;
                }
                queues.push(stats);
            }
            Err(e) => {
                warn!(queue = kind.queue_name(), error = %e, "queue stats failed");
                queues.push(QueueStats {
                    name: kind.queue_name().to_string(),
                    exists: false,
                    messages: 0,
                    messages_ready: 0,
                    messages_unacknowledged: 0,
                    consumers: 0,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    Ok(Json(QueuesStatusResponse {
        total_pending_messages: total,
        active_queues: active,
        queues,
    }))
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged_queues: Vec<String>,
    pub skipped_queues: Vec<String>,
    pub errors: Vec<String>,
}

/// Destructive: drops every pending message on every queue. Operator action.
pub async fn post_queues_purge(State(state): State<AppState>) -> Json<PurgeResponse> {
    let mut purged = Vec::new();
    let mut skipped = Vec::new();
    let mut errors = Vec::new();

    for kind in JobKind::ALL {
        let queue = kind.queue_name();
        match state.bus.purge(queue) {
            Ok(0) => skipped.push(queue.to_string()),
            Ok(n) => {
                warn!(queue, dropped = n, "queue purged");
                purged.push(queue.to_string());
            }
            Err(e) => errors.push(format!("{queue}: {e}")),
        }
    }

    Json(PurgeResponse {
        purged_queues: purged,
        skipped_queues: skipped,
        errors,
    })
}
