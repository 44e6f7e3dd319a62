use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use backup_core::events::{BackupEvent, EventSink, TracingSink};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

const BROADCAST_CAPACITY: usize = 256;
/// Replay subject for backup lifecycle events that carry no backup id yet.
pub const BACKUPS_SUBJECT: &str = "backups";

#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub subject: String,
    pub timestamp: i64,
    pub event: Value,
}

/// Fans backup events out to WebSocket subscribers and keeps the most recent
/// ones per subject so a client that reconnects mid-restore can catch up.
#[derive(Clone)]
pub struct AuditBroadcaster {
    tx: broadcast::Sender<String>,
    queue: Arc<DashMap<String, VecDeque<QueuedEvent>>>,
    capacity: usize,
}

impl AuditBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Queued events newer than `since` (ms), oldest first. All subjects when
    /// `subject` is `None`.
    pub fn replay(&self, subject: Option<&str>, since: i64) -> Vec<QueuedEvent> {
        let mut events: Vec<QueuedEvent> = match subject {
            Some(s) => self
                .queue
                .get(s)
                .map(|q| q.iter().filter(|e| e.timestamp > since).cloned().collect())
                .unwrap_or_default(),
            None => self
                .queue
                .iter()
                .flat_map(|q| q.value().iter().filter(|e| e.timestamp > since).cloned().collect::<Vec<_>>())
                .collect(),
        };
        events.sort_by_key(|e| e.timestamp);
        events
    }

    /// Drop subjects whose newest event is older than `max_age`.
    pub fn prune_idle(&self, max_age: chrono::Duration) -> usize {
        let cutoff = (chrono::Utc::now() - max_age).timestamp_millis();
        let before = self.queue.len();
        self.queue
            .retain(|_, events| events.back().is_some_and(|newest| newest.timestamp > cutoff));
        before.saturating_sub(self.queue.len())
    }

    pub fn subjects(&self) -> usize {
        self.queue.len()
    }

    fn publish(&self, subject: String, event: Value) {
        let queued = QueuedEvent {
            subject: subject.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        };
        let message = envelope(&queued);

        {
            let mut entry = self.queue.entry(subject).or_default();
            entry.push_back(queued);
            if entry.len() > self.capacity {
                entry.pop_front();
            }
        }

        // No subscribers is not an error.
        let _ = self.tx.send(message);
    }
}

impl EventSink for AuditBroadcaster {
    fn emit(&self, event: BackupEvent) {
        TracingSink.emit(event.clone());

        let subject = subject_of(&event);
        match serde_json::to_value(&event) {
            Ok(value) => self.publish(subject, value),
            Err(e) => tracing::warn!(error = %e, "Could not serialize audit event"),
        }
    }
}

fn subject_of(event: &BackupEvent) -> String {
    match event {
        BackupEvent::BackupCreated { record } => record.backup_id.clone(),
        BackupEvent::RestoreStateChanged { backup_id, .. }
        | BackupEvent::RestoreCompleted { backup_id, .. }
        | BackupEvent::RestoreFailed { backup_id, .. } => backup_id.clone(),
        BackupEvent::BackupStarted { .. } | BackupEvent::BackupFailed { .. } | BackupEvent::NoChanges { .. } => {
            BACKUPS_SUBJECT.to_string()
        }
    }
}

fn envelope(queued: &QueuedEvent) -> String {
    serde_json::json!({
        "subject": queued.subject,
        "timestamp": queued.timestamp,
        "event": queued.event,
    })
    .to_string()
}

/// `{"type": "replay:request", "payload": {"subject": "...", "since": 0}}`
fn parse_replay_request(text: &str) -> Option<(Option<String>, i64)> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    if parsed.get("type").and_then(|t| t.as_str()) != Some("replay:request") {
        return None;
    }
    let payload = parsed.get("payload");
    let subject = payload
        .and_then(|p| p.get("subject"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let since = payload.and_then(|p| p.get("since")).and_then(|v| v.as_i64()).unwrap_or(0);
    Some((subject, since))
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let audit = state.audit.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, audit))
}

async fn handle_socket(socket: WebSocket, audit: AuditBroadcaster) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = audit.subscribe();

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Ok(message) => {
                    if sender.send(Message::Text(message.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Audit subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Some((subject, since)) = parse_replay_request(text.as_str()) else {
                        continue;
                    };
                    // Replay goes to the requesting client only.
                    for queued in audit.replay(subject.as_deref(), since) {
                        if sender.send(Message::Text(envelope(&queued).into())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("Audit subscriber disconnected");
}
