/*
 * Meeting Companion Server - Session Event Bus
 * Copyright (c) 2024 Meeting Companion Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Envelope every published event is wrapped in before fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub seq: u64,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
#[error("no bus channel for session {0}")]
pub struct SessionGone(pub String);

struct SessionChannel {
    tx: broadcast::Sender<EventEnvelope>,
    // seq assignment and send happen under this lock so every
    // subscriber observes one global order per session.
    next_seq: Mutex<u64>,
}

/// Per-session ordered pub/sub. Subscribers are tokio broadcast
/// receivers: a slow subscriber lags and drops its oldest events, the
/// publisher never blocks.
pub struct SessionBus {
    channels: RwLock<HashMap<String, Arc<SessionChannel>>>,
    capacity: usize,
}

impl SessionBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn ensure_channel(&self, session_id: &str) {
        let mut channels = self.channels.write();
        channels.entry(session_id.to_string()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(self.capacity);
            Arc::new(SessionChannel {
                tx,
                next_seq: Mutex::new(1),
            })
        });
    }

    /// Subscribe to a session's events, creating the channel on first
    /// reference. The receiver sees only events published after this call.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<EventEnvelope> {
        self.ensure_channel(session_id);
        let channels = self.channels.read();
        channels
            .get(session_id)
            .expect("channel ensured above")
            .tx
            .subscribe()
    }

    /// Assign the next `seq` and fan the event out to every subscriber.
    /// Publishing to an unknown session fails with `SessionGone`; callers
    /// log and discard.
    pub fn publish(
        &self,
        session_id: &str,
        event: &str,
        payload: Value,
    ) -> Result<EventEnvelope, SessionGone> {
        let channel = {
            let channels = self.channels.read();
            channels
                .get(session_id)
                .cloned()
                .ok_or_else(|| SessionGone(session_id.to_string()))?
        };

        let mut next_seq = channel.next_seq.lock();
        let envelope = EventEnvelope {
            event: event.to_string(),
            seq: *next_seq,
            payload,
        };
        *next_seq += 1;
        // No receivers is fine; history replay comes from the store.
        let _ = channel.tx.send(envelope.clone());
        Ok(envelope)
    }

    pub fn remove(&self, session_id: &str) {
        self.channels.write().remove(session_id);
    }

    pub fn has_channel(&self, session_id: &str) -> bool {
        self.channels.read().contains_key(session_id)
    }
}
