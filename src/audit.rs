//! Dual-emit audit log (spec §4.10, §6, §9).
//!
//! Grounded on `ccos::causal_chain::CausalChain`'s split between an
//! internal durable ledger and a list of real-time event sinks, collapsed
//! here into one durable in-memory log plus a `tokio::sync::broadcast`
//! channel standing in for the real-time bus. Both sinks are best-effort:
//! emitting an event never fails the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub permanent: bool,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            permanent: true,
        }
    }
}

/// Stream id used by the durable sink, per spec.md §6.
pub const EVENT_STREAM: &str = "security:events";

pub struct AuditLog {
    durable: Mutex<Vec<AuditEvent>>,
    realtime: broadcast::Sender<AuditEvent>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        let (realtime, _) = broadcast::channel(1024);
        Self {
            durable: Mutex::new(Vec::new()),
            realtime,
        }
    }

    /// Append to the durable log and best-effort notify the real-time bus.
    /// Never fails: a full/receiver-less broadcast channel is swallowed.
    pub fn emit(&self, event: AuditEvent) {
        tracing::debug!(event_type = %event.event_type, "security event");
        if let Ok(mut log) = self.durable.lock() {
            log.push(event.clone());
        }
        let _ = self.realtime.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.realtime.subscribe()
    }

    pub fn durable_events(&self) -> Vec<AuditEvent> {
        self.durable.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_never_fails_without_subscribers() {
        let log = AuditLog::new();
        log.emit(AuditEvent::new("authorization_granted", serde_json::json!({})));
        assert_eq!(log.durable_events().len(), 1);
    }

    #[test]
    fn subscriber_sees_emitted_event() {
        let log = AuditLog::new();
        let mut rx = log.subscribe();
        log.emit(AuditEvent::new("capability_granted", serde_json::json!({"id": "c1"})));
        let received = rx.try_recv().expect("event should be queued");
        assert_eq!(received.event_type, "capability_granted");
    }
}
