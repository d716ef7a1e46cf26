//! Engine event feed
//!
//! Lifecycle and health changes are published on a bounded channel. The
//! engine never blocks on a slow consumer: when the queue is full the event
//! is dropped and counted.

use super::registry::ApplySummary;
use super::stats::EngineCounters;
use crate::types::NodeState;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Messages published by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// Node registered (and scheduled if enabled)
    NodeAdded { id: u32, name: String },
    /// Node definition replaced; `rebuilt` is set when its driver was rebuilt
    NodeUpdated { id: u32, name: String, rebuilt: bool },
    /// Node removed; its entry has left the cache
    NodeRemoved { id: u32, name: String },
    /// A configuration batch was applied
    ConfigApplied(ApplySummary),
    /// Node moved between Ok and Errored
    HealthChanged { id: u32, from: NodeState, to: NodeState },
    /// An acquisition cycle failed
    ReadError { id: u32, error: String },
    /// Written value reached its destination
    WriteSuccess { id: u32, value: f64 },
    /// Engine is shutting down
    Shutdown,
}

/// Sending half, shared by the engine and every acquisition task
#[derive(Clone)]
pub struct EventSink {
    sender: Sender<EngineMessage>,
    counters: Arc<EngineCounters>,
}

impl EventSink {
    pub fn new(sender: Sender<EngineMessage>, counters: Arc<EngineCounters>) -> Self {
        Self { sender, counters }
    }

    /// Try to send a message, counting it as dropped if the queue is full
    pub fn send(&self, msg: EngineMessage) {
        if self.sender.try_send(msg).is_err() {
            let dropped = self.counters.record_event_dropped();
            if dropped % 100 == 1 {
                tracing::warn!(dropped, "Event queue full, dropping engine events");
            }
        }
    }
}

/// Receiving half handed to the engine's consumer
pub struct EngineEvents {
    receiver: Receiver<EngineMessage>,
}

impl EngineEvents {
    pub fn new(receiver: Receiver<EngineMessage>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Option<EngineMessage> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for the next message
    pub fn recv_timeout(&self, timeout: Duration) -> Option<EngineMessage> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Receive all pending messages
    pub fn drain(&self) -> Vec<EngineMessage> {
        self.receiver.try_iter().collect()
    }
}
