// MIT License - Copyright (c) 2026 zway-core contributors
// Controller lifecycle events

use crate::job::JobId;

/// Events emitted by the controller.
///
/// Users subscribe via `controller.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<ControllerEvent>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Worker running, queue accepting jobs
    Started,
    /// Worker stopped (requested or link lost); jobs are no longer processed
    Terminated,
    /// Jobs held for a battery node were released
    NodeAwake { node_id: u8 },
    /// A battery node went back to sleep
    NodeAsleep { node_id: u8 },
    /// A job reached Done
    JobCompleted { job_id: JobId, node_id: u8, success: bool },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<ControllerEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<ControllerEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
