// MIT License - Copyright (c) 2026 zway-core contributors
// Link to the radio transceiver

pub mod channel;

use std::future::Future;
use std::time::Duration;

use crate::constants::FrameType;
use crate::error::Result;

/// An outbound serial API frame as the worker hands it to the transport.
/// Byte framing (SOF, length, checksum) is the transport's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub function_id: u8,
    pub node_id: u8,
    pub payload: Vec<u8>,
    /// Zero when no asynchronous callback is expected
    pub callback_id: u8,
}

/// Inbound traffic from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    /// Link-level acknowledgement of the last frame written
    Ack,
    /// Link-level rejection (bad checksum)
    Nak,
    /// Link-level collision; the radio dropped the frame
    Can,
    /// Synchronous answer to the request in flight
    Response { function_id: u8, payload: Vec<u8> },
    /// Asynchronous completion; the first payload byte is the transmit status
    Callback { function_id: u8, callback_id: u8, payload: Vec<u8> },
    /// Report initiated by a node
    Unsolicited { node_id: u8, function_id: u8, payload: Vec<u8> },
}

/// Transport owned exclusively by the worker task.
///
/// `read` is raced against other wake-up sources, so it must be cancel
/// safe: dropping the future before it completes must not lose a frame.
pub trait Transport: Send + 'static {
    /// Write one frame to the radio.
    fn write(&mut self, frame: &Frame) -> impl Future<Output = Result<()>> + Send;

    /// Wait up to `timeout` for the next inbound frame. `Ok(None)` on
    /// timeout; an error means the link is gone.
    fn read(&mut self, timeout: Duration) -> impl Future<Output = Result<Option<LinkFrame>>> + Send;

    /// Best-effort interrupt of the transmission in progress.
    fn abort(&mut self) -> impl Future<Output = Result<()>> + Send;
}
