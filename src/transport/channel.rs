// MIT License - Copyright (c) 2026 zway-core contributors
// In-memory radio link over tokio channels

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::constants::{FrameType, function, transmit};
use crate::error::{Result, ZWayError};
use crate::transport::{Frame, LinkFrame, Transport};

/// Controller side of an in-memory link.
pub struct ChannelTransport {
    to_radio: mpsc::UnboundedSender<Frame>,
    from_radio: mpsc::UnboundedReceiver<LinkFrame>,
}

/// Radio side of an in-memory link: sees every frame the controller
/// writes and injects replies and reports.
pub struct RadioHandle {
    from_controller: mpsc::UnboundedReceiver<Frame>,
    to_controller: mpsc::UnboundedSender<LinkFrame>,
}

/// Create a connected transport/radio pair.
pub fn link() -> (ChannelTransport, RadioHandle) {
    let (to_radio, from_controller) = mpsc::unbounded_channel();
    let (to_controller, from_radio) = mpsc::unbounded_channel();
    (
        ChannelTransport { to_radio, from_radio },
        RadioHandle { from_controller, to_controller },
    )
}

impl Transport for ChannelTransport {
    async fn write(&mut self, frame: &Frame) -> Result<()> {
        trace!("-> {:?}", frame);
        self.to_radio.send(frame.clone()).map_err(|_| ZWayError::ChannelClosed)
    }

    async fn read(&mut self, wait: Duration) -> Result<Option<LinkFrame>> {
        match timeout(wait, self.from_radio.recv()).await {
            Ok(Some(frame)) => {
                trace!("<- {:?}", frame);
                Ok(Some(frame))
            }
            Ok(None) => Err(ZWayError::ChannelClosed),
            Err(_) => Ok(None),
        }
    }

    async fn abort(&mut self) -> Result<()> {
        debug!("Sending SendData abort");
        let frame = Frame {
            frame_type: FrameType::Request,
            function_id: function::SEND_DATA_ABORT,
            node_id: 0,
            payload: Vec::new(),
            callback_id: 0,
        };
        self.to_radio.send(frame).map_err(|_| ZWayError::ChannelClosed)
    }
}

impl RadioHandle {
    /// Next frame written by the controller; `None` once the controller
    /// side is dropped.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_controller.recv().await
    }

    /// A frame already written, without waiting.
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.from_controller.try_recv().ok()
    }

    pub fn send(&self, frame: LinkFrame) -> Result<()> {
        self.to_controller.send(frame).map_err(|_| ZWayError::ChannelClosed)
    }

    pub fn ack(&self) -> Result<()> {
        self.send(LinkFrame::Ack)
    }

    pub fn nak(&self) -> Result<()> {
        self.send(LinkFrame::Nak)
    }

    pub fn respond(&self, function_id: u8, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send(LinkFrame::Response { function_id, payload: payload.into() })
    }

    /// Complete `frame` with the given transmit status.
    pub fn complete(&self, frame: &Frame, status: u8) -> Result<()> {
        self.send(LinkFrame::Callback {
            function_id: frame.function_id,
            callback_id: frame.callback_id,
            payload: vec![status],
        })
    }

    pub fn report(&self, node_id: u8, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send(LinkFrame::Unsolicited {
            node_id,
            function_id: function::APPLICATION_COMMAND_HANDLER,
            payload: payload.into(),
        })
    }

    /// Answer a frame the way a healthy radio and node would: ack, accept,
    /// and report successful delivery when a callback was asked for.
    pub fn deliver(&self, frame: &Frame) -> Result<()> {
        self.ack()?;
        if frame.function_id == function::SEND_DATA {
            self.respond(frame.function_id, [0x01])?;
            if frame.callback_id != 0 {
                self.complete(frame, transmit::COMPLETE_OK)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(callback_id: u8) -> Frame {
        Frame {
            frame_type: FrameType::Request,
            function_id: function::SEND_DATA,
            node_id: 4,
            payload: vec![0x20, 0x02],
            callback_id,
        }
    }

    #[tokio::test]
    async fn test_write_reaches_radio() {
        let (mut transport, mut radio) = link();
        transport.write(&frame(3)).await.unwrap();
        assert_eq!(radio.next_frame().await, Some(frame(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out() {
        let (mut transport, _radio) = link();
        let got = transport.read(Duration::from_millis(100)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_deliver_sequence() {
        let (mut transport, radio) = link();
        radio.deliver(&frame(7)).unwrap();
        let wait = Duration::from_millis(10);
        assert_eq!(transport.read(wait).await.unwrap(), Some(LinkFrame::Ack));
        assert!(matches!(
            transport.read(wait).await.unwrap(),
            Some(LinkFrame::Response { function_id: function::SEND_DATA, .. })
        ));
        assert_eq!(
            transport.read(wait).await.unwrap(),
            Some(LinkFrame::Callback {
                function_id: function::SEND_DATA,
                callback_id: 7,
                payload: vec![transmit::COMPLETE_OK],
            })
        );
    }

    #[tokio::test]
    async fn test_closed_link_is_an_error() {
        let (mut transport, radio) = link();
        drop(radio);
        assert!(matches!(
            transport.read(Duration::from_millis(10)).await,
            Err(ZWayError::ChannelClosed)
        ));
        assert!(transport.write(&frame(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_sends_abort_frame() {
        let (mut transport, mut radio) = link();
        transport.abort().await.unwrap();
        let f = radio.next_frame().await.unwrap();
        assert_eq!(f.function_id, function::SEND_DATA_ABORT);
    }
}
