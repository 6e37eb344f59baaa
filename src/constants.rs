// MIT License - Copyright (c) 2026 zway-core contributors
// Serial API constants

/// Serial API frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Host to radio, or unsolicited radio to host
    Request = 0x00,
    /// Synchronous answer to a request
    Response = 0x01,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Serial API function identifiers used by the core.
pub mod function {
    pub const APPLICATION_COMMAND_HANDLER: u8 = 0x04;
    pub const SERIAL_API_GET_CAPABILITIES: u8 = 0x07;
    pub const SEND_DATA: u8 = 0x13;
    pub const GET_VERSION: u8 = 0x15;
    pub const SEND_DATA_ABORT: u8 = 0x16;
    pub const MEMORY_GET_ID: u8 = 0x20;
    pub const REQUEST_NODE_INFO: u8 = 0x60;
    pub const APPLICATION_UPDATE: u8 = 0x49;
}

/// Transmit status carried as the first byte of a SendData callback.
pub mod transmit {
    pub const COMPLETE_OK: u8 = 0x00;
    pub const COMPLETE_NO_ACK: u8 = 0x01;
    pub const COMPLETE_FAIL: u8 = 0x02;
    pub const ROUTING_NOT_IDLE: u8 = 0x03;
}

/// Command class identifiers referenced by the core.
pub mod command_class {
    pub const NO_OPERATION: u8 = 0x00;
    pub const BASIC: u8 = 0x20;
    pub const SWITCH_BINARY: u8 = 0x25;
    pub const SENSOR_BINARY: u8 = 0x30;
    pub const MULTI_CHANNEL: u8 = 0x60;
    pub const WAKE_UP: u8 = 0x84;
    pub const SECURITY: u8 = 0x98;
}

/// Largest application payload a single SendData frame carries.
pub const MAX_FRAME_PAYLOAD: usize = 46;

/// Node id of the controller itself.
pub const CONTROLLER_NODE_ID: u8 = 1;

/// Highest valid node id.
pub const MAX_NODE_ID: u8 = 232;

/// Callback ids cycle through 1..=255; zero means "no callback expected".
pub const CALLBACK_ID_MIN: u8 = 1;
pub const CALLBACK_ID_MAX: u8 = 255;

/// Default per-phase timeouts (milliseconds).
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1_600;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 10_000;

/// Default number of attempts before a job fails.
pub const DEFAULT_MAX_SENDS: u8 = 3;

/// How long finished jobs stay visible to queue inspection (milliseconds).
pub const DEFAULT_DONE_RETENTION_MS: u64 = 5_000;

/// Security S0 encapsulation overhead: header, IV, nonce id, MAC.
pub const SECURITY_OVERHEAD: usize = 20;

/// Multi Channel encapsulation overhead.
pub const MULTI_CHANNEL_OVERHEAD: usize = 4;

/// CRC-16 encapsulation overhead.
pub const CRC16_OVERHEAD: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_byte() {
        assert_eq!(FrameType::from_byte(0), Some(FrameType::Request));
        assert_eq!(FrameType::from_byte(1), Some(FrameType::Response));
        assert_eq!(FrameType::from_byte(2), None);
    }

    #[test]
    fn test_secure_payload_budget() {
        assert!(MAX_FRAME_PAYLOAD > SECURITY_OVERHEAD + MULTI_CHANNEL_OVERHEAD);
        assert_eq!(MAX_FRAME_PAYLOAD - SECURITY_OVERHEAD, 26);
    }
}
