// MIT License - Copyright (c) 2026 zway-core contributors
// Error taxonomy and numeric codes

use std::fmt;

use crate::data::DataType;
use crate::job::JobId;

/// Numeric error codes exposed to integrators.
///
/// Zero is success, negative values are specific failure kinds. The values
/// are stable and match the codes used by existing Z-Way tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    NoError = 0,
    InvalidArg = -1,
    BadAllocation = -2,
    NotImplemented = -3,
    NotSupported = -4,
    AccessDenied = -5,
    ThreadingError = -6,
    InvalidOperation = -7,
    InternalError = -8,
    BadData = -9,
    InvalidType = -10,
    InvalidThread = -12,
    InvalidPort = -20,
    InvalidConfig = -21,
    NotPrimary = -25,
    SoftFailure = -26,
    JobNotFound = -30,
    JobAlreadyAdded = -31,
    DuplicateObject = -32,
    PacketTooBig = -40,
}

impl ErrorCode {
    /// Parse a raw integer code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::NoError),
            -1 => Some(Self::InvalidArg),
            -2 => Some(Self::BadAllocation),
            -3 => Some(Self::NotImplemented),
            -4 => Some(Self::NotSupported),
            -5 => Some(Self::AccessDenied),
            -6 => Some(Self::ThreadingError),
            -7 => Some(Self::InvalidOperation),
            -8 => Some(Self::InternalError),
            -9 => Some(Self::BadData),
            -10 => Some(Self::InvalidType),
            -12 => Some(Self::InvalidThread),
            -20 => Some(Self::InvalidPort),
            -21 => Some(Self::InvalidConfig),
            -25 => Some(Self::NotPrimary),
            -26 => Some(Self::SoftFailure),
            -30 => Some(Self::JobNotFound),
            -31 => Some(Self::JobAlreadyAdded),
            -32 => Some(Self::DuplicateObject),
            -40 => Some(Self::PacketTooBig),
            _ => None,
        }
    }

    /// The raw integer value.
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Human-readable description of the code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoError => "No error",
            Self::InvalidArg => "Bad arguments",
            Self::BadAllocation => "Allocation failed",
            Self::NotImplemented => "Not implemented",
            Self::NotSupported => "Not supported by the device",
            Self::AccessDenied => "Access denied",
            Self::ThreadingError => "Threading error",
            Self::InvalidOperation => "Invalid operation",
            Self::InternalError => "Internal consistency error",
            Self::BadData => "Bad data received",
            Self::InvalidType => "Wrong data type",
            Self::InvalidThread => "Accessed from invalid thread",
            Self::InvalidPort => "Can not open port",
            Self::InvalidConfig => "Invalid configuration",
            Self::NotPrimary => "Controller is not primary",
            Self::SoftFailure => "Operation did not succeed",
            Self::JobNotFound => "Job not found",
            Self::JobAlreadyAdded => "Job already in the queue",
            Self::DuplicateObject => "Duplicate job merged",
            Self::PacketTooBig => "Packet too big to encapsulate",
        }
    }

    /// Informational codes are reported to callers but are not failures.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::NoError | Self::DuplicateObject | Self::PacketTooBig)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// All errors that can occur in the controller core.
#[derive(Debug, thiserror::Error)]
pub enum ZWayError {
    #[error("Invalid argument: {reason}")]
    InvalidArg { reason: String },

    #[error("Allocation failed")]
    BadAllocation,

    #[error("Not implemented: {what}")]
    NotImplemented { what: String },

    #[error("Not supported by device {node_id}")]
    NotSupported { node_id: u8 },

    #[error("Access denied")]
    AccessDenied,

    #[error("Threading error: {details}")]
    ThreadingError { details: String },

    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("Internal consistency error: {details}")]
    InternalError { details: String },

    #[error("Bad data: {details}")]
    BadData { details: String },

    #[error("Invalid type: expected {expected:?}, found {actual:?}")]
    InvalidType { expected: DataType, actual: DataType },

    #[error("Accessed from invalid thread")]
    InvalidThread,

    #[error("Invalid port: {port}")]
    InvalidPort { port: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Controller is not primary")]
    NotPrimary,

    #[error("Soft failure: {reason}")]
    SoftFailure { reason: String },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    #[error("Job already added: {job_id}")]
    JobAlreadyAdded { job_id: JobId },

    #[error("Duplicate job merged into {job_id}")]
    DuplicateObject { job_id: JobId },

    #[error("Packet too big: {size} bytes (max: {max})")]
    PacketTooBig { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,
}

impl ZWayError {
    pub(crate) fn invalid_arg(reason: impl Into<String>) -> Self {
        Self::InvalidArg { reason: reason.into() }
    }

    pub(crate) fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    pub(crate) fn soft_failure(reason: impl Into<String>) -> Self {
        Self::SoftFailure { reason: reason.into() }
    }

    /// The numeric code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArg { .. } => ErrorCode::InvalidArg,
            Self::BadAllocation => ErrorCode::BadAllocation,
            Self::NotImplemented { .. } => ErrorCode::NotImplemented,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::AccessDenied => ErrorCode::AccessDenied,
            Self::ThreadingError { .. } | Self::ChannelClosed => ErrorCode::ThreadingError,
            Self::InvalidOperation { .. } => ErrorCode::InvalidOperation,
            Self::InternalError { .. } => ErrorCode::InternalError,
            Self::BadData { .. } => ErrorCode::BadData,
            Self::InvalidType { .. } => ErrorCode::InvalidType,
            Self::InvalidThread => ErrorCode::InvalidThread,
            Self::InvalidPort { .. } | Self::Io(_) => ErrorCode::InvalidPort,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::NotPrimary => ErrorCode::NotPrimary,
            Self::SoftFailure { .. } => ErrorCode::SoftFailure,
            Self::JobNotFound { .. } => ErrorCode::JobNotFound,
            Self::JobAlreadyAdded { .. } => ErrorCode::JobAlreadyAdded,
            Self::DuplicateObject { .. } => ErrorCode::DuplicateObject,
            Self::PacketTooBig { .. } => ErrorCode::PacketTooBig,
        }
    }

    /// Whether the error is a caller mistake rejected before any side effect.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ZWayError::InvalidArg { .. }
                | ZWayError::InvalidType { .. }
                | ZWayError::InvalidOperation { .. }
                | ZWayError::InvalidThread
        )
    }
}

/// Log an internal consistency violation.
///
/// Aborts in debug builds; release builds log and carry on.
pub(crate) fn internal_error(details: impl Into<String>) -> ZWayError {
    let details = details.into();
    tracing::error!("Internal consistency error: {}", details);
    debug_assert!(false, "internal consistency error: {details}");
    ZWayError::InternalError { details }
}

pub type Result<T> = std::result::Result<T, ZWayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        let codes = [
            0, -1, -2, -3, -4, -5, -6, -7, -8, -9, -10, -12, -20, -21, -25, -26, -30, -31, -32, -40,
        ];
        for code in codes {
            let parsed = ErrorCode::from_code(code).unwrap();
            assert_eq!(parsed.code(), code);
        }
        assert!(ErrorCode::from_code(-11).is_none());
        assert!(ErrorCode::from_code(1).is_none());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ZWayError::invalid_arg("x").code(), ErrorCode::InvalidArg);
        assert_eq!(ZWayError::soft_failure("x").code().code(), -26);
        assert_eq!(ZWayError::DuplicateObject { job_id: JobId(3) }.code().code(), -32);
        assert_eq!(ZWayError::PacketTooBig { size: 60, max: 46 }.code().code(), -40);
        assert_eq!(ZWayError::ChannelClosed.code(), ErrorCode::ThreadingError);
    }

    #[test]
    fn test_informational() {
        assert!(ErrorCode::DuplicateObject.is_informational());
        assert!(ErrorCode::PacketTooBig.is_informational());
        assert!(!ErrorCode::SoftFailure.is_informational());
    }

    #[test]
    fn test_caller_error() {
        assert!(ZWayError::invalid_operation("read-only").is_caller_error());
        assert!(!ZWayError::soft_failure("unreachable").is_caller_error());
    }

    #[test]
    fn test_display() {
        let err = ZWayError::InvalidType { expected: DataType::Boolean, actual: DataType::Integer };
        assert_eq!(err.to_string(), "Invalid type: expected Boolean, found Integer");
        assert_eq!(ErrorCode::JobNotFound.to_string(), "Job not found (-30)");
    }
}
