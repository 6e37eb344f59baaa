// MIT License - Copyright (c) 2026 zway-core contributors
// Controller configuration

use std::time::Duration;

use crate::constants;
use crate::job::JobPolicy;

/// Configuration for a controller instance.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Instance name, used in log lines
    pub name: String,
    /// Link-level acknowledgement timeout in milliseconds
    pub ack_timeout_ms: u64,
    /// Synchronous response timeout in milliseconds
    pub response_timeout_ms: u64,
    /// Asynchronous callback timeout in milliseconds
    pub callback_timeout_ms: u64,
    /// Attempts per job before it fails with SoftFailure
    pub max_sends: u8,
    /// How long finished jobs stay visible to queue inspection, in milliseconds
    pub done_retention_ms: u64,
    /// Longest the worker sleeps with nothing to do, in milliseconds
    pub idle_poll_interval_ms: u64,
    /// Largest application payload one frame carries
    pub max_frame_payload: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "zway".to_string(),
            ack_timeout_ms: constants::DEFAULT_ACK_TIMEOUT_MS,
            response_timeout_ms: constants::DEFAULT_RESPONSE_TIMEOUT_MS,
            callback_timeout_ms: constants::DEFAULT_CALLBACK_TIMEOUT_MS,
            max_sends: constants::DEFAULT_MAX_SENDS,
            done_retention_ms: constants::DEFAULT_DONE_RETENTION_MS,
            idle_poll_interval_ms: 1000,
            max_frame_payload: constants::MAX_FRAME_PAYLOAD,
            event_capacity: 256,
        }
    }
}

impl ControllerConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::default()
    }

    /// Per-job policy used when a job does not bring its own.
    pub fn job_policy(&self) -> JobPolicy {
        JobPolicy {
            max_sends: self.max_sends,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            callback_timeout: Duration::from_millis(self.callback_timeout_ms),
        }
    }

    pub fn done_retention(&self) -> Duration {
        Duration::from_millis(self.done_retention_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms.max(1))
    }
}

/// Builder for ControllerConfig.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn ack_timeout_ms(mut self, ms: u64) -> Self {
        self.config.ack_timeout_ms = ms;
        self
    }

    pub fn response_timeout_ms(mut self, ms: u64) -> Self {
        self.config.response_timeout_ms = ms;
        self
    }

    pub fn callback_timeout_ms(mut self, ms: u64) -> Self {
        self.config.callback_timeout_ms = ms;
        self
    }

    pub fn max_sends(mut self, sends: u8) -> Self {
        self.config.max_sends = sends;
        self
    }

    pub fn done_retention_ms(mut self, ms: u64) -> Self {
        self.config.done_retention_ms = ms;
        self
    }

    pub fn idle_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.idle_poll_interval_ms = ms;
        self
    }

    pub fn max_frame_payload(mut self, bytes: usize) -> Self {
        self.config.max_frame_payload = bytes;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> ControllerConfig {
        self.config
    }
}
