// MIT License - Copyright (c) 2026 zway-core contributors
// Job queue and observable data tree for a Z-Wave controller stack
//
//! # zway-core
//!
//! The core of a Z-Wave controller: an ordered, retry-aware job queue that
//! respects per-node wake state and link acknowledgement semantics, and a
//! thread-safe, hierarchical, observable data tree that mirrors protocol
//! state.
//!
//! A single worker task owns the link to the radio. Callers enqueue
//! already-encoded frames with success/failure continuations; inbound
//! reports are handed to a [`FrameHandler`] which updates the data tree.
//!
//! ## Quick Start
//!
//! ```no_run
//! use zway_core::constants::{command_class, function};
//! use zway_core::transport::channel;
//! use zway_core::{Controller, ControllerConfig, JobBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ControllerConfig::builder()
//!         .name("home")
//!         .callback_timeout_ms(5_000)
//!         .build();
//!
//!     let (transport, _radio) = channel::link();
//!     let mut controller = Controller::start(config, transport)?;
//!
//!     controller.devices().add_device(5)?;
//!     controller.devices().add_command_class(5, 0, command_class::SWITCH_BINARY, true)?;
//!
//!     let payload = vec![command_class::SWITCH_BINARY, 0x01, 0xFF];
//!     let job = JobBuilder::new(5, function::SEND_DATA, payload)
//!         .identity("SwitchBinary.Set")
//!         .description("SwitchBinary Set")
//!         .expect_response()
//!         .expect_callback()
//!         .stage("devices.5.instances.0.commandClasses.37.data.level", true)
//!         .on_failure(|report, e| eprintln!("{} failed: {}", report.description, e));
//!     controller.enqueue(job)?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     controller.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod controller;
pub mod data;
pub mod device;
pub mod error;
pub mod event;
pub mod job;
pub mod timer;
pub mod transport;
pub mod worker;

// Re-exports for convenience
pub use config::{ControllerConfig, ControllerConfigBuilder};
pub use controller::Controller;
pub use data::{
    CallbackArg, ChangeFlags, ChangeKind, DataCallback, DataCallbackRef, DataChange, DataTree,
    DataType, DataValue, HolderId, data_callback,
};
pub use device::{DeviceCallback, DeviceCallbackRef, DeviceChangeType, Devices, device_callback};
pub use error::{ErrorCode, Result, ZWayError};
pub use event::{ControllerEvent, EventReceiver};
pub use job::queue::NodeState;
pub use job::{EnqueueOutcome, JobBuilder, JobId, JobOutcome, JobReport, JobState};
pub use timer::TimerId;
pub use worker::FrameHandler;
