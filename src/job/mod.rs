// MIT License - Copyright (c) 2026 zway-core contributors
// Outbound jobs: one command for one node with its retry policy

pub mod queue;

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use tokio::time::Instant;

use crate::constants::{self, FrameType};
use crate::data::DataValue;
use crate::error::{Result, ZWayError};
use crate::transport::Frame;

pub use queue::{EnqueueOutcome, JobQueue};

/// Queue-wide job identifier. Monotonic, never reused; ordering by id is
/// enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued and deliverable
    Created,
    /// Held back until the node wakes up
    Waiting,
    /// Held back until the node has a security session
    WaitingSecurity,
    /// Handed to the transport
    Sending,
    AwaitingAck,
    AwaitingResponse,
    AwaitingCallback,
    Done(JobOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure,
}

impl JobState {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Sending | Self::AwaitingAck | Self::AwaitingResponse | Self::AwaitingCallback
        )
    }

    /// Status column of the queue dump.
    pub fn status_char(&self) -> char {
        match self {
            Self::Done(_) => 'D',
            Self::Waiting => 'W',
            Self::WaitingSecurity => 'S',
            _ => ' ',
        }
    }
}

/// Progress of one awaited phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitFlag {
    #[default]
    NotNeeded,
    Waiting,
    Received,
}

impl WaitFlag {
    fn armed(needed: bool) -> Self {
        if needed { Self::Waiting } else { Self::NotNeeded }
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::NotNeeded => ' ',
            Self::Waiting => '-',
            Self::Received => '+',
        }
    }
}

bitflags! {
    /// Encapsulations requested for a job. Each one eats into the frame's
    /// payload budget.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Encapsulation: u8 {
        const SECURITY      = 0x01;
        const MULTI_CHANNEL = 0x02;
        const CRC16         = 0x04;
    }
}

impl Encapsulation {
    /// Bytes of overhead added to the payload.
    pub fn overhead(&self) -> usize {
        let mut total = 0;
        if self.contains(Self::SECURITY) {
            total += constants::SECURITY_OVERHEAD;
        }
        if self.contains(Self::MULTI_CHANNEL) {
            total += constants::MULTI_CHANNEL_OVERHEAD;
        }
        if self.contains(Self::CRC16) {
            total += constants::CRC16_OVERHEAD;
        }
        total
    }
}

/// Retry and timeout policy of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPolicy {
    /// Attempts before the job fails (at least 1)
    pub max_sends: u8,
    pub ack_timeout: Duration,
    pub response_timeout: Duration,
    pub callback_timeout: Duration,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_sends: constants::DEFAULT_MAX_SENDS,
            ack_timeout: Duration::from_millis(constants::DEFAULT_ACK_TIMEOUT_MS),
            response_timeout: Duration::from_millis(constants::DEFAULT_RESPONSE_TIMEOUT_MS),
            callback_timeout: Duration::from_millis(constants::DEFAULT_CALLBACK_TIMEOUT_MS),
        }
    }
}

/// Result context handed to continuations.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub node_id: u8,
    pub instance_id: Option<u8>,
    pub function_id: u8,
    pub description: String,
    pub send_count: u8,
    /// Payload of the synchronous response, if one arrived
    pub response: Option<Vec<u8>>,
    /// Payload of the asynchronous callback, if one arrived
    pub callback: Option<Vec<u8>>,
}

pub type SuccessFn = Box<dyn FnOnce(&JobReport) + Send>;
pub type FailureFn = Box<dyn FnOnce(&JobReport, &ZWayError) + Send>;

/// One caller's success/failure pair. Exactly one side fires, once.
pub struct Continuation {
    on_success: Option<SuccessFn>,
    on_failure: Option<FailureFn>,
}

impl Continuation {
    pub(crate) fn fire(self, report: &JobReport, outcome: &Result<()>) {
        match outcome {
            Ok(()) => {
                if let Some(f) = self.on_success {
                    f(report);
                }
            }
            Err(e) => {
                if let Some(f) = self.on_failure {
                    f(report, e);
                }
            }
        }
    }
}

/// One outbound command.
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) node_id: u8,
    pub(crate) instance_id: Option<u8>,
    pub(crate) identity: Option<String>,
    pub(crate) frame_type: FrameType,
    pub(crate) function_id: u8,
    pub(crate) payload: Vec<u8>,
    pub(crate) callback_id: u8,
    pub(crate) description: String,
    pub(crate) expect_ack: bool,
    pub(crate) expect_response: bool,
    pub(crate) expect_callback: bool,
    pub(crate) ack: WaitFlag,
    pub(crate) response: WaitFlag,
    pub(crate) callback: WaitFlag,
    pub(crate) state: JobState,
    pub(crate) send_count: u8,
    pub(crate) policy: JobPolicy,
    pub(crate) deadline: Option<Instant>,
    pub(crate) continuations: Vec<Continuation>,
    pub(crate) updates: Vec<(String, DataValue)>,
    pub(crate) encapsulation: Encapsulation,
    pub(crate) response_payload: Option<Vec<u8>>,
    pub(crate) callback_payload: Option<Vec<u8>>,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn send_count(&self) -> u8 {
        self.send_count
    }

    pub fn needs_security(&self) -> bool {
        self.encapsulation.contains(Encapsulation::SECURITY)
    }

    /// Arm the wait flags for a fresh attempt.
    pub(crate) fn arm(&mut self) {
        self.ack = WaitFlag::armed(self.expect_ack);
        self.response = WaitFlag::armed(self.expect_response);
        self.callback = WaitFlag::armed(self.expect_callback);
        self.response_payload = None;
        self.callback_payload = None;
        self.deadline = None;
    }

    /// Move to the first phase still waiting, or report that none is left.
    pub(crate) fn advance(&mut self, now: Instant) -> bool {
        let (state, timeout) = if self.ack == WaitFlag::Waiting {
            (JobState::AwaitingAck, self.policy.ack_timeout)
        } else if self.response == WaitFlag::Waiting {
            (JobState::AwaitingResponse, self.policy.response_timeout)
        } else if self.callback == WaitFlag::Waiting {
            (JobState::AwaitingCallback, self.policy.callback_timeout)
        } else {
            self.deadline = None;
            return false;
        };
        self.state = state;
        self.deadline = Some(now + timeout);
        true
    }

    pub(crate) fn frame(&self) -> Frame {
        Frame {
            frame_type: self.frame_type,
            function_id: self.function_id,
            node_id: self.node_id,
            payload: self.payload.clone(),
            callback_id: self.callback_id,
        }
    }

    pub(crate) fn report(&self) -> JobReport {
        JobReport {
            job_id: self.id,
            node_id: self.node_id,
            instance_id: self.instance_id,
            function_id: self.function_id,
            description: self.description.clone(),
            send_count: self.send_count,
            response: self.response_payload.clone(),
            callback: self.callback_payload.clone(),
        }
    }

    pub(crate) fn line(&self, now: Instant) -> JobLine {
        JobLine {
            send_count: self.send_count,
            status: self.state.status_char(),
            ack: self.ack.as_char(),
            response: self.response.as_char(),
            callback: self.callback.as_char(),
            timeout: self
                .deadline
                .map(|d| d.saturating_duration_since(now).as_secs_f32())
                .unwrap_or(0.0),
            node_id: self.node_id,
            frame_type: self.frame_type as u8,
            function_id: self.function_id,
            payload: self.payload.clone(),
            callback_id: self.callback_id,
            description: self.description.clone(),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("identity", &self.identity)
            .field("function_id", &self.function_id)
            .field("state", &self.state)
            .field("send_count", &self.send_count)
            .field("continuations", &self.continuations.len())
            .finish()
    }
}

/// One line of the queue dump.
#[derive(Debug, Clone, PartialEq)]
pub struct JobLine {
    pub send_count: u8,
    pub status: char,
    pub ack: char,
    pub response: char,
    pub callback: char,
    pub timeout: f32,
    pub node_id: u8,
    pub frame_type: u8,
    pub function_id: u8,
    pub payload: Vec<u8>,
    pub callback_id: u8,
    pub description: String,
}

impl fmt::Display for JobLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {:3.2} {:3} ( {:02X} {:02X} ",
            self.send_count,
            self.status,
            self.ack,
            self.response,
            self.callback,
            self.timeout,
            self.node_id,
            self.frame_type,
            self.function_id
        )?;
        for b in &self.payload {
            write!(f, "{:02X} ", b)?;
        }
        write!(f, "{:02X} ) {}", self.callback_id, self.description)
    }
}

/// Builder for a job. Everything except node, function and payload is
/// optional.
///
/// ```
/// use zway_core::job::JobBuilder;
/// use zway_core::constants::function;
///
/// let job = JobBuilder::new(5, function::SEND_DATA, vec![0x25, 0x02])
///     .identity("SwitchBinary.Get")
///     .description("SwitchBinary Get")
///     .expect_response()
///     .expect_callback()
///     .on_success(|report| println!("done after {} sends", report.send_count));
/// ```
pub struct JobBuilder {
    node_id: u8,
    instance_id: Option<u8>,
    identity: Option<String>,
    frame_type: FrameType,
    function_id: u8,
    payload: Vec<u8>,
    description: String,
    expect_ack: bool,
    expect_response: bool,
    expect_callback: bool,
    policy: Option<JobPolicy>,
    continuation: Continuation,
    updates: Vec<(String, DataValue)>,
    encapsulation: Encapsulation,
}

impl JobBuilder {
    pub fn new(node_id: u8, function_id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            node_id,
            instance_id: None,
            identity: None,
            frame_type: FrameType::Request,
            function_id,
            payload: payload.into(),
            description: String::new(),
            expect_ack: true,
            expect_response: false,
            expect_callback: false,
            policy: None,
            continuation: Continuation { on_success: None, on_failure: None },
            updates: Vec::new(),
            encapsulation: Encapsulation::empty(),
        }
    }

    pub fn instance(mut self, instance_id: u8) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Semantic identity used to merge duplicates for the same node.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = frame_type;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.expect_ack = false;
        self
    }

    pub fn expect_response(mut self) -> Self {
        self.expect_response = true;
        self
    }

    pub fn expect_callback(mut self) -> Self {
        self.expect_callback = true;
        self
    }

    pub fn policy(mut self, policy: JobPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn encapsulation(mut self, encapsulation: Encapsulation) -> Self {
        self.encapsulation = encapsulation;
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(&JobReport) + Send + 'static) -> Self {
        self.continuation.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(&JobReport, &ZWayError) + Send + 'static) -> Self {
        self.continuation.on_failure = Some(Box::new(f));
        self
    }

    /// Stage a data tree write (path from the tree root) that is applied
    /// only if the job succeeds.
    pub fn stage(mut self, path: impl Into<String>, value: impl Into<DataValue>) -> Self {
        self.updates.push((path.into(), value.into()));
        self
    }

    /// Check the parameters and produce the job.
    pub(crate) fn build(
        self,
        id: JobId,
        default_policy: JobPolicy,
        max_frame_payload: usize,
    ) -> Result<Job> {
        if self.node_id == 0 || self.node_id > constants::MAX_NODE_ID {
            return Err(ZWayError::invalid_arg(format!("node id {} out of range", self.node_id)));
        }
        if self.identity.as_deref() == Some("") {
            return Err(ZWayError::invalid_arg("empty job identity"));
        }
        if self.instance_id.is_some() && !self.encapsulation.contains(Encapsulation::MULTI_CHANNEL)
        {
            return Err(ZWayError::invalid_arg(
                "instance addressing requires multi channel encapsulation",
            ));
        }
        let policy = self.policy.unwrap_or(default_policy);
        if policy.max_sends == 0 {
            return Err(ZWayError::invalid_arg("max_sends must be at least 1"));
        }
        let max = max_frame_payload.saturating_sub(self.encapsulation.overhead());
        if self.payload.len() > max {
            return Err(ZWayError::PacketTooBig { size: self.payload.len(), max });
        }

        let mut job = Job {
            id,
            node_id: self.node_id,
            instance_id: self.instance_id,
            identity: self.identity,
            frame_type: self.frame_type,
            function_id: self.function_id,
            payload: self.payload,
            callback_id: 0,
            description: self.description,
            expect_ack: self.expect_ack,
            expect_response: self.expect_response,
            expect_callback: self.expect_callback,
            ack: WaitFlag::NotNeeded,
            response: WaitFlag::NotNeeded,
            callback: WaitFlag::NotNeeded,
            state: JobState::Created,
            send_count: 0,
            policy,
            deadline: None,
            continuations: vec![self.continuation],
            updates: self.updates,
            encapsulation: self.encapsulation,
            response_payload: None,
            callback_payload: None,
        };
        job.arm();
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::constants::function;

    fn build(builder: JobBuilder) -> Result<Job> {
        builder.build(JobId(1), JobPolicy::default(), constants::MAX_FRAME_PAYLOAD)
    }

    #[test]
    fn test_build_rejects_bad_node() {
        let err = build(JobBuilder::new(0, function::SEND_DATA, vec![0])).unwrap_err();
        assert!(matches!(err, ZWayError::InvalidArg { .. }));
        let err = build(JobBuilder::new(240, function::SEND_DATA, vec![0])).unwrap_err();
        assert!(matches!(err, ZWayError::InvalidArg { .. }));
    }

    #[test]
    fn test_build_rejects_zero_sends() {
        let policy = JobPolicy { max_sends: 0, ..JobPolicy::default() };
        let job = JobBuilder::new(2, function::SEND_DATA, vec![0]).policy(policy);
        let err = build(job).unwrap_err();
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_packet_too_big_for_encapsulation() {
        let payload = vec![0u8; 30];
        assert!(build(JobBuilder::new(2, function::SEND_DATA, payload.clone())).is_ok());
        let err = build(
            JobBuilder::new(2, function::SEND_DATA, payload).encapsulation(Encapsulation::SECURITY),
        )
        .unwrap_err();
        assert!(matches!(err, ZWayError::PacketTooBig { size: 30, max: 26 }));
    }

    #[test]
    fn test_phases_follow_expectations() {
        let now = Instant::now();
        let mut job = build(
            JobBuilder::new(2, function::SEND_DATA, vec![0x20, 0x02])
                .expect_response()
                .expect_callback(),
        )
        .unwrap();
        assert!(job.advance(now));
        assert_eq!(job.state, JobState::AwaitingAck);
        assert_eq!(job.deadline, Some(now + job.policy.ack_timeout));

        job.ack = WaitFlag::Received;
        assert!(job.advance(now));
        assert_eq!(job.state, JobState::AwaitingResponse);
        job.response = WaitFlag::Received;
        assert!(job.advance(now));
        assert_eq!(job.state, JobState::AwaitingCallback);
        job.callback = WaitFlag::Received;
        assert!(!job.advance(now));
    }

    #[test]
    fn test_only_one_side_fires() {
        let hits = Arc::new(AtomicU32::new(0));
        let (s, f) = (hits.clone(), hits.clone());
        let job = build(
            JobBuilder::new(2, function::SEND_DATA, vec![0])
                .on_success(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                })
                .on_failure(move |_, _| {
                    f.fetch_add(10, Ordering::SeqCst);
                }),
        )
        .unwrap();
        let report = job.report();
        for c in job.continuations {
            c.fire(&report, &Ok(()));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_line_format() {
        let mut job = build(
            JobBuilder::new(5, function::SEND_DATA, vec![0x25, 0x02])
                .description("SwitchBinary Get")
                .expect_callback(),
        )
        .unwrap();
        job.callback_id = 0x0A;
        job.send_count = 1;
        job.ack = WaitFlag::Received;
        job.state = JobState::AwaitingCallback;
        let line = job.line(Instant::now()).to_string();
        assert_eq!(line, "1   +   - 0.00   5 ( 00 13 25 02 0A ) SwitchBinary Get");
    }
}
