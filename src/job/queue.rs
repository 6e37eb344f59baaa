// MIT License - Copyright (c) 2026 zway-core contributors
// Ordered, sleep-aware job queue with duplicate merging

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::constants::{self, transmit};
use crate::data::DataValue;
use crate::error::{ErrorCode, Result, ZWayError};
use crate::job::{
    Continuation, Job, JobBuilder, JobId, JobLine, JobOutcome, JobPolicy, JobReport, JobState,
    WaitFlag,
};
use crate::transport::Frame;

/// What `enqueue` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to the queue
    Queued(JobId),
    /// Folded into an equivalent job that was already queued
    Merged(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Queued(id) | Self::Merged(id) => *id,
        }
    }

    /// `NoError` or the informational `DuplicateObject`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Queued(_) => ErrorCode::NoError,
            Self::Merged(_) => ErrorCode::DuplicateObject,
        }
    }
}

/// Wake and security state of one node as the queue sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeState {
    /// Always-on node; never held back
    pub listening: bool,
    /// Battery node currently reachable
    pub awake: bool,
    pub secure_session: bool,
}

impl Default for NodeState {
    fn default() -> Self {
        Self { listening: true, awake: true, secure_session: false }
    }
}

impl NodeState {
    fn hold(&self, job: &Job) -> JobState {
        if !self.listening && !self.awake {
            JobState::Waiting
        } else if job.needs_security() && !self.secure_session {
            JobState::WaitingSecurity
        } else {
            JobState::Created
        }
    }
}

/// A job that reached `Done`, with everything needed to report it.
pub(crate) struct Finished {
    pub report: JobReport,
    pub outcome: Result<()>,
    pub continuations: Vec<Continuation>,
    pub updates: Vec<(String, DataValue)>,
    /// The failed attempt put a battery node to sleep
    pub node_slept: bool,
}

impl Finished {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Result of feeding one link event to the in-flight job.
pub(crate) enum Step {
    /// No job was waiting for this event
    Ignored,
    /// The job moved on to its next phase
    Advanced,
    /// The attempt failed and the job went back to the queue
    Retry { node_id: u8, slept: bool },
    Finished(Finished),
}

struct DoneRecord {
    id: JobId,
    outcome: JobOutcome,
    line: JobLine,
    finished_at: Instant,
}

struct QueueState {
    jobs: BTreeMap<JobId, Job>,
    index: HashMap<(u8, String), JobId>,
    nodes: HashMap<u8, NodeState>,
    in_flight: Option<Job>,
    done: VecDeque<DoneRecord>,
    cancelled: Vec<Finished>,
    next_id: u64,
    callback_id: u8,
    closed: bool,
}

impl QueueState {
    fn node(&self, node_id: u8) -> NodeState {
        self.nodes.get(&node_id).copied().unwrap_or_default()
    }

    /// Recompute the hold state of every queued job of `node_id`.
    fn restate(&mut self, node_id: u8) {
        let node = self.node(node_id);
        for job in self.jobs.values_mut().filter(|j| j.node_id == node_id) {
            job.state = node.hold(job);
        }
    }

    /// Callback ids cycle 1..=255, never 0.
    fn increment_callback_id(&mut self) -> u8 {
        let id = self.callback_id;
        self.callback_id = if id >= constants::CALLBACK_ID_MAX {
            constants::CALLBACK_ID_MIN
        } else {
            id + 1
        };
        id
    }

    fn unindex(&mut self, job: &Job) {
        if let Some(identity) = &job.identity {
            let key = (job.node_id, identity.clone());
            if self.index.get(&key) == Some(&job.id) {
                self.index.remove(&key);
            }
        }
    }

    fn finalize(&mut self, mut job: Job, outcome: Result<()>, now: Instant) -> Finished {
        self.unindex(&job);
        let done = if outcome.is_ok() { JobOutcome::Success } else { JobOutcome::Failure };
        job.state = JobState::Done(done);
        job.deadline = None;
        self.done.push_back(DoneRecord {
            id: job.id,
            outcome: done,
            line: job.line(now),
            finished_at: now,
        });
        Finished {
            report: job.report(),
            outcome,
            continuations: std::mem::take(&mut job.continuations),
            updates: std::mem::take(&mut job.updates),
            node_slept: false,
        }
    }

    /// The in-flight attempt failed: retry in place or give up.
    ///
    /// `delivery_failed` is set when the radio sent the frame but the node
    /// never acknowledged it. Only then is an awake battery node taken to
    /// have gone back to sleep.
    fn fail_attempt(&mut self, reason: String, delivery_failed: bool, now: Instant) -> Step {
        let Some(mut job) = self.in_flight.take() else {
            return Step::Ignored;
        };
        let node_id = job.node_id;
        let node = self.nodes.entry(node_id).or_default();
        let slept = delivery_failed && !node.listening && node.awake;
        if slept {
            node.awake = false;
        }

        if job.send_count < job.policy.max_sends {
            debug!(
                "Job {} to node {} failed ({}), retry {}/{}",
                job.id, node_id, reason, job.send_count, job.policy.max_sends
            );
            job.arm();
            self.jobs.insert(job.id, job);
            self.restate(node_id);
            Step::Retry { node_id, slept }
        } else {
            warn!(
                "Job {} to node {} failed after {} sends: {}",
                job.id, node_id, job.send_count, reason
            );
            if slept {
                self.restate(node_id);
            }
            let mut finished = self.finalize(job, Err(ZWayError::soft_failure(reason)), now);
            finished.node_slept = slept;
            Step::Finished(finished)
        }
    }

    /// Move to the next awaited phase, finishing the job when none is left.
    fn progress(&mut self, now: Instant) -> Step {
        let Some(job) = self.in_flight.as_mut() else {
            return Step::Ignored;
        };
        if job.advance(now) {
            return Step::Advanced;
        }
        match self.in_flight.take() {
            Some(job) => Step::Finished(self.finalize(job, Ok(()), now)),
            None => Step::Ignored,
        }
    }
}

/// Outbound job queue shared between callers and the worker.
///
/// Callers enqueue, cancel and inspect from any thread; the worker is the
/// only one that takes jobs out and feeds link events back in.
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    default_policy: JobPolicy,
    max_frame_payload: usize,
    done_retention: Duration,
}

impl JobQueue {
    pub fn new(
        default_policy: JobPolicy,
        max_frame_payload: usize,
        done_retention: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: BTreeMap::new(),
                index: HashMap::new(),
                nodes: HashMap::new(),
                in_flight: None,
                done: VecDeque::new(),
                cancelled: Vec::new(),
                next_id: 1,
                callback_id: constants::CALLBACK_ID_MIN,
                closed: false,
            }),
            notify: Notify::new(),
            default_policy,
            max_frame_payload,
            done_retention,
        }
    }

    /// Add a job, or merge it into a pending job with the same node and
    /// identity.
    ///
    /// A merged job is discarded; its continuations and staged updates move
    /// to the existing job and fire when that one finishes. Fails with
    /// `InvalidOperation` once the queue has been drained for shutdown.
    pub fn enqueue(&self, builder: JobBuilder) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ZWayError::invalid_operation("job queue is closed"));
        }
        let id = JobId(state.next_id);
        let mut job = builder.build(id, self.default_policy, self.max_frame_payload)?;

        if let Some(identity) = &job.identity
            && let Some(existing_id) = state.index.get(&(job.node_id, identity.clone())).copied()
        {
            let st = &mut *state;
            let existing = match st.in_flight.as_mut() {
                Some(j) if j.id == existing_id => Some(j),
                _ => st.jobs.get_mut(&existing_id),
            };
            if let Some(existing) = existing {
                existing.continuations.append(&mut job.continuations);
                existing.updates.append(&mut job.updates);
                debug!(
                    "Merged duplicate {} for node {} into job {}",
                    identity, job.node_id, existing_id
                );
                return Ok(EnqueueOutcome::Merged(existing_id));
            }
        }

        state.next_id += 1;
        job.state = state.node(job.node_id).hold(&job);
        if let Some(identity) = &job.identity {
            state.index.insert((job.node_id, identity.clone()), id);
        }
        trace!("Queued job {} for node {} ({:?})", id, job.node_id, job.state);
        state.jobs.insert(id, job);
        drop(state);
        self.notify.notify_one();
        Ok(EnqueueOutcome::Queued(id))
    }

    /// Cancel a job that has not been sent yet. Its failure continuations
    /// fire with `SoftFailure` on the worker.
    pub fn remove(&self, id: JobId) -> Result<()> {
        let mut state = self.state.lock();
        if state.in_flight.as_ref().is_some_and(|j| j.id == id) {
            return Err(ZWayError::invalid_operation(format!(
                "job {} is being sent and can no longer be cancelled",
                id
            )));
        }
        let Some(job) = state.jobs.remove(&id) else {
            return Err(ZWayError::JobNotFound { job_id: id });
        };
        let node_id = job.node_id;
        let outcome = Err(ZWayError::soft_failure("job cancelled"));
        let finished = state.finalize(job, outcome, Instant::now());
        state.cancelled.push(finished);
        state.restate(node_id);
        drop(state);
        info!("Cancelled job {}", id);
        self.notify.notify_one();
        Ok(())
    }

    /// True when no job is queued or in flight. Finished jobs still kept
    /// for inspection do not count.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.jobs.is_empty() && state.in_flight.is_none()
    }

    /// Number of jobs not yet finished.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.jobs.len() + usize::from(state.in_flight.is_some())
    }

    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        let state = self.state.lock();
        if let Some(j) = state.in_flight.as_ref().filter(|j| j.id == id) {
            return Some(j.state);
        }
        if let Some(j) = state.jobs.get(&id) {
            return Some(j.state);
        }
        state.done.iter().find(|d| d.id == id).map(|d| JobState::Done(d.outcome))
    }

    // --- Node state ---

    pub fn node_state(&self, node_id: u8) -> NodeState {
        self.state.lock().node(node_id)
    }

    /// Mark a node as always-on or battery powered. A battery node starts
    /// out asleep.
    pub fn set_listening(&self, node_id: u8, listening: bool) {
        let mut state = self.state.lock();
        let node = state.nodes.entry(node_id).or_default();
        node.listening = listening;
        node.awake = listening;
        state.restate(node_id);
        drop(state);
        self.notify.notify_one();
    }

    /// Release jobs held back for a sleeping node. Returns whether the node
    /// was asleep.
    pub fn wake(&self, node_id: u8) -> bool {
        let mut state = self.state.lock();
        let node = state.nodes.entry(node_id).or_default();
        let was_asleep = !node.awake;
        node.awake = true;
        state.restate(node_id);
        drop(state);
        if was_asleep {
            debug!("Node {} is awake", node_id);
            self.notify.notify_one();
        }
        was_asleep
    }

    /// Hold jobs for a battery node until its next wake-up. Returns whether
    /// the node went to sleep; always-on nodes never do.
    pub fn sleep(&self, node_id: u8) -> bool {
        let mut state = self.state.lock();
        let node = state.nodes.entry(node_id).or_default();
        if node.listening || !node.awake {
            return false;
        }
        node.awake = false;
        state.restate(node_id);
        debug!("Node {} is asleep", node_id);
        true
    }

    pub fn set_secure_session(&self, node_id: u8, established: bool) {
        let mut state = self.state.lock();
        state.nodes.entry(node_id).or_default().secure_session = established;
        state.restate(node_id);
        drop(state);
        self.notify.notify_one();
    }

    // --- Inspection ---

    /// Snapshot of every job, finished ones included, in enqueue order.
    pub fn lines(&self) -> Vec<JobLine> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut lines: Vec<(JobId, JobLine)> = state
            .done
            .iter()
            .map(|d| (d.id, d.line.clone()))
            .chain(state.in_flight.iter().map(|j| (j.id, j.line(now))))
            .chain(state.jobs.values().map(|j| (j.id, j.line(now))))
            .collect();
        lines.sort_by_key(|(id, _)| *id);
        lines.into_iter().map(|(_, line)| line).collect()
    }

    /// Write the queue dump, one line per job.
    pub fn inspect(&self, w: &mut impl io::Write) -> io::Result<()> {
        for line in self.lines() {
            writeln!(w, "{}", line)?;
        }
        Ok(())
    }

    // --- Worker side ---

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Take the oldest deliverable job and return the frame to write.
    ///
    /// A job is deliverable when it is not held back and no older job for
    /// the same node is held back.
    pub(crate) fn take_next(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        if state.in_flight.is_some() {
            return None;
        }
        let mut blocked = HashSet::new();
        let mut chosen = None;
        for job in state.jobs.values() {
            if blocked.contains(&job.node_id) {
                continue;
            }
            if job.state == JobState::Created {
                chosen = Some(job.id);
                break;
            }
            blocked.insert(job.node_id);
        }
        let mut job = state.jobs.remove(&chosen?)?;
        job.callback_id = if job.expect_callback { state.increment_callback_id() } else { 0 };
        job.send_count += 1;
        job.arm();
        job.state = JobState::Sending;
        let frame = job.frame();
        trace!("Sending job {} (attempt {})", job.id, job.send_count);
        state.in_flight = Some(job);
        Some(frame)
    }

    /// The frame was written; start waiting for the first phase.
    pub(crate) fn sent(&self, now: Instant) -> Step {
        self.state.lock().progress(now)
    }

    /// The frame could not be written.
    pub(crate) fn write_failed(&self, reason: &str, now: Instant) -> Step {
        self.state.lock().fail_attempt(format!("write failed: {}", reason), false, now)
    }

    pub(crate) fn on_ack(&self, now: Instant) -> Step {
        let mut state = self.state.lock();
        match state.in_flight.as_mut() {
            Some(job) if job.state == JobState::AwaitingAck => {
                job.ack = WaitFlag::Received;
                state.progress(now)
            }
            _ => Step::Ignored,
        }
    }

    /// NAK or CAN from the radio.
    pub(crate) fn on_reject(&self, what: &str, now: Instant) -> Step {
        let mut state = self.state.lock();
        let awaiting_ack = state
            .in_flight
            .as_ref()
            .is_some_and(|job| job.state == JobState::AwaitingAck);
        if !awaiting_ack {
            return Step::Ignored;
        }
        state.fail_attempt(format!("{} received", what), false, now)
    }

    /// Synchronous response. For a job that also expects a callback, a
    /// zero first byte means the radio refused the request.
    pub(crate) fn on_response(&self, function_id: u8, payload: &[u8], now: Instant) -> Step {
        let mut state = self.state.lock();
        let Some(job) = state.in_flight.as_mut() else {
            return Step::Ignored;
        };
        if job.state != JobState::AwaitingResponse || job.function_id != function_id {
            return Step::Ignored;
        }
        job.response_payload = Some(payload.to_vec());
        if job.expect_callback && payload.first() == Some(&0) {
            return state.fail_attempt("request rejected by the radio".to_string(), false, now);
        }
        job.response = WaitFlag::Received;
        state.progress(now)
    }

    /// Asynchronous completion; the first payload byte is the transmit
    /// status.
    pub(crate) fn on_callback(
        &self,
        function_id: u8,
        callback_id: u8,
        payload: &[u8],
        now: Instant,
    ) -> Step {
        let mut state = self.state.lock();
        let Some(job) = state.in_flight.as_mut() else {
            return Step::Ignored;
        };
        if job.state != JobState::AwaitingCallback
            || job.function_id != function_id
            || job.callback_id != callback_id
        {
            return Step::Ignored;
        }
        job.callback_payload = Some(payload.to_vec());
        match payload.first().copied() {
            Some(transmit::COMPLETE_OK) => {
                job.callback = WaitFlag::Received;
                state.progress(now)
            }
            Some(status) => {
                state.fail_attempt(format!("transmit status {:#04x}", status), true, now)
            }
            None => state.fail_attempt("empty callback".to_string(), true, now),
        }
    }

    /// Fail the in-flight attempt if its phase deadline has passed.
    pub(crate) fn expire(&self, now: Instant) -> Step {
        let mut state = self.state.lock();
        let phase = match state.in_flight.as_ref() {
            Some(job) if job.deadline.is_some_and(|d| d <= now) => match job.state {
                JobState::AwaitingAck => "ack",
                JobState::AwaitingResponse => "response",
                _ => "callback",
            },
            _ => return Step::Ignored,
        };
        state.fail_attempt(format!("{} timeout", phase), phase == "callback", now)
    }

    /// Fail the in-flight job without retrying.
    pub(crate) fn abort(&self, now: Instant) -> Option<Finished> {
        let mut state = self.state.lock();
        let job = state.in_flight.take()?;
        Some(state.finalize(job, Err(ZWayError::soft_failure("send aborted")), now))
    }

    /// Earliest instant the worker must wake up for: the in-flight phase
    /// deadline or the next finished job to reap.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        let phase = state.in_flight.as_ref().and_then(|j| j.deadline);
        let reap = state.done.front().map(|d| d.finished_at + self.done_retention);
        match (phase, reap) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drop finished jobs older than the retention period.
    pub(crate) fn reap(&self, now: Instant) {
        let mut state = self.state.lock();
        while state
            .done
            .front()
            .is_some_and(|d| d.finished_at + self.done_retention <= now)
        {
            state.done.pop_front();
        }
    }

    pub(crate) fn take_cancelled(&self) -> Vec<Finished> {
        std::mem::take(&mut self.state.lock().cancelled)
    }

    /// Fail everything still pending and refuse new jobs; used when the
    /// worker exits.
    pub(crate) fn drain_all(&self, reason: &str) -> Vec<Finished> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.closed = true;
        let mut out = std::mem::take(&mut state.cancelled);
        if let Some(job) = state.in_flight.take() {
            out.push(state.finalize(job, Err(ZWayError::soft_failure(reason)), now));
        }
        let jobs = std::mem::take(&mut state.jobs);
        for job in jobs.into_values() {
            out.push(state.finalize(job, Err(ZWayError::soft_failure(reason)), now));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use crate::constants::function;
    use crate::job::Encapsulation;

    fn queue() -> JobQueue {
        JobQueue::new(JobPolicy::default(), constants::MAX_FRAME_PAYLOAD, Duration::from_secs(5))
    }

    fn get(node: u8) -> JobBuilder {
        JobBuilder::new(node, function::SEND_DATA, vec![0x25, 0x02]).identity("SwitchBinary.Get")
    }

    fn fire(finished: Finished) {
        let Finished { report, outcome, continuations, .. } = finished;
        for c in continuations {
            c.fire(&report, &outcome);
        }
    }

    fn finish(step: Step) -> Finished {
        match step {
            Step::Finished(f) => f,
            _ => panic!("job did not finish"),
        }
    }

    #[test]
    fn test_fresh_queue_is_idle() {
        let q = queue();
        assert!(q.is_idle());
        q.enqueue(get(3)).unwrap();
        assert!(!q.is_idle());
    }

    #[test]
    fn test_duplicate_merges_and_both_fire_in_order() {
        let q = queue();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());

        let first = q
            .enqueue(get(3).on_success(move |_| l1.lock().unwrap().push("f1")))
            .unwrap();
        let second = q
            .enqueue(get(3).on_success(move |_| l2.lock().unwrap().push("f2")))
            .unwrap();
        assert_eq!(first, EnqueueOutcome::Queued(JobId(1)));
        assert_eq!(second, EnqueueOutcome::Merged(JobId(1)));
        assert_eq!(second.code(), ErrorCode::DuplicateObject);
        assert_eq!(q.pending(), 1);

        let now = Instant::now();
        assert!(q.take_next().is_some());
        assert!(matches!(q.sent(now), Step::Advanced));
        fire(finish(q.on_ack(now)));
        assert_eq!(*log.lock().unwrap(), vec!["f1", "f2"]);
        assert!(q.is_idle());
    }

    #[test]
    fn test_different_nodes_do_not_merge() {
        let q = queue();
        assert!(matches!(q.enqueue(get(3)).unwrap(), EnqueueOutcome::Queued(_)));
        assert!(matches!(q.enqueue(get(4)).unwrap(), EnqueueOutcome::Queued(_)));
        let anonymous = JobBuilder::new(3, function::SEND_DATA, vec![0x25, 0x02]);
        assert!(matches!(q.enqueue(anonymous).unwrap(), EnqueueOutcome::Queued(_)));
        assert_eq!(q.pending(), 3);
    }

    #[test]
    fn test_duplicate_of_in_flight_job_merges() {
        let q = queue();
        let hits = Arc::new(StdMutex::new(0));
        let h = hits.clone();
        q.enqueue(get(3)).unwrap();
        q.take_next().unwrap();
        let outcome = q
            .enqueue(get(3).on_success(move |_| *h.lock().unwrap() += 1))
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Merged(JobId(1)));
        let now = Instant::now();
        q.sent(now);
        fire(finish(q.on_ack(now)));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_sleeping_node_held_until_wake() {
        let q = queue();
        q.set_listening(7, false);
        q.enqueue(JobBuilder::new(7, function::SEND_DATA, vec![1]).description("a")).unwrap();
        q.enqueue(JobBuilder::new(8, function::SEND_DATA, vec![2]).description("b")).unwrap();
        q.enqueue(JobBuilder::new(7, function::SEND_DATA, vec![3]).description("c")).unwrap();
        assert_eq!(q.job_state(JobId(1)), Some(JobState::Waiting));

        let frame = q.take_next().unwrap();
        assert_eq!(frame.node_id, 8);
        let now = Instant::now();
        q.sent(now);
        fire(finish(q.on_ack(now)));
        assert!(q.take_next().is_none());

        assert!(q.wake(7));
        let frame = q.take_next().unwrap();
        assert_eq!(frame.payload, vec![1]);
        q.sent(now);
        fire(finish(q.on_ack(now)));
        let frame = q.take_next().unwrap();
        assert_eq!(frame.payload, vec![3]);
    }

    #[test]
    fn test_secure_job_blocks_later_jobs_for_node() {
        let q = queue();
        q.enqueue(
            JobBuilder::new(4, function::SEND_DATA, vec![0x62, 0x01])
                .encapsulation(Encapsulation::SECURITY),
        )
        .unwrap();
        q.enqueue(JobBuilder::new(4, function::SEND_DATA, vec![0x20, 0x02])).unwrap();
        assert_eq!(q.job_state(JobId(1)), Some(JobState::WaitingSecurity));
        assert!(q.take_next().is_none());

        q.set_secure_session(4, true);
        assert_eq!(q.take_next().unwrap().payload, vec![0x62, 0x01]);
    }

    #[test]
    fn test_retry_keeps_position_then_soft_failure() {
        let q = queue();
        let err = Arc::new(StdMutex::new(None));
        let e = err.clone();
        q.enqueue(
            get(3).on_failure(move |_, error| *e.lock().unwrap() = Some(error.code())),
        )
        .unwrap();
        q.enqueue(JobBuilder::new(3, function::SEND_DATA, vec![9])).unwrap();

        let mut now = Instant::now();
        for attempt in 1..=3u8 {
            let frame = q.take_next().unwrap();
            assert_eq!(frame.payload, vec![0x25, 0x02], "attempt {}", attempt);
            q.sent(now);
            now += Duration::from_secs(2);
            match q.expire(now) {
                Step::Retry { node_id: 3, slept: false } => assert!(attempt < 3),
                Step::Finished(f) => {
                    assert_eq!(attempt, 3);
                    assert_eq!(f.report.send_count, 3);
                    fire(f);
                }
                _ => panic!("unexpected step"),
            }
        }
        assert_eq!(*err.lock().unwrap(), Some(ErrorCode::SoftFailure));
        assert_eq!(q.take_next().unwrap().payload, vec![9]);
    }

    #[test]
    fn test_failed_delivery_puts_battery_node_to_sleep() {
        let q = queue();
        q.set_listening(9, false);
        q.wake(9);
        q.enqueue(get(9).expect_callback()).unwrap();
        let frame = q.take_next().unwrap();
        let now = Instant::now();
        q.sent(now);
        q.on_ack(now);
        let status = [transmit::COMPLETE_NO_ACK];
        let step = q.on_callback(function::SEND_DATA, frame.callback_id, &status, now);
        assert!(matches!(step, Step::Retry { node_id: 9, slept: true }));
        assert!(!q.node_state(9).awake);
        assert_eq!(q.job_state(JobId(1)), Some(JobState::Waiting));
        assert!(q.take_next().is_none());
    }

    #[test]
    fn test_link_level_failures_keep_battery_node_awake() {
        let q = queue();
        q.set_listening(9, false);
        q.wake(9);
        q.enqueue(get(9).expect_callback()).unwrap();

        q.take_next().unwrap();
        let now = Instant::now();
        q.sent(now);
        let step = q.on_reject("NAK", now);
        assert!(matches!(step, Step::Retry { node_id: 9, slept: false }));
        assert!(q.node_state(9).awake);
        assert_eq!(q.job_state(JobId(1)), Some(JobState::Created));

        q.take_next().unwrap();
        let now = Instant::now();
        q.sent(now);
        let step = q.expire(now + Duration::from_secs(3600));
        assert!(matches!(step, Step::Retry { node_id: 9, slept: false }));
        assert!(q.node_state(9).awake);
        assert!(q.take_next().is_some());
    }

    #[test]
    fn test_callback_timeout_puts_battery_node_to_sleep() {
        let q = queue();
        q.set_listening(9, false);
        q.wake(9);
        q.enqueue(get(9).expect_callback()).unwrap();
        q.take_next().unwrap();
        let now = Instant::now();
        q.sent(now);
        q.on_ack(now);
        let step = q.expire(now + Duration::from_secs(3600));
        assert!(matches!(step, Step::Retry { node_id: 9, slept: true }));
        assert!(!q.node_state(9).awake);
        assert!(q.take_next().is_none());
    }

    #[test]
    fn test_full_exchange_collects_payloads() {
        let q = queue();
        q.enqueue(get(5).expect_response().expect_callback()).unwrap();
        let frame = q.take_next().unwrap();
        assert_ne!(frame.callback_id, 0);
        let now = Instant::now();
        assert!(matches!(q.sent(now), Step::Advanced));
        assert!(matches!(q.on_ack(now), Step::Advanced));
        assert!(matches!(q.on_response(function::GET_VERSION, &[1], now), Step::Ignored));
        assert!(matches!(q.on_response(function::SEND_DATA, &[1], now), Step::Advanced));
        assert!(matches!(
            q.on_callback(function::SEND_DATA, frame.callback_id.wrapping_add(1), &[0], now),
            Step::Ignored
        ));
        let f = finish(q.on_callback(function::SEND_DATA, frame.callback_id, &[0, 0, 3], now));
        assert!(f.succeeded());
        assert_eq!(f.report.response, Some(vec![1]));
        assert_eq!(f.report.callback, Some(vec![0, 0, 3]));
    }

    #[test]
    fn test_rejected_response_retries() {
        let q = queue();
        q.enqueue(get(5).expect_response().expect_callback()).unwrap();
        q.take_next().unwrap();
        let now = Instant::now();
        q.sent(now);
        q.on_ack(now);
        assert!(matches!(q.on_response(function::SEND_DATA, &[0], now), Step::Retry { .. }));
    }

    #[test]
    fn test_nak_retries() {
        let q = queue();
        q.enqueue(get(5)).unwrap();
        q.take_next().unwrap();
        let now = Instant::now();
        q.sent(now);
        assert!(matches!(q.on_reject("NAK", now), Step::Retry { .. }));
        assert_eq!(q.job_state(JobId(1)), Some(JobState::Created));
    }

    #[test]
    fn test_callback_ids_cycle_and_skip_zero() {
        let q = queue();
        let mut state = q.state.lock();
        state.callback_id = 255;
        assert_eq!(state.increment_callback_id(), 255);
        assert_eq!(state.increment_callback_id(), 1);
        assert_eq!(state.increment_callback_id(), 2);
    }

    #[test]
    fn test_remove() {
        let q = queue();
        let code = Arc::new(StdMutex::new(None));
        let c = code.clone();
        let a = q
            .enqueue(get(3).on_failure(move |_, e| *c.lock().unwrap() = Some(e.code())))
            .unwrap();
        let b = q.enqueue(JobBuilder::new(3, function::SEND_DATA, vec![7])).unwrap();

        q.remove(a.job_id()).unwrap();
        for f in q.take_cancelled() {
            fire(f);
        }
        assert_eq!(*code.lock().unwrap(), Some(ErrorCode::SoftFailure));
        assert!(matches!(q.remove(a.job_id()), Err(ZWayError::JobNotFound { .. })));
        assert!(matches!(q.remove(JobId(99)), Err(ZWayError::JobNotFound { .. })));

        q.take_next().unwrap();
        assert!(matches!(q.remove(b.job_id()), Err(ZWayError::InvalidOperation { .. })));
    }

    #[test]
    fn test_enqueue_rejections_leave_queue_untouched() {
        let q = queue();
        let too_big = JobBuilder::new(3, function::SEND_DATA, vec![0; 47]);
        assert!(matches!(q.enqueue(too_big), Err(ZWayError::PacketTooBig { size: 47, max: 46 })));
        assert!(matches!(
            q.enqueue(JobBuilder::new(0, function::SEND_DATA, vec![0])),
            Err(ZWayError::InvalidArg { .. })
        ));
        assert!(q.is_idle());
        assert_eq!(q.enqueue(get(3)).unwrap().job_id(), JobId(1));
    }

    #[test]
    fn test_inspect_shows_status_and_reaps() {
        let q = queue();
        q.set_listening(6, false);
        q.enqueue(JobBuilder::new(6, function::SEND_DATA, vec![0x84, 0x08]).description("WakeUp"))
            .unwrap();
        q.enqueue(JobBuilder::new(2, function::SEND_DATA, vec![0x00]).description("NOP")).unwrap();
        q.take_next().unwrap();
        let now = Instant::now();
        q.sent(now);
        fire(finish(q.on_ack(now)));

        let mut out = Vec::new();
        q.inspect(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0 W"));
        assert!(lines[0].ends_with("( 00 13 84 08 00 ) WakeUp"));
        assert!(lines[1].starts_with("1 D +"));

        q.reap(now + Duration::from_secs(5));
        assert_eq!(q.lines().len(), 1);
        assert!(q.next_deadline().is_none());
    }

    #[test]
    fn test_drain_all_fails_everything() {
        let q = queue();
        q.enqueue(get(3)).unwrap();
        q.enqueue(get(4)).unwrap();
        q.take_next().unwrap();
        let drained = q.drain_all("controller stopped");
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|f| !f.succeeded()));
        assert!(q.is_idle());
    }

    #[test]
    fn test_enqueue_after_drain_is_refused() {
        let q = queue();
        q.enqueue(get(3)).unwrap();
        q.drain_all("controller stopped");
        let err = q.enqueue(get(4)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperation);
        assert!(q.is_idle());
        assert!(q.take_next().is_none());
    }
}
