// MIT License - Copyright (c) 2026 zway-core contributors
// Controller context: data tree, job queue, devices and the worker task

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::constants::{command_class, function};
use crate::data::DataTree;
use crate::device::Devices;
use crate::error::{Result, ZWayError};
use crate::event::{ControllerEvent, EventReceiver, EventSender, event_channel};
use crate::job::queue::{Finished, NodeState};
use crate::job::{EnqueueOutcome, JobBuilder, JobId, JobQueue, JobReport, JobState};
use crate::timer::{TimerId, Timers};
use crate::transport::Transport;
use crate::worker::{FrameHandler, Worker, WorkerCommand};

/// State shared between the controller handle and its worker task.
pub(crate) struct Shared {
    pub name: String,
    pub tree: Arc<DataTree>,
    pub devices: Devices,
    pub queue: JobQueue,
    pub timers: Timers,
    pub idle_poll_interval: Duration,
    event_tx: EventSender,
    running: AtomicBool,
    handler: RwLock<Option<Arc<dyn FrameHandler>>>,
}

impl Shared {
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn mirror(&self, node_id: u8) {
        if let Err(e) = self.devices.mirror_node_state(node_id, self.queue.node_state(node_id)) {
            warn!("[{}] Could not mirror state of node {}: {}", self.name, node_id, e);
        }
    }

    pub fn node_awake(&self, node_id: u8) {
        self.mirror(node_id);
        let _ = self.event_tx.send(ControllerEvent::NodeAwake { node_id });
    }

    pub fn node_asleep(&self, node_id: u8) {
        debug!("[{}] Node {} went back to sleep", self.name, node_id);
        self.mirror(node_id);
        let _ = self.event_tx.send(ControllerEvent::NodeAsleep { node_id });
    }

    /// An inbound report: the node is evidently awake, then the frame goes
    /// to the handler.
    pub fn unsolicited(&self, node_id: u8, function_id: u8, payload: &[u8]) {
        if self.queue.wake(node_id) {
            self.node_awake(node_id);
        }
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.handle_frame(&self.devices, node_id, function_id, payload),
            None => debug!(
                "[{}] Unhandled frame {:#04x} from node {} ({} bytes)",
                self.name,
                function_id,
                node_id,
                payload.len()
            ),
        }
    }

    /// Commit staged updates, run continuations in registration order and
    /// announce the result.
    pub fn complete(&self, finished: Finished) {
        let Finished { report, mut outcome, continuations, updates, node_slept } = finished;
        if node_slept {
            self.node_asleep(report.node_id);
        }
        if outcome.is_ok()
            && !updates.is_empty()
            && let Err(e) = self.tree.apply(self.tree.root(), &updates)
        {
            warn!(
                "[{}] Job {} succeeded but its updates were rejected: {}",
                self.name, report.job_id, e
            );
            outcome = Err(e);
        }

        let success = outcome.is_ok();
        debug!(
            "[{}] Job {} ({}) finished: {}",
            self.name,
            report.job_id,
            report.description,
            if success { "success" } else { "failure" }
        );
        for continuation in continuations {
            continuation.fire(&report, &outcome);
        }
        let _ = self.event_tx.send(ControllerEvent::JobCompleted {
            job_id: report.job_id,
            node_id: report.node_id,
            success,
        });
    }

    pub fn terminated(&self) {
        let _ = self.event_tx.send(ControllerEvent::Terminated);
    }
}

/// A running controller instance.
///
/// Owns the data tree, the device registry, the job queue and the worker
/// task that talks to the radio. Several controllers can live in one
/// process; nothing is global.
///
/// # Example
///
/// ```no_run
/// use zway_core::transport::channel;
/// use zway_core::{Controller, ControllerConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let (transport, _radio) = channel::link();
///     let mut controller = Controller::start(ControllerConfig::default(), transport)?;
///
///     let mut events = controller.subscribe();
///     tokio::spawn(async move {
///         while let Ok(event) = events.recv().await {
///             println!("Event: {:?}", event);
///         }
///     });
///
///     controller.devices().add_device(5)?;
///     controller.send_nop(5, |_| println!("node 5 is alive"), |_, e| println!("node 5: {}", e))?;
///
///     tokio::signal::ctrl_c().await?;
///     controller.stop().await?;
///     Ok(())
/// }
/// ```
pub struct Controller {
    shared: Arc<Shared>,
    config: ControllerConfig,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    shutdown_tx: watch::Sender<bool>,
    worker_handle: Option<JoinHandle<()>>,
}

impl Controller {
    /// Validate the config and spawn the worker on the current tokio
    /// runtime.
    pub fn start<T: Transport>(config: ControllerConfig, transport: T) -> Result<Self> {
        if config.max_sends == 0 {
            return Err(ZWayError::InvalidConfig {
                reason: "max_sends must be at least 1".into(),
            });
        }
        if config.max_frame_payload == 0 {
            return Err(ZWayError::InvalidConfig {
                reason: "max_frame_payload must be positive".into(),
            });
        }

        let (event_tx, _event_rx) = event_channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let tree = Arc::new(DataTree::new());
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            devices: Devices::new(tree.clone()),
            tree,
            queue: JobQueue::new(
                config.job_policy(),
                config.max_frame_payload,
                config.done_retention(),
            ),
            timers: Timers::new(),
            idle_poll_interval: config.idle_poll_interval(),
            event_tx,
            running: AtomicBool::new(true),
            handler: RwLock::new(None),
        });

        let worker = Worker::new(shared.clone(), transport, command_rx, shutdown_rx);
        let worker_handle = tokio::spawn(worker.run());

        let _ = shared.event_tx.send(ControllerEvent::Started);
        info!("[{}] Controller started", config.name);

        Ok(Self { shared, config, commands, shutdown_tx, worker_handle: Some(worker_handle) })
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.event_tx.subscribe()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// False once the worker has exited, whether stopped or because the
    /// link failed.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ZWayError::invalid_operation("controller is not running"))
        }
    }

    // --- Data ---

    pub fn data(&self) -> &Arc<DataTree> {
        &self.shared.tree
    }

    pub fn devices(&self) -> &Devices {
        &self.shared.devices
    }

    /// Install the consumer of unsolicited frames, replacing any previous one.
    pub fn set_frame_handler(&self, handler: impl FrameHandler + 'static) {
        *self.shared.handler.write() = Some(Arc::new(handler));
    }

    pub fn clear_frame_handler(&self) {
        *self.shared.handler.write() = None;
    }

    // --- Jobs ---

    /// Queue a job. A job equivalent to one already pending is merged into
    /// it and reported as [`EnqueueOutcome::Merged`].
    pub fn enqueue(&self, job: JobBuilder) -> Result<EnqueueOutcome> {
        self.ensure_running()?;
        self.shared.queue.enqueue(job)
    }

    /// Cancel a job that has not been sent yet.
    pub fn remove_job(&self, id: JobId) -> Result<()> {
        self.shared.queue.remove(id)
    }

    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        self.shared.queue.job_state(id)
    }

    /// Ping a node with a NoOperation frame.
    pub fn send_nop(
        &self,
        node_id: u8,
        on_success: impl FnOnce(&JobReport) + Send + 'static,
        on_failure: impl FnOnce(&JobReport, &ZWayError) + Send + 'static,
    ) -> Result<EnqueueOutcome> {
        let job = JobBuilder::new(node_id, function::SEND_DATA, vec![command_class::NO_OPERATION])
            .identity("NoOperation")
            .description("NOP")
            .expect_response()
            .expect_callback()
            .on_success(on_success)
            .on_failure(on_failure);
        self.enqueue(job)
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.shared.queue.is_idle()
    }

    /// Write the queue dump, one line per job.
    pub fn queue_inspect(&self, w: &mut impl io::Write) -> io::Result<()> {
        self.shared.queue.inspect(w)
    }

    /// Abort the frame currently being sent. Its job fails without retry.
    pub fn send_abort(&self) -> Result<()> {
        self.ensure_running()?;
        self.commands.send(WorkerCommand::SendAbort).map_err(|_| ZWayError::ChannelClosed)
    }

    // --- Node sleep model ---

    /// A battery node reported in: release the jobs held for it.
    pub fn awake_queue(&self, node_id: u8) {
        if self.shared.queue.wake(node_id) {
            self.shared.node_awake(node_id);
        }
    }

    /// Mark a node as always listening or battery powered. Battery nodes
    /// start out asleep.
    pub fn set_device_listening(&self, node_id: u8, listening: bool) {
        self.shared.queue.set_listening(node_id, listening);
        self.shared.mirror(node_id);
    }

    /// Put a battery node back to sleep, holding its jobs until it wakes.
    pub fn set_device_asleep(&self, node_id: u8) {
        if self.shared.queue.sleep(node_id) {
            self.shared.node_asleep(node_id);
        }
    }

    pub fn set_security_session(&self, node_id: u8, established: bool) {
        self.shared.queue.set_secure_session(node_id, established);
        self.shared.mirror(node_id);
    }

    pub fn node_state(&self, node_id: u8) -> NodeState {
        self.shared.queue.node_state(node_id)
    }

    // --- Timers ---

    /// Run `callback` on the worker once `delay` has elapsed.
    pub fn add_timer(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerId {
        self.shared.timers.add(delay, callback)
    }

    pub fn remove_timer(&self, id: TimerId) -> Result<()> {
        self.shared.timers.remove(id)
    }

    // --- Lifecycle ---

    /// Stop the worker and wait for it to exit. Pending jobs fail with
    /// `SoftFailure`; the data tree stays readable.
    pub async fn stop(&mut self) -> Result<()> {
        info!("[{}] Stopping controller", self.config.name);
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker_handle.take() {
            handle
                .await
                .map_err(|e| ZWayError::ThreadingError { details: e.to_string() })?;
        }
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // The worker still fails pending jobs on its way out.
        let _ = self.shutdown_tx.send(true);
        self.worker_handle.take();
    }
}
