// MIT License - Copyright (c) 2026 zway-core contributors
// Worker task: owns the transport and drives the job queue

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::controller::Shared;
use crate::device::Devices;
use crate::job::queue::Step;
use crate::transport::{LinkFrame, Transport};

/// Consumer of unsolicited frames, normally the command class layer.
///
/// Runs on the worker task. Implementations update the data tree through
/// the device registry they are handed.
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, devices: &Devices, node_id: u8, function_id: u8, payload: &[u8]);
}

impl<F> FrameHandler for F
where
    F: Fn(&Devices, u8, u8, &[u8]) + Send + Sync,
{
    fn handle_frame(&self, devices: &Devices, node_id: u8, function_id: u8, payload: &[u8]) {
        self(devices, node_id, function_id, payload)
    }
}

/// Requests from the controller handle to the worker.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Abort the frame being sent and fail its job
    SendAbort,
}

pub(crate) struct Worker<T> {
    shared: Arc<Shared>,
    transport: T,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport> Worker<T> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transport: T,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self { shared, transport, commands, shutdown_rx }
    }

    /// Run until shutdown is requested or the link fails.
    pub(crate) async fn run(mut self) {
        info!("[{}] Worker started", self.shared.name);
        let shared = self.shared.clone();

        let reason = loop {
            self.housekeeping().await;

            let wait = self.read_timeout();
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        debug!("[{}] Worker shutting down", shared.name);
                        break "controller stopped";
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                _ = shared.queue.notified() => {}
                _ = shared.timers.changed() => {}
                read = self.transport.read(wait) => match read {
                    Ok(Some(frame)) => self.dispatch(frame),
                    Ok(None) => {}
                    Err(e) => {
                        error!("[{}] Link lost: {}", shared.name, e);
                        break "link lost";
                    }
                },
            }
        };

        self.terminate(reason);
    }

    /// Everything that is due regardless of link traffic: timers, phase
    /// timeouts, cancelled jobs, reaping, then the next frame to send.
    async fn housekeeping(&mut self) {
        let now = Instant::now();
        for callback in self.shared.timers.take_due(now) {
            callback();
        }
        let step = self.shared.queue.expire(now);
        self.step(step);
        for finished in self.shared.queue.take_cancelled() {
            self.shared.complete(finished);
        }
        self.shared.queue.reap(now);
        self.send_next().await;
    }

    async fn send_next(&mut self) {
        let Some(frame) = self.shared.queue.take_next() else {
            return;
        };
        let result = self.transport.write(&frame).await;
        let now = Instant::now();
        let step = match result {
            Ok(()) => self.shared.queue.sent(now),
            Err(e) => {
                warn!("[{}] Write to node {} failed: {}", self.shared.name, frame.node_id, e);
                self.shared.queue.write_failed(&e.to_string(), now)
            }
        };
        self.step(step);
    }

    fn read_timeout(&self) -> Duration {
        let idle = self.shared.idle_poll_interval;
        let deadline = [self.shared.queue.next_deadline(), self.shared.timers.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(idle),
            None => idle,
        }
    }

    async fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::SendAbort => {
                if let Err(e) = self.transport.abort().await {
                    warn!("[{}] Send abort failed: {}", self.shared.name, e);
                }
                if let Some(finished) = self.shared.queue.abort(Instant::now()) {
                    info!("[{}] Aborted job {}", self.shared.name, finished.report.job_id);
                    self.shared.complete(finished);
                }
            }
        }
    }

    fn dispatch(&self, frame: LinkFrame) {
        let now = Instant::now();
        let queue = &self.shared.queue;
        let step = match frame {
            LinkFrame::Ack => queue.on_ack(now),
            LinkFrame::Nak => queue.on_reject("NAK", now),
            LinkFrame::Can => queue.on_reject("CAN", now),
            LinkFrame::Response { function_id, payload } => {
                queue.on_response(function_id, &payload, now)
            }
            LinkFrame::Callback { function_id, callback_id, payload } => {
                queue.on_callback(function_id, callback_id, &payload, now)
            }
            LinkFrame::Unsolicited { node_id, function_id, payload } => {
                self.shared.unsolicited(node_id, function_id, &payload);
                return;
            }
        };
        if matches!(step, Step::Ignored) {
            trace!("[{}] No job waiting for this frame, dropped", self.shared.name);
        }
        self.step(step);
    }

    fn step(&self, step: Step) {
        match step {
            Step::Ignored | Step::Advanced => {}
            Step::Retry { node_id, slept } => {
                if slept {
                    self.shared.node_asleep(node_id);
                }
            }
            Step::Finished(finished) => self.shared.complete(finished),
        }
    }

    fn terminate(self, reason: &str) {
        self.shared.set_running(false);
        let drained = self.shared.queue.drain_all(reason);
        if !drained.is_empty() {
            warn!("[{}] Failing {} pending jobs: {}", self.shared.name, drained.len(), reason);
        }
        for finished in drained {
            self.shared.complete(finished);
        }
        self.shared.terminated();
        info!("[{}] Worker stopped: {}", self.shared.name, reason);
    }
}
