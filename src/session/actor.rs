//! Simulated autopilot session
//!
//! One [`SimSession`] exists per connected autopilot. Its loop advances the
//! simulation one step at a time, either when a step request arrives (lock-step)
//! or when the pacing timer says a step is due.

use mavlink::ardupilotmega::{MavAutopilot, MavMessage, HIL_ACTUATOR_CONTROLS_DATA};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sitl_bridge_shared::state_machine::{ModeEvent, ModeTransition};
use sitl_bridge_shared::{localize_time_us, now_us, ChannelId, PacingDecision, StepMode, StepPacer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mavlink::telemetry;

/// Step requests a session holds before `request_step` waits for its loop
pub const STEP_INBOX_CAPACITY: usize = 1;

/// Outbound capability bound to the session's own connection
pub type SendMessage = Arc<dyn Fn(MavMessage) + Send + Sync>;

/// A request to advance the simulation by one step
#[derive(Debug, Clone, Default)]
pub struct StepRequest {
    /// Actuator controls that triggered the step, if any
    pub controls: Option<HIL_ACTUATOR_CONTROLS_DATA>,
}

impl StepRequest {
    pub fn on_controls(controls: HIL_ACTUATOR_CONTROLS_DATA) -> Self {
        Self {
            controls: Some(controls),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub channel: ChannelId,
    pub steps: u64,
    pub mode: StepMode,
    pub autopilot: Option<MavAutopilot>,
    pub clock_ahead_events: u64,
}

pub struct SimSession {
    channel: ChannelId,
    pacer: StepPacer,
    autopilot: OnceLock<MavAutopilot>,
    lock_step: AtomicBool,
    step_counter: AtomicU64,
    clock_ahead_events: AtomicU64,
    started_at: Instant,
    start_epoch_us: i64,
    inbox_tx: mpsc::Sender<StepRequest>,
    inbox_rx: Mutex<Option<mpsc::Receiver<StepRequest>>>,
    send_telemetry: SendMessage,
    cancel: CancellationToken,
}

impl SimSession {
    pub fn new(channel: ChannelId, pacer: StepPacer, send_telemetry: SendMessage) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(STEP_INBOX_CAPACITY);

        Self {
            channel,
            pacer,
            autopilot: OnceLock::new(),
            lock_step: AtomicBool::new(false),
            step_counter: AtomicU64::new(0),
            clock_ahead_events: AtomicU64::new(0),
            started_at: Instant::now(),
            start_epoch_us: now_us(),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            send_telemetry,
            cancel: CancellationToken::new(),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Wall-clock epoch (µs) the session was created at
    pub fn start_epoch_us(&self) -> i64 {
        self.start_epoch_us
    }

    /// Queue a step. Requests are consumed in arrival order.
    ///
    /// Waits while the inbox is full so callers cannot outrun the stepping
    /// loop. Never fails: a request to a closed session is dropped.
    pub async fn request_step(&self, request: StepRequest) {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                debug!(channel = %self.channel, "Step request dropped, session closed");
            }
            sent = self.inbox_tx.send(request) => {
                if sent.is_err() {
                    debug!(channel = %self.channel, "Step request dropped, session loop gone");
                }
            }
        }
    }

    /// Capture the autopilot type. Returns false if it was already set.
    pub fn set_autopilot(&self, autopilot: MavAutopilot) -> bool {
        self.autopilot.set(autopilot).is_ok()
    }

    pub fn autopilot(&self) -> Option<MavAutopilot> {
        self.autopilot.get().cloned()
    }

    /// Switch to lock-step. Only the first call reports a change.
    pub fn enter_lock_step(&self) -> ModeTransition {
        let was_lock_step = self.lock_step.swap(true, Ordering::SeqCst);
        StepMode::from_lock_step(was_lock_step).process_event(ModeEvent::ActuatorControls)
    }

    pub fn mode(&self) -> StepMode {
        StepMode::from_lock_step(self.lock_step.load(Ordering::SeqCst))
    }

    pub fn step_count(&self) -> u64 {
        self.step_counter.load(Ordering::SeqCst)
    }

    /// Send a message back to this session's connection
    pub fn send(&self, message: MavMessage) {
        (self.send_telemetry)(message)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            channel: self.channel,
            steps: self.step_count(),
            mode: self.mode(),
            autopilot: self.autopilot(),
            clock_ahead_events: self.clock_ahead_events.load(Ordering::SeqCst),
        }
    }

    /// Stop the loop after its current step. Safe to call any number of
    /// times, before or after [`SimSession::run`].
    pub fn close(&self) {
        if !self.is_closed() {
            debug!(channel = %self.channel, steps = self.step_count(), "Closing session");
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run the stepping loop until [`SimSession::close`] is called.
    ///
    /// Only the first call runs the loop; later calls log and return.
    pub async fn run(&self) {
        let taken = self
            .inbox_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut inbox) = taken else {
            warn!(channel = %self.channel, "Attempt to run session which is already running");
            return;
        };

        debug!(
            channel = %self.channel,
            start_epoch_us = self.start_epoch_us(),
            "Session loop started"
        );

        let mut rng = StdRng::from_entropy();
        let mut last_step = Instant::now();

        loop {
            let deadline = last_step + self.pacer.due_after(self.mode());

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(request) = inbox.recv() => {
                    last_step = self.perform_step(&request, &mut rng);
                }

                _ = sleep_until(deadline) => {
                    match self.pacer.decide(self.mode(), last_step.elapsed()) {
                        PacingDecision::Step { forced } => {
                            if forced {
                                debug!(
                                    channel = %self.channel,
                                    idle_us = last_step.elapsed().as_micros() as u64,
                                    max_us = self.pacer.idle_ceiling().as_micros() as u64,
                                    "Force update"
                                );
                            }
                            last_step = self.perform_step(&StepRequest::default(), &mut rng);
                        }
                        // Mode switched while sleeping; recompute the deadline
                        PacingDecision::Wait(_) => {}
                    }
                }
            }
        }

        debug!(channel = %self.channel, steps = self.step_count(), "Session loop stopped");
    }

    /// Execute one step and return the instant it started at
    fn perform_step(&self, request: &StepRequest, rng: &mut StdRng) -> Instant {
        let now = Instant::now();
        let iteration = self.step_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let simulation_time_us = now.duration_since(self.started_at).as_micros() as i64;

        if let Some(controls) = &request.controls {
            let autopilot_time_us = localize_time_us(controls.time_usec as i64, self.start_epoch_us);
            if autopilot_time_us > simulation_time_us {
                self.clock_ahead_events.fetch_add(1, Ordering::SeqCst);
                debug!(
                    channel = %self.channel,
                    autopilot_time_us,
                    simulation_time_us,
                    "Autopilot time is ahead of simulation"
                );
            }
        }

        debug!(
            channel = %self.channel,
            simulation_time_us,
            lock_step = self.mode().is_lock_step(),
            on_controls = request.controls.is_some(),
            iteration,
            "Entering step"
        );

        let time_usec = (self.start_epoch_us + simulation_time_us) as u64;
        for message in telemetry::synthesize(time_usec, rng) {
            (self.send_telemetry)(message);
        }

        now
    }
}
