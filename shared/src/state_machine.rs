//! Session Stepping State Machine
//!
//! A session starts free-running and switches to lock-step on the first
//! actuator-control message. There is no way back.

use std::time::Duration;

use crate::pacing;

/// Stepping mode of a simulated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    /// Steps on a fixed wall-clock interval
    #[default]
    FreeRunning,
    /// Steps on actuator controls, with an idle-ceiling fallback
    LockStep,
}

/// Events that can change the stepping mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    /// Actuator controls received from the autopilot
    ActuatorControls,
}

/// Result of feeding a [`ModeEvent`] to a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeTransition {
    /// Mode changed from `from` to `to`
    Changed { from: StepMode, to: StepMode },
    /// Mode was already final for this event
    Unchanged(StepMode),
}

impl StepMode {
    pub fn from_lock_step(lock_step: bool) -> Self {
        if lock_step {
            StepMode::LockStep
        } else {
            StepMode::FreeRunning
        }
    }

    pub fn is_lock_step(self) -> bool {
        self == StepMode::LockStep
    }

    /// Next mode for an event. Lock-step is absorbing.
    pub fn process_event(self, event: ModeEvent) -> ModeTransition {
        match (self, event) {
            (StepMode::FreeRunning, ModeEvent::ActuatorControls) => ModeTransition::Changed {
                from: StepMode::FreeRunning,
                to: StepMode::LockStep,
            },
            (StepMode::LockStep, ModeEvent::ActuatorControls) => ModeTransition::Unchanged(self),
        }
    }
}

/// What the self-pacing timer should do right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingDecision {
    /// Execute a self-paced step. `forced` marks a lock-step liveness step.
    Step { forced: bool },
    /// Nothing due yet; check again after this long
    Wait(Duration),
}

/// Decides when self-paced steps are due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPacer {
    step_interval: Duration,
    idle_ceiling: Duration,
}

impl Default for StepPacer {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(pacing::NON_LOCKING_STEP_INTERVAL_MS),
            Duration::from_millis(pacing::MAX_IDLE_ON_LOCK_STEP_MS),
        )
    }
}

impl StepPacer {
    pub fn new(step_interval: Duration, idle_ceiling: Duration) -> Self {
        Self {
            step_interval,
            idle_ceiling,
        }
    }

    pub fn step_interval(&self) -> Duration {
        self.step_interval
    }

    pub fn idle_ceiling(&self) -> Duration {
        self.idle_ceiling
    }

    /// Minimum silence after the last step before a self-paced step fires
    pub fn due_after(&self, mode: StepMode) -> Duration {
        match mode {
            StepMode::FreeRunning => self.step_interval,
            StepMode::LockStep => self.idle_ceiling.max(self.step_interval),
        }
    }

    /// Decide for `elapsed` time since the last executed step
    pub fn decide(&self, mode: StepMode, elapsed: Duration) -> PacingDecision {
        let due = self.due_after(mode);
        if elapsed < due {
            return PacingDecision::Wait(due - elapsed);
        }
        PacingDecision::Step {
            forced: mode.is_lock_step(),
        }
    }
}
