//! SITL Bridge Shared Types
//!
//! Transport-free building blocks used by the bridge binary: pacing
//! parameters, time localization, the stepping state machine and the
//! error taxonomy.

pub mod error;
pub mod state_machine;
pub mod time;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::BridgeError;
pub use state_machine::{PacingDecision, StepMode, StepPacer};
pub use time::{localize_time_us, localize_time_us_with_threshold, FIVE_YEARS_US};

/// Get current timestamp in microseconds since Unix epoch
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Stepping parameters for simulated sessions
pub mod pacing {
    /// Self-paced step interval while free-running
    pub const NON_LOCKING_STEP_INTERVAL_MS: u64 = 50;

    /// Longest silence tolerated in lock-step mode before a forced step
    pub const MAX_IDLE_ON_LOCK_STEP_MS: u64 = 500;
}

/// Transport-level handle of one connected peer.
///
/// Allocated by the protocol node when a connection is accepted and stable
/// for the lifetime of that connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}
