//! MAVLink Bridge Module
//!
//! Serves simulated autopilots (PX4 SITL and friends) over MAVLink v2 and
//! builds the synthetic HIL telemetry sent back to them.

mod node;
pub mod telemetry;

pub use node::{
    MavNode, MessageRouter, NodeConfig, NodeEvent, NodeEventReceiver, NodeHandle,
};
