//! Session management for simulated autopilots
//!
//! This module handles:
//! - One stepping session per connected channel
//! - Free-running and lock-step pacing
//! - Registry of live sessions

mod actor;
mod manager;

pub use actor::{SendMessage, SimSession, StepRequest};
pub use manager::SessionManager;
