//! Inbound message dispatch

mod server;

pub use server::BridgeServer;
