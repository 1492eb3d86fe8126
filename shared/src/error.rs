//! Error taxonomy shared by the bridge components

use std::io;

use thiserror::Error;

use crate::ChannelId;

/// Errors raised by the bridge transport and routing layers
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to bind listening endpoint {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Channel closed: {0}")]
    ChannelClosed(ChannelId),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),
}
