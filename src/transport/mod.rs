pub mod tcp;
pub mod traits;

pub use tcp::TcpEndpoint;
pub use traits::{EndpointListener, TransportStream};
