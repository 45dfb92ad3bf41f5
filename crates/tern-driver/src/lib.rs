//! The tern media driver.
//!
//! The driver owns every shared-memory resource of the transport: the CnC
//! file clients attach to, the log buffers publications and images append
//! to and read from, the counters describing all of it. One conductor
//! thread runs the control plane; external send/receive workers interact
//! with it only through counters, log buffers, and the conductor proxy.

#[macro_use]
mod macros;

pub mod conductor;
pub mod context;
pub mod endpoint;
pub mod image;
pub mod proxy;
pub mod publication;
pub mod udp_channel;
pub mod uri;

pub use conductor::{DriverConductor, DriverError};
pub use context::DriverContext;
pub use proxy::{ConductorEvent, ConductorProxy};
pub use udp_channel::{ChannelError, UdpChannel};
pub use uri::{ChannelUri, UriError};
