//! Multi-stream TCP goodput measurement over WebSockets.
//!
//! A measurement runs one or more parallel TCP flows ("streams") in a single
//! direction for a bounded duration. The traffic originator pushes
//! random-filled binary frames whose size scales with the amount of data
//! already sent, interleaved with JSON measurement frames; the sink counts
//! bytes and reports its own view back in-band on the same connection
//! ("counterflow"). Both endpoints archive one JSON record per stream,
//! including kernel TCP statistics where the platform exposes them.

pub mod client;
pub mod emit;
pub mod model;
pub mod netx;
pub mod persistence;
pub mod proto;
pub mod server;
pub mod stream;
mod ticker;

pub use client::{Client, ClientConfig, Scheme};
pub use emit::{Emitter, LogEmitter, NullEmitter};
pub use model::{AppInfo, BBRInfo, ConnectionInfo, Measurement, Origin, StreamResult, TCPInfo};
pub use proto::{Error, SubtestKind};
pub use server::{Authorizer, Server, ServerConfig};

/// Symbolic version of the running code, embedded in archival records.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short git commit of the running code, or "unknown" outside a checkout.
pub const GIT_SHORT_COMMIT: &str = env!("MSTREAM_GIT_COMMIT");
