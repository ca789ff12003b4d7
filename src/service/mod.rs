//! Capture service boundary
//!
//! The transport link a session connects through, and the in-process host
//! that serves the other side of it.

pub mod host;
pub mod link;

pub use host::{CaptureHost, HostConfig};
pub use link::{
    BufferLease, Direction, PoolStats, ServiceLink, StreamEvent, StreamFlags, StreamHandle,
    StreamProperties, Transport,
};
