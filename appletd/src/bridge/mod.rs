//! Host stream plumbing for the applet bridge.
//!
//! # Architecture
//!
//! - **codec**: Length-prefixed, NUL-delimited framing for AsyncRead/AsyncWrite
//! - **protocol**: Typed command set (HostRequest inbound, BridgeEvent outbound)
//! - **sender**: Cloneable outbound handle plus the single writer task

pub mod codec;
pub mod protocol;
pub mod sender;
