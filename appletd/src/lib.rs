//! appletd: protocol engine between a document host and the hosted
//! programs embedded in its pages.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod guest;
pub mod headless;
pub mod host;
pub mod registry;
pub mod script;
pub mod server;
pub mod tunnel;

pub use bridge::codec::{Frame, FrameCodec, FrameError};
pub use bridge::protocol::{BridgeEvent, Command, HostRequest, ProgramSpec, ProgramState};
pub use bridge::sender::FrameSender;
pub use config::{BridgeConfig, ConfigError};
pub use dispatcher::{DispatchError, Dispatcher, Flow};
pub use guest::{GuestClass, GuestError, GuestObject, GuestValue};
pub use headless::HeadlessHost;
pub use host::{AppletHost, HostError, ProgramEnv};
pub use registry::{Context, Registry, RegistryError};
pub use script::{CallError, ScriptBridge, ScriptObject, ScriptValue};
pub use server::{ExitReason, ServerError, run_stdio, serve};
pub use tunnel::{Direction, Tunnel, TunnelError, TunnelStream};

/// Crate version, reported by `--version`.
pub const APPLETD_VERSION: &str = env!("CARGO_PKG_VERSION");
