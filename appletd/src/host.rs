//! Applet host interface.
//!
//! The host owns hosted-program instances: it loads them, drives their
//! lifecycle, and gives each one a [`ProgramEnv`] for talking back to the
//! embedding document.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::protocol::{AudioAction, BridgeEvent, ProgramSpec, ProgramState, TrustDecision};
use crate::bridge::sender::FrameSender;
use crate::guest::GuestObject;
use crate::script::{CallError, ScriptBridge, ScriptObject, ScriptValue};
use crate::tunnel::{Direction, Tunnel, TunnelError, TunnelStream};

/// Lifecycle failures, reported to the host as `HostedProgramFailed`.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The program class could not be loaded or instantiated.
    #[error("failed to load program: {message}")]
    Load { message: String },

    /// A lifecycle method (init/start/stop/destroy) failed.
    #[error("{phase} failed: {message}")]
    Lifecycle {
        phase: &'static str,
        message: String,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HostError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn lifecycle(phase: &'static str, message: impl Into<String>) -> Self {
        Self::Lifecycle {
            phase,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Drives hosted-program instances on behalf of the dispatcher.
///
/// The dispatcher reports `Instantiated`, `Initialized`, `Started`, `Stopped`
/// and `Destroyed` after each call returns `Ok`; implementations only report
/// intermediate states (such as `ClassLoaded`) through [`ProgramEnv`].
#[async_trait]
pub trait AppletHost: Send + Sync {
    /// Load and instantiate a program. The returned object is handle 0.
    async fn create(
        &self,
        env: ProgramEnv,
        spec: &ProgramSpec,
    ) -> Result<Arc<dyn GuestObject>, HostError>;

    async fn init(&self, program: &Arc<dyn GuestObject>) -> Result<(), HostError>;

    async fn start(&self, program: &Arc<dyn GuestObject>) -> Result<(), HostError>;

    async fn stop(&self, program: &Arc<dyn GuestObject>) -> Result<(), HostError>;

    async fn destroy(&self, program: &Arc<dyn GuestObject>) -> Result<(), HostError>;

    fn show_console(&self) {
        tracing::info!("Console requested; this host has none");
    }
}

/// A hosted program's handle back to the bridge and the embedding document.
#[derive(Clone)]
pub struct ProgramEnv {
    context: String,
    program: String,
    sender: FrameSender,
    scripts: Arc<ScriptBridge>,
    tunnel: Arc<Tunnel>,
}

impl std::fmt::Debug for ProgramEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramEnv")
            .field("context", &self.context)
            .field("program", &self.program)
            .finish()
    }
}

impl ProgramEnv {
    pub fn new(
        context: impl Into<String>,
        program: impl Into<String>,
        sender: FrameSender,
        scripts: Arc<ScriptBridge>,
        tunnel: Arc<Tunnel>,
    ) -> Self {
        Self {
            context: context.into(),
            program: program.into(),
            sender,
            scripts,
            tunnel,
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn report_state(&self, state: ProgramState) -> io::Result<()> {
        self.sender.send(BridgeEvent::ProgramState {
            context: self.context.clone(),
            program: self.program.clone(),
            state,
        })
    }

    pub fn report_failure(&self, message: impl Into<String>) -> io::Result<()> {
        self.sender.send(BridgeEvent::ProgramFailed {
            context: self.context.clone(),
            program: self.program.clone(),
            message: message.into(),
        })
    }

    /// Navigate the document, optionally into a named frame.
    pub fn show_document(&self, url: &str, frame: Option<&str>) -> io::Result<()> {
        self.sender.send(BridgeEvent::ShowDocument {
            context: self.context.clone(),
            url: url.to_string(),
            frame: frame.map(str::to_string),
        })
    }

    pub fn show_status(&self, message: &str) -> io::Result<()> {
        self.sender.send(BridgeEvent::ShowStatus {
            context: self.context.clone(),
            message: message.to_string(),
        })
    }

    pub fn request_resize(&self, width: u32, height: u32) -> io::Result<()> {
        self.sender.send(BridgeEvent::ResizeProgram {
            context: self.context.clone(),
            program: self.program.clone(),
            width,
            height,
        })
    }

    pub fn audio(&self, url: &str, action: AudioAction) -> io::Result<()> {
        self.sender.send(BridgeEvent::Audio {
            context: self.context.clone(),
            url: url.to_string(),
            action,
        })
    }

    /// The embedding document's window object.
    pub fn window(&self) -> ScriptObject {
        ScriptObject::window(&self.context, &self.program)
    }

    pub async fn evaluate(&self, script: &str) -> Result<ScriptValue, CallError> {
        self.scripts.evaluate(&self.window(), script).await
    }

    pub async fn open_stream(
        &self,
        url: &str,
        direction: Direction,
    ) -> Result<TunnelStream, TunnelError> {
        self.tunnel.connect(url, direction).await
    }

    pub async fn confirm_security(
        &self,
        permission: &str,
        certificates: &[String],
    ) -> TrustDecision {
        self.scripts
            .confirm_security(&self.context, permission, certificates)
            .await
    }

    pub fn scripts(&self) -> &Arc<ScriptBridge> {
        &self.scripts
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }
}
