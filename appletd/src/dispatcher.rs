//! Routes decoded host frames to the registry, host, call bridge, and tunnel.
//!
//! Handlers run on the reader task in arrival order, except `CallMember`,
//! which is moved to the blocking pool so a guest method may itself call back
//! into the bridge while the reader keeps draining replies.

use std::io;
use std::sync::Arc;

use crate::bridge::codec::Frame;
use crate::bridge::protocol::{
    BridgeEvent, Command, HostRequest, ObjectId, ProgramSpec, ProgramState, ProtocolError, Ticket,
};
use crate::bridge::sender::FrameSender;
use crate::config::BridgeConfig;
use crate::host::{AppletHost, ProgramEnv};
use crate::registry::{Context, Registry, RegistryError};
use crate::script::ScriptBridge;
use crate::script::inbound::{self, MemberResult};
use crate::script::pending::Reply;
use crate::tunnel::Tunnel;

/// What the read loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("cannot reach host: {0}")]
    Transport(#[from] io::Error),
}

impl DispatchError {
    /// The outbound stream is gone; nothing further can be answered.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Init,
    Start,
    Stop,
    Destroy,
}

impl Lifecycle {
    fn reached(self) -> ProgramState {
        match self {
            Self::Init => ProgramState::Initialized,
            Self::Start => ProgramState::Started,
            Self::Stop => ProgramState::Stopped,
            Self::Destroy => ProgramState::Destroyed,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    host: Arc<dyn AppletHost>,
    sender: FrameSender,
    scripts: Arc<ScriptBridge>,
    tunnel: Arc<Tunnel>,
}

impl Dispatcher {
    pub fn new(host: Arc<dyn AppletHost>, sender: FrameSender, config: BridgeConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let scripts = Arc::new(ScriptBridge::new(
            Arc::clone(&registry),
            sender.clone(),
            config.clone(),
        ));
        let tunnel = Arc::new(Tunnel::new(sender.clone(), config));
        Self {
            registry,
            host,
            sender,
            scripts,
            tunnel,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn scripts(&self) -> &Arc<ScriptBridge> {
        &self.scripts
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub async fn dispatch(&self, frame: &Frame) -> Result<Flow, DispatchError> {
        let request = HostRequest::try_from(frame)?;
        tracing::trace!(code = frame.code(), "Dispatching");

        match request {
            HostRequest::CreateContext { context } => self.create_context(&context),
            HostRequest::DestroyContext { context } => self.destroy_context(&context).await,
            HostRequest::CreateProgram {
                context,
                program,
                spec,
            } => self.create_program(&context, &program, spec).await?,
            HostRequest::InitProgram { context, program } => {
                self.lifecycle(&context, &program, Lifecycle::Init).await?
            }
            HostRequest::StartProgram { context, program } => {
                self.lifecycle(&context, &program, Lifecycle::Start).await?
            }
            HostRequest::StopProgram { context, program } => {
                self.lifecycle(&context, &program, Lifecycle::Stop).await?
            }
            HostRequest::DestroyProgram { context, program } => {
                self.lifecycle(&context, &program, Lifecycle::Destroy).await?
            }
            HostRequest::ShowConsole => self.host.show_console(),
            HostRequest::ShutdownServer => {
                tracing::info!("Shutdown requested by host");
                return Ok(Flow::Shutdown);
            }
            HostRequest::UrlData { job, code, data } => self.tunnel.deliver(job, code, data),
            HostRequest::GetMember {
                context,
                program,
                ticket,
                object,
                name,
            } => {
                let result = match self.registry.context(&context) {
                    Ok(ctx) => inbound::get_member(&ctx, &program, object, &name),
                    Err(e) => MemberResult::error(e),
                };
                self.reply(Command::GetMember, context, program, ticket, result)?;
            }
            HostRequest::PutMember {
                context,
                program,
                ticket,
                object,
                name,
                value,
            } => {
                let result = match self.registry.context(&context) {
                    Ok(ctx) => inbound::put_member(&ctx, &program, object, &name, &value),
                    Err(e) => MemberResult::error(e),
                };
                self.reply(Command::PutMember, context, program, ticket, result)?;
            }
            HostRequest::CallMember {
                context,
                program,
                ticket,
                object,
                name,
                args,
            } => match self.registry.context(&context) {
                Ok(ctx) => self.spawn_call(ctx, program, ticket, object, name, args),
                Err(e) => {
                    let result = MemberResult::error(e);
                    self.reply(Command::CallMember, context, program, ticket, result)?
                }
            },
            HostRequest::DerefObject {
                context, object, ..
            } => match self.registry.context(&context) {
                Ok(ctx) => inbound::dereference(&ctx, object),
                Err(e) => tracing::warn!(%context, %object, error = %e, "DerefObject ignored"),
            },
            HostRequest::EvalReturn { context, value, .. } => self.eval_return(&context, value),
            HostRequest::ScriptReturn {
                context,
                ticket,
                kind,
                value,
            } => self.resolve(&context, ticket, Reply::Value { kind, value }),
            HostRequest::SecurityReply {
                context,
                ticket,
                decision,
            } => self.resolve(&context, ticket, Reply::Trust(decision)),
        }
        Ok(Flow::Continue)
    }

    fn create_context(&self, context: &str) {
        match self.registry.create_context(context) {
            Ok(_) => tracing::info!(%context, "Context created"),
            Err(e) => tracing::warn!(%context, error = %e, "CreateContext ignored"),
        }
    }

    async fn destroy_context(&self, context: &str) {
        match self.registry.remove_context(context) {
            Ok(ctx) => {
                self.teardown(&ctx).await;
                tracing::info!(%context, "Context destroyed");
            }
            Err(e) => tracing::warn!(%context, error = %e, "DestroyContext ignored"),
        }
    }

    async fn teardown(&self, ctx: &Context) {
        for program in ctx.shutdown() {
            let Some(instance) = program.instance else {
                continue;
            };
            if let Err(e) = self.host.destroy(&instance).await {
                tracing::warn!(
                    context = %ctx.id(),
                    program = %program.id,
                    error = %e,
                    "Destroy during context teardown failed"
                );
            }
        }
    }

    async fn create_program(
        &self,
        context: &str,
        program: &str,
        spec: ProgramSpec,
    ) -> Result<(), DispatchError> {
        let ctx = match self.registry.context(context) {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(context, program, e),
        };
        if let Err(e) = ctx.add_program(program, spec.clone()) {
            return self.fail(context, program, e);
        }

        let env = ProgramEnv::new(
            context,
            program,
            self.sender.clone(),
            Arc::clone(&self.scripts),
            Arc::clone(&self.tunnel),
        );
        match self.host.create(env, &spec).await {
            Ok(instance) => {
                ctx.attach_instance(program, instance)?;
                tracing::info!(%context, %program, class = %spec.class_name, "Program created");
                self.advance(&ctx, program, ProgramState::Instantiated)
            }
            Err(e) => {
                let _ = ctx.remove_program(program);
                self.fail(context, program, e)
            }
        }
    }

    async fn lifecycle(
        &self,
        context: &str,
        program: &str,
        step: Lifecycle,
    ) -> Result<(), DispatchError> {
        let ctx = match self.registry.context(context) {
            Ok(ctx) => ctx,
            Err(e) => return self.fail(context, program, e),
        };
        let instance = match ctx.instance(program) {
            Ok(instance) => instance,
            Err(e) => return self.fail(context, program, e),
        };

        let result = match step {
            Lifecycle::Init => self.host.init(&instance).await,
            Lifecycle::Start => self.host.start(&instance).await,
            Lifecycle::Stop => self.host.stop(&instance).await,
            Lifecycle::Destroy => self.host.destroy(&instance).await,
        };
        if let Err(e) = result {
            return self.fail(context, program, e);
        }

        tracing::debug!(%context, %program, ?step, "Lifecycle step done");
        self.advance(&ctx, program, step.reached())?;
        if let Lifecycle::Destroy = step {
            ctx.remove_program(program)?;
        }
        Ok(())
    }

    fn advance(
        &self,
        ctx: &Context,
        program: &str,
        state: ProgramState,
    ) -> Result<(), DispatchError> {
        ctx.set_program_state(program, state)?;
        self.sender.send(BridgeEvent::ProgramState {
            context: ctx.id().to_string(),
            program: program.to_string(),
            state,
        })?;
        Ok(())
    }

    fn fail(
        &self,
        context: &str,
        program: &str,
        error: impl std::fmt::Display,
    ) -> Result<(), DispatchError> {
        let message = error.to_string();
        tracing::warn!(%context, %program, error = %message, "Hosted program failed");
        self.sender.send(BridgeEvent::ProgramFailed {
            context: context.to_string(),
            program: program.to_string(),
            message,
        })?;
        Ok(())
    }

    fn reply(
        &self,
        command: Command,
        context: String,
        program: String,
        ticket: Ticket,
        result: MemberResult,
    ) -> Result<(), DispatchError> {
        Ok(send_reply(&self.sender, command, context, program, ticket, result)?)
    }

    fn spawn_call(
        &self,
        ctx: Arc<Context>,
        program: String,
        ticket: Ticket,
        object: ObjectId,
        name: String,
        args: Vec<String>,
    ) {
        let sender = self.sender.clone();
        let context = ctx.id().to_string();
        let call_program = program.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                inbound::call_member(&ctx, &call_program, object, &name, &args)
            })
            .await
            .unwrap_or_else(|e| {
                tracing::error!(
                    %context,
                    ticket = ticket.get(),
                    error = %e,
                    "Guest method aborted"
                );
                if e.is_panic() {
                    MemberResult::error("guest method panicked")
                } else {
                    MemberResult::error(e)
                }
            });
            let sent = send_reply(&sender, Command::CallMember, context, program, ticket, result);
            if let Err(e) = sent {
                tracing::debug!(error = %e, "Could not send CallMember reply");
            }
        });
    }

    fn eval_return(&self, context: &str, value: String) {
        match self.registry.context(context) {
            Ok(ctx) => {
                if !ctx.eval_slot().deliver(value) {
                    tracing::warn!(%context, "Eval reply with no pending eval, discarded");
                }
            }
            Err(e) => tracing::debug!(%context, error = %e, "Eval reply for unknown context"),
        }
    }

    fn resolve(&self, context: &str, ticket: Ticket, reply: Reply) {
        let resolved = self
            .registry
            .context(context)
            .map(|ctx| ctx.pending().resolve(ticket, reply))
            .unwrap_or(false);
        if !resolved {
            tracing::debug!(%context, ticket = ticket.get(), "Late or unknown reply discarded");
        }
    }

    /// Destroy every context and abort in-flight jobs.
    pub async fn shutdown(&self) {
        for ctx in self.registry.drain() {
            self.teardown(&ctx).await;
        }
        self.tunnel.shutdown();
    }
}

/// Answer a ticket, falling back to an error reply when the value cannot be framed.
fn send_reply(
    sender: &FrameSender,
    command: Command,
    context: String,
    program: String,
    ticket: Ticket,
    result: MemberResult,
) -> io::Result<()> {
    let reply = member_reply(command, context.clone(), program.clone(), ticket, result);
    match sender.send(reply) {
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
            tracing::warn!(
                %context,
                %program,
                ticket = ticket.get(),
                error = %e,
                "Reply value cannot be encoded"
            );
            let fallback = MemberResult::error("value cannot be encoded");
            sender.send(member_reply(command, context, program, ticket, fallback))
        }
        other => other,
    }
}

fn member_reply(
    command: Command,
    context: String,
    program: String,
    ticket: Ticket,
    result: MemberResult,
) -> BridgeEvent {
    BridgeEvent::MemberReply {
        command,
        context,
        program,
        ticket,
        kind: result.kind,
        value: result.value,
    }
}
