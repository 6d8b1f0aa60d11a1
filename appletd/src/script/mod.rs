//! Synchronous call bridge between guest code and the host script engine.
//!
//! Outbound calls (guest → script) are issued by [`ScriptBridge`] and resolved
//! by the reader task: `eval` through the per-context [`eval::EvalSlot`],
//! ticketed requests through [`pending::PendingCalls`]. Inbound calls
//! (script → guest) are answered by the functions in [`inbound`].

pub mod eval;
pub mod inbound;
pub mod pending;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::protocol::{BridgeEvent, Ticket, TrustDecision, ValueKind};
use crate::bridge::sender::FrameSender;
use crate::config::BridgeConfig;
use crate::registry::{Context, Registry};

use pending::{PendingCalls, Reply};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("no such context {0}")]
    NoSuchContext(String),

    #[error("host did not answer within {0:?}")]
    NoResponse(Duration),

    #[error("context closed while waiting for the host")]
    ContextClosed,

    #[error("script error: {0}")]
    Script(String),

    #[error("malformed reply {0:?}")]
    Malformed(String),

    #[error("evaluation produced no result")]
    NoResult,

    /// Script object references have no source-text form to assign.
    #[error("cannot assign script object {0} by value")]
    ObjectAssignment(String),

    #[error(transparent)]
    Transport(#[from] io::Error),
}

/// Reference to an object living in the host script engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptObject {
    pub context: String,
    pub program: String,
    pub id: String,
}

impl ScriptObject {
    pub fn new(
        context: impl Into<String>,
        program: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            program: program.into(),
            id: id.into(),
        }
    }

    /// The window of the document embedding `program`.
    pub fn window(context: impl Into<String>, program: impl Into<String>) -> Self {
        Self::new(context, program, "0")
    }

    fn with_id(&self, id: &str) -> Self {
        Self::new(&self.context, &self.program, id)
    }
}

/// A value returned by the host script engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Void,
    Null,
    Boolean(bool),
    Int(i64),
    Double(f64),
    String(String),
    Object(ScriptObject),
    Function(ScriptObject),
}

impl ScriptValue {
    /// Build a value from a reply's kind and text, relative to `origin`.
    pub fn from_reply(
        origin: &ScriptObject,
        kind: ValueKind,
        text: &str,
    ) -> Result<Self, CallError> {
        Ok(match kind {
            ValueKind::Error => return Err(CallError::Script(text.to_string())),
            ValueKind::Void => Self::Void,
            ValueKind::Boolean => Self::Boolean(text.trim() == "true"),
            ValueKind::Number => {
                if let Ok(n) = text.trim().parse::<i64>() {
                    Self::Int(n)
                } else if let Ok(f) = text.trim().parse::<f64>() {
                    Self::Double(f)
                } else {
                    Self::String(text.to_string())
                }
            }
            ValueKind::String => Self::String(text.to_string()),
            ValueKind::Object => Self::Object(origin.with_id(text)),
            ValueKind::Function => Self::Function(origin.with_id(text)),
        })
    }

    /// Parse an eval reply of the form `<kind> <text>`.
    pub fn parse_eval(origin: &ScriptObject, raw: &str) -> Result<Self, CallError> {
        let (kind, text) = raw.split_once(' ').unwrap_or((raw, ""));
        let kind = kind
            .parse::<ValueKind>()
            .map_err(|_| CallError::Malformed(raw.to_string()))?;
        Self::from_reply(origin, kind, text)
    }

    /// Source text for an assignment right-hand side. Object references
    /// render as their bare handle id, which is not an expression for them.
    pub fn literal(&self) -> String {
        match self {
            Self::Void | Self::Null => "null".to_string(),
            Self::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void | Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Double(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Object(o) | Self::Function(o) => write!(f, "{}", o.id),
        }
    }
}

/// Removes a ticket from the table if the caller stops waiting for any reason.
struct TicketGuard<'a> {
    pending: &'a PendingCalls,
    ticket: Ticket,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.pending.abandon(self.ticket);
    }
}

/// Issues guest → script calls and waits for their replies.
pub struct ScriptBridge {
    registry: Arc<Registry>,
    sender: FrameSender,
    config: BridgeConfig,
}

impl ScriptBridge {
    pub fn new(registry: Arc<Registry>, sender: FrameSender, config: BridgeConfig) -> Self {
        Self {
            registry,
            sender,
            config,
        }
    }

    fn context(&self, id: &str) -> Result<Arc<Context>, CallError> {
        self.registry
            .context(id)
            .map_err(|_| CallError::NoSuchContext(id.to_string()))
    }

    /// Evaluate `script` against `target` and return the raw `<kind> <text>` reply.
    pub async fn evaluate_raw(
        &self,
        target: &ScriptObject,
        script: &str,
    ) -> Result<String, CallError> {
        let ctx = self.context(&target.context)?;
        let event = BridgeEvent::ScriptEvent {
            context: target.context.clone(),
            program: target.program.clone(),
            object: target.id.clone(),
            event: "eval".to_string(),
            args: vec![script.replace('"', "\\\"")],
        };
        tracing::debug!(context = %target.context, program = %target.program, "Evaluating script");

        let result = ctx
            .eval_slot()
            .run(self.config.eval_timeout, || Ok(self.sender.send(event)?))
            .await;
        if let Err(CallError::NoResponse(after)) = &result {
            tracing::warn!(context = %target.context, ?after, "Eval timed out");
        }
        result
    }

    pub async fn evaluate(
        &self,
        target: &ScriptObject,
        script: &str,
    ) -> Result<ScriptValue, CallError> {
        let raw = self.evaluate_raw(target, script).await?;
        ScriptValue::parse_eval(target, &raw)
    }

    async fn ticketed<F>(&self, context: &str, build: F) -> Result<Reply, CallError>
    where
        F: FnOnce(Ticket) -> BridgeEvent,
    {
        let ctx = self.context(context)?;
        let pending = ctx.pending();
        let (ticket, rx) = pending.register().ok_or(CallError::ContextClosed)?;
        let _guard = TicketGuard { pending, ticket };

        self.sender.send(build(ticket))?;

        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CallError::ContextClosed),
            Err(_) => {
                tracing::warn!(%context, ticket = ticket.get(), "Ticketed call timed out");
                Err(CallError::NoResponse(self.config.call_timeout))
            }
        }
    }

    fn value_reply(target: &ScriptObject, reply: Reply) -> Result<ScriptValue, CallError> {
        match reply {
            Reply::Value { kind, value } => ScriptValue::from_reply(target, kind, &value),
            Reply::Trust(decision) => Err(CallError::Malformed(format!("{decision:?}"))),
        }
    }

    pub async fn get_member(
        &self,
        target: &ScriptObject,
        name: &str,
    ) -> Result<ScriptValue, CallError> {
        let reply = self
            .ticketed(&target.context, |ticket| BridgeEvent::ScriptGetMember {
                context: target.context.clone(),
                program: target.program.clone(),
                ticket,
                object: target.id.clone(),
                name: name.to_string(),
            })
            .await?;
        Self::value_reply(target, reply)
    }

    pub async fn call_member(
        &self,
        target: &ScriptObject,
        name: &str,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, CallError> {
        let reply = self
            .ticketed(&target.context, |ticket| BridgeEvent::ScriptCallMember {
                context: target.context.clone(),
                program: target.program.clone(),
                ticket,
                object: target.id.clone(),
                name: name.to_string(),
                args: args.iter().map(ToString::to_string).collect(),
            })
            .await?;
        Self::value_reply(target, reply)
    }

    /// Assign through evaluation of `this.<name>=<literal>`.
    pub async fn set_member(
        &self,
        target: &ScriptObject,
        name: &str,
        value: &ScriptValue,
    ) -> Result<(), CallError> {
        if let ScriptValue::Object(o) | ScriptValue::Function(o) = value {
            return Err(CallError::ObjectAssignment(o.id.clone()));
        }
        let script = format!("this.{name}={}", value.literal());
        match self.evaluate(target, &script).await? {
            ScriptValue::Void => Err(CallError::NoResult),
            _ => Ok(()),
        }
    }

    /// Ask the host user to grant `permission`. Anything but an answer is a denial.
    pub async fn confirm_security(
        &self,
        context: &str,
        permission: &str,
        certificates: &[String],
    ) -> TrustDecision {
        let result = self
            .ticketed(context, |ticket| BridgeEvent::SecurityConfirm {
                context: context.to_string(),
                ticket,
                permission: permission.to_string(),
                certificates: certificates.to_vec(),
            })
            .await;
        match result {
            Ok(Reply::Trust(decision)) => decision,
            Ok(other) => {
                tracing::warn!(%context, ?other, "Unexpected reply to security confirm");
                TrustDecision::Denied
            }
            Err(e) => {
                tracing::warn!(%context, error = %e, "Security confirm failed, denying");
                TrustDecision::Denied
            }
        }
    }
}
