//! Script → guest member access.
//!
//! Every function here answers with a [`MemberResult`]; failures degrade to an
//! `Error`-kind result and never propagate.

use std::fmt::Display;
use std::sync::Arc;

use crate::bridge::protocol::{ObjectId, ValueKind};
use crate::guest::{GuestObject, GuestValue};
use crate::registry::Context;

/// Kind and text carried back in a member reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberResult {
    pub kind: ValueKind,
    pub value: String,
}

impl MemberResult {
    pub fn void() -> Self {
        Self {
            kind: ValueKind::Void,
            value: String::new(),
        }
    }

    pub fn error(message: impl Display) -> Self {
        Self {
            kind: ValueKind::Error,
            value: message.to_string(),
        }
    }

    fn new(kind: ValueKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Map a guest value to its wire kind, exporting objects as handles.
pub fn classify(ctx: &Context, program: &str, value: GuestValue) -> MemberResult {
    match value {
        GuestValue::Void | GuestValue::Null => MemberResult::void(),
        GuestValue::Boolean(b) => MemberResult::new(ValueKind::Boolean, b.to_string()),
        GuestValue::Byte(n) => MemberResult::new(ValueKind::Number, n.to_string()),
        GuestValue::Short(n) => MemberResult::new(ValueKind::Number, n.to_string()),
        GuestValue::Int(n) => MemberResult::new(ValueKind::Number, n.to_string()),
        GuestValue::Long(n) => MemberResult::new(ValueKind::Number, n.to_string()),
        GuestValue::Float(n) => MemberResult::new(ValueKind::Number, n.to_string()),
        GuestValue::Double(n) => MemberResult::new(ValueKind::Number, n.to_string()),
        GuestValue::Char(c) => MemberResult::new(ValueKind::String, c.to_string()),
        GuestValue::String(s) => MemberResult::new(ValueKind::String, s),
        GuestValue::Object(object) => {
            let id = ctx.intern(program, object);
            MemberResult::new(ValueKind::Object, id.to_string())
        }
    }
}

fn target(
    ctx: &Context,
    program: &str,
    object: ObjectId,
) -> Result<Arc<dyn GuestObject>, MemberResult> {
    ctx.object(program, object).map_err(|e| {
        tracing::debug!(context = %ctx.id(), %program, %object, error = %e, "Unresolved object");
        MemberResult::error(e)
    })
}

/// Read a field, or report a method of that name as a function.
pub fn get_member(ctx: &Context, program: &str, object: ObjectId, name: &str) -> MemberResult {
    let target = match target(ctx, program, object) {
        Ok(t) => t,
        Err(result) => return result,
    };
    let class = target.guest_class();

    if class.has_field(name) {
        return match class.get(target.as_ref(), name) {
            Ok(value) => classify(ctx, program, value),
            Err(e) => MemberResult::error(e),
        };
    }
    if class.has_method(name) {
        return MemberResult::new(ValueKind::Function, name);
    }
    MemberResult::error(format!("{} has no member `{name}`", class.name()))
}

pub fn put_member(
    ctx: &Context,
    program: &str,
    object: ObjectId,
    name: &str,
    value: &str,
) -> MemberResult {
    let target = match target(ctx, program, object) {
        Ok(t) => t,
        Err(result) => return result,
    };
    match target.guest_class().set(target.as_ref(), name, value) {
        Ok(()) => MemberResult::void(),
        Err(e) => {
            tracing::debug!(context = %ctx.id(), %program, %name, error = %e, "PutMember failed");
            MemberResult::error(e)
        }
    }
}

/// Resolve and invoke a method. May block; run it off the reader task.
pub fn call_member(
    ctx: &Context,
    program: &str,
    object: ObjectId,
    name: &str,
    args: &[String],
) -> MemberResult {
    let target = match target(ctx, program, object) {
        Ok(t) => t,
        Err(result) => return result,
    };
    match target.guest_class().invoke(target.as_ref(), name, args) {
        Ok(value) => classify(ctx, program, value),
        Err(e) => {
            tracing::debug!(
                context = %ctx.id(),
                %program,
                %name,
                argc = args.len(),
                error = %e,
                "CallMember failed"
            );
            MemberResult::error(e)
        }
    }
}

pub fn dereference(ctx: &Context, object: ObjectId) {
    if let Err(e) = ctx.release(object) {
        tracing::warn!(context = %ctx.id(), %object, error = %e, "DerefObject for unknown handle");
    }
}
