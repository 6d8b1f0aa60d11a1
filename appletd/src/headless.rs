//! Host with no managed runtime behind it.
//!
//! Every hosted program becomes an inert guest object that exposes its launch
//! parameters to the script side and can reach back into the document
//! (status line, resize, nested `eval`). Used by the standalone binary and as
//! the reference host in tests.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;

use crate::bridge::protocol::{ProgramSpec, ProgramState};
use crate::guest::{GuestClass, GuestError, GuestObject, GuestValue, ParamType, Primitive};
use crate::host::{AppletHost, HostError, ProgramEnv};
use crate::script::ScriptValue;

const STRING: ParamType = ParamType::String;
const INT: ParamType = ParamType::Primitive(Primitive::Int);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Initialized,
    Running,
    Stopped,
    Destroyed,
}

pub struct HeadlessProgram {
    env: ProgramEnv,
    spec: ProgramSpec,
    size: Mutex<(u32, u32)>,
    status: Mutex<String>,
    phase: Mutex<Phase>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Headless program mutex poisoned");
        poisoned.into_inner()
    })
}

fn string_arg(args: &[GuestValue], index: usize) -> String {
    args.get(index)
        .and_then(GuestValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn dimension(value: Option<&GuestValue>) -> Result<u32, GuestError> {
    value
        .and_then(GuestValue::as_i64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| GuestError::invocation("dimension must be a non-negative int"))
}

fn into_guest(value: ScriptValue) -> GuestValue {
    match value {
        ScriptValue::Void => GuestValue::Void,
        ScriptValue::Null => GuestValue::Null,
        ScriptValue::Boolean(b) => GuestValue::Boolean(b),
        ScriptValue::Int(n) => GuestValue::Long(n),
        ScriptValue::Double(n) => GuestValue::Double(n),
        ScriptValue::String(s) => GuestValue::String(s),
        ScriptValue::Object(o) | ScriptValue::Function(o) => GuestValue::String(o.id),
    }
}

impl HeadlessProgram {
    fn new(env: ProgramEnv, spec: ProgramSpec) -> Self {
        let size = (spec.width, spec.height);
        Self {
            env,
            spec,
            size: Mutex::new(size),
            status: Mutex::new(String::new()),
            phase: Mutex::new(Phase::Created),
        }
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }

    pub fn status(&self) -> String {
        lock(&self.status).clone()
    }

    pub fn size(&self) -> (u32, u32) {
        *lock(&self.size)
    }

    fn show_status(&self, text: String) -> Result<GuestValue, GuestError> {
        self.env
            .show_status(&text)
            .map_err(|e| GuestError::invocation(e.to_string()))?;
        *lock(&self.status) = text;
        Ok(GuestValue::Void)
    }

    fn resize(&self, args: &[GuestValue]) -> Result<GuestValue, GuestError> {
        let width = dimension(args.first())?;
        let height = dimension(args.get(1))?;
        *lock(&self.size) = (width, height);
        self.env
            .request_resize(width, height)
            .map_err(|e| GuestError::invocation(e.to_string()))?;
        Ok(GuestValue::Void)
    }

    /// Evaluate in the embedding document. Blocks the calling thread, so it
    /// must run on the blocking pool.
    fn eval(&self, script: String) -> Result<GuestValue, GuestError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| GuestError::invocation(e.to_string()))?;
        let env = self.env.clone();
        handle
            .block_on(async move { env.evaluate(&script).await })
            .map(into_guest)
            .map_err(|e| GuestError::invocation(e.to_string()))
    }

    fn transition(&self, phase: &'static str, from: &[Phase], to: Phase) -> Result<(), HostError> {
        let mut current = lock(&self.phase);
        if !from.contains(&current) {
            return Err(HostError::lifecycle(
                phase,
                format!("program is {:?}", *current).to_lowercase(),
            ));
        }
        *current = to;
        Ok(())
    }
}

impl GuestObject for HeadlessProgram {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn guest_class(&self) -> &GuestClass {
        static CLASS: OnceLock<GuestClass> = OnceLock::new();
        CLASS.get_or_init(|| {
            GuestClass::builder::<HeadlessProgram>("HeadlessProgram")
                .field("name", |p| p.spec.name.as_str().into())
                .field("className", |p| p.spec.class_name.as_str().into())
                .field("documentBase", |p| p.spec.document_base.as_str().into())
                .field("codeBase", |p| p.spec.code_base.clone().into())
                .field("width", |p| GuestValue::Long(p.size().0.into()))
                .field("height", |p| GuestValue::Long(p.size().1.into()))
                .field_mut(
                    "status",
                    STRING,
                    |p| p.status().into(),
                    |p, value| {
                        *lock(&p.status) = value.as_str().unwrap_or_default().to_string();
                        Ok(())
                    },
                )
                .method("getParameter", &[STRING], |p, args| {
                    Ok(p.spec.parameter(&string_arg(&args, 0)).into())
                })
                .method("getParameter", &[STRING, STRING], |p, args| {
                    let value = p
                        .spec
                        .parameter(&string_arg(&args, 0))
                        .map(str::to_string)
                        .unwrap_or_else(|| string_arg(&args, 1));
                    Ok(value.into())
                })
                .method("showStatus", &[STRING], |p, args| {
                    p.show_status(string_arg(&args, 0))
                })
                .method("resize", &[INT, INT], |p, args| p.resize(&args))
                .method("eval", &[STRING], |p, args| p.eval(string_arg(&args, 0)))
                .build()
        })
    }
}

fn headless(program: &Arc<dyn GuestObject>) -> Result<&HeadlessProgram, HostError> {
    program
        .as_any()
        .downcast_ref::<HeadlessProgram>()
        .ok_or_else(|| HostError::internal("program was not created by this host"))
}

/// [`AppletHost`] whose programs are plain parameter holders.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessHost;

impl HeadlessHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AppletHost for HeadlessHost {
    async fn create(
        &self,
        env: ProgramEnv,
        spec: &ProgramSpec,
    ) -> Result<Arc<dyn GuestObject>, HostError> {
        if spec.class_name.trim().is_empty() {
            return Err(HostError::load("no class name given"));
        }
        if let Err(e) = env.report_state(ProgramState::ClassLoaded) {
            tracing::debug!(error = %e, "Could not report class loaded");
        }
        tracing::info!(
            context = %env.context(),
            program = %env.program(),
            class = %spec.class_name,
            "Created headless program"
        );
        Ok(Arc::new(HeadlessProgram::new(env, spec.clone())))
    }

    async fn init(&self, program: &Arc<dyn GuestObject>) -> Result<(), HostError> {
        headless(program)?.transition("init", &[Phase::Created], Phase::Initialized)
    }

    async fn start(&self, program: &Arc<dyn GuestObject>) -> Result<(), HostError> {
        headless(program)?.transition(
            "start",
            &[Phase::Initialized, Phase::Stopped],
            Phase::Running,
        )
    }

    async fn stop(&self, program: &Arc<dyn GuestObject>) -> Result<(), HostError> {
        headless(program)?.transition("stop", &[Phase::Running], Phase::Stopped)
    }

    async fn destroy(&self, program: &Arc<dyn GuestObject>) -> Result<(), HostError> {
        headless(program)?.transition(
            "destroy",
            &[
                Phase::Created,
                Phase::Initialized,
                Phase::Running,
                Phase::Stopped,
            ],
            Phase::Destroyed,
        )
    }
}
