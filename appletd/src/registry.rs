//! Session registry: contexts, their hosted programs, and object handles.
//!
//! The registry owns one lock over the context table. Each [`Context`] owns
//! one lock over its arena (programs plus exported guest objects), a ticket
//! table for bridge-issued calls, and the eval slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bridge::protocol::{ObjectId, ProgramSpec, ProgramState};
use crate::guest::GuestObject;
use crate::script::eval::EvalSlot;
use crate::script::pending::PendingCalls;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("context {0} already exists")]
    ContextExists(String),

    #[error("no such context {0}")]
    NoSuchContext(String),

    #[error("program {0} already exists")]
    ProgramExists(String),

    #[error("no such program {0}")]
    NoSuchProgram(String),

    #[error("no such object {0}")]
    NoSuchObject(ObjectId),
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!(table = what, "Registry mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// One hosted program inside a context.
pub struct HostedProgram {
    pub id: String,
    pub spec: ProgramSpec,
    pub state: Option<ProgramState>,
    /// Set once the host has instantiated the program.
    pub instance: Option<Arc<dyn GuestObject>>,
}

/// Guest objects exported to the script side, keyed by handle id.
struct ObjectTable {
    next: u32,
    by_id: HashMap<ObjectId, Arc<dyn GuestObject>>,
    by_addr: HashMap<usize, ObjectId>,
}

fn addr(object: &Arc<dyn GuestObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl ObjectTable {
    fn new() -> Self {
        Self {
            next: 1,
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
        }
    }

    fn intern(&mut self, object: Arc<dyn GuestObject>) -> ObjectId {
        let key = addr(&object);
        if let Some(id) = self.by_addr.get(&key) {
            return *id;
        }
        let id = ObjectId::new(self.next);
        self.next = self.next.wrapping_add(1).max(1);
        self.by_addr.insert(key, id);
        self.by_id.insert(id, object);
        id
    }

    fn release(&mut self, id: ObjectId) -> bool {
        match self.by_id.remove(&id) {
            Some(object) => {
                self.by_addr.remove(&addr(&object));
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.by_id.clear();
        self.by_addr.clear();
    }
}

struct ContextState {
    programs: HashMap<String, HostedProgram>,
    objects: ObjectTable,
}

/// One host document session.
pub struct Context {
    id: String,
    state: Mutex<ContextState>,
    pending: PendingCalls,
    eval: EvalSlot,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish()
    }
}

impl Context {
    fn new(id: String) -> Self {
        Self {
            id,
            state: Mutex::new(ContextState {
                programs: HashMap::new(),
                objects: ObjectTable::new(),
            }),
            pending: PendingCalls::new(),
            eval: EvalSlot::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn eval_slot(&self) -> &EvalSlot {
        &self.eval
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        lock_or_recover(&self.state, "context")
    }

    /// Reserve a program id before the host instantiates it.
    pub fn add_program(&self, id: &str, spec: ProgramSpec) -> Result<(), RegistryError> {
        let mut state = self.lock();
        if state.programs.contains_key(id) {
            return Err(RegistryError::ProgramExists(id.to_string()));
        }
        state.programs.insert(
            id.to_string(),
            HostedProgram {
                id: id.to_string(),
                spec,
                state: None,
                instance: None,
            },
        );
        Ok(())
    }

    pub fn attach_instance(
        &self,
        program: &str,
        instance: Arc<dyn GuestObject>,
    ) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let entry = state
            .programs
            .get_mut(program)
            .ok_or_else(|| RegistryError::NoSuchProgram(program.to_string()))?;
        entry.instance = Some(instance);
        Ok(())
    }

    pub fn set_program_state(
        &self,
        program: &str,
        new_state: ProgramState,
    ) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let entry = state
            .programs
            .get_mut(program)
            .ok_or_else(|| RegistryError::NoSuchProgram(program.to_string()))?;
        entry.state = Some(new_state);
        Ok(())
    }

    pub fn program_state(&self, program: &str) -> Option<ProgramState> {
        self.lock().programs.get(program).and_then(|p| p.state)
    }

    pub fn has_program(&self, program: &str) -> bool {
        self.lock().programs.contains_key(program)
    }

    pub fn program_count(&self) -> usize {
        self.lock().programs.len()
    }

    pub fn program_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().programs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The program's guest instance, once attached.
    pub fn instance(&self, program: &str) -> Result<Arc<dyn GuestObject>, RegistryError> {
        self.lock()
            .programs
            .get(program)
            .and_then(|p| p.instance.clone())
            .ok_or_else(|| RegistryError::NoSuchProgram(program.to_string()))
    }

    pub fn remove_program(&self, program: &str) -> Result<HostedProgram, RegistryError> {
        self.lock()
            .programs
            .remove(program)
            .ok_or_else(|| RegistryError::NoSuchProgram(program.to_string()))
    }

    /// Resolve a handle; id 0 is the program instance itself.
    pub fn object(
        &self,
        program: &str,
        id: ObjectId,
    ) -> Result<Arc<dyn GuestObject>, RegistryError> {
        if id.is_program() {
            return self.instance(program);
        }
        self.lock()
            .objects
            .by_id
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NoSuchObject(id))
    }

    /// Handle for `object`, minting one on first export.
    pub fn intern(&self, program: &str, object: Arc<dyn GuestObject>) -> ObjectId {
        let mut state = self.lock();
        let is_program = state
            .programs
            .get(program)
            .and_then(|p| p.instance.as_ref())
            .is_some_and(|instance| addr(instance) == addr(&object));
        if is_program {
            return ObjectId::PROGRAM;
        }
        state.objects.intern(object)
    }

    pub fn release(&self, id: ObjectId) -> Result<(), RegistryError> {
        if id.is_program() {
            return Ok(());
        }
        if self.lock().objects.release(id) {
            Ok(())
        } else {
            Err(RegistryError::NoSuchObject(id))
        }
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.by_id.len()
    }

    /// Tear the context down: drop every handle, fail pending calls and the
    /// eval slot, and hand back the programs for the host to destroy.
    pub fn shutdown(&self) -> Vec<HostedProgram> {
        let programs: Vec<HostedProgram> = {
            let mut state = self.lock();
            state.objects.clear();
            state.programs.drain().map(|(_, p)| p).collect()
        };
        let failed = self.pending.fail_all();
        self.eval.close();
        tracing::debug!(
            context = %self.id,
            programs = programs.len(),
            failed_calls = failed,
            "Context shut down"
        );
        programs
    }
}

/// Table of live contexts.
#[derive(Default)]
pub struct Registry {
    contexts: Mutex<HashMap<String, Arc<Context>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Context>>> {
        lock_or_recover(&self.contexts, "contexts")
    }

    pub fn create_context(&self, id: &str) -> Result<Arc<Context>, RegistryError> {
        let mut contexts = self.lock();
        if contexts.contains_key(id) {
            return Err(RegistryError::ContextExists(id.to_string()));
        }
        let context = Arc::new(Context::new(id.to_string()));
        contexts.insert(id.to_string(), Arc::clone(&context));
        Ok(context)
    }

    pub fn context(&self, id: &str) -> Result<Arc<Context>, RegistryError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NoSuchContext(id.to_string()))
    }

    /// Unlink a context. The caller finishes teardown via [`Context::shutdown`].
    pub fn remove_context(&self, id: &str) -> Result<Arc<Context>, RegistryError> {
        self.lock()
            .remove(id)
            .ok_or_else(|| RegistryError::NoSuchContext(id.to_string()))
    }

    /// Unlink every context, for process shutdown.
    pub fn drain(&self) -> Vec<Arc<Context>> {
        self.lock().drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::GuestClass;
    use std::any::Any;
    use std::sync::OnceLock;

    struct Thing;

    impl GuestObject for Thing {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn guest_class(&self) -> &GuestClass {
            static CLASS: OnceLock<GuestClass> = OnceLock::new();
            CLASS.get_or_init(|| GuestClass::empty("Thing"))
        }
    }

    fn spec() -> ProgramSpec {
        ProgramSpec {
            name: "demo".into(),
            class_name: "Demo".into(),
            document_base: "http://x/y.html".into(),
            code_base: None,
            archives: None,
            width: 100,
            height: 50,
            parameters: Vec::new(),
        }
    }

    #[test]
    fn context_ids_are_unique_while_live() {
        let registry = Registry::new();
        registry.create_context("ctx1").unwrap();
        assert!(matches!(
            registry.create_context("ctx1"),
            Err(RegistryError::ContextExists(_))
        ));
        registry.remove_context("ctx1").unwrap();
        registry.create_context("ctx1").unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_program_is_rejected() {
        let registry = Registry::new();
        let ctx = registry.create_context("ctx1").unwrap();
        ctx.add_program("p1", spec()).unwrap();
        assert!(matches!(
            ctx.add_program("p1", spec()),
            Err(RegistryError::ProgramExists(_))
        ));
        assert_eq!(ctx.program_count(), 1);
    }

    #[test]
    fn interning_is_stable_per_referent() {
        let registry = Registry::new();
        let ctx = registry.create_context("ctx1").unwrap();
        let a: Arc<dyn GuestObject> = Arc::new(Thing);
        let b: Arc<dyn GuestObject> = Arc::new(Thing);

        let id_a = ctx.intern("p1", Arc::clone(&a));
        let id_b = ctx.intern("p1", Arc::clone(&b));
        assert_eq!(id_a, ObjectId::new(1));
        assert_eq!(id_b, ObjectId::new(2));
        assert_eq!(ctx.intern("p1", a), id_a);

        ctx.release(id_a).unwrap();
        assert!(matches!(
            ctx.object("p1", id_a),
            Err(RegistryError::NoSuchObject(_))
        ));
        assert!(ctx.release(id_a).is_err());
        assert!(ctx.object("p1", id_b).is_ok());
    }

    #[test]
    fn program_instance_is_object_zero() {
        let registry = Registry::new();
        let ctx = registry.create_context("ctx1").unwrap();
        ctx.add_program("p1", spec()).unwrap();
        assert!(ctx.object("p1", ObjectId::PROGRAM).is_err());

        let instance: Arc<dyn GuestObject> = Arc::new(Thing);
        ctx.attach_instance("p1", Arc::clone(&instance)).unwrap();
        assert_eq!(ctx.intern("p1", instance), ObjectId::PROGRAM);
        assert!(ctx.object("p1", ObjectId::PROGRAM).is_ok());

        // Handle 0 is never released.
        ctx.release(ObjectId::PROGRAM).unwrap();
        assert!(ctx.object("p1", ObjectId::PROGRAM).is_ok());
        assert_eq!(ctx.object_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cascades() {
        let registry = Registry::new();
        let ctx = registry.create_context("ctx1").unwrap();
        ctx.add_program("p1", spec()).unwrap();
        ctx.intern("p1", Arc::new(Thing));
        let (_, rx) = ctx.pending().register().unwrap();

        let removed = registry.remove_context("ctx1").unwrap();
        let programs = removed.shutdown();

        assert_eq!(programs.len(), 1);
        assert_eq!(programs[0].id, "p1");
        assert_eq!(removed.object_count(), 0);
        assert!(rx.await.is_err());
        assert!(matches!(
            registry.context("ctx1"),
            Err(RegistryError::NoSuchContext(_))
        ));
    }
}
