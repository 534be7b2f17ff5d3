//! Native backend
//!
//! Satisfies the backend contract in-process on top of QuickJS (via
//! `rquickjs`). Linear memory is emulated with a byte buffer, and value
//! pointers index a slab of persistent engine values.
//!
//! `compile` produces the engine's own bytecode (see `compile.rs`); the
//! versioned envelope around it belongs to [`crate::bytecode`]. The engine
//! heap limit is enforced by the allocator in `heap.rs`.

mod compile;
mod exports;
mod heap;
mod memory;

pub use memory::LinearMemory;

use heap::{HeapState, LimitedAllocator};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Context, Ctx, Exception, Function, Module, Persistent, Runtime, Value};

use crate::abi::{self, export, import, phase};
use crate::backend::{
    Backend, BackendFactory, BackendFault, BackendId, Caller, ImportTable, InstanceHandle,
    InterruptCheck, ModuleHandle, Val,
};

/// Hidden global holding the context id
pub(crate) const CONTEXT_MARKER: &str = "__fos_context_id";
/// `import.meta` slot through which a host module shim reaches its exports
const META_EXPORTS: &str = "hostExports";

pub const BACKEND_NAME: &str = "native-quickjs";
pub const BACKEND_VERSION: &str = "0.9";
pub const ENGINE_VERSION: &str = "QuickJS (rquickjs 0.9)";

type Shared = Rc<NativeShared>;
type InterruptSlot = Rc<RefCell<Option<InterruptCheck>>>;

// ============================================================================
// BACKEND
// ============================================================================

/// In-process QuickJS backend
pub struct NativeBackend {
    id: BackendId,
    modules: Vec<u32>,
    instances: Vec<Option<NativeInstance>>,
    interrupt: InterruptSlot,
    memory_limit: Option<usize>,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend {
    pub fn new() -> Self {
        Self {
            id: BackendId::new(BACKEND_NAME, BACKEND_VERSION),
            modules: Vec::new(),
            instances: Vec::new(),
            interrupt: Rc::new(RefCell::new(None)),
            memory_limit: None,
        }
    }

    fn instance(&self, handle: &InstanceHandle) -> Result<&NativeInstance, BackendFault> {
        self.instances
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| BackendFault::trap("invalid_instance", format!("no instance {}", handle.0)))
    }
}

impl Backend for NativeBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn load_module(&mut self, bytes: &[u8]) -> Result<ModuleHandle, BackendFault> {
        let version = abi::parse_module_image(bytes)
            .ok_or_else(|| BackendFault::Compilation("not an engine module image".into()))?;
        if version != abi::ABI_VERSION {
            return Err(BackendFault::Compilation(format!(
                "module targets ABI v{version}, backend implements v{}",
                abi::ABI_VERSION
            )));
        }
        tracing::trace!("Loaded engine module (ABI v{})", version);
        self.modules.push(version);
        Ok(ModuleHandle(self.modules.len() as u32 - 1))
    }

    fn instantiate(
        &mut self,
        module: &ModuleHandle,
        imports: ImportTable,
    ) -> Result<InstanceHandle, BackendFault> {
        if self.modules.get(module.0 as usize).is_none() {
            return Err(BackendFault::Instantiation(format!("unknown module {}", module.0)));
        }
        if let Some(missing) = import::ALL.iter().find(|name| !imports.contains(name)) {
            return Err(BackendFault::Instantiation(format!("unresolved import `{missing}`")));
        }

        let instance = NativeInstance::new(imports, self.interrupt.clone(), self.memory_limit)?;
        self.instances.push(Some(instance));
        let handle = InstanceHandle(self.instances.len() as u32 - 1);
        tracing::debug!("Instantiated native engine instance {}", handle.0);
        Ok(handle)
    }

    fn call_export(
        &mut self,
        instance: &InstanceHandle,
        name: &str,
        args: &[Val],
    ) -> Result<Vec<Val>, BackendFault> {
        self.instance(instance)?.call(name, args)
    }

    fn read_memory(
        &self,
        instance: &InstanceHandle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), BackendFault> {
        self.instance(instance)?.shared.memory.borrow().read(offset, buf)
    }

    fn write_memory(
        &mut self,
        instance: &InstanceHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), BackendFault> {
        self.instance(instance)?.shared.memory.borrow_mut().write(offset, data)
    }

    fn set_interrupt_check(&mut self, check: Option<InterruptCheck>) {
        *self.interrupt.borrow_mut() = check;
    }

    fn set_memory_limit(&mut self, bytes: Option<usize>) {
        self.memory_limit = bytes;
        for instance in self.instances.iter().flatten() {
            instance.shared.heap.set_limit(bytes);
        }
    }
}

/// Factory for [`NativeBackend`]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeFactory;

impl BackendFactory for NativeFactory {
    fn create(&self) -> Result<Box<dyn Backend>, BackendFault> {
        Ok(Box::new(NativeBackend::new()))
    }

    fn module_image(&self) -> Vec<u8> {
        abi::module_image()
    }
}

// ============================================================================
// INSTANCE
// ============================================================================

struct NativeInstance {
    runtime: Runtime,
    shared: Shared,
}

impl NativeInstance {
    fn new(
        imports: ImportTable,
        interrupt: InterruptSlot,
        memory_limit: Option<usize>,
    ) -> Result<Self, BackendFault> {
        let heap = Rc::new(HeapState::default());
        heap.set_limit(memory_limit);
        let runtime = Runtime::new_with_alloc(LimitedAllocator::new(heap.clone()))
            .map_err(|e| BackendFault::Instantiation(e.to_string()))?;
        runtime.set_interrupt_handler(Some(Box::new(move || {
            interrupt.borrow_mut().as_mut().is_some_and(|check| check())
        })));

        let shared = Rc::new(NativeShared::new(imports, heap));
        let weak = Rc::downgrade(&shared);
        install_rejection_tracker(&runtime, move |ctx, promise, reason, is_handled| {
            track_rejection(&weak, ctx, promise, reason, is_handled)
        });
        runtime.set_loader(
            HostResolver,
            HostLoader {
                shared: Rc::downgrade(&shared),
            },
        );

        Ok(Self { runtime, shared })
    }

    /// Top-level export call
    fn call(&self, name: &str, args: &[Val]) -> Result<Vec<Val>, BackendFault> {
        self.shared.heap.reset_exhausted();
        let result = self.call_inner(name, args);
        if let Some(fault) = self.shared.trap.borrow_mut().take() {
            return Err(fault);
        }
        result
    }

    fn call_inner(&self, name: &str, args: &[Val]) -> Result<Vec<Val>, BackendFault> {
        let shared = &self.shared;
        match name {
            export::CONTEXT_NEW => self.context_new(),
            export::CONTEXT_FREE => {
                let ctx_id = exports::Args::new(name, args).u32()?;
                shared.remove_context(ctx_id)?;
                Ok(Vec::new())
            }
            export::JOB_PENDING => Ok(vec![Val::I32(self.runtime.is_job_pending() as i32)]),
            export::JOB_EXECUTE => Ok(vec![Val::I32(self.execute_job())]),
            export::SET_MAX_STACK_SIZE => {
                let size = exports::Args::new(name, args).usize()?;
                self.runtime.set_max_stack_size(size);
                Ok(Vec::new())
            }
            export::SET_GC_THRESHOLD => {
                let size = exports::Args::new(name, args).usize()?;
                self.runtime.set_gc_threshold(size);
                Ok(Vec::new())
            }
            export::RUN_GC => {
                self.runtime.run_gc();
                Ok(Vec::new())
            }
            export::MEMORY_USAGE => {
                let out = exports::Args::new(name, args).u32()?;
                let report = self.memory_report();
                exports::return_bytes(shared, report.into_bytes(), out)
            }
            _ if exports::is_memory_export(name) => exports::memory_export(shared, name, args),
            _ => {
                let ctx_id = exports::Args::new(name, args).u32()?;
                let context = shared.context(ctx_id)?;
                context.with(|ctx| exports::dispatch(&ctx, shared, ctx_id, name, args))
            }
        }
    }

    fn context_new(&self) -> Result<Vec<Val>, BackendFault> {
        let context = Context::full(&self.runtime).map_err(|e| BackendFault::Runtime(e.to_string()))?;
        let id = self.shared.next_context.get();
        context
            .with(|ctx| {
                let marker = format!(
                    "Object.defineProperty(globalThis, '{CONTEXT_MARKER}', {{ value: {id} }})"
                );
                ctx.eval::<Value, _>(marker)?;
                exports::prepare_context(&ctx, &self.shared, id)
            })
            .map_err(|e| BackendFault::Runtime(format!("context setup failed: {e}")))?;
        self.shared.next_context.set(id + 1);
        self.shared.contexts.borrow_mut().insert(id, context);
        Ok(vec![Val::I32(id as i32)])
    }

    fn execute_job(&self) -> i32 {
        match self.runtime.execute_pending_job() {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(err) => {
                err.0.with(|ctx| {
                    let value = ctx.catch();
                    let code = exports::exception_phase(&self.shared, &value, phase::RUNTIME);
                    *self.shared.job_exception.borrow_mut() = Some((Persistent::save(&ctx, value), code));
                });
                -1
            }
        }
    }

    fn memory_report(&self) -> String {
        let usage = self.runtime.memory_usage();
        let limit = match self.shared.heap.limit() {
            Some(limit) => limit.to_string(),
            None => "none".to_string(),
        };
        format!(
            "heap: {} bytes in {} allocations (limit {})\n\
             objects: {} ({} bytes)\n\
             strings: {} ({} bytes)\n\
             atoms: {}\n\
             functions: {}\n\
             pinned values: {}\n\
             linear memory: {} bytes allocated",
            self.shared.heap.used(),
            usage.memory_used_count,
            limit,
            usage.obj_count,
            usage.obj_size,
            usage.str_count,
            usage.str_size,
            usage.atom_count,
            usage.js_func_count,
            self.shared.values.borrow().live(),
            self.shared.memory.borrow().allocated(),
        )
    }
}

impl Drop for NativeInstance {
    fn drop(&mut self) {
        // Engine values must be released before the runtime goes away
        self.shared.clear();
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Default)]
struct ValueSlab {
    slots: Vec<Option<Persistent<Value<'static>>>>,
    free: Vec<usize>,
}

impl ValueSlab {
    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// State reachable from both export calls and engine callbacks
pub(crate) struct NativeShared {
    memory: RefCell<LinearMemory>,
    values: RefCell<ValueSlab>,
    contexts: RefCell<HashMap<u32, Context>>,
    helpers: RefCell<HashMap<(u32, &'static str), Persistent<Function<'static>>>>,
    imports: ImportTable,
    exceptions: RefCell<HashMap<u32, (Persistent<Value<'static>>, i32)>>,
    thrown: RefCell<Option<Persistent<Value<'static>>>>,
    job_exception: RefCell<Option<(Persistent<Value<'static>>, i32)>>,
    trap: RefCell<Option<BackendFault>>,
    next_context: Cell<u32>,
    heap: Rc<HeapState>,
}

impl NativeShared {
    fn new(imports: ImportTable, heap: Rc<HeapState>) -> Self {
        Self {
            memory: RefCell::new(LinearMemory::new()),
            values: RefCell::new(ValueSlab::default()),
            contexts: RefCell::new(HashMap::new()),
            helpers: RefCell::new(HashMap::new()),
            imports,
            exceptions: RefCell::new(HashMap::new()),
            thrown: RefCell::new(None),
            job_exception: RefCell::new(None),
            trap: RefCell::new(None),
            next_context: Cell::new(1),
            heap,
        }
    }

    fn context(&self, id: u32) -> Result<Context, BackendFault> {
        self.contexts
            .borrow()
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendFault::trap("invalid_context", format!("no context {id}")))
    }

    fn remove_context(&self, id: u32) -> Result<(), BackendFault> {
        let helpers: Vec<_> = {
            let mut map = self.helpers.borrow_mut();
            let keys: Vec<_> = map.keys().filter(|(ctx, _)| *ctx == id).copied().collect();
            keys.into_iter().filter_map(|key| map.remove(&key)).collect()
        };
        drop(helpers);
        let exception = self.exceptions.borrow_mut().remove(&id);
        drop(exception);
        let context = self.contexts.borrow_mut().remove(&id);
        match context {
            Some(context) => {
                drop(context);
                Ok(())
            }
            None => Err(BackendFault::trap("invalid_context", format!("no context {id}"))),
        }
    }

    /// Pin a value, returning its non-zero pointer
    pub(crate) fn put<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> i32 {
        let persistent = Persistent::save(ctx, value);
        let mut slab = self.values.borrow_mut();
        let index = match slab.free.pop() {
            Some(index) => {
                slab.slots[index] = Some(persistent);
                index
            }
            None => {
                slab.slots.push(Some(persistent));
                slab.slots.len() - 1
            }
        };
        index as i32 + 1
    }

    /// A new reference to a pinned value
    pub(crate) fn get<'js>(&self, ctx: &Ctx<'js>, ptr: i32) -> Result<Value<'js>, BackendFault> {
        let persistent = {
            let slab = self.values.borrow();
            slot_index(ptr)
                .and_then(|index| slab.slots.get(index))
                .and_then(Option::as_ref)
                .cloned()
        };
        let persistent = persistent.ok_or_else(|| invalid_handle(ptr))?;
        persistent
            .restore(ctx)
            .map_err(|e| BackendFault::trap("invalid_handle", e.to_string()))
    }

    /// Unpin a value and return it
    pub(crate) fn take<'js>(&self, ctx: &Ctx<'js>, ptr: i32) -> Result<Value<'js>, BackendFault> {
        let persistent = self.remove(ptr)?;
        persistent
            .restore(ctx)
            .map_err(|e| BackendFault::trap("invalid_handle", e.to_string()))
    }

    pub(crate) fn release(&self, ptr: i32) -> Result<(), BackendFault> {
        let persistent = self.remove(ptr)?;
        drop(persistent);
        Ok(())
    }

    fn remove(&self, ptr: i32) -> Result<Persistent<Value<'static>>, BackendFault> {
        let mut slab = self.values.borrow_mut();
        let index = slot_index(ptr).ok_or_else(|| invalid_handle(ptr))?;
        let persistent = slab
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| invalid_handle(ptr))?;
        slab.free.push(index);
        Ok(persistent)
    }

    /// Record a fault raised inside an engine callback and turn it into an
    /// exception that unwinds the script
    pub(crate) fn raise(&self, ctx: &Ctx<'_>, fault: BackendFault) -> rquickjs::Error {
        let message = fault.to_string();
        self.trap.borrow_mut().get_or_insert(fault);
        Exception::throw_internal(ctx, &message)
    }

    fn clear(&self) {
        let values = std::mem::take(&mut *self.values.borrow_mut());
        drop(values);
        let exceptions = std::mem::take(&mut *self.exceptions.borrow_mut());
        drop(exceptions);
        let thrown = self.thrown.borrow_mut().take();
        drop(thrown);
        let job_exception = self.job_exception.borrow_mut().take();
        drop(job_exception);
        let helpers = std::mem::take(&mut *self.helpers.borrow_mut());
        drop(helpers);
        let contexts = std::mem::take(&mut *self.contexts.borrow_mut());
        drop(contexts);
    }
}

fn slot_index(ptr: i32) -> Option<usize> {
    (ptr > 0).then(|| ptr as usize - 1)
}

fn invalid_handle(ptr: i32) -> BackendFault {
    BackendFault::trap("invalid_handle", format!("value pointer {ptr} is not live"))
}

/// Context id stamped on the global object at creation
pub(crate) fn context_id(ctx: &Ctx<'_>) -> rquickjs::Result<u32> {
    ctx.globals().get::<_, i32>(CONTEXT_MARKER).map(|id| id as u32)
}

// ============================================================================
// CALLER
// ============================================================================

/// Re-entry handle given to imports; bound to the calling context
pub(crate) struct NativeCaller<'js> {
    ctx: Ctx<'js>,
    ctx_id: u32,
    shared: Shared,
}

impl<'js> NativeCaller<'js> {
    pub(crate) fn new(ctx: Ctx<'js>, ctx_id: u32, shared: Shared) -> Self {
        Self { ctx, ctx_id, shared }
    }
}

impl Caller for NativeCaller<'_> {
    fn call_export(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>, BackendFault> {
        if exports::is_memory_export(name) {
            return exports::memory_export(&self.shared, name, args);
        }
        if exports::is_runtime_export(name) {
            return Err(BackendFault::trap(
                "reentrant_call",
                format!("export `{name}` cannot be called from a host import"),
            ));
        }
        let target = exports::Args::new(name, args).u32()?;
        if target != self.ctx_id {
            return Err(BackendFault::trap(
                "context_mismatch",
                format!("context {target} used while context {} is executing", self.ctx_id),
            ));
        }
        exports::dispatch(&self.ctx, &self.shared, self.ctx_id, name, args)
    }

    fn read_memory(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), BackendFault> {
        self.shared.memory.borrow().read(offset, buf)
    }

    fn write_memory(&mut self, offset: u32, data: &[u8]) -> Result<(), BackendFault> {
        self.shared.memory.borrow_mut().write(offset, data)
    }
}

// ============================================================================
// ENGINE CALLBACKS
// ============================================================================

fn install_rejection_tracker<F>(runtime: &Runtime, tracker: F)
where
    F: for<'js> Fn(Ctx<'js>, Value<'js>, Value<'js>, bool) + 'static,
{
    runtime.set_host_promise_rejection_tracker(Some(Box::new(tracker)));
}

fn track_rejection<'js>(
    shared: &Weak<NativeShared>,
    ctx: Ctx<'js>,
    promise: Value<'js>,
    reason: Value<'js>,
    is_handled: bool,
) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let (Ok(ctx_id), Some(import)) = (context_id(&ctx), shared.imports.get(import::HOST_PROMISE_REJECTION))
    else {
        return;
    };

    let promise = shared.put(&ctx, promise);
    let reason = shared.put(&ctx, reason);
    let args = [
        Val::I32(ctx_id as i32),
        Val::I32(promise),
        Val::I32(reason),
        Val::I32(is_handled as i32),
    ];
    let mut caller = NativeCaller::new(ctx.clone(), ctx_id, shared.clone());
    if let Err(fault) = import(&mut caller, &args) {
        shared.trap.borrow_mut().get_or_insert(fault);
    }
    for ptr in [promise, reason] {
        if let Err(fault) = shared.release(ptr) {
            tracing::warn!("Failed to release rejection value {}: {}", ptr, fault);
        }
    }
}

/// Module names are resolved verbatim; the host registry is flat
struct HostResolver;

impl Resolver for HostResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, _base: &str, name: &str) -> rquickjs::Result<String> {
        Ok(name.to_string())
    }
}

/// Materializes host modules through the `host_load_module` import
struct HostLoader {
    shared: Weak<NativeShared>,
}

impl Loader for HostLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let Some(shared) = self.shared.upgrade() else {
            return Err(Exception::throw_internal(ctx, "engine instance was dropped"));
        };
        let ctx_id = context_id(ctx)?;
        let Some(import) = shared.imports.get(import::HOST_LOAD_MODULE) else {
            return Err(Exception::throw_internal(ctx, "host module loader is not linked"));
        };

        let name_ptr = shared
            .memory
            .borrow_mut()
            .alloc(name.as_bytes())
            .map_err(|fault| shared.raise(ctx, fault))?;
        let args = [
            Val::I32(ctx_id as i32),
            Val::I32(name_ptr as i32),
            Val::I32(name.len() as i32),
        ];
        let mut caller = NativeCaller::new(ctx.clone(), ctx_id, shared.clone());
        let result = import(&mut caller, &args);
        if let Err(fault) = shared.memory.borrow_mut().free(name_ptr) {
            tracing::warn!("Failed to free module name buffer: {}", fault);
        }

        let ptr = match result {
            Ok(values) => values.first().and_then(Val::as_i32).unwrap_or(0),
            Err(fault) => return Err(shared.raise(ctx, fault)),
        };
        if ptr == 0 {
            return Err(Exception::throw_reference(
                ctx,
                &format!("module '{name}' is not registered"),
            ));
        }
        let exports = shared.take(ctx, ptr).map_err(|fault| shared.raise(ctx, fault))?;

        let keys: Vec<String> = match exports.as_object() {
            Some(object) => object.keys::<String>().collect::<rquickjs::Result<_>>()?,
            None => Vec::new(),
        };
        let module = Module::declare(ctx.clone(), name, module_shim(&keys))?;
        module.meta()?.set(META_EXPORTS, exports)?;

        tracing::debug!("Loaded host module '{}' ({} exports)", name, keys.len());
        Ok(module)
    }
}

/// Module source re-exporting a materialized export object. The object is
/// only reachable through the shim's own `import.meta`.
fn module_shim(keys: &[String]) -> String {
    let mut source = format!("const __exports = import.meta.{META_EXPORTS};\n");
    let mut has_default = false;
    for key in keys {
        if key == "default" {
            has_default = true;
            source.push_str("export default __exports[\"default\"];\n");
        } else if is_identifier(key) {
            source.push_str(&format!("export const {key} = __exports[\"{key}\"];\n"));
        }
    }
    if !has_default {
        source.push_str("export default __exports;\n");
    }
    source
}

const RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "delete", "do",
    "else", "enum", "export", "extends", "false", "finally", "for", "function", "if", "implements",
    "import", "in", "instanceof", "interface", "let", "new", "null", "package", "private",
    "protected", "public", "return", "static", "super", "switch", "this", "throw", "true", "try",
    "typeof", "var", "void", "while", "with", "yield",
];

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    first_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !RESERVED.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_shim_exports() {
        let shim = module_shim(&["add".into(), "PI".into(), "not-valid".into()]);
        assert!(shim.starts_with("const __exports = import.meta.hostExports;"));
        assert!(!shim.contains("globalThis"));
        assert!(shim.contains("export const add = __exports[\"add\"];"));
        assert!(shim.contains("export const PI"));
        assert!(!shim.contains("not-valid\"];\nexport"));
        assert!(shim.contains("export default __exports;"));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("fetchData"));
        assert!(is_identifier("_private$"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("class"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_load_module_rejects_bad_image() {
        let mut backend = NativeBackend::new();
        let err = backend.load_module(b"garbage").unwrap_err();
        assert!(matches!(err, BackendFault::Compilation(_)));
    }

    #[test]
    fn test_instantiate_requires_imports() {
        let mut backend = NativeBackend::new();
        let module = backend.load_module(&abi::module_image()).unwrap();
        let err = backend.instantiate(&module, ImportTable::new()).unwrap_err();
        assert!(matches!(err, BackendFault::Instantiation(ref msg) if msg.contains("host_call")));
    }

    #[test]
    fn test_unknown_export_traps() {
        let mut backend = NativeBackend::new();
        let module = backend.load_module(&abi::module_image()).unwrap();
        let mut imports = ImportTable::new();
        for name in import::ALL {
            imports.define(name, |_caller, _args| Ok(vec![Val::I32(0)]));
        }
        let instance = backend.instantiate(&module, imports).unwrap();
        let ctx = backend.call_export(&instance, export::CONTEXT_NEW, &[]).unwrap();
        let err = backend
            .call_export(&instance, "no_such_export", &[ctx[0]])
            .unwrap_err();
        assert!(matches!(err, BackendFault::Trap { ref code, .. } if code == "unknown_export"));
    }
}
