//! Runtime
//!
//! Owns one backend instance of the engine module. Realms created from a
//! runtime share its heap, job queue, interrupt predicate and memory limit.

use std::cell::{Cell, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::abi::{self, import, Abi};
use crate::backend::{BackendFactory, BackendFault, BackendId, Caller, ImportTable, Val};
use crate::bridge;
use crate::config::RuntimeConfig;
use crate::error::{translate_fault, BridgeError, Result};
use crate::host;
use crate::realm::{Realm, RealmShared};
use crate::scope::{BackendSlot, InstanceCaller, Scope};

// ============================================================================
// SHARED STATE
// ============================================================================

/// Routes backend callbacks to the realm owning the context
#[derive(Default)]
pub(crate) struct Dispatch {
    realms: RefCell<HashMap<u32, Weak<RealmShared>>>,
}

impl Dispatch {
    pub(crate) fn register(&self, ctx: u32, realm: Weak<RealmShared>) {
        self.realms.borrow_mut().insert(ctx, realm);
    }

    pub(crate) fn unregister(&self, ctx: u32) {
        self.realms.borrow_mut().remove(&ctx);
    }

    fn realm(&self, ctx: u32) -> std::result::Result<Rc<RealmShared>, BackendFault> {
        self.realms
            .borrow()
            .get(&ctx)
            .and_then(Weak::upgrade)
            .ok_or_else(|| BackendFault::trap("unknown_context", format!("no realm for context {ctx}")))
    }

    fn live(&self) -> Vec<Rc<RealmShared>> {
        self.realms.borrow().values().filter_map(Weak::upgrade).collect()
    }

    fn len(&self) -> usize {
        self.realms.borrow().values().filter(|r| r.strong_count() > 0).count()
    }
}

/// Interrupt predicate plus per-evaluation deadline
#[derive(Default)]
pub(crate) struct InterruptState {
    predicate: RefCell<Option<Box<dyn FnMut() -> bool>>>,
    timeout: Cell<Option<Duration>>,
    deadline: Cell<Option<Instant>>,
    tripped: Cell<bool>,
    checks: Cell<u64>,
}

impl InterruptState {
    /// Start a new evaluation window
    pub(crate) fn begin(&self) {
        self.tripped.set(false);
        self.checks.set(0);
        self.deadline.set(self.timeout.get().map(|timeout| Instant::now() + timeout));
    }

    /// Polled by the backend; `true` aborts the running script
    fn check(&self) -> bool {
        self.checks.set(self.checks.get() + 1);
        if self.tripped.get() {
            return true;
        }
        let expired = self.deadline.get().is_some_and(|deadline| Instant::now() >= deadline);
        let requested = match self.predicate.try_borrow_mut() {
            Ok(mut predicate) => predicate.as_mut().is_some_and(|f| f()),
            Err(_) => false,
        };
        if expired || requested {
            tracing::debug!(expired, "Interrupting script after {} checks", self.checks.get());
            self.tripped.set(true);
        }
        self.tripped.get()
    }

    pub(crate) fn tripped(&self) -> bool {
        self.tripped.get()
    }

    pub(crate) fn checks(&self) -> u64 {
        self.checks.get()
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) id: BackendId,
    pub(crate) engine_version: String,
    pub(crate) backend: RefCell<Option<BackendSlot>>,
    pub(crate) interrupt: Rc<InterruptState>,
    pub(crate) dispatch: Rc<Dispatch>,
}

impl RuntimeInner {
    /// Exclusive access to the backend instance
    pub(crate) fn instance_caller(&self) -> Result<InstanceCaller<'_>> {
        let slot = self.backend.try_borrow_mut().map_err(|_| BridgeError::Reentrant)?;
        let slot = RefMut::filter_map(slot, Option::as_mut).map_err(|_| BridgeError::UseAfterDispose("runtime"))?;
        Ok(InstanceCaller::new(slot))
    }

    pub(crate) fn with_abi<T>(
        &self,
        f: impl FnOnce(&mut Abi<'_>) -> std::result::Result<T, BackendFault>,
    ) -> Result<T> {
        let mut caller = self.instance_caller()?;
        let mut abi = Abi::new(&mut caller);
        f(&mut abi).map_err(|fault| BridgeError::Engine(translate_fault(&self.id, fault)))
    }

    fn with_backend<T>(&self, f: impl FnOnce(&mut BackendSlot) -> T) -> Result<T> {
        let mut slot = self.backend.try_borrow_mut().map_err(|_| BridgeError::Reentrant)?;
        let slot = slot.as_mut().ok_or(BridgeError::UseAfterDispose("runtime"))?;
        Ok(f(slot))
    }
}

// ============================================================================
// HOST IMPORTS
// ============================================================================

fn arg(args: &[Val], index: usize) -> std::result::Result<u32, BackendFault> {
    args.get(index)
        .and_then(Val::as_i32)
        .map(|v| v as u32)
        .ok_or_else(|| BackendFault::trap("bad_signature", format!("missing import argument {index}")))
}

fn host_fault(err: BridgeError) -> BackendFault {
    match err {
        BridgeError::Engine(engine) if engine.trap_code.is_some() => BackendFault::Trap {
            code: engine.trap_code.unwrap_or_default(),
            message: engine.message,
        },
        other => BackendFault::trap("host_error", other.to_string()),
    }
}

/// Run an import body inside a callback scope, flushing releases after
fn in_realm<T>(
    dispatch: &Dispatch,
    caller: &mut dyn Caller,
    ctx: u32,
    f: impl FnOnce(&mut Scope<'_>) -> Result<T>,
) -> std::result::Result<T, BackendFault> {
    let realm = dispatch.realm(ctx)?;
    let mut scope = Scope::callback(caller, &realm);
    let out = f(&mut scope).map_err(host_fault)?;
    scope.flush_releases().map_err(host_fault)?;
    Ok(out)
}

fn host_imports(dispatch: &Rc<Dispatch>) -> ImportTable {
    let mut imports = ImportTable::new();

    let routes = Rc::clone(dispatch);
    imports.define(import::HOST_CALL, move |caller, args| {
        let (ctx, func, this, argc, argv) = (arg(args, 0)?, arg(args, 1)?, arg(args, 2)?, arg(args, 3)?, arg(args, 4)?);
        let raw = in_realm(&routes, caller, ctx, |scope| {
            let argv = if argc == 0 {
                Vec::new()
            } else {
                scope.with_abi(|abi, _| abi.read_i32s(argv, argc))?
            };
            let argv: Vec<u32> = argv.into_iter().map(|v| v as u32).collect();
            host::call(scope, func, this, &argv)
        })?;
        Ok(vec![Val::I32(raw as i32)])
    });

    let routes = Rc::clone(dispatch);
    imports.define(import::HOST_LOAD_MODULE, move |caller, args| {
        let (ctx, ptr, len) = (arg(args, 0)?, arg(args, 1)?, arg(args, 2)?);
        let raw = in_realm(&routes, caller, ctx, |scope| {
            let bytes = scope.with_abi(|abi, _| abi.read_bytes(ptr, len))?;
            let name = String::from_utf8_lossy(&bytes).into_owned();
            let exports = scope.realm().modules.borrow().get(&name).cloned();
            match exports {
                Some(exports) => {
                    tracing::debug!(realm = %scope.realm_id(), module = %name, "Loading host module");
                    host::materialize(scope, &exports)
                }
                None => Ok(0),
            }
        })?;
        Ok(vec![Val::I32(raw as i32)])
    });

    let routes = Rc::clone(dispatch);
    imports.define(import::HOST_PROMISE_REJECTION, move |caller, args| {
        let (ctx, promise, reason, handled) = (arg(args, 0)?, arg(args, 1)?, arg(args, 2)?, arg(args, 3)?);
        in_realm(&routes, caller, ctx, |scope| {
            bridge::on_rejection(scope, promise, reason, handled != 0)
        })?;
        Ok(Vec::new())
    });

    imports
}

// ============================================================================
// RUNTIME
// ============================================================================

/// One engine instance and the realms created from it
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Load and instantiate the engine module on a backend from `factory`
    pub fn initialize(factory: &dyn BackendFactory, config: RuntimeConfig) -> Result<Self> {
        let mut backend = factory.create().map_err(|fault| Self::startup_fault(None, fault))?;
        let id = backend.id().clone();

        let image = config.module_image.clone().unwrap_or_else(|| factory.module_image());
        let module = backend
            .load_module(&image)
            .map_err(|fault| Self::startup_fault(Some(&id), fault))?;

        let dispatch = Rc::new(Dispatch::default());
        let instance = backend
            .instantiate(&module, host_imports(&dispatch))
            .map_err(|fault| Self::startup_fault(Some(&id), fault))?;

        let interrupt = Rc::new(InterruptState::default());
        interrupt.timeout.set(config.eval_timeout());
        let check = Rc::clone(&interrupt);
        backend.set_interrupt_check(Some(Box::new(move || check.check())));
        backend.set_memory_limit(config.memory_limit);

        let mut inner = RuntimeInner {
            id,
            engine_version: String::new(),
            backend: RefCell::new(Some(BackendSlot { backend, instance })),
            interrupt,
            dispatch,
        };
        inner.engine_version = inner.with_abi(|abi| abi.engine_version())?;
        inner.with_abi(|abi| {
            if let Some(bytes) = config.max_stack_size {
                abi.set_max_stack_size(bytes)?;
            }
            if let Some(bytes) = config.gc_threshold {
                abi.set_gc_threshold(bytes)?;
            }
            Ok(())
        })?;

        tracing::info!(
            backend = %inner.id,
            engine = %inner.engine_version,
            abi = abi::ABI_VERSION,
            "Runtime initialized"
        );
        Ok(Self { inner: Rc::new(inner) })
    }

    /// Runtime over the bundled native backend
    #[cfg(feature = "native")]
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    #[cfg(feature = "native")]
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        Self::initialize(&crate::backend::native::NativeFactory, config)
    }

    fn startup_fault(id: Option<&BackendId>, fault: BackendFault) -> BridgeError {
        let unknown = BackendId::new("unknown", "0");
        let id = id.unwrap_or(&unknown);
        tracing::error!(backend = %id, "Runtime initialization failed: {}", fault);
        BridgeError::Engine(translate_fault(id, fault))
    }

    /// Create an isolated realm with its own global object
    pub fn create_realm(&self) -> Result<Realm> {
        Realm::create(&self.inner)
    }

    /// Poll `predicate` during execution; returning `true` aborts the script
    pub fn enable_interrupt_handler(&self, predicate: impl FnMut() -> bool + 'static) -> Result<()> {
        self.inner.with_backend(|_| ())?;
        *self.inner.interrupt.predicate.borrow_mut() = Some(Box::new(predicate));
        Ok(())
    }

    pub fn disable_interrupt_handler(&self) -> Result<()> {
        self.inner.with_backend(|_| ())?;
        self.inner.interrupt.predicate.borrow_mut().take();
        Ok(())
    }

    /// Wall-clock budget applied to every top-level evaluation
    pub fn set_eval_timeout(&self, timeout: Option<Duration>) {
        self.inner.interrupt.timeout.set(timeout);
    }

    /// Cap the heap; `None` removes the limit
    pub fn set_memory_limit(&self, bytes: Option<usize>) -> Result<()> {
        self.inner.with_backend(|slot| slot.backend.set_memory_limit(bytes))
    }

    pub fn set_max_stack_size(&self, bytes: usize) -> Result<()> {
        self.inner.with_abi(|abi| abi.set_max_stack_size(bytes))
    }

    pub fn run_gc(&self) -> Result<()> {
        self.inner.with_abi(|abi| abi.run_gc())
    }

    /// Human-readable heap statistics
    pub fn memory_usage_report(&self) -> Result<String> {
        self.inner.with_abi(|abi| abi.memory_usage())
    }

    /// Whether the engine job queue holds work
    pub fn is_job_pending(&self) -> Result<bool> {
        self.inner.with_abi(|abi| abi.job_pending())
    }

    pub fn backend_id(&self) -> &BackendId {
        &self.inner.id
    }

    pub fn engine_version(&self) -> &str {
        &self.inner.engine_version
    }

    /// Realms that are still alive
    pub fn realm_count(&self) -> usize {
        self.inner.dispatch.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.backend.try_borrow().is_ok_and(|slot| slot.is_none())
    }

    /// Dispose every realm, then the backend. Safe to call repeatedly.
    pub fn dispose(&self) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        self.inner.with_backend(|_| ())?;
        let mut first_error = None;
        for realm in self.inner.dispatch.live() {
            if let Err(err) = realm.dispose() {
                tracing::warn!(realm = %realm.id, "Realm dispose failed: {}", err);
                first_error.get_or_insert(err);
            }
        }
        self.inner.backend.borrow_mut().take();
        tracing::info!(backend = %self.inner.id, "Runtime disposed");
        first_error.map_or(Ok(()), Err)
    }

    /// Let every realm finish its host tasks, then dispose
    pub async fn shutdown_async(self) -> Result<()> {
        for realm in self.inner.dispatch.live() {
            if realm.disposed.get() {
                continue;
            }
            bridge::run_until_idle(&realm).await?;
        }
        self.dispose()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            tracing::warn!("Runtime dropped with errors: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_interrupt_state_predicate() {
        let state = InterruptState::default();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        *state.predicate.borrow_mut() = Some(Box::new(move || {
            counter.set(counter.get() + 1);
            counter.get() >= 3
        }));

        state.begin();
        assert!(!state.check());
        assert!(!state.check());
        assert!(state.check());
        // Stays tripped without asking again
        assert!(state.check());
        assert_eq!(calls.get(), 3);
        assert!(state.tripped());

        state.begin();
        assert!(!state.tripped());
    }

    #[test]
    fn test_interrupt_state_deadline() {
        let state = InterruptState::default();
        state.timeout.set(Some(Duration::ZERO));
        state.begin();
        assert!(state.check());
    }

    #[test]
    fn test_dispatch_unknown_context() {
        let dispatch = Dispatch::default();
        assert!(dispatch.realm(7).is_err());
        assert_eq!(dispatch.len(), 0);
    }
}
