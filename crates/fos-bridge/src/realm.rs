//! Realms
//!
//! A realm is one engine context: its own global object, host bindings,
//! host modules, pinned handles and pending host tasks. Every entry point
//! opens a [`Scope`]; nested entry from inside a host function fails with
//! [`BridgeError::Reentrant`] instead of corrupting engine state.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde::Serialize;

use crate::bridge::{self, DrainReport, RejectionCallback, RejectionTracker, TaskQueue};
use crate::bytecode::CompiledBytecode;
use crate::config::EvalOptions;
use crate::error::{BridgeError, Result};
use crate::handle::{HandleId, HandleTable, RealmId, ValueHandle};
use crate::host::{self, Bindings, Export, HostFunction};
use crate::marshal::{FromScript, HostValue, IntoScript};
use crate::runtime::RuntimeInner;
use crate::scope::{AsScope, Scope};

pub(crate) struct RealmShared {
    pub(crate) id: RealmId,
    pub(crate) ctx: u32,
    pub(crate) runtime: Rc<RuntimeInner>,
    pub(crate) handles: RefCell<HandleTable>,
    pub(crate) pending_release: RefCell<Vec<HandleId>>,
    pub(crate) functions: RefCell<Vec<HostFunction>>,
    pub(crate) modules: RefCell<HashMap<String, Vec<(String, Export)>>>,
    pub(crate) tasks: RefCell<TaskQueue>,
    pub(crate) rejections: RefCell<RejectionTracker>,
    pub(crate) on_rejection: RefCell<Option<RejectionCallback>>,
    pub(crate) evaluated: Cell<bool>,
    pub(crate) disposed: Cell<bool>,
}

impl RealmShared {
    /// Queue a dropped handle for release on the next access
    pub(crate) fn defer_release(&self, id: HandleId) {
        if self.disposed.get() {
            return;
        }
        let live = match self.handles.try_borrow() {
            Ok(handles) => handles.get(id.index, id.generation).is_some(),
            Err(_) => true,
        };
        if live {
            if let Ok(mut pending) = self.pending_release.try_borrow_mut() {
                pending.push(id);
            }
        }
    }

    /// Free every pinned value and the context itself
    pub(crate) fn dispose(self: &Rc<Self>) -> Result<()> {
        if self.disposed.get() {
            return Ok(());
        }
        let mut scope = match Scope::open(self) {
            Ok(scope) => Some(scope),
            Err(BridgeError::UseAfterDispose(_)) => None,
            Err(err) => return Err(err),
        };
        self.disposed.set(true);
        self.runtime.dispatch.unregister(self.ctx);

        let tasks = self.tasks.borrow_mut().clear();
        let abandoned = tasks.0.len() + tasks.1.len();
        drop(tasks);
        let rejections = std::mem::take(&mut *self.rejections.borrow_mut());
        drop(rejections.into_handles());
        self.on_rejection.borrow_mut().take();
        self.functions.borrow_mut().clear();
        self.modules.borrow_mut().clear();
        self.pending_release.borrow_mut().clear();

        let raws = self.handles.borrow_mut().drain();
        let leaked = raws.len();
        let mut outcome = Ok(());
        if let Some(scope) = scope.as_mut() {
            for raw in raws {
                if let Err(err) = scope.free_raw(raw) {
                    outcome = Err(err);
                    break;
                }
            }
            if outcome.is_ok() {
                outcome = scope.with_abi(|abi, ctx| abi.context_free(ctx));
            }
        }
        tracing::debug!(
            realm = %self.id,
            handles = leaked,
            tasks = abandoned,
            "Realm disposed"
        );
        outcome
    }
}

// ============================================================================
// REALM
// ============================================================================

/// An isolated script context
pub struct Realm {
    shared: Rc<RealmShared>,
}

impl Realm {
    pub(crate) fn create(runtime: &Rc<RuntimeInner>) -> Result<Self> {
        let ctx = runtime.with_abi(|abi| abi.context_new())?;
        let shared = Rc::new(RealmShared {
            id: RealmId::next(),
            ctx,
            runtime: Rc::clone(runtime),
            handles: RefCell::default(),
            pending_release: RefCell::default(),
            functions: RefCell::default(),
            modules: RefCell::default(),
            tasks: RefCell::default(),
            rejections: RefCell::default(),
            on_rejection: RefCell::default(),
            evaluated: Cell::new(false),
            disposed: Cell::new(false),
        });
        runtime.dispatch.register(ctx, Rc::downgrade(&shared));
        tracing::debug!(realm = %shared.id, ctx, "Realm created");
        Ok(Self { shared })
    }

    pub fn id(&self) -> RealmId {
        self.shared.id
    }

    /// Open a scope for direct handle work
    pub fn scope(&mut self) -> Result<Scope<'_>> {
        Scope::open(&self.shared)
    }

    /// Run `f` inside a scope
    pub fn with<R>(&mut self, f: impl FnOnce(&mut Scope<'_>) -> Result<R>) -> Result<R> {
        let mut scope = Scope::open(&self.shared)?;
        f(&mut scope)
    }

    /// Install host bindings on the global object.
    ///
    /// Only allowed before the first evaluation.
    pub fn with_globals(&mut self, build: impl FnOnce(&mut Bindings)) -> Result<()> {
        if self.shared.evaluated.get() {
            return Err(BridgeError::GlobalsSealed);
        }
        let mut bindings = Bindings::new();
        build(&mut bindings);
        self.install(bindings)
    }

    /// Define `bindings` on the global object
    pub(crate) fn install(&mut self, bindings: Bindings) -> Result<()> {
        let mut scope = Scope::open(&self.shared)?;
        let exports = host::register(&self.shared, bindings);

        let global = scope.with_abi(|abi, ctx| abi.global(ctx))?;
        let mut outcome = Ok(());
        for (name, export) in &exports {
            outcome = host::export_raw(&mut scope, export).and_then(|value| scope.store(global, name, value));
            if outcome.is_err() {
                break;
            }
        }
        scope.free_raw(global)?;
        tracing::debug!(realm = %self.shared.id, count = exports.len(), "Globals installed");
        outcome
    }

    pub fn install_console(&mut self) -> Result<()> {
        crate::console::install_console(self)
    }

    pub fn install_timers(&mut self) -> Result<()> {
        crate::timers::install_timers(self)
    }

    /// Make `name` importable from modules evaluated in this realm
    pub fn register_module(&mut self, name: &str, build: impl FnOnce(&mut Bindings)) -> Result<()> {
        if self.shared.disposed.get() {
            return Err(BridgeError::UseAfterDispose("realm"));
        }
        let mut bindings = Bindings::new();
        build(&mut bindings);
        let exports = host::register(&self.shared, bindings);
        tracing::debug!(realm = %self.shared.id, module = name, "Host module registered");
        self.shared.modules.borrow_mut().insert(name.to_string(), exports);
        Ok(())
    }

    /// Evaluate source and return its completion value
    pub fn eval_code(&mut self, source: &str, options: EvalOptions) -> Result<ValueHandle> {
        let mut scope = Scope::open(&self.shared)?;
        self.shared.evaluated.set(true);
        tracing::trace!(realm = %self.shared.id, filename = %options.filename, "Evaluating {} bytes", source.len());
        scope.eval(source, &options)
    }

    /// Evaluate a script and marshal its result
    pub fn eval<T: FromScript>(&mut self, source: &str) -> Result<T> {
        let value = self.eval_code(source, EvalOptions::script())?;
        let mut scope = Scope::open(&self.shared)?;
        let out = T::from_script(&mut scope, &value);
        scope.dispose(&value)?;
        out
    }

    /// Evaluate, then drive jobs and host tasks until the result settles
    pub async fn eval_async<T: FromScript>(&mut self, source: &str, options: EvalOptions) -> Result<T> {
        let value = self.eval_code(source, options)?;
        bridge::resolve(&self.shared, value).await
    }

    /// Await a value produced earlier; non-promises resolve immediately
    pub async fn resolve<T: FromScript>(&mut self, value: ValueHandle) -> Result<T> {
        bridge::resolve(&self.shared, value).await
    }

    /// Call a function value with host arguments
    pub fn call(&mut self, func: &ValueHandle, args: &[HostValue]) -> Result<ValueHandle> {
        let mut scope = Scope::open(&self.shared)?;
        let args = args
            .iter()
            .map(|arg| scope.new_value(arg))
            .collect::<Result<Vec<_>>>()?;
        let result = func.invoke(&mut scope, None, &args);
        for arg in &args {
            scope.dispose(arg)?;
        }
        result
    }

    /// Compile to an engine-specific bytecode envelope without running it
    pub fn compile(&mut self, source: &str, options: &EvalOptions) -> Result<CompiledBytecode> {
        let mut scope = Scope::open(&self.shared)?;
        let payload = scope.compile(source, &options.filename, options.flags(source))?;
        let runtime = &self.shared.runtime;
        CompiledBytecode::seal(&runtime.id, &runtime.engine_version, &payload)
            .map_err(|reason| scope.compilation_error(reason))
    }

    /// Run bytecode produced by [`Realm::compile`] on a matching engine
    pub fn evaluate_compiled(&mut self, bytecode: &CompiledBytecode) -> Result<ValueHandle> {
        let mut scope = Scope::open(&self.shared)?;
        let runtime = &self.shared.runtime;
        let payload = bytecode
            .open(&runtime.id, &runtime.engine_version)
            .map_err(|reason| scope.compilation_error(reason))?;
        self.shared.evaluated.set(true);
        scope.eval_compiled(payload)
    }

    pub fn global(&mut self) -> Result<ValueHandle> {
        Scope::open(&self.shared)?.global()
    }

    pub fn new_value(&mut self, value: impl IntoScript) -> Result<ValueHandle> {
        value.into_script(&mut Scope::open(&self.shared)?)
    }

    pub fn new_record<T: Serialize>(&mut self, record: &T) -> Result<ValueHandle> {
        Scope::open(&self.shared)?.new_record(record)
    }

    /// Diagnostic rendering of a value
    pub fn dump(&mut self, value: &ValueHandle) -> Result<String> {
        Scope::open(&self.shared)?.dump(value)
    }

    pub fn to_json(&mut self, value: &ValueHandle, indent: u32) -> Result<String> {
        Scope::open(&self.shared)?.to_json(value, indent)
    }

    /// Run everything that is ready without blocking
    pub fn drain(&mut self) -> Result<DrainReport> {
        bridge::drain(&self.shared)
    }

    /// Drain until no host task remains
    pub async fn run_until_idle(&mut self) -> Result<DrainReport> {
        bridge::run_until_idle(&self.shared).await
    }

    /// Observe rejections nobody handled by the end of a drain pass.
    ///
    /// The flag is `true` when a handler was attached after the report.
    pub fn on_unhandled_rejection(&mut self, callback: impl Fn(&mut Scope<'_>, &ValueHandle, bool) + 'static) {
        *self.shared.on_rejection.borrow_mut() = Some(Rc::new(callback));
    }

    /// Pinned values not yet released
    pub fn live_handles(&self) -> usize {
        self.shared.handles.borrow().live()
    }

    /// Host tasks not yet delivered to script
    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    /// Rejections waiting for the next drain pass
    pub fn unhandled_rejections(&self) -> usize {
        self.shared.rejections.borrow().unhandled_count()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.get()
    }

    /// Release the context and everything it pins. Idempotent.
    pub fn dispose(&mut self) -> Result<()> {
        self.shared.dispose()
    }
}

impl AsScope for Realm {
    fn as_scope(&mut self) -> Result<Scope<'_>> {
        Scope::open(&self.shared)
    }
}

impl Drop for Realm {
    fn drop(&mut self) {
        if let Err(err) = self.shared.dispose() {
            tracing::warn!(realm = %self.shared.id, "Realm dropped with errors: {}", err);
        }
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.shared.id)
            .field("ctx", &self.shared.ctx)
            .field("disposed", &self.shared.disposed.get())
            .finish()
    }
}
