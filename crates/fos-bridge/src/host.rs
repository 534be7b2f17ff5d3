//! Host functions and bindings
//!
//! Host closures are registered per realm and reached from script through
//! the `host_call` import. A failing closure throws a script `Error` whose
//! `cause` chain mirrors the `anyhow` context chain.

use std::future::Future;
use std::rc::Rc;

use crate::bridge::Completion;
use crate::error::{BridgeError, Result};
use crate::handle::ValueHandle;
use crate::marshal::{FromScript, HostValue, IntoScript};
use crate::realm::RealmShared;
use crate::scope::{AsScope, Scope};

/// Name given to errors thrown on behalf of a failing host function
pub const HOST_ERROR_NAME: &str = "HostError";

pub(crate) type SyncFn = Rc<dyn Fn(&mut Scope<'_>, &CallArgs) -> anyhow::Result<ValueHandle>>;
pub(crate) type AsyncFn = Rc<dyn Fn(Vec<HostValue>) -> HostFuture>;
pub(crate) type HostFuture = smol::future::BoxedLocal<anyhow::Result<HostValue>>;

#[derive(Clone)]
pub(crate) enum HostFunction {
    Sync(SyncFn),
    Async(AsyncFn),
}

/// Arguments of a synchronous host call
pub struct CallArgs {
    this: ValueHandle,
    args: Vec<ValueHandle>,
}

impl CallArgs {
    pub fn this(&self) -> &ValueHandle {
        &self.this
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ValueHandle> {
        self.args.get(index)
    }

    pub fn all(&self) -> &[ValueHandle] {
        &self.args
    }

    /// Marshal argument `index`; a missing argument reads as `undefined`
    pub fn arg<T: FromScript>(&self, cx: &mut impl AsScope, index: usize) -> anyhow::Result<T> {
        let mut scope = cx.as_scope()?;
        match self.args.get(index) {
            Some(value) => Ok(value.to::<T>(&mut scope)?),
            None => {
                let undefined = scope.new_undefined()?;
                let result = undefined.to::<T>(&mut scope);
                scope.dispose(&undefined)?;
                Ok(result.map_err(|err| anyhow::anyhow!("argument {index}: {err}"))?)
            }
        }
    }

    /// Dispose whatever the host function left alive
    fn release(self, scope: &mut Scope<'_>) -> Result<()> {
        for value in std::iter::once(&self.this).chain(&self.args) {
            match scope.dispose(value) {
                Ok(()) | Err(BridgeError::UseAfterDispose(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

// ============================================================================
// BINDINGS
// ============================================================================

enum Binding {
    Value(HostValue),
    Function(HostFunction),
    Namespace(Bindings),
}

/// Builder for globals and host modules
#[derive(Default)]
pub struct Bindings {
    entries: Vec<(String, Binding)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous host function
    pub fn function<F, R>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&mut Scope<'_>, &CallArgs) -> anyhow::Result<R> + 'static,
        R: IntoScript,
    {
        let wrapped: SyncFn = Rc::new(move |scope: &mut Scope<'_>, args: &CallArgs| {
            let value = f(scope, args)?;
            Ok(value.into_script(scope)?)
        });
        self.entries.push((name.to_string(), Binding::Function(HostFunction::Sync(wrapped))));
        self
    }

    /// Register an async host function; script receives a promise
    pub fn function_async<F, Fut, R>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(Vec<HostValue>) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<R>> + 'static,
        R: Into<HostValue>,
    {
        let wrapped: AsyncFn = Rc::new(move |args: Vec<HostValue>| -> HostFuture {
            let future = f(args);
            Box::pin(async move { future.await.map(Into::into) })
        });
        self.entries.push((name.to_string(), Binding::Function(HostFunction::Async(wrapped))));
        self
    }

    /// Register a plain data value
    pub fn value(&mut self, name: &str, value: impl Into<HostValue>) -> &mut Self {
        self.entries.push((name.to_string(), Binding::Value(value.into())));
        self
    }

    /// Register a nested object of bindings
    pub fn namespace(&mut self, name: &str, build: impl FnOnce(&mut Bindings)) -> &mut Self {
        let mut nested = Bindings::new();
        build(&mut nested);
        self.entries.push((name.to_string(), Binding::Namespace(nested)));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A registered binding, with functions resolved to registry ids
#[derive(Debug, Clone)]
pub(crate) enum Export {
    Value(HostValue),
    Function { id: u32, name: String },
    Namespace(Vec<(String, Export)>),
}

/// Move functions into the realm registry
pub(crate) fn register(realm: &RealmShared, bindings: Bindings) -> Vec<(String, Export)> {
    bindings
        .entries
        .into_iter()
        .map(|(name, binding)| {
            let export = match binding {
                Binding::Value(value) => Export::Value(value),
                Binding::Function(function) => {
                    let mut functions = realm.functions.borrow_mut();
                    functions.push(function);
                    Export::Function {
                        id: functions.len() as u32 - 1,
                        name: name.clone(),
                    }
                }
                Binding::Namespace(nested) => Export::Namespace(register(realm, nested)),
            };
            (name, export)
        })
        .collect()
}

/// Build the script value of one export
pub(crate) fn export_raw(scope: &mut Scope<'_>, export: &Export) -> Result<u32> {
    match export {
        Export::Value(value) => scope.value_raw(value),
        Export::Function { id, name } => {
            let raw = scope.with_abi(|abi, ctx| abi.new_function(ctx, *id, name))?;
            if raw == 0 {
                return Err(scope.exception());
            }
            Ok(raw)
        }
        Export::Namespace(entries) => materialize(scope, entries),
    }
}

/// Build an object holding every export
pub(crate) fn materialize(scope: &mut Scope<'_>, exports: &[(String, Export)]) -> Result<u32> {
    let object = scope.with_abi(|abi, ctx| abi.new_object(ctx))?;
    for (name, export) in exports {
        let value = match export_raw(scope, export) {
            Ok(value) => value,
            Err(err) => {
                scope.free_raw(object)?;
                return Err(err);
            }
        };
        scope.store(object, name, value)?;
    }
    Ok(object)
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Run host function `func_id` for a `host_call` import.
///
/// `this` and `argv` are borrowed pointers. Returns an owned result pointer,
/// or `0` after throwing.
pub(crate) fn call(scope: &mut Scope<'_>, func_id: u32, this: u32, argv: &[u32]) -> Result<u32> {
    let function = scope.realm().functions.borrow().get(func_id as usize).cloned();
    let Some(function) = function else {
        let err = anyhow::anyhow!("host function #{func_id} is not registered");
        return throw(scope, &err);
    };

    let this = scope.wrap_dup(this)?;
    let args = argv
        .iter()
        .map(|raw| scope.wrap_dup(*raw))
        .collect::<Result<Vec<_>>>()?;
    let call_args = CallArgs { this, args };

    let outcome = match function {
        HostFunction::Sync(f) => {
            let result = f(scope, &call_args);
            call_args.release(scope)?;
            match result {
                Ok(value) => Ok(scope.into_raw(value)?),
                Err(err) => Err(err),
            }
        }
        HostFunction::Async(f) => {
            let values = call_args
                .all()
                .iter()
                .map(|arg| scope.snapshot(arg))
                .collect::<Result<Vec<_>>>();
            call_args.release(scope)?;
            match values {
                Ok(values) => Ok(spawn_promise(scope, f(values))?),
                Err(err) => Err(anyhow::Error::new(err)),
            }
        }
    };

    match outcome {
        Ok(raw) => Ok(raw),
        Err(err) => {
            // Uncatchable engine failures must not be rethrown as script errors
            if let Some(bridge) = err.downcast_ref::<BridgeError>() {
                if bridge.is_interrupted() || bridge.as_engine().is_some_and(|e| e.is_memory_limit()) {
                    return Err(bridge.clone());
                }
            }
            tracing::debug!(realm = %scope.realm_id(), "Host function #{} failed: {:#}", func_id, err);
            throw(scope, &err)
        }
    }
}

fn throw(scope: &mut Scope<'_>, err: &anyhow::Error) -> Result<u32> {
    let error = error_raw(scope, err)?;
    scope.with_abi(|abi, ctx| abi.throw(ctx, error))?;
    scope.free_raw(error)?;
    Ok(0)
}

/// A script `Error` for `err`, with each context layer as a nested `cause`
pub(crate) fn error_raw(scope: &mut Scope<'_>, err: &anyhow::Error) -> Result<u32> {
    let messages: Vec<String> = err.chain().map(ToString::to_string).collect();
    let mut inner: Option<u32> = None;
    for message in messages.iter().rev() {
        let error = scope.with_abi(|abi, ctx| abi.new_error(ctx, message))?;
        if error == 0 {
            if let Some(inner) = inner {
                scope.free_raw(inner)?;
            }
            return Err(scope.exception());
        }
        let name = scope.value_raw(&HostValue::from(HOST_ERROR_NAME))?;
        scope.store(error, "name", name)?;
        if let Some(cause) = inner.take() {
            scope.store(error, "cause", cause)?;
        }
        inner = Some(error);
    }
    match inner {
        Some(error) => Ok(error),
        None => Err(scope.exception()),
    }
}

/// Queue `future` and return the promise it will settle
fn spawn_promise(scope: &mut Scope<'_>, future: HostFuture) -> Result<u32> {
    let (promise, resolve, reject) = scope.with_abi(|abi, ctx| abi.new_promise(ctx))?;
    if promise == 0 {
        return Err(scope.exception());
    }
    let resolve = scope.wrap(resolve)?;
    let reject = scope.wrap(reject)?;
    let id = scope
        .realm()
        .tasks
        .borrow_mut()
        .push(future, Completion::Promise { resolve, reject });
    tracing::trace!(realm = %scope.realm_id(), task = id, "Queued async host call");
    Ok(promise)
}
