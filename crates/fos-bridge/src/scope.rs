//! Realm access scopes
//!
//! A [`Scope`] is the exclusive right to talk to a realm's backend. Top-level
//! scopes hold the runtime's backend cell for their lifetime; callback scopes
//! borrow the [`Caller`] handed to a host import. Opening a second top-level
//! scope while one is active fails with [`BridgeError::Reentrant`].

use std::cell::RefMut;
use std::rc::Rc;

use serde::Serialize;

use crate::abi::{self, Abi, Equality, EvalFlags};
use crate::backend::{Backend, BackendFault, BackendId, Caller, InstanceHandle, Val};
use crate::config::EvalOptions;
use crate::error::{
    translate_exception, translate_fault, BridgeError, FailureKind, Result, RuntimeCause,
    ScriptError, TranslatedError,
};
use crate::handle::{HandleId, PromiseState, ScriptType, ValueHandle};
use crate::marshal::HostValue;
use crate::realm::RealmShared;

/// Nesting limit for snapshots and cause chains
pub(crate) const MAX_DEPTH: usize = 64;
const MAX_CAUSE_DEPTH: usize = 8;

/// Anything that can hand out a [`Scope`]: a realm, or a scope itself
pub trait AsScope {
    fn as_scope(&mut self) -> Result<Scope<'_>>;
}

/// The runtime's backend and its single instance
pub(crate) struct BackendSlot {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) instance: InstanceHandle,
}

/// Top-level [`Caller`] over the borrowed backend slot
pub(crate) struct InstanceCaller<'a> {
    slot: RefMut<'a, BackendSlot>,
}

impl<'a> InstanceCaller<'a> {
    pub(crate) fn new(slot: RefMut<'a, BackendSlot>) -> Self {
        Self { slot }
    }
}

impl Caller for InstanceCaller<'_> {
    fn call_export(&mut self, name: &str, args: &[Val]) -> std::result::Result<Vec<Val>, BackendFault> {
        let BackendSlot { backend, instance } = &mut *self.slot;
        backend.call_export(instance, name, args)
    }

    fn read_memory(&mut self, offset: u32, buf: &mut [u8]) -> std::result::Result<(), BackendFault> {
        let BackendSlot { backend, instance } = &*self.slot;
        backend.read_memory(instance, offset, buf)
    }

    fn write_memory(&mut self, offset: u32, data: &[u8]) -> std::result::Result<(), BackendFault> {
        let BackendSlot { backend, instance } = &mut *self.slot;
        backend.write_memory(instance, offset, data)
    }
}

enum Access<'a> {
    TopLevel(InstanceCaller<'a>),
    Callback(&'a mut dyn Caller),
}

/// Exclusive access to one realm
pub struct Scope<'a> {
    access: Access<'a>,
    realm: &'a Rc<RealmShared>,
}

impl<'a> Scope<'a> {
    /// Open a top-level scope, starting a fresh evaluation window
    pub(crate) fn open(realm: &'a Rc<RealmShared>) -> Result<Self> {
        if realm.disposed.get() {
            return Err(BridgeError::UseAfterDispose("realm"));
        }
        let caller = realm.runtime.instance_caller()?;
        realm.runtime.interrupt.begin();
        let mut scope = Scope {
            access: Access::TopLevel(caller),
            realm,
        };
        scope.flush_releases()?;
        Ok(scope)
    }

    /// Scope for a host import invoked while the backend is executing
    pub(crate) fn callback(caller: &'a mut dyn Caller, realm: &'a Rc<RealmShared>) -> Self {
        Scope {
            access: Access::Callback(caller),
            realm,
        }
    }

    fn reborrow(&mut self) -> Scope<'_> {
        let caller: &mut dyn Caller = match &mut self.access {
            Access::TopLevel(caller) => caller,
            Access::Callback(caller) => &mut **caller,
        };
        Scope {
            access: Access::Callback(caller),
            realm: self.realm,
        }
    }

    pub(crate) fn realm(&self) -> &Rc<RealmShared> {
        self.realm
    }

    pub fn realm_id(&self) -> crate::handle::RealmId {
        self.realm.id
    }

    pub(crate) fn backend_id(&self) -> &BackendId {
        &self.realm.runtime.id
    }

    /// Live handles currently pinned by the realm
    pub fn live_handles(&self) -> usize {
        self.realm.handles.borrow().live()
    }

    /// Run ABI calls against this realm's context
    pub(crate) fn with_abi<T>(
        &mut self,
        f: impl FnOnce(&mut Abi<'_>, u32) -> std::result::Result<T, BackendFault>,
    ) -> Result<T> {
        let Scope { access, realm } = self;
        let caller: &mut dyn Caller = match access {
            Access::TopLevel(caller) => caller,
            Access::Callback(caller) => &mut **caller,
        };
        let mut abi = Abi::new(caller);
        f(&mut abi, realm.ctx).map_err(|fault| BridgeError::Engine(translate_fault(&realm.runtime.id, fault)))
    }

    // ========================================================================
    // HANDLE TABLE
    // ========================================================================

    /// Track an owned pointer; `0` means the last call raised an exception
    pub(crate) fn adopt(&mut self, raw: u32) -> Result<ValueHandle> {
        if raw == 0 {
            return Err(self.exception());
        }
        self.wrap(raw)
    }

    pub(crate) fn wrap(&mut self, raw: u32) -> Result<ValueHandle> {
        let code = match self.with_abi(|abi, ctx| abi.tag(ctx, raw)) {
            Ok(code) => code,
            Err(err) => {
                let _ = self.free_raw(raw);
                return Err(err);
            }
        };
        let (index, generation) = self.realm.handles.borrow_mut().insert(raw);
        let id = HandleId {
            realm: self.realm.id,
            index,
            generation,
        };
        Ok(ValueHandle::new(id, ScriptType::from_tag(code), Rc::downgrade(self.realm)))
    }

    /// Track a new reference to a borrowed pointer
    pub(crate) fn wrap_dup(&mut self, raw: u32) -> Result<ValueHandle> {
        let owned = self.with_abi(|abi, ctx| abi.dup(ctx, raw))?;
        self.wrap(owned)
    }

    /// Pointer behind a live handle of this realm
    pub(crate) fn raw(&self, handle: &ValueHandle) -> Result<u32> {
        if handle.id.realm != self.realm.id {
            return Err(BridgeError::RealmMismatch {
                expected: self.realm.id,
                found: handle.id.realm,
            });
        }
        self.realm
            .handles
            .borrow()
            .get(handle.id.index, handle.id.generation)
            .ok_or(BridgeError::UseAfterDispose("value handle"))
    }

    /// Untrack a handle and hand its pointer over to the caller
    pub(crate) fn into_raw(&mut self, handle: ValueHandle) -> Result<u32> {
        self.raw(&handle)?;
        self.realm
            .handles
            .borrow_mut()
            .remove(handle.id.index, handle.id.generation)
            .ok_or(BridgeError::UseAfterDispose("value handle"))
    }

    pub(crate) fn dispose(&mut self, handle: &ValueHandle) -> Result<()> {
        self.raw(handle)?;
        let raw = self
            .realm
            .handles
            .borrow_mut()
            .remove(handle.id.index, handle.id.generation)
            .ok_or(BridgeError::UseAfterDispose("value handle"))?;
        self.free_raw(raw)
    }

    pub(crate) fn free_raw(&mut self, raw: u32) -> Result<()> {
        if raw == 0 {
            return Ok(());
        }
        self.with_abi(|abi, ctx| abi.free_value(ctx, raw))
    }

    /// Release handles that were dropped without being disposed
    pub(crate) fn flush_releases(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut *self.realm.pending_release.borrow_mut());
        for id in pending {
            let raw = self.realm.handles.borrow_mut().remove(id.index, id.generation);
            if let Some(raw) = raw {
                self.free_raw(raw)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // EXCEPTIONS
    // ========================================================================

    /// Translate the pending exception of this realm's context
    pub(crate) fn exception(&mut self) -> BridgeError {
        match self.take_exception() {
            Ok(err) => err,
            Err(err) => err,
        }
    }

    fn take_exception(&mut self) -> Result<BridgeError> {
        let (raw, phase) = self.with_abi(|abi, ctx| abi.take_exception(ctx))?;
        if raw == 0 {
            return Ok(BridgeError::Engine(TranslatedError {
                kind: FailureKind::Runtime,
                backend: self.backend_id().clone(),
                trap_code: None,
                cause: Some(RuntimeCause::Backend),
                message: "operation failed without raising an exception".into(),
                script_error: None,
            }));
        }
        Ok(self.translate_raw(raw, phase))
    }

    /// Translate an owned exception value raised in `phase`, consuming it
    pub(crate) fn translate_raw(&mut self, raw: u32, phase: i32) -> BridgeError {
        let error = self.script_error(raw, 0);
        let _ = self.free_raw(raw);
        match error {
            Ok(error) => {
                let interrupted = self.realm.runtime.interrupt.tripped();
                if interrupted {
                    tracing::debug!(
                        realm = %self.realm.id,
                        "Evaluation interrupted after {} checks",
                        self.realm.runtime.interrupt.checks()
                    );
                }
                BridgeError::Engine(translate_exception(
                    self.backend_id(),
                    error,
                    phase == abi::phase::COMPILE,
                    interrupted,
                    phase == abi::phase::OUT_OF_MEMORY,
                ))
            }
            Err(err) => err,
        }
    }

    /// Error describing a promise rejection reason
    pub(crate) fn rejection_error(&mut self, reason: &ValueHandle) -> BridgeError {
        let raw = match self.raw(reason).and_then(|raw| self.with_abi(|abi, ctx| abi.dup(ctx, raw))) {
            Ok(raw) => raw,
            Err(err) => return err,
        };
        self.translate_raw(raw, abi::phase::RUNTIME)
    }

    fn script_error(&mut self, raw: u32, depth: usize) -> Result<ScriptError> {
        let tag = ScriptType::from_tag(self.with_abi(|abi, ctx| abi.tag(ctx, raw))?);
        if tag != ScriptType::Error {
            let message = match tag {
                ScriptType::String => self.raw_string(raw)?,
                _ => self.with_abi(|abi, ctx| abi.dump(ctx, raw))?,
            };
            let value = self.snapshot_raw(raw, 0).unwrap_or(HostValue::Undefined);
            return Ok(ScriptError {
                name: None,
                message,
                stack: None,
                cause: None,
                value,
            });
        }

        let name = self.data_string(raw, "name")?;
        let message = self.data_string(raw, "message")?.unwrap_or_default();
        let stack = self.data_string(raw, "stack")?.filter(|s| !s.is_empty());

        let cause_raw = self.with_abi(|abi, ctx| abi.get_data(ctx, raw, "cause"))?;
        let cause = if cause_raw == 0 {
            self.discard_exception()?;
            None
        } else {
            let cause_tag = self.with_abi(|abi, ctx| abi.tag(ctx, cause_raw))?;
            let cause = if ScriptType::from_tag(cause_tag).is_nullish() || depth >= MAX_CAUSE_DEPTH {
                None
            } else {
                Some(Box::new(self.script_error(cause_raw, depth + 1)?))
            };
            self.free_raw(cause_raw)?;
            cause
        };

        let mut fields = vec![("message".to_string(), HostValue::String(message.clone()))];
        if let Some(name) = &name {
            fields.insert(0, ("name".to_string(), HostValue::String(name.clone())));
        }
        if let Some(stack) = &stack {
            fields.push(("stack".to_string(), HostValue::String(stack.clone())));
        }

        Ok(ScriptError {
            name,
            message,
            stack,
            cause,
            value: HostValue::Object(fields),
        })
    }

    /// String-valued data property `key`, looked up without running
    /// accessors or proxy traps; `None` otherwise
    fn data_string(&mut self, raw: u32, key: &str) -> Result<Option<String>> {
        let value = self.with_abi(|abi, ctx| abi.get_data(ctx, raw, key))?;
        if value == 0 {
            self.discard_exception()?;
            return Ok(None);
        }
        let tag = ScriptType::from_tag(self.with_abi(|abi, ctx| abi.tag(ctx, value))?);
        let text = if tag == ScriptType::String {
            self.raw_string(value).map(Some)
        } else {
            Ok(None)
        };
        self.free_raw(value)?;
        text
    }

    /// Property `key` rendered as a string; `None` when absent or throwing
    fn string_property(&mut self, raw: u32, key: &str) -> Result<Option<String>> {
        let value = self.with_abi(|abi, ctx| abi.get(ctx, raw, key))?;
        if value == 0 {
            self.discard_exception()?;
            return Ok(None);
        }
        let tag = ScriptType::from_tag(self.with_abi(|abi, ctx| abi.tag(ctx, value))?);
        let text = if tag.is_nullish() {
            Ok(None)
        } else {
            self.raw_string(value).map(Some)
        };
        self.free_raw(value)?;
        text
    }

    fn raw_string(&mut self, raw: u32) -> Result<String> {
        match self.with_abi(|abi, ctx| abi.to_string(ctx, raw))? {
            Some(text) => Ok(text),
            None => Err(self.exception()),
        }
    }

    fn discard_exception(&mut self) -> Result<()> {
        let (raw, _) = self.with_abi(|abi, ctx| abi.take_exception(ctx))?;
        self.free_raw(raw)
    }

    // ========================================================================
    // VALUE OPERATIONS
    // ========================================================================

    pub(crate) fn to_number(&mut self, value: &ValueHandle) -> Result<f64> {
        let raw = self.raw(value)?;
        self.with_abi(|abi, ctx| abi.to_number(ctx, raw))
    }

    pub(crate) fn to_bool(&mut self, value: &ValueHandle) -> Result<bool> {
        let raw = self.raw(value)?;
        self.with_abi(|abi, ctx| abi.to_bool(ctx, raw))
    }

    pub(crate) fn to_string(&mut self, value: &ValueHandle) -> Result<String> {
        let raw = self.raw(value)?;
        self.raw_string(raw)
    }

    pub(crate) fn to_bigint(&mut self, value: &ValueHandle) -> Result<i128> {
        let raw = self.raw(value)?;
        self.raw_bigint(raw)
    }

    pub(crate) fn to_bytes(&mut self, value: &ValueHandle) -> Result<Vec<u8>> {
        let raw = self.raw(value)?;
        self.raw_bytes(raw)
    }

    fn raw_bigint(&mut self, raw: u32) -> Result<i128> {
        let digits = self.raw_string(raw)?;
        digits.parse::<i128>().map_err(|_| {
            BridgeError::Conversion(crate::error::ConversionError::new(format!(
                "BigInt {digits} does not fit in i128"
            )))
        })
    }

    fn raw_bytes(&mut self, raw: u32) -> Result<Vec<u8>> {
        match self.with_abi(|abi, ctx| abi.to_bytes(ctx, raw))? {
            Some(bytes) => Ok(bytes),
            None => Err(self.exception()),
        }
    }

    /// `value instanceof constructor`
    pub(crate) fn instance_of(&mut self, value: &ValueHandle, constructor: &ValueHandle) -> Result<bool> {
        let value = self.raw(value)?;
        let constructor = self.raw(constructor)?;
        match self.with_abi(|abi, ctx| abi.instance_of(ctx, value, constructor))? {
            Some(result) => Ok(result),
            None => Err(self.exception()),
        }
    }

    pub(crate) fn get_property(&mut self, object: &ValueHandle, key: &str) -> Result<ValueHandle> {
        let raw = self.raw(object)?;
        let value = self.with_abi(|abi, ctx| abi.get(ctx, raw, key))?;
        self.adopt(value)
    }

    pub(crate) fn get_index(&mut self, object: &ValueHandle, index: u32) -> Result<ValueHandle> {
        let raw = self.raw(object)?;
        let value = self.with_abi(|abi, ctx| abi.get_index(ctx, raw, index))?;
        self.adopt(value)
    }

    pub(crate) fn set_property(&mut self, object: &ValueHandle, key: &str, value: &ValueHandle) -> Result<()> {
        let target = self.raw(object)?;
        let value = self.raw(value)?;
        if self.with_abi(|abi, ctx| abi.set(ctx, target, key, value))? {
            Ok(())
        } else {
            Err(self.exception())
        }
    }

    pub(crate) fn invoke(
        &mut self,
        func: &ValueHandle,
        this: Option<&ValueHandle>,
        args: &[ValueHandle],
    ) -> Result<ValueHandle> {
        let func = self.raw(func)?;
        let argv = args.iter().map(|arg| self.raw(arg)).collect::<Result<Vec<_>>>()?;
        let (this, temporary) = match this {
            Some(this) => (self.raw(this)?, false),
            None => (self.with_abi(|abi, ctx| abi.new_undefined(ctx))?, true),
        };
        let result = self.with_abi(|abi, ctx| abi.call_function(ctx, func, this, &argv));
        if temporary {
            self.free_raw(this)?;
        }
        self.adopt(result?)
    }

    pub(crate) fn keys(&mut self, object: &ValueHandle) -> Result<Vec<String>> {
        let raw = self.raw(object)?;
        self.raw_keys(raw)
    }

    fn raw_keys(&mut self, raw: u32) -> Result<Vec<String>> {
        let array = self.with_abi(|abi, ctx| abi.keys(ctx, raw))?;
        if array == 0 {
            return Err(self.exception());
        }
        let result = self.raw_string_array(array);
        self.free_raw(array)?;
        result
    }

    fn raw_string_array(&mut self, array: u32) -> Result<Vec<String>> {
        let len = self.with_abi(|abi, ctx| abi.length(ctx, array))?.max(0) as u32;
        let mut out = Vec::with_capacity(len as usize);
        for index in 0..len {
            let item = self.with_abi(|abi, ctx| abi.get_index(ctx, array, index))?;
            if item == 0 {
                return Err(self.exception());
            }
            let text = self.raw_string(item);
            self.free_raw(item)?;
            out.push(text?);
        }
        Ok(out)
    }

    pub(crate) fn length(&mut self, value: &ValueHandle) -> Result<Option<usize>> {
        let raw = self.raw(value)?;
        let len = self.with_abi(|abi, ctx| abi.length(ctx, raw))?;
        Ok((len >= 0).then_some(len as usize))
    }

    pub(crate) fn iterator(&mut self, value: &ValueHandle) -> Result<ValueHandle> {
        let raw = self.raw(value)?;
        let iterator = self.with_abi(|abi, ctx| abi.iterator(ctx, raw))?;
        self.adopt(iterator)
    }

    pub(crate) fn equals(&mut self, a: &ValueHandle, b: &ValueHandle, mode: Equality) -> Result<bool> {
        let a = self.raw(a)?;
        let b = self.raw(b)?;
        self.with_abi(|abi, ctx| abi.equals(ctx, a, b, mode))
    }

    /// `None` for values that are not promises
    pub(crate) fn promise_state(&mut self, value: &ValueHandle) -> Result<Option<PromiseState>> {
        let raw = self.raw(value)?;
        let code = self.with_abi(|abi, ctx| abi.promise_state(ctx, raw))?;
        Ok(match code {
            abi::promise::PENDING => Some(PromiseState::Pending),
            abi::promise::FULFILLED => Some(PromiseState::Fulfilled),
            abi::promise::REJECTED => Some(PromiseState::Rejected),
            _ => None,
        })
    }

    /// Fulfillment value or rejection reason of a settled promise
    pub(crate) fn promise_result(&mut self, value: &ValueHandle) -> Result<ValueHandle> {
        let raw = self.raw(value)?;
        let result = self.with_abi(|abi, ctx| abi.promise_result(ctx, raw))?;
        self.adopt(result)
    }

    pub(crate) fn dup(&mut self, value: &ValueHandle) -> Result<ValueHandle> {
        let raw = self.raw(value)?;
        self.wrap_dup(raw)
    }

    pub fn dump(&mut self, value: &ValueHandle) -> Result<String> {
        let raw = self.raw(value)?;
        self.with_abi(|abi, ctx| abi.dump(ctx, raw))
    }

    /// `JSON.stringify` with the given indent
    pub fn to_json(&mut self, value: &ValueHandle, indent: u32) -> Result<String> {
        let raw = self.raw(value)?;
        match self.with_abi(|abi, ctx| abi.to_json(ctx, raw, indent))? {
            Some(json) => Ok(json),
            None => Err(self.exception()),
        }
    }

    pub(crate) fn job_pending(&mut self) -> Result<bool> {
        self.with_abi(|abi, _| abi.job_pending())
    }

    // ========================================================================
    // SNAPSHOTS
    // ========================================================================

    pub(crate) fn snapshot(&mut self, value: &ValueHandle) -> Result<HostValue> {
        let raw = self.raw(value)?;
        self.snapshot_raw(raw, 0)
    }

    /// Walk a value into host form; function-valued properties are skipped
    pub(crate) fn snapshot_raw(&mut self, raw: u32, depth: usize) -> Result<HostValue> {
        if depth > MAX_DEPTH {
            return Err(BridgeError::Conversion(crate::error::ConversionError::new(format!(
                "value nesting exceeds {MAX_DEPTH} levels"
            ))));
        }
        let tag = ScriptType::from_tag(self.with_abi(|abi, ctx| abi.tag(ctx, raw))?);
        let value = match tag {
            ScriptType::Undefined | ScriptType::Function => HostValue::Undefined,
            ScriptType::Null => HostValue::Null,
            ScriptType::Boolean => HostValue::Bool(self.with_abi(|abi, ctx| abi.to_bool(ctx, raw))?),
            ScriptType::Number => HostValue::Number(self.with_abi(|abi, ctx| abi.to_number(ctx, raw))?),
            ScriptType::BigInt => HostValue::BigInt(self.raw_bigint(raw)?),
            ScriptType::Bytes => HostValue::Bytes(self.raw_bytes(raw)?),
            ScriptType::String => HostValue::String(self.raw_string(raw)?),
            ScriptType::Symbol => HostValue::String(self.with_abi(|abi, ctx| abi.dump(ctx, raw))?),
            ScriptType::Promise => HostValue::Object(Vec::new()),
            ScriptType::Error => {
                let mut fields = Vec::new();
                for key in ["name", "message"] {
                    if let Some(text) = self.string_property(raw, key)? {
                        fields.push((key.to_string(), HostValue::String(text)));
                    }
                }
                HostValue::Object(fields)
            }
            ScriptType::Array => {
                let len = self.with_abi(|abi, ctx| abi.length(ctx, raw))?.max(0) as u32;
                let mut items = Vec::with_capacity(len as usize);
                for index in 0..len {
                    let item = self.with_abi(|abi, ctx| abi.get_index(ctx, raw, index))?;
                    if item == 0 {
                        return Err(self.exception());
                    }
                    let snapshot = self.snapshot_raw(item, depth + 1);
                    self.free_raw(item)?;
                    items.push(match snapshot? {
                        HostValue::Undefined => HostValue::Null,
                        other => other,
                    });
                }
                HostValue::Array(items)
            }
            ScriptType::Object => {
                let keys = self.raw_keys(raw)?;
                let mut fields = Vec::with_capacity(keys.len());
                for key in keys {
                    let item = self.with_abi(|abi, ctx| abi.get(ctx, raw, &key))?;
                    if item == 0 {
                        return Err(self.exception());
                    }
                    let item_tag = self.with_abi(|abi, ctx| abi.tag(ctx, item));
                    let skip = matches!(item_tag, Ok(code) if code == abi::tag::FUNCTION);
                    let snapshot = if skip {
                        Ok(HostValue::Undefined)
                    } else {
                        self.snapshot_raw(item, depth + 1)
                    };
                    self.free_raw(item)?;
                    if !skip {
                        fields.push((key, snapshot?));
                    }
                }
                HostValue::Object(fields)
            }
        };
        Ok(value)
    }

    // ========================================================================
    // CONSTRUCTORS
    // ========================================================================

    pub fn new_undefined(&mut self) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_undefined(ctx))?;
        self.adopt(raw)
    }

    pub fn new_null(&mut self) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_null(ctx))?;
        self.adopt(raw)
    }

    pub fn new_bool(&mut self, value: bool) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_bool(ctx, value))?;
        self.adopt(raw)
    }

    pub fn new_number(&mut self, value: f64) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_number(ctx, value))?;
        self.adopt(raw)
    }

    pub fn new_string(&mut self, value: &str) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_string(ctx, value))?;
        self.adopt(raw)
    }

    pub fn new_object(&mut self) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_object(ctx))?;
        self.adopt(raw)
    }

    pub fn new_array(&mut self) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_array(ctx))?;
        self.adopt(raw)
    }

    /// A BigInt, whatever its magnitude
    pub fn new_bigint(&mut self, value: i128) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_bigint(ctx, &value.to_string()))?;
        self.adopt(raw)
    }

    /// A `Uint8Array` holding a copy of `bytes`
    pub fn new_bytes(&mut self, bytes: &[u8]) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_bytes(ctx, bytes))?;
        self.adopt(raw)
    }

    /// A script `Error` with the given message
    pub fn new_error(&mut self, message: &str) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.new_error(ctx, message))?;
        self.adopt(raw)
    }

    /// Build a value graph bottom-up from a host tree
    pub fn new_value(&mut self, value: &HostValue) -> Result<ValueHandle> {
        let raw = self.value_raw(value)?;
        self.wrap(raw)
    }

    /// Build a value from any serializable record
    pub fn new_record<T: Serialize>(&mut self, record: &T) -> Result<ValueHandle> {
        let value = HostValue::from_serialize(record)?;
        self.new_value(&value)
    }

    pub fn global(&mut self) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.global(ctx))?;
        self.adopt(raw)
    }

    pub(crate) fn value_raw(&mut self, value: &HostValue) -> Result<u32> {
        let raw = match value {
            HostValue::Undefined => self.with_abi(|abi, ctx| abi.new_undefined(ctx))?,
            HostValue::Null => self.with_abi(|abi, ctx| abi.new_null(ctx))?,
            HostValue::Bool(b) => self.with_abi(|abi, ctx| abi.new_bool(ctx, *b))?,
            HostValue::Number(n) => self.with_abi(|abi, ctx| abi.new_number(ctx, *n))?,
            HostValue::BigInt(n) => self.with_abi(|abi, ctx| abi.new_bigint(ctx, &n.to_string()))?,
            HostValue::String(s) => self.with_abi(|abi, ctx| abi.new_string(ctx, s))?,
            HostValue::Bytes(bytes) => self.with_abi(|abi, ctx| abi.new_bytes(ctx, bytes))?,
            HostValue::Array(items) => {
                let array = self.with_abi(|abi, ctx| abi.new_array(ctx))?;
                if array == 0 {
                    return Err(self.exception());
                }
                let filled = items.iter().enumerate().try_for_each(|(index, item)| {
                    let item = self.value_raw(item)?;
                    self.store_index(array, index as u32, item)
                });
                self.release_on_error(array, filled)?
            }
            HostValue::Object(fields) => {
                let object = self.with_abi(|abi, ctx| abi.new_object(ctx))?;
                if object == 0 {
                    return Err(self.exception());
                }
                let filled = fields.iter().try_for_each(|(key, item)| {
                    let item = self.value_raw(item)?;
                    self.store(object, key, item)
                });
                self.release_on_error(object, filled)?
            }
        };
        if raw == 0 {
            return Err(self.exception());
        }
        Ok(raw)
    }

    /// Hand back `container` once filled; a partially built one is freed
    fn release_on_error(&mut self, container: u32, filled: Result<()>) -> Result<u32> {
        match filled {
            Ok(()) => Ok(container),
            Err(err) => {
                if let Err(free_err) = self.free_raw(container) {
                    tracing::warn!("Failed to free partially built value: {}", free_err);
                }
                Err(err)
            }
        }
    }

    /// Set `object[key]`, consuming `value`
    pub(crate) fn store(&mut self, object: u32, key: &str, value: u32) -> Result<()> {
        let ok = self.with_abi(|abi, ctx| abi.set(ctx, object, key, value));
        self.free_raw(value)?;
        if ok? {
            Ok(())
        } else {
            Err(self.exception())
        }
    }

    fn store_index(&mut self, array: u32, index: u32, value: u32) -> Result<()> {
        let ok = self.with_abi(|abi, ctx| abi.set_index(ctx, array, index, value));
        self.free_raw(value)?;
        if ok? {
            Ok(())
        } else {
            Err(self.exception())
        }
    }

    // ========================================================================
    // EVALUATION
    // ========================================================================

    pub(crate) fn eval(&mut self, source: &str, options: &EvalOptions) -> Result<ValueHandle> {
        let flags = options.flags(source);
        let raw = self.with_abi(|abi, ctx| abi.eval(ctx, source, &options.filename, flags))?;
        self.adopt(raw)
    }

    /// Compiled payload, or the compilation error
    pub(crate) fn compile(&mut self, source: &str, filename: &str, flags: EvalFlags) -> Result<Vec<u8>> {
        match self.with_abi(|abi, ctx| abi.compile(ctx, source, filename, flags))? {
            Some(payload) => Ok(payload),
            None => Err(self.exception()),
        }
    }

    pub(crate) fn eval_compiled(&mut self, payload: &[u8]) -> Result<ValueHandle> {
        let raw = self.with_abi(|abi, ctx| abi.eval_compiled(ctx, payload))?;
        self.adopt(raw)
    }

    /// Error value for a failed compile step that never reached the engine
    pub(crate) fn compilation_error(&self, message: impl Into<String>) -> BridgeError {
        BridgeError::Engine(TranslatedError::compilation(self.backend_id(), message))
    }
}

impl AsScope for Scope<'_> {
    fn as_scope(&mut self) -> Result<Scope<'_>> {
        Ok(self.reborrow())
    }
}
