//! Engine ABI
//!
//! Export and import names of the compiled engine module, the numeric codes
//! that cross the boundary, and [`Abi`], a typed client over a [`Caller`].
//!
//! Conventions: values are opaque non-zero `i32` pointers owned by whoever
//! received them; `0` from a value-returning export means an exception is
//! pending on the context. Out-parameters are little-endian `i32` slots in
//! linear memory.

use bitflags::bitflags;

use crate::backend::{BackendFault, Caller, Val};

/// Version of the export/import contract below
pub const ABI_VERSION: u32 = 4;

/// Magic prefix of an engine module image
pub const MODULE_MAGIC: &[u8; 8] = b"\0fosjsm\x01";

/// The module image matching this ABI
pub fn module_image() -> Vec<u8> {
    let mut image = MODULE_MAGIC.to_vec();
    image.extend_from_slice(&ABI_VERSION.to_le_bytes());
    image
}

/// Parse a module image, returning the ABI version it targets
pub fn parse_module_image(bytes: &[u8]) -> Option<u32> {
    let rest = bytes.strip_prefix(MODULE_MAGIC.as_slice())?;
    let version: [u8; 4] = rest.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(version))
}

// ============================================================================
// EXPORTS
// ============================================================================

pub mod export {
    // Linear memory
    pub const MALLOC: &str = "malloc";
    pub const FREE: &str = "free";

    // Runtime-wide
    pub const ENGINE_VERSION: &str = "engine_version";
    pub const JOB_PENDING: &str = "job_pending";
    pub const JOB_EXECUTE: &str = "job_execute";
    pub const SET_MAX_STACK_SIZE: &str = "runtime_set_max_stack_size";
    pub const SET_GC_THRESHOLD: &str = "runtime_set_gc_threshold";
    pub const RUN_GC: &str = "runtime_run_gc";
    pub const MEMORY_USAGE: &str = "runtime_memory_usage";
    pub const CONTEXT_NEW: &str = "context_new";

    // Context
    pub const CONTEXT_FREE: &str = "context_free";
    pub const CONTEXT_GLOBAL: &str = "context_global";
    pub const TAKE_EXCEPTION: &str = "context_take_exception";
    pub const THROW: &str = "context_throw";
    pub const JOB_TAKE_EXCEPTION: &str = "job_take_exception";

    // Constructors
    pub const UNDEFINED: &str = "value_undefined";
    pub const NULL: &str = "value_null";
    pub const BOOL: &str = "value_bool";
    pub const NUMBER: &str = "value_number";
    pub const STRING: &str = "value_string";
    pub const OBJECT: &str = "value_object";
    pub const ARRAY: &str = "value_array";
    pub const ERROR: &str = "value_error";
    pub const FUNCTION: &str = "value_function";
    pub const PROMISE: &str = "value_promise";
    pub const BIGINT: &str = "value_bigint";
    pub const BYTES: &str = "value_bytes";

    // Value operations
    pub const DUP: &str = "value_dup";
    pub const FREE_VALUE: &str = "value_free";
    pub const TAG: &str = "value_tag";
    pub const TO_NUMBER: &str = "value_to_number";
    pub const TO_BOOL: &str = "value_to_bool";
    pub const TO_STRING: &str = "value_string_get";
    pub const GET: &str = "value_get";
    pub const GET_DATA: &str = "value_get_data";
    pub const SET: &str = "value_set";
    pub const GET_INDEX: &str = "value_get_index";
    pub const SET_INDEX: &str = "value_set_index";
    pub const KEYS: &str = "value_keys";
    pub const LENGTH: &str = "value_length";
    pub const CALL: &str = "value_call";
    pub const ITERATOR: &str = "value_iterator";
    pub const EQUALS: &str = "value_equals";
    pub const DUMP: &str = "value_dump";
    pub const INSTANCE_OF: &str = "value_instance_of";
    pub const TO_BYTES: &str = "value_to_bytes";
    pub const TO_JSON: &str = "value_to_json";
    pub const PROMISE_STATE: &str = "promise_state";
    pub const PROMISE_RESULT: &str = "promise_result";

    // Evaluation
    pub const EVAL: &str = "eval";
    pub const COMPILE: &str = "compile";
    pub const EVAL_COMPILED: &str = "eval_compiled";
}

// ============================================================================
// IMPORTS
// ============================================================================

pub mod import {
    /// `(ctx, func_id, this, argc, argv) -> value | 0`
    pub const HOST_CALL: &str = "host_call";
    /// `(ctx, name_ptr, name_len) -> exports object | 0`
    pub const HOST_LOAD_MODULE: &str = "host_load_module";
    /// `(ctx, promise, reason, is_handled)`
    pub const HOST_PROMISE_REJECTION: &str = "host_promise_rejection";

    pub const ALL: [&str; 3] = [HOST_CALL, HOST_LOAD_MODULE, HOST_PROMISE_REJECTION];
}

// ============================================================================
// CODES
// ============================================================================

/// Type tags returned by `value_tag`
pub mod tag {
    pub const UNDEFINED: i32 = 0;
    pub const NULL: i32 = 1;
    pub const BOOLEAN: i32 = 2;
    pub const NUMBER: i32 = 3;
    pub const BIGINT: i32 = 4;
    pub const STRING: i32 = 5;
    pub const SYMBOL: i32 = 6;
    pub const OBJECT: i32 = 7;
    pub const ARRAY: i32 = 8;
    pub const FUNCTION: i32 = 9;
    pub const PROMISE: i32 = 10;
    pub const ERROR: i32 = 11;
    /// `ArrayBuffer` or `Uint8Array`
    pub const BYTES: i32 = 12;
}

/// Codes returned by `promise_state`
pub mod promise {
    pub const NOT_A_PROMISE: i32 = -1;
    pub const PENDING: i32 = 0;
    pub const FULFILLED: i32 = 1;
    pub const REJECTED: i32 = 2;
}

/// Phase written by `context_take_exception` and `job_take_exception`
pub mod phase {
    pub const RUNTIME: i32 = 0;
    pub const COMPILE: i32 = 1;
    /// The engine heap refused an allocation while raising the exception
    pub const OUT_OF_MEMORY: i32 = 2;
}

/// Comparison modes of `value_equals`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Equality {
    Strict = 0,
    SameValue = 1,
    SameValueZero = 2,
}

bitflags! {
    /// Flags accepted by `eval` and `compile`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EvalFlags: u32 {
        const MODULE = 1 << 0;
        const STRICT = 1 << 1;
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Typed view of the engine exports through a [`Caller`]
pub struct Abi<'a> {
    caller: &'a mut dyn Caller,
}

type Fault<T> = Result<T, BackendFault>;

fn bad_result(name: &str) -> BackendFault {
    BackendFault::trap("bad_signature", format!("export `{name}` returned an unexpected result"))
}

impl<'a> Abi<'a> {
    pub fn new(caller: &'a mut dyn Caller) -> Self {
        Self { caller }
    }

    fn call(&mut self, name: &str, args: &[Val]) -> Fault<Vec<Val>> {
        self.caller.call_export(name, args)
    }

    fn call_i32(&mut self, name: &str, args: &[Val]) -> Fault<i32> {
        self.call(name, args)?
            .first()
            .and_then(Val::as_i32)
            .ok_or_else(|| bad_result(name))
    }

    fn call_f64(&mut self, name: &str, args: &[Val]) -> Fault<f64> {
        self.call(name, args)?
            .first()
            .and_then(Val::as_f64)
            .ok_or_else(|| bad_result(name))
    }

    fn call_unit(&mut self, name: &str, args: &[Val]) -> Fault<()> {
        self.call(name, args).map(|_| ())
    }

    // --- memory ---

    pub fn malloc(&mut self, size: u32) -> Fault<u32> {
        let ptr = self.call_i32(export::MALLOC, &[Val::I32(size as i32)])?;
        if ptr == 0 {
            return Err(BackendFault::trap("out_of_memory", format!("malloc({size}) failed")));
        }
        Ok(ptr as u32)
    }

    pub fn free(&mut self, ptr: u32) -> Fault<()> {
        self.call_unit(export::FREE, &[Val::I32(ptr as i32)])
    }

    pub fn read_bytes(&mut self, ptr: u32, len: u32) -> Fault<Vec<u8>> {
        let mut buf = vec![0; len as usize];
        self.caller.read_memory(ptr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_i32(&mut self, ptr: u32) -> Fault<i32> {
        let mut buf = [0; 4];
        self.caller.read_memory(ptr, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_i32s(&mut self, ptr: u32, count: u32) -> Fault<Vec<i32>> {
        let bytes = self.read_bytes(ptr, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Copy bytes into a fresh allocation; empty input still allocates
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Fault<u32> {
        let ptr = self.malloc(data.len().max(1) as u32)?;
        self.caller.write_memory(ptr, data)?;
        Ok(ptr)
    }

    pub fn alloc_i32s(&mut self, values: &[u32]) -> Fault<u32> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.alloc_bytes(&bytes)
    }

    /// Run `f` with a scratch pointer, then free it
    fn with_buffer<T>(&mut self, data: &[u8], f: impl FnOnce(&mut Self, u32) -> Fault<T>) -> Fault<T> {
        let ptr = self.alloc_bytes(data)?;
        let out = f(self, ptr);
        self.free(ptr)?;
        out
    }

    /// Call an export that returns a `(ptr, len)` string through an out slot
    fn call_string(&mut self, name: &str, args: &[Val]) -> Fault<Option<String>> {
        let out = self.alloc_bytes(&[0; 4])?;
        let mut full = args.to_vec();
        full.push(Val::I32(out as i32));
        let ptr = self.call_i32(name, &full);
        let len = self.read_i32(out);
        self.free(out)?;
        let (ptr, len) = (ptr?, len?);
        if ptr == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(ptr as u32, len as u32)?;
        self.free(ptr as u32)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| BackendFault::trap("bad_utf8", format!("export `{name}` returned invalid UTF-8")))
    }

    // --- runtime ---

    pub fn engine_version(&mut self) -> Fault<String> {
        Ok(self.call_string(export::ENGINE_VERSION, &[])?.unwrap_or_default())
    }

    pub fn job_pending(&mut self) -> Fault<bool> {
        Ok(self.call_i32(export::JOB_PENDING, &[])? != 0)
    }

    /// `1` ran a job, `0` queue empty, `-1` the job threw
    pub fn job_execute(&mut self) -> Fault<i32> {
        self.call_i32(export::JOB_EXECUTE, &[])
    }

    pub fn set_max_stack_size(&mut self, bytes: usize) -> Fault<()> {
        self.call_unit(export::SET_MAX_STACK_SIZE, &[Val::I64(bytes as i64)])
    }

    pub fn set_gc_threshold(&mut self, bytes: usize) -> Fault<()> {
        self.call_unit(export::SET_GC_THRESHOLD, &[Val::I64(bytes as i64)])
    }

    pub fn run_gc(&mut self) -> Fault<()> {
        self.call_unit(export::RUN_GC, &[])
    }

    pub fn memory_usage(&mut self) -> Fault<String> {
        Ok(self.call_string(export::MEMORY_USAGE, &[])?.unwrap_or_default())
    }

    pub fn context_new(&mut self) -> Fault<u32> {
        let ctx = self.call_i32(export::CONTEXT_NEW, &[])?;
        if ctx == 0 {
            return Err(BackendFault::Runtime("context creation failed".into()));
        }
        Ok(ctx as u32)
    }

    // --- context ---

    pub fn context_free(&mut self, ctx: u32) -> Fault<()> {
        self.call_unit(export::CONTEXT_FREE, &[ctx_val(ctx)])
    }

    pub fn global(&mut self, ctx: u32) -> Fault<u32> {
        self.value(export::CONTEXT_GLOBAL, &[ctx_val(ctx)])
    }

    /// Take the pending exception and the phase it was raised in
    pub fn take_exception(&mut self, ctx: u32) -> Fault<(u32, i32)> {
        let out = self.alloc_bytes(&[0; 4])?;
        let value = self.call_i32(export::TAKE_EXCEPTION, &[ctx_val(ctx), Val::I32(out as i32)]);
        let phase = self.read_i32(out);
        self.free(out)?;
        Ok((value? as u32, phase?))
    }

    /// Take the exception of the last failed job and its phase
    pub fn job_take_exception(&mut self, ctx: u32) -> Fault<(u32, i32)> {
        let out = self.alloc_bytes(&[0; 4])?;
        let value = self.call_i32(export::JOB_TAKE_EXCEPTION, &[ctx_val(ctx), Val::I32(out as i32)]);
        let phase = self.read_i32(out);
        self.free(out)?;
        Ok((value? as u32, phase?))
    }

    /// Make `value` the exception raised when the current host call returns
    pub fn throw(&mut self, ctx: u32, value: u32) -> Fault<()> {
        self.call_unit(export::THROW, &[ctx_val(ctx), ptr_val(value)])
    }

    // --- constructors ---

    fn value(&mut self, name: &str, args: &[Val]) -> Fault<u32> {
        Ok(self.call_i32(name, args)? as u32)
    }

    pub fn new_undefined(&mut self, ctx: u32) -> Fault<u32> {
        self.value(export::UNDEFINED, &[ctx_val(ctx)])
    }

    pub fn new_null(&mut self, ctx: u32) -> Fault<u32> {
        self.value(export::NULL, &[ctx_val(ctx)])
    }

    pub fn new_bool(&mut self, ctx: u32, value: bool) -> Fault<u32> {
        self.value(export::BOOL, &[ctx_val(ctx), Val::I32(value as i32)])
    }

    pub fn new_number(&mut self, ctx: u32, value: f64) -> Fault<u32> {
        self.value(export::NUMBER, &[ctx_val(ctx), Val::F64(value)])
    }

    pub fn new_string(&mut self, ctx: u32, value: &str) -> Fault<u32> {
        self.with_buffer(value.as_bytes(), |abi, ptr| {
            abi.value(export::STRING, &[ctx_val(ctx), ptr_val(ptr), len_val(value.len())])
        })
    }

    pub fn new_object(&mut self, ctx: u32) -> Fault<u32> {
        self.value(export::OBJECT, &[ctx_val(ctx)])
    }

    pub fn new_array(&mut self, ctx: u32) -> Fault<u32> {
        self.value(export::ARRAY, &[ctx_val(ctx)])
    }

    pub fn new_error(&mut self, ctx: u32, message: &str) -> Fault<u32> {
        self.with_buffer(message.as_bytes(), |abi, ptr| {
            abi.value(export::ERROR, &[ctx_val(ctx), ptr_val(ptr), len_val(message.len())])
        })
    }

    pub fn new_function(&mut self, ctx: u32, func_id: u32, name: &str) -> Fault<u32> {
        self.with_buffer(name.as_bytes(), |abi, ptr| {
            abi.value(
                export::FUNCTION,
                &[ctx_val(ctx), Val::I32(func_id as i32), ptr_val(ptr), len_val(name.len())],
            )
        })
    }

    /// BigInt from its decimal representation
    pub fn new_bigint(&mut self, ctx: u32, digits: &str) -> Fault<u32> {
        self.with_buffer(digits.as_bytes(), |abi, ptr| {
            abi.value(export::BIGINT, &[ctx_val(ctx), ptr_val(ptr), len_val(digits.len())])
        })
    }

    /// `Uint8Array` holding a copy of `bytes`
    pub fn new_bytes(&mut self, ctx: u32, bytes: &[u8]) -> Fault<u32> {
        self.with_buffer(bytes, |abi, ptr| {
            abi.value(export::BYTES, &[ctx_val(ctx), ptr_val(ptr), len_val(bytes.len())])
        })
    }

    /// Returns `(promise, resolve, reject)`
    pub fn new_promise(&mut self, ctx: u32) -> Fault<(u32, u32, u32)> {
        let out = self.alloc_bytes(&[0; 8])?;
        let promise = self.value(export::PROMISE, &[ctx_val(ctx), ptr_val(out)]);
        let resolvers = self.read_i32s(out, 2);
        self.free(out)?;
        let (promise, resolvers) = (promise?, resolvers?);
        Ok((promise, resolvers[0] as u32, resolvers[1] as u32))
    }

    // --- value operations ---

    pub fn dup(&mut self, ctx: u32, value: u32) -> Fault<u32> {
        self.value(export::DUP, &[ctx_val(ctx), ptr_val(value)])
    }

    pub fn free_value(&mut self, ctx: u32, value: u32) -> Fault<()> {
        self.call_unit(export::FREE_VALUE, &[ctx_val(ctx), ptr_val(value)])
    }

    pub fn tag(&mut self, ctx: u32, value: u32) -> Fault<i32> {
        self.call_i32(export::TAG, &[ctx_val(ctx), ptr_val(value)])
    }

    pub fn to_number(&mut self, ctx: u32, value: u32) -> Fault<f64> {
        self.call_f64(export::TO_NUMBER, &[ctx_val(ctx), ptr_val(value)])
    }

    pub fn to_bool(&mut self, ctx: u32, value: u32) -> Fault<bool> {
        Ok(self.call_i32(export::TO_BOOL, &[ctx_val(ctx), ptr_val(value)])? != 0)
    }

    /// String contents of a string value; `None` means an exception is pending
    pub fn to_string(&mut self, ctx: u32, value: u32) -> Fault<Option<String>> {
        self.call_string(export::TO_STRING, &[ctx_val(ctx), ptr_val(value)])
    }

    pub fn get(&mut self, ctx: u32, object: u32, key: &str) -> Fault<u32> {
        self.with_buffer(key.as_bytes(), |abi, ptr| {
            abi.value(export::GET, &[ctx_val(ctx), ptr_val(object), ptr_val(ptr), len_val(key.len())])
        })
    }

    /// Own or inherited data property `key`; accessors and proxies yield
    /// `undefined` without running script code
    pub fn get_data(&mut self, ctx: u32, object: u32, key: &str) -> Fault<u32> {
        self.with_buffer(key.as_bytes(), |abi, ptr| {
            abi.value(export::GET_DATA, &[ctx_val(ctx), ptr_val(object), ptr_val(ptr), len_val(key.len())])
        })
    }

    /// Returns `false` if an exception is pending
    pub fn set(&mut self, ctx: u32, object: u32, key: &str, value: u32) -> Fault<bool> {
        self.with_buffer(key.as_bytes(), |abi, ptr| {
            let args = [ctx_val(ctx), ptr_val(object), ptr_val(ptr), len_val(key.len()), ptr_val(value)];
            Ok(abi.call_i32(export::SET, &args)? != 0)
        })
    }

    pub fn get_index(&mut self, ctx: u32, object: u32, index: u32) -> Fault<u32> {
        self.value(export::GET_INDEX, &[ctx_val(ctx), ptr_val(object), Val::I32(index as i32)])
    }

    pub fn set_index(&mut self, ctx: u32, object: u32, index: u32, value: u32) -> Fault<bool> {
        let args = [ctx_val(ctx), ptr_val(object), Val::I32(index as i32), ptr_val(value)];
        Ok(self.call_i32(export::SET_INDEX, &args)? != 0)
    }

    /// Array of own enumerable string keys
    pub fn keys(&mut self, ctx: u32, object: u32) -> Fault<u32> {
        self.value(export::KEYS, &[ctx_val(ctx), ptr_val(object)])
    }

    /// `-1` if the value has no numeric length
    pub fn length(&mut self, ctx: u32, value: u32) -> Fault<i32> {
        self.call_i32(export::LENGTH, &[ctx_val(ctx), ptr_val(value)])
    }

    pub fn call_function(&mut self, ctx: u32, func: u32, this: u32, args: &[u32]) -> Fault<u32> {
        let argv = if args.is_empty() { 0 } else { self.alloc_i32s(args)? };
        let result = self.value(
            export::CALL,
            &[ctx_val(ctx), ptr_val(func), ptr_val(this), len_val(args.len()), ptr_val(argv)],
        );
        if argv != 0 {
            self.free(argv)?;
        }
        result
    }

    pub fn iterator(&mut self, ctx: u32, value: u32) -> Fault<u32> {
        self.value(export::ITERATOR, &[ctx_val(ctx), ptr_val(value)])
    }

    pub fn equals(&mut self, ctx: u32, a: u32, b: u32, mode: Equality) -> Fault<bool> {
        let args = [ctx_val(ctx), ptr_val(a), ptr_val(b), Val::I32(mode as i32)];
        Ok(self.call_i32(export::EQUALS, &args)? != 0)
    }

    pub fn dump(&mut self, ctx: u32, value: u32) -> Fault<String> {
        Ok(self
            .call_string(export::DUMP, &[ctx_val(ctx), ptr_val(value)])?
            .unwrap_or_else(|| "<unprintable>".to_string()))
    }

    /// `None` if an exception is pending
    pub fn instance_of(&mut self, ctx: u32, value: u32, constructor: u32) -> Fault<Option<bool>> {
        let code = self.call_i32(
            export::INSTANCE_OF,
            &[ctx_val(ctx), ptr_val(value), ptr_val(constructor)],
        )?;
        Ok((code >= 0).then_some(code == 1))
    }

    /// Contents of an `ArrayBuffer` or `Uint8Array`; `None` if an exception is pending
    pub fn to_bytes(&mut self, ctx: u32, value: u32) -> Fault<Option<Vec<u8>>> {
        let out = self.alloc_bytes(&[0; 4])?;
        let ptr = self.call_i32(export::TO_BYTES, &[ctx_val(ctx), ptr_val(value), ptr_val(out)]);
        let len = self.read_i32(out);
        self.free(out)?;
        let (ptr, len) = (ptr?, len?);
        if ptr == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(ptr as u32, len as u32)?;
        self.free(ptr as u32)?;
        Ok(Some(bytes))
    }

    pub fn to_json(&mut self, ctx: u32, value: u32, indent: u32) -> Fault<Option<String>> {
        self.call_string(export::TO_JSON, &[ctx_val(ctx), ptr_val(value), Val::I32(indent as i32)])
    }

    pub fn promise_state(&mut self, ctx: u32, value: u32) -> Fault<i32> {
        self.call_i32(export::PROMISE_STATE, &[ctx_val(ctx), ptr_val(value)])
    }

    pub fn promise_result(&mut self, ctx: u32, value: u32) -> Fault<u32> {
        self.value(export::PROMISE_RESULT, &[ctx_val(ctx), ptr_val(value)])
    }

    // --- evaluation ---

    pub fn eval(&mut self, ctx: u32, source: &str, filename: &str, flags: EvalFlags) -> Fault<u32> {
        let src = self.alloc_bytes(source.as_bytes())?;
        let name = self.alloc_bytes(filename.as_bytes())?;
        let args = [
            ctx_val(ctx),
            ptr_val(src),
            len_val(source.len()),
            ptr_val(name),
            len_val(filename.len()),
            Val::I32(flags.bits() as i32),
        ];
        let result = self.value(export::EVAL, &args);
        self.free(src)?;
        self.free(name)?;
        result
    }

    /// Compiled payload, or `None` when an exception is pending
    pub fn compile(
        &mut self,
        ctx: u32,
        source: &str,
        filename: &str,
        flags: EvalFlags,
    ) -> Fault<Option<Vec<u8>>> {
        let src = self.alloc_bytes(source.as_bytes())?;
        let name = self.alloc_bytes(filename.as_bytes())?;
        let out = self.alloc_bytes(&[0; 4])?;
        let args = [
            ctx_val(ctx),
            ptr_val(src),
            len_val(source.len()),
            ptr_val(name),
            len_val(filename.len()),
            Val::I32(flags.bits() as i32),
            ptr_val(out),
        ];
        let ptr = self.call_i32(export::COMPILE, &args);
        let len = self.read_i32(out);
        self.free(src)?;
        self.free(name)?;
        self.free(out)?;
        let (ptr, len) = (ptr?, len?);
        if ptr == 0 {
            return Ok(None);
        }
        let payload = self.read_bytes(ptr as u32, len as u32)?;
        self.free(ptr as u32)?;
        Ok(Some(payload))
    }

    pub fn eval_compiled(&mut self, ctx: u32, payload: &[u8]) -> Fault<u32> {
        self.with_buffer(payload, |abi, ptr| {
            abi.value(export::EVAL_COMPILED, &[ctx_val(ctx), ptr_val(ptr), len_val(payload.len())])
        })
    }
}

fn ctx_val(ctx: u32) -> Val {
    Val::I32(ctx as i32)
}

fn ptr_val(ptr: u32) -> Val {
    Val::I32(ptr as i32)
}

fn len_val(len: usize) -> Val {
    Val::I32(len as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_image_roundtrip() {
        assert_eq!(parse_module_image(&module_image()), Some(ABI_VERSION));
    }

    #[test]
    fn test_module_image_rejects_garbage() {
        assert_eq!(parse_module_image(b"\0asm\x01\0\0\0"), None);
        assert_eq!(parse_module_image(MODULE_MAGIC), None);
    }

    #[test]
    fn test_eval_flags() {
        let flags = EvalFlags::MODULE | EvalFlags::STRICT;
        assert_eq!(flags.bits(), 3);
        assert_eq!(EvalFlags::from_bits_truncate(0xff), flags);
    }
}
