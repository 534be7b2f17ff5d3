//! Compile-only parsing and QuickJS bytecode
//!
//! Scripts and modules are parsed without running anything, and the
//! resulting function or module record is serialized with the engine's own
//! object writer. The payload handed to the host is
//! `flags (u32 LE) | checksum (u64 LE) | bytecode`.
//!
//! Bytecode is trusted input for the engine reader. The checksum catches
//! truncation and bit rot, not tampering.

use std::collections::hash_map::DefaultHasher;
use std::ffi::CString;
use std::hash::Hasher;

use rquickjs::{qjs, Ctx, Exception, Module, Value};

use crate::abi::EvalFlags;

const HEADER_LEN: usize = 12;

/// Parse a global script without evaluating it
pub(super) fn parse_script<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    filename: &str,
    flags: EvalFlags,
) -> rquickjs::Result<Value<'js>> {
    let mut eval_flags = qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_COMPILE_ONLY;
    if flags.contains(EvalFlags::STRICT) {
        eval_flags |= qjs::JS_EVAL_FLAG_STRICT;
    }
    let len = source.len();
    let source = CString::new(source)?;
    let filename = CString::new(filename)?;
    let raw = unsafe {
        qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            source.as_ptr(),
            len as _,
            filename.as_ptr(),
            eval_flags as i32,
        )
    };
    owned(ctx, raw)
}

/// Parse a module and resolve its imports without evaluating it
pub(super) fn parse_module<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    filename: &str,
) -> rquickjs::Result<Module<'js>> {
    Module::declare(ctx.clone(), filename, source)
}

/// Run a program produced by [`parse_script`] or [`load`]. Modules yield
/// their evaluation promise.
pub(super) fn run<'js>(ctx: &Ctx<'js>, program: Value<'js>) -> rquickjs::Result<Value<'js>> {
    let ctx_ptr = ctx.as_raw().as_ptr();
    let raw = program.as_raw();
    match unsafe { qjs::JS_VALUE_GET_TAG(raw) } {
        qjs::JS_TAG_MODULE => {
            if unsafe { qjs::JS_ResolveModule(ctx_ptr, raw) } < 0 {
                // A failed resolution releases the module record itself
                std::mem::forget(program);
                return Err(rquickjs::Error::Exception);
            }
        }
        qjs::JS_TAG_FUNCTION_BYTECODE => {}
        _ => return Err(Exception::throw_type(ctx, "compiled payload is not a program")),
    }
    // JS_EvalFunction consumes its argument
    std::mem::forget(program);
    let result = unsafe { qjs::JS_EvalFunction(ctx_ptr, raw) };
    owned(ctx, result)
}

/// Compile `source` to an engine payload
pub(super) fn compile(
    ctx: &Ctx<'_>,
    source: &str,
    filename: &str,
    flags: EvalFlags,
) -> rquickjs::Result<Vec<u8>> {
    let bytecode = if flags.contains(EvalFlags::MODULE) {
        parse_module(ctx, source, filename)?.write_le()?
    } else {
        let function = parse_script(ctx, source, filename, flags)?;
        write_object(ctx, &function)?
    };
    Ok(seal(flags, &bytecode))
}

/// Read an engine payload back into an unevaluated program
pub(super) fn load<'js>(ctx: &Ctx<'js>, payload: &[u8]) -> rquickjs::Result<Value<'js>> {
    let Some((_flags, bytecode)) = unseal(payload) else {
        return Err(Exception::throw_type(ctx, "compiled payload is corrupt"));
    };
    let object = unsafe {
        qjs::JS_ReadObject(
            ctx.as_raw().as_ptr(),
            bytecode.as_ptr(),
            bytecode.len() as _,
            qjs::JS_READ_OBJ_BYTECODE as i32,
        )
    };
    owned(ctx, object)
}

fn write_object(ctx: &Ctx<'_>, value: &Value<'_>) -> rquickjs::Result<Vec<u8>> {
    let ctx_ptr = ctx.as_raw().as_ptr();
    let mut len: qjs::size_t = 0;
    let buf = unsafe {
        qjs::JS_WriteObject(ctx_ptr, &mut len, value.as_raw(), qjs::JS_WRITE_OBJ_BYTECODE as i32)
    };
    if buf.is_null() {
        return Err(rquickjs::Error::Exception);
    }
    let bytes = unsafe { std::slice::from_raw_parts(buf, len as usize) }.to_vec();
    unsafe { qjs::js_free(ctx_ptr, buf.cast()) };
    Ok(bytes)
}

/// Wrap an owned engine result, surfacing a pending exception
fn owned<'js>(ctx: &Ctx<'js>, raw: qjs::JSValue) -> rquickjs::Result<Value<'js>> {
    if unsafe { qjs::JS_IsException(raw) } {
        return Err(rquickjs::Error::Exception);
    }
    Ok(unsafe { Value::from_raw(ctx.clone(), raw) })
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

fn seal(flags: EvalFlags, bytecode: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HEADER_LEN + bytecode.len());
    payload.extend_from_slice(&flags.bits().to_le_bytes());
    payload.extend_from_slice(&checksum(bytecode).to_le_bytes());
    payload.extend_from_slice(bytecode);
    payload
}

fn unseal(payload: &[u8]) -> Option<(EvalFlags, &[u8])> {
    if payload.len() <= HEADER_LEN {
        return None;
    }
    let (header, bytecode) = payload.split_at(HEADER_LEN);
    let flags = u32::from_le_bytes(header[..4].try_into().ok()?);
    let sum = u64::from_le_bytes(header[4..].try_into().ok()?);
    (sum == checksum(bytecode)).then(|| (EvalFlags::from_bits_truncate(flags), bytecode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_roundtrip() {
        let payload = seal(EvalFlags::MODULE, b"\x05bytecode");
        let (flags, bytecode) = unseal(&payload).unwrap();
        assert_eq!(flags, EvalFlags::MODULE);
        assert_eq!(bytecode, b"\x05bytecode");
    }

    #[test]
    fn test_unseal_rejects_damage() {
        let mut payload = seal(EvalFlags::empty(), b"\x05bytecode");
        let last = payload.len() - 1;
        payload[last] ^= 0xff;
        assert!(unseal(&payload).is_none());
        assert!(unseal(&payload[..HEADER_LEN]).is_none());
        assert!(unseal(&[1, 0]).is_none());
    }
}
