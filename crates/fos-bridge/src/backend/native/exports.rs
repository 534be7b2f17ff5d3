//! Context exports of the native backend

use std::rc::{Rc, Weak};

use rquickjs::function::{Rest, This};
use rquickjs::promise::PromiseState;
use rquickjs::{
    qjs, Array, BigInt, Ctx, Exception, Function, Object, Persistent, Promise, TypedArray, Type,
    Value,
};

use super::{compile, NativeCaller, NativeShared, Shared, ENGINE_VERSION};
use crate::abi::{export, import, phase, promise, tag, EvalFlags};
use crate::backend::{BackendFault, Val};

/// Inspector installed into every context before any script runs.
///
/// It captures the intrinsics it relies on up front and reads objects only
/// through property descriptors, so rendering a value never runs a getter,
/// a `toJSON` method or a proxy trap.
const INSPECTOR: &str = r#"(isProxy) => {
    const describe = Object.getOwnPropertyDescriptor;
    const ownNames = Object.getOwnPropertyNames;
    const protoOf = Object.getPrototypeOf;
    const isArray = Array.isArray;
    const quote = JSON.stringify;
    const str = String;
    const errorProto = Error.prototype;
    const promiseProto = Promise.prototype;
    const ACCESSOR = {};
    const MAX_DEPTH = 4;

    const isObject = (v) => (typeof v === 'object' && v !== null) || typeof v === 'function';
    const slot = (o, k) => {
        const d = describe(o, k);
        if (d === undefined) return undefined;
        const v = describe(d, 'value');
        return v === undefined ? ACCESSOR : v;
    };
    const enumerable = (o, k) => {
        const d = describe(o, k);
        return d !== undefined && describe(d, 'enumerable').value === true;
    };
    const lookup = (o, k) => {
        for (let p = o; p !== null; p = protoOf(p)) {
            if (isProxy(p)) return ACCESSOR;
            const s = slot(p, k);
            if (s !== undefined) return s;
        }
        return undefined;
    };
    const inherits = (o, proto) => {
        for (let p = o; p !== null; p = protoOf(p)) {
            if (isProxy(p)) return false;
            if (p === proto) return true;
        }
        return false;
    };
    const data = (o, k) => {
        if (!isObject(o) || isProxy(o)) return undefined;
        const s = lookup(o, k);
        return s === undefined || s === ACCESSOR ? undefined : s.value;
    };

    const field = (o, k, depth, seen) => {
        const s = slot(o, k);
        if (s === undefined) return 'undefined';
        if (s === ACCESSOR) return '[Getter]';
        return render(s.value, depth + 1, seen);
    };
    const error = (e, depth, seen) => {
        const name = data(e, 'name');
        const message = data(e, 'message');
        const stack = data(e, 'stack');
        let out = (typeof name === 'string' ? name : 'Error') + ': ' + (typeof message === 'string' ? message : '');
        if (typeof stack === 'string' && stack !== '') out += '\n' + stack;
        const cause = slot(e, 'cause');
        if (cause === ACCESSOR) out += '\nCaused by: [Getter]';
        else if (cause !== undefined) out += '\nCaused by: ' + render(cause.value, depth + 1, { x: e, up: seen });
        return out;
    };
    const render = (v, depth, seen) => {
        switch (typeof v) {
            case 'undefined': return 'undefined';
            case 'string': return quote(v);
            case 'bigint': return str(v) + 'n';
            case 'number':
            case 'boolean':
            case 'symbol': return str(v);
        }
        if (v === null) return 'null';
        if (isProxy(v)) return '[Proxy]';
        if (typeof v === 'function') {
            const name = data(v, 'name');
            return '[Function: ' + (typeof name === 'string' && name !== '' ? name : 'anonymous') + ']';
        }
        for (let s = seen; s !== null; s = s.up) {
            if (s.x === v) return '[Circular]';
        }
        if (inherits(v, errorProto)) return error(v, depth, seen);
        if (inherits(v, promiseProto)) return '[Promise]';
        const array = isArray(v);
        if (depth >= MAX_DEPTH) return array ? '[Array]' : '[Object]';
        const inner = { x: v, up: seen };
        let out = '';
        if (array) {
            const length = data(v, 'length');
            for (let i = 0; i < length; i++) {
                if (i > 0) out += ',';
                out += field(v, str(i), depth, inner);
            }
            return '[' + out + ']';
        }
        const keys = ownNames(v);
        for (let i = 0; i < keys.length; i++) {
            const k = keys[i];
            if (!enumerable(v, k)) continue;
            if (out !== '') out += ',';
            out += quote(k) + ':' + field(v, k, depth, inner);
        }
        return '{' + out + '}';
    };

    return { dump: (v) => render(v, 0, null), data };
}"#;

/// Script helpers compiled on first use
const HELPERS: &[(&str, &str)] = &[
    ("json", "(v, indent) => JSON.stringify(v, null, indent)"),
    (
        "iterator",
        r#"(v) => {
            const f = v == null ? undefined : v[Symbol.iterator];
            if (typeof f !== 'function') throw new TypeError('value is not iterable');
            return f.call(v);
        }"#,
    ),
    (
        "equals",
        "(a, b, mode) => mode === 0 ? a === b : mode === 1 ? Object.is(a, b) : (a === b || (a !== a && b !== b))",
    ),
    ("instance_of", "(v, c) => v instanceof c"),
    ("bigint", "(digits) => BigInt(digits)"),
    (
        "length",
        "(v) => { if (v == null) return -1; const n = v.length; return typeof n === 'number' ? n : -1; }",
    ),
    ("keys", "(v) => Object.keys(v)"),
    ("number", "(v) => Number(v)"),
    ("truthy", "(v) => !!v"),
    ("string", "(v) => String(v)"),
    (
        "named",
        "(f, name) => Object.defineProperty(f, 'name', { value: name, configurable: true })",
    ),
];

/// Positional reader over export arguments
pub(super) struct Args<'a> {
    name: &'a str,
    args: &'a [Val],
    pos: usize,
}

impl<'a> Args<'a> {
    pub(super) fn new(name: &'a str, args: &'a [Val]) -> Self {
        Self { name, args, pos: 0 }
    }

    fn next(&mut self) -> Result<Val, BackendFault> {
        let value = self.args.get(self.pos).copied().ok_or_else(|| {
            BackendFault::trap(
                "bad_signature",
                format!("export `{}` expects more than {} arguments", self.name, self.pos),
            )
        })?;
        self.pos += 1;
        Ok(value)
    }

    fn mismatch(&self) -> BackendFault {
        BackendFault::trap(
            "bad_signature",
            format!("argument {} of `{}` has the wrong type", self.pos, self.name),
        )
    }

    pub(super) fn i32(&mut self) -> Result<i32, BackendFault> {
        let value = self.next()?;
        value.as_i32().ok_or_else(|| self.mismatch())
    }

    pub(super) fn u32(&mut self) -> Result<u32, BackendFault> {
        self.i32().map(|v| v as u32)
    }

    pub(super) fn usize(&mut self) -> Result<usize, BackendFault> {
        let value = self.next()?;
        value.as_i64().map(|v| v.max(0) as usize).ok_or_else(|| self.mismatch())
    }

    fn f64(&mut self) -> Result<f64, BackendFault> {
        let value = self.next()?;
        value.as_f64().ok_or_else(|| self.mismatch())
    }

    /// A `(ptr, len)` pair read as UTF-8
    fn string(&mut self, shared: &NativeShared) -> Result<String, BackendFault> {
        let ptr = self.u32()?;
        let len = self.u32()?;
        if len == 0 {
            return Ok(String::new());
        }
        shared.memory.borrow().read_string(ptr, len)
    }

    fn bytes(&mut self, shared: &NativeShared) -> Result<Vec<u8>, BackendFault> {
        let ptr = self.u32()?;
        let len = self.u32()?;
        if len == 0 {
            return Ok(Vec::new());
        }
        shared.memory.borrow().read_vec(ptr, len)
    }
}

pub(super) fn is_memory_export(name: &str) -> bool {
    matches!(name, export::MALLOC | export::FREE | export::ENGINE_VERSION)
}

/// Exports that act on the whole runtime and may not be re-entered
pub(super) fn is_runtime_export(name: &str) -> bool {
    matches!(
        name,
        export::CONTEXT_NEW
            | export::CONTEXT_FREE
            | export::JOB_PENDING
            | export::JOB_EXECUTE
            | export::SET_MAX_STACK_SIZE
            | export::SET_GC_THRESHOLD
            | export::RUN_GC
            | export::MEMORY_USAGE
    )
}

pub(super) fn memory_export(
    shared: &NativeShared,
    name: &str,
    args: &[Val],
) -> Result<Vec<Val>, BackendFault> {
    let mut a = Args::new(name, args);
    match name {
        export::MALLOC => {
            let size = a.u32()?;
            let ptr = shared.memory.borrow_mut().malloc(size);
            Ok(vec![Val::I32(ptr as i32)])
        }
        export::FREE => {
            let ptr = a.u32()?;
            shared.memory.borrow_mut().free(ptr)?;
            Ok(Vec::new())
        }
        export::ENGINE_VERSION => {
            let out = a.u32()?;
            return_bytes(shared, ENGINE_VERSION.as_bytes().to_vec(), out)
        }
        _ => Err(unknown_export(name)),
    }
}

/// Copy bytes into linear memory and report their length through `out`
pub(super) fn return_bytes(
    shared: &NativeShared,
    bytes: Vec<u8>,
    out: u32,
) -> Result<Vec<Val>, BackendFault> {
    let mut memory = shared.memory.borrow_mut();
    let ptr = memory.alloc(&bytes)?;
    memory.write_i32(out, bytes.len() as i32)?;
    Ok(vec![Val::I32(ptr as i32)])
}

fn unknown_export(name: &str) -> BackendFault {
    BackendFault::trap("unknown_export", format!("no export named `{name}`"))
}

/// Successful result of a context export
enum Ret<'js> {
    Value(Value<'js>),
    I32(i32),
    F64(f64),
    Unit,
    Bytes(Vec<u8>, u32),
}

/// How a thrown exception is attributed
enum Phase {
    Runtime,
    Compile,
    /// Compile phase for syntax errors, runtime otherwise
    Module,
}

/// Install the per-context inspector; runs before any script code
pub(super) fn prepare_context<'js>(ctx: &Ctx<'js>, shared: &NativeShared, ctx_id: u32) -> rquickjs::Result<()> {
    let proxy: Value<'js> = ctx.eval("new Proxy({}, {})")?;
    let proxy_class = unsafe { qjs::JS_GetClassID(proxy.as_raw()) };
    let is_proxy = Function::new(ctx.clone(), move |value: Value<'js>| {
        value.is_object() && unsafe { qjs::JS_GetClassID(value.as_raw()) } == proxy_class
    })?;
    let factory: Function<'js> = ctx.eval(format!("({INSPECTOR})"))?;
    let inspector: Object<'js> = factory.call((is_proxy,))?;
    for name in ["dump", "data"] {
        let func: Function<'js> = inspector.get(name)?;
        shared
            .helpers
            .borrow_mut()
            .insert((ctx_id, name), Persistent::save(ctx, func));
    }
    Ok(())
}

/// Phase code for a caught exception. Out-of-memory is reported only when
/// the allocator actually refused a request during this call.
pub(super) fn exception_phase(shared: &NativeShared, exception: &Value<'_>, phase: i32) -> i32 {
    let engine_report = exception.is_null()
        || exception
            .as_exception()
            .and_then(Exception::message)
            .is_some_and(|message| message == "out of memory");
    if shared.heap.exhausted() && engine_report {
        phase::OUT_OF_MEMORY
    } else {
        phase
    }
}

pub(super) fn dispatch<'js>(
    ctx: &Ctx<'js>,
    shared: &Shared,
    ctx_id: u32,
    name: &str,
    args: &[Val],
) -> Result<Vec<Val>, BackendFault> {
    let mut a = Args::new(name, args);
    a.u32()?;
    let mut attribution = Phase::Runtime;

    let result: rquickjs::Result<Ret<'js>> = match name {
        export::CONTEXT_GLOBAL => Ok(Ret::Value(ctx.globals().into_value())),
        export::TAKE_EXCEPTION => {
            let out = a.u32()?;
            let pending = shared.exceptions.borrow_mut().remove(&ctx_id);
            let (ptr, code) = match pending {
                Some((value, code)) => (put_persistent(ctx, shared, value)?, code),
                None => (0, phase::RUNTIME),
            };
            shared.memory.borrow_mut().write_i32(out, code)?;
            Ok(Ret::I32(ptr))
        }
        export::JOB_TAKE_EXCEPTION => {
            let out = a.u32()?;
            let pending = shared.job_exception.borrow_mut().take();
            let (ptr, code) = match pending {
                Some((value, code)) => (put_persistent(ctx, shared, value)?, code),
                None => (0, phase::RUNTIME),
            };
            shared.memory.borrow_mut().write_i32(out, code)?;
            Ok(Ret::I32(ptr))
        }
        export::THROW => {
            let value = shared.get(ctx, a.i32()?)?;
            *shared.thrown.borrow_mut() = Some(Persistent::save(ctx, value));
            Ok(Ret::Unit)
        }

        export::UNDEFINED => Ok(Ret::Value(Value::new_undefined(ctx.clone()))),
        export::NULL => Ok(Ret::Value(Value::new_null(ctx.clone()))),
        export::BOOL => Ok(Ret::Value(Value::new_bool(ctx.clone(), a.i32()? != 0))),
        export::NUMBER => Ok(Ret::Value(Value::new_number(ctx.clone(), a.f64()?))),
        export::STRING => {
            let text = a.string(shared)?;
            rquickjs::String::from_str(ctx.clone(), &text).map(|s| Ret::Value(s.into_value()))
        }
        export::OBJECT => Object::new(ctx.clone()).map(|o| Ret::Value(o.into_value())),
        export::ARRAY => Array::new(ctx.clone()).map(|a| Ret::Value(a.into_value())),
        export::ERROR => {
            let message = a.string(shared)?;
            Exception::from_message(ctx.clone(), &message)
                .map(|e| Ret::Value(e.into_object().into_value()))
        }
        export::FUNCTION => {
            let func_id = a.i32()?;
            let func_name = a.string(shared)?;
            host_function(ctx, shared, ctx_id, func_id, &func_name).map(Ret::Value)
        }
        export::PROMISE => {
            let out = a.u32()?;
            match Promise::new(ctx) {
                Ok((promise, resolve, reject)) => {
                    let resolve = shared.put(ctx, resolve.into_value());
                    let reject = shared.put(ctx, reject.into_value());
                    let mut memory = shared.memory.borrow_mut();
                    memory.write_i32(out, resolve)?;
                    memory.write_i32(out + 4, reject)?;
                    Ok(Ret::Value(promise.into_value()))
                }
                Err(err) => Err(err),
            }
        }
        export::BIGINT => {
            let digits = a.string(shared)?;
            match digits.parse::<i64>() {
                Ok(n) => BigInt::from_i64(ctx.clone(), n).map(|b| Ret::Value(b.into_value())),
                Err(_) => call_helper::<Value>(ctx, shared, ctx_id, "bigint", (digits.as_str(),)).map(Ret::Value),
            }
        }
        export::BYTES => {
            let bytes = a.bytes(shared)?;
            TypedArray::<u8>::new_copy(ctx.clone(), &bytes).map(|t| Ret::Value(t.into_value()))
        }

        export::DUP => Ok(Ret::Value(shared.get(ctx, a.i32()?)?)),
        export::FREE_VALUE => {
            shared.release(a.i32()?)?;
            Ok(Ret::Unit)
        }
        export::TAG => Ok(Ret::I32(tag_of(&shared.get(ctx, a.i32()?)?))),
        export::TO_NUMBER => {
            let value = shared.get(ctx, a.i32()?)?;
            match value.as_number() {
                Some(n) => Ok(Ret::F64(n)),
                None => call_helper::<f64>(ctx, shared, ctx_id, "number", (value,)).map(Ret::F64),
            }
        }
        export::TO_BOOL => {
            let value = shared.get(ctx, a.i32()?)?;
            match value.as_bool() {
                Some(b) => Ok(Ret::I32(b as i32)),
                None => call_helper::<bool>(ctx, shared, ctx_id, "truthy", (value,))
                    .map(|b| Ret::I32(b as i32)),
            }
        }
        export::TO_STRING => {
            let value = shared.get(ctx, a.i32()?)?;
            let out = a.u32()?;
            let text = match value.as_string() {
                Some(s) => s.to_string(),
                None => call_helper::<String>(ctx, shared, ctx_id, "string", (value,)),
            };
            text.map(|t| Ret::Bytes(t.into_bytes(), out))
        }
        export::GET => {
            let target = shared.get(ctx, a.i32()?)?;
            let key = a.string(shared)?;
            as_object(ctx, &target).and_then(|o| o.get::<_, Value>(key.as_str()).map(Ret::Value))
        }
        export::SET => {
            let target = shared.get(ctx, a.i32()?)?;
            let key = a.string(shared)?;
            let value = shared.get(ctx, a.i32()?)?;
            as_object(ctx, &target).and_then(|o| o.set(key.as_str(), value).map(|_| Ret::I32(1)))
        }
        export::GET_DATA => {
            let target = shared.get(ctx, a.i32()?)?;
            let key = a.string(shared)?;
            call_helper::<Value>(ctx, shared, ctx_id, "data", (target, key.as_str())).map(Ret::Value)
        }
        export::GET_INDEX => {
            let target = shared.get(ctx, a.i32()?)?;
            let index = a.u32()?;
            as_object(ctx, &target).and_then(|o| o.get::<_, Value>(index).map(Ret::Value))
        }
        export::SET_INDEX => {
            let target = shared.get(ctx, a.i32()?)?;
            let index = a.u32()?;
            let value = shared.get(ctx, a.i32()?)?;
            as_object(ctx, &target).and_then(|o| o.set(index, value).map(|_| Ret::I32(1)))
        }
        export::KEYS => {
            let target = shared.get(ctx, a.i32()?)?;
            call_helper::<Value>(ctx, shared, ctx_id, "keys", (target,)).map(Ret::Value)
        }
        export::LENGTH => {
            let target = shared.get(ctx, a.i32()?)?;
            call_helper::<f64>(ctx, shared, ctx_id, "length", (target,)).map(|n| Ret::I32(n as i32))
        }
        export::CALL => {
            let func = shared.get(ctx, a.i32()?)?;
            let this = shared.get(ctx, a.i32()?)?;
            let argc = a.u32()?;
            let argv = a.u32()?;
            let mut call_args = Vec::with_capacity(argc as usize);
            if argc > 0 {
                let raw = shared.memory.borrow().read_vec(argv, argc * 4)?;
                for chunk in raw.chunks_exact(4) {
                    let ptr = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    call_args.push(shared.get(ctx, ptr)?);
                }
            }
            match func.as_function() {
                Some(f) => f.call::<_, Value>((This(this), Rest(call_args))).map(Ret::Value),
                None => Err(Exception::throw_type(ctx, "value is not a function")),
            }
        }
        export::ITERATOR => {
            let target = shared.get(ctx, a.i32()?)?;
            call_helper::<Value>(ctx, shared, ctx_id, "iterator", (target,)).map(Ret::Value)
        }
        export::EQUALS => {
            let left = shared.get(ctx, a.i32()?)?;
            let right = shared.get(ctx, a.i32()?)?;
            let mode = a.i32()?;
            call_helper::<bool>(ctx, shared, ctx_id, "equals", (left, right, mode))
                .map(|b| Ret::I32(b as i32))
        }
        export::DUMP => {
            let target = shared.get(ctx, a.i32()?)?;
            let out = a.u32()?;
            call_helper::<String>(ctx, shared, ctx_id, "dump", (target,))
                .map(|s| Ret::Bytes(s.into_bytes(), out))
        }
        export::INSTANCE_OF => {
            let value = shared.get(ctx, a.i32()?)?;
            let constructor = shared.get(ctx, a.i32()?)?;
            call_helper::<bool>(ctx, shared, ctx_id, "instance_of", (value, constructor))
                .map(|b| Ret::I32(b as i32))
        }
        export::TO_BYTES => {
            let value = shared.get(ctx, a.i32()?)?;
            let out = a.u32()?;
            byte_contents(ctx, &value).map(|bytes| Ret::Bytes(bytes, out))
        }
        export::TO_JSON => {
            let target = shared.get(ctx, a.i32()?)?;
            let indent = a.i32()?;
            let out = a.u32()?;
            match call_helper::<Option<String>>(ctx, shared, ctx_id, "json", (target, indent)) {
                Ok(Some(json)) => Ok(Ret::Bytes(json.into_bytes(), out)),
                Ok(None) => Err(Exception::throw_type(ctx, "value has no JSON representation")),
                Err(err) => Err(err),
            }
        }
        export::PROMISE_STATE => {
            let value = shared.get(ctx, a.i32()?)?;
            let code = match value.as_promise() {
                None => promise::NOT_A_PROMISE,
                Some(p) => match p.state() {
                    PromiseState::Pending => promise::PENDING,
                    PromiseState::Resolved => promise::FULFILLED,
                    PromiseState::Rejected => promise::REJECTED,
                },
            };
            Ok(Ret::I32(code))
        }
        export::PROMISE_RESULT => {
            let value = shared.get(ctx, a.i32()?)?;
            match value.as_promise().and_then(|p| p.result::<Value>()) {
                None => Ok(Ret::Value(Value::new_undefined(ctx.clone()))),
                Some(Ok(result)) => Ok(Ret::Value(result)),
                // A rejected promise rethrows its reason; hand the reason back as a value
                Some(Err(rquickjs::Error::Exception)) => Ok(Ret::Value(ctx.catch())),
                Some(Err(err)) => Err(err),
            }
        }

        export::EVAL => {
            let source = a.string(shared)?;
            let filename = a.string(shared)?;
            let flags = EvalFlags::from_bits_truncate(a.u32()?);
            if flags.contains(EvalFlags::MODULE) {
                attribution = Phase::Module;
                compile::parse_module(ctx, &source, &filename).and_then(|module| {
                    attribution = Phase::Runtime;
                    module.eval().map(|(_, promise)| Ret::Value(promise.into_value()))
                })
            } else {
                attribution = Phase::Compile;
                compile::parse_script(ctx, &source, &filename, flags).and_then(|program| {
                    attribution = Phase::Runtime;
                    compile::run(ctx, program).map(Ret::Value)
                })
            }
        }
        export::COMPILE => {
            let source = a.string(shared)?;
            let filename = a.string(shared)?;
            let flags = EvalFlags::from_bits_truncate(a.u32()?);
            let out = a.u32()?;
            attribution = Phase::Compile;
            compile::compile(ctx, &source, &filename, flags).map(|bytes| Ret::Bytes(bytes, out))
        }
        export::EVAL_COMPILED => {
            let payload = a.bytes(shared)?;
            attribution = Phase::Compile;
            compile::load(ctx, &payload).and_then(|program| {
                attribution = Phase::Runtime;
                compile::run(ctx, program).map(Ret::Value)
            })
        }

        _ => return Err(unknown_export(name)),
    };

    match result {
        Ok(Ret::Value(value)) => Ok(vec![Val::I32(shared.put(ctx, value))]),
        Ok(Ret::I32(v)) => Ok(vec![Val::I32(v)]),
        Ok(Ret::F64(v)) => Ok(vec![Val::F64(v)]),
        Ok(Ret::Unit) => Ok(Vec::new()),
        Ok(Ret::Bytes(bytes, out)) => return_bytes(shared, bytes, out),
        Err(err) => {
            let exception = caught(ctx, err);
            let code = exception_phase(shared, &exception, attribute(ctx, shared, ctx_id, &exception, attribution));
            shared
                .exceptions
                .borrow_mut()
                .insert(ctx_id, (Persistent::save(ctx, exception), code));
            Ok(failure_result(name))
        }
    }
}

fn failure_result(name: &str) -> Vec<Val> {
    match name {
        export::TO_NUMBER => vec![Val::F64(f64::NAN)],
        export::INSTANCE_OF => vec![Val::I32(-1)],
        export::THROW | export::FREE_VALUE => Vec::new(),
        _ => vec![Val::I32(0)],
    }
}

fn put_persistent<'js>(
    ctx: &Ctx<'js>,
    shared: &NativeShared,
    value: Persistent<Value<'static>>,
) -> Result<i32, BackendFault> {
    let value = value
        .restore(ctx)
        .map_err(|e| BackendFault::trap("invalid_handle", e.to_string()))?;
    Ok(shared.put(ctx, value))
}

/// The exception value behind an engine error
fn caught<'js>(ctx: &Ctx<'js>, err: rquickjs::Error) -> Value<'js> {
    match err {
        rquickjs::Error::Exception => ctx.catch(),
        other => Exception::from_message(ctx.clone(), &other.to_string())
            .map(|e| e.into_object().into_value())
            .unwrap_or_else(|_| Value::new_undefined(ctx.clone())),
    }
}

fn attribute<'js>(
    ctx: &Ctx<'js>,
    shared: &Shared,
    ctx_id: u32,
    exception: &Value<'js>,
    attribution: Phase,
) -> i32 {
    match attribution {
        Phase::Runtime => phase::RUNTIME,
        Phase::Compile => phase::COMPILE,
        Phase::Module => {
            let name = call_helper::<Value>(ctx, shared, ctx_id, "data", (exception.clone(), "name"));
            match name.ok().and_then(|n| n.as_string().and_then(|s| s.to_string().ok())) {
                Some(name) if name == "SyntaxError" => phase::COMPILE,
                _ => phase::RUNTIME,
            }
        }
    }
}

/// Contents of an `ArrayBuffer` or `Uint8Array`
fn byte_contents<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<Vec<u8>> {
    let Some(object) = value.as_object() else {
        return Err(Exception::throw_type(ctx, "value is not a byte buffer"));
    };
    let bytes = if let Some(buffer) = object.as_array_buffer() {
        buffer.as_bytes()
    } else if let Some(array) = object.as_typed_array::<u8>() {
        array.as_bytes()
    } else {
        return Err(Exception::throw_type(ctx, "value is not a byte buffer"));
    };
    match bytes {
        Some(bytes) => Ok(bytes.to_vec()),
        None => Err(Exception::throw_type(ctx, "byte buffer is detached")),
    }
}

fn as_object<'a, 'js>(ctx: &Ctx<'js>, value: &'a Value<'js>) -> rquickjs::Result<&'a Object<'js>> {
    value
        .as_object()
        .ok_or_else(|| Exception::throw_type(ctx, "value is not an object"))
}

fn tag_of(value: &Value<'_>) -> i32 {
    if value.is_undefined() {
        return tag::UNDEFINED;
    }
    if value
        .as_object()
        .is_some_and(|o| o.is_array_buffer() || o.is_typed_array::<u8>())
    {
        return tag::BYTES;
    }
    match value.type_of() {
        Type::Undefined => tag::UNDEFINED,
        Type::Null => tag::NULL,
        Type::Bool => tag::BOOLEAN,
        Type::Int | Type::Float => tag::NUMBER,
        Type::BigInt => tag::BIGINT,
        Type::String => tag::STRING,
        Type::Symbol => tag::SYMBOL,
        Type::Array => tag::ARRAY,
        Type::Function | Type::Constructor => tag::FUNCTION,
        Type::Promise => tag::PROMISE,
        Type::Exception => tag::ERROR,
        _ => tag::OBJECT,
    }
}

/// Call one of the per-context helpers, compiling it on first use
fn call_helper<'js, R>(
    ctx: &Ctx<'js>,
    shared: &NativeShared,
    ctx_id: u32,
    name: &'static str,
    args: impl rquickjs::function::IntoArgs<'js>,
) -> rquickjs::Result<R>
where
    R: rquickjs::FromJs<'js>,
{
    helper(ctx, shared, ctx_id, name)?.call(args)
}

fn helper<'js>(
    ctx: &Ctx<'js>,
    shared: &NativeShared,
    ctx_id: u32,
    name: &'static str,
) -> rquickjs::Result<Function<'js>> {
    let cached = shared.helpers.borrow().get(&(ctx_id, name)).cloned();
    if let Some(cached) = cached {
        return cached.restore(ctx);
    }
    let source = HELPERS
        .iter()
        .find(|(helper, _)| *helper == name)
        .map(|(_, source)| format!("({source})"))
        .ok_or_else(|| Exception::throw_internal(ctx, &format!("unknown helper `{name}`")))?;
    let func: Function<'js> = ctx.eval(source)?;
    shared
        .helpers
        .borrow_mut()
        .insert((ctx_id, name), Persistent::save(ctx, func.clone()));
    Ok(func)
}

/// A script function that forwards to the `host_call` import
fn host_function<'js>(
    ctx: &Ctx<'js>,
    shared: &Shared,
    ctx_id: u32,
    func_id: i32,
    name: &str,
) -> rquickjs::Result<Value<'js>> {
    let weak = Rc::downgrade(shared);
    let func = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, this: This<Value<'js>>, args: Rest<Value<'js>>| {
            call_host(&ctx, &weak, ctx_id, func_id, this.0, args.0)
        },
    )?;
    if !name.is_empty() {
        call_helper::<Value>(ctx, shared, ctx_id, "named", (func.clone(), name))?;
    }
    Ok(func.into_value())
}

fn call_host<'js>(
    ctx: &Ctx<'js>,
    shared: &Weak<NativeShared>,
    ctx_id: u32,
    func_id: i32,
    this: Value<'js>,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let Some(shared) = shared.upgrade() else {
        return Err(Exception::throw_internal(ctx, "engine instance was dropped"));
    };
    let Some(import) = shared.imports.get(import::HOST_CALL) else {
        return Err(Exception::throw_internal(ctx, "host_call import is not linked"));
    };

    let this_ptr = shared.put(ctx, this);
    let arg_ptrs: Vec<i32> = args.into_iter().map(|v| shared.put(ctx, v)).collect();
    let argv = if arg_ptrs.is_empty() {
        Ok(0)
    } else {
        let bytes: Vec<u8> = arg_ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
        shared.memory.borrow_mut().alloc(&bytes)
    };

    let outcome = argv.and_then(|argv| {
        let call_args = [
            Val::I32(ctx_id as i32),
            Val::I32(func_id),
            Val::I32(this_ptr),
            Val::I32(arg_ptrs.len() as i32),
            Val::I32(argv as i32),
        ];
        let mut caller = NativeCaller::new(ctx.clone(), ctx_id, shared.clone());
        let outcome = import(&mut caller, &call_args);
        shared.memory.borrow_mut().free(argv)?;
        outcome
    });

    for ptr in std::iter::once(this_ptr).chain(arg_ptrs) {
        if let Err(fault) = shared.release(ptr) {
            tracing::warn!("Failed to release host call argument {}: {}", ptr, fault);
        }
    }

    let ret = match outcome {
        Ok(values) => values.first().and_then(Val::as_i32).unwrap_or(0),
        Err(fault) => return Err(shared.raise(ctx, fault)),
    };
    if ret != 0 {
        return shared.take(ctx, ret).map_err(|fault| shared.raise(ctx, fault));
    }
    let thrown = shared.thrown.borrow_mut().take();
    match thrown {
        Some(value) => {
            let value = value.restore(ctx)?;
            Err(ctx.throw(value))
        }
        None => Err(Exception::throw_internal(ctx, "host function failed without an exception")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_exports_are_not_runtime_exports() {
        assert!(is_memory_export(export::MALLOC));
        assert!(!is_runtime_export(export::MALLOC));
        assert!(is_runtime_export(export::JOB_EXECUTE));
        assert!(!is_runtime_export(export::EVAL));
    }
}
