//! Integration tests for fos-bridge
//!
//! Drives realms end to end on the native backend: handle accounting,
//! marshaling, host functions, the async bridge, bytecode and limits.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Waker};
use std::time::Duration;

use anyhow::Context as _;
use fos_bridge::{
    BridgeError, Bytes, BytecodeCache, CallArgs, CompiledBytecode, EvalOptions, FailureKind, Flags, HostValue, PromiseState,
    Realm, Record, Runtime, RuntimeCause, RuntimeConfig, Scope, ScriptType,
};
use serde::{Deserialize, Serialize};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn realm() -> (Runtime, Realm) {
    init_tracing();
    let runtime = Runtime::new().unwrap();
    let realm = runtime.create_realm().unwrap();
    (runtime, realm)
}

fn engine_error(err: &BridgeError) -> &fos_bridge::TranslatedError {
    err.as_engine().unwrap_or_else(|| panic!("expected an engine error, got {err:?}"))
}

/// Numeric field of the runtime memory report, e.g. `"heap: "`
fn report_number(runtime: &Runtime, prefix: &str) -> usize {
    let report = runtime.memory_usage_report().unwrap();
    report
        .lines()
        .find_map(|line| line.strip_prefix(prefix))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .unwrap_or_else(|| panic!("no `{prefix}` in {report}"))
}

// ============================================================================
// HANDLES
// ============================================================================

#[test]
fn test_live_handles_return_to_baseline() {
    let (_runtime, mut realm) = realm();
    let baseline = realm.live_handles();

    let object = realm.eval_code("({ a: 1, b: 'two' })", EvalOptions::script()).unwrap();
    let a = object.get_property(&mut realm, "a").unwrap();
    assert_eq!(realm.live_handles(), baseline + 2);

    assert_eq!(a.as_number(&mut realm).unwrap(), 1.0);
    a.dispose(&mut realm).unwrap();
    object.dispose(&mut realm).unwrap();
    assert_eq!(realm.live_handles(), baseline);
}

#[test]
fn test_double_dispose_is_detected() {
    let (_runtime, mut realm) = realm();
    let value = realm.new_value("hello").unwrap();
    let other = realm.new_value(7).unwrap();

    value.dispose(&mut realm).unwrap();
    assert!(matches!(value.dispose(&mut realm), Err(BridgeError::UseAfterDispose(_))));
    assert!(matches!(value.as_string(&mut realm), Err(BridgeError::UseAfterDispose(_))));

    // Unrelated handles are untouched
    assert_eq!(other.as_number(&mut realm).unwrap(), 7.0);
}

#[test]
fn test_dropped_handles_release_lazily() {
    let (_runtime, mut realm) = realm();
    let baseline = realm.live_handles();
    let value = realm.eval_code("[1, 2, 3]", EvalOptions::script()).unwrap();
    drop(value);
    realm.eval::<()>("0").unwrap();
    assert_eq!(realm.live_handles(), baseline);
}

#[test]
fn test_type_mismatch() {
    let (_runtime, mut realm) = realm();
    let value = realm.new_value("text").unwrap();
    let err = value.as_number(&mut realm).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::TypeMismatch {
            expected: "number",
            found: ScriptType::String
        }
    ));
}

#[test]
fn test_iterate_array() {
    let (_runtime, mut realm) = realm();
    let array = realm.eval_code("[10, 20, 30]", EvalOptions::script()).unwrap();
    assert_eq!(array.length(&mut realm).unwrap(), 3);

    let items = array.iter(&mut realm).unwrap().collect(&mut realm).unwrap();
    let mut total = 0.0;
    for item in &items {
        total += item.as_number(&mut realm).unwrap();
        item.dispose(&mut realm).unwrap();
    }
    assert_eq!(total, 60.0);
}

#[test]
fn test_handles_are_bound_to_their_realm() {
    let runtime = Runtime::new().unwrap();
    let mut first = runtime.create_realm().unwrap();
    let mut second = runtime.create_realm().unwrap();

    first.eval::<()>("globalThis.shared = 1").unwrap();
    assert_eq!(second.eval::<String>("typeof shared").unwrap(), "undefined");

    let value = first.new_value(5).unwrap();
    assert!(matches!(
        value.as_number(&mut second),
        Err(BridgeError::RealmMismatch { .. })
    ));
}

#[test]
fn test_use_after_realm_dispose() {
    let (_runtime, mut realm) = realm();
    let value = realm.new_value(1).unwrap();
    realm.dispose().unwrap();
    realm.dispose().unwrap();
    assert!(realm.is_disposed());
    assert!(matches!(realm.eval::<f64>("1"), Err(BridgeError::UseAfterDispose(_))));
    assert!(matches!(value.as_number(&mut realm), Err(BridgeError::UseAfterDispose(_))));
}

#[test]
fn test_runtime_dispose_invalidates_realms() {
    let (runtime, mut realm) = realm();
    assert_eq!(runtime.realm_count(), 1);
    runtime.dispose().unwrap();
    runtime.dispose().unwrap();
    assert!(runtime.is_disposed());
    assert!(matches!(realm.eval::<f64>("1"), Err(BridgeError::UseAfterDispose(_))));
    assert!(matches!(runtime.create_realm(), Err(BridgeError::UseAfterDispose(_))));
}

// ============================================================================
// MARSHALING
// ============================================================================

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Settings {
    name: String,
    #[serde(default)]
    retries: u32,
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Point {
    x: f64,
    y: f64,
}

#[test]
fn test_record_roundtrip_with_defaults() {
    let (_runtime, mut realm) = realm();
    let Record(settings) = realm
        .eval::<Record<Settings>>("({ name: 'svc', tags: ['a', 'b'] })")
        .unwrap();
    assert_eq!(
        settings,
        Settings {
            name: "svc".into(),
            retries: 0,
            tags: vec!["a".into(), "b".into()],
        }
    );

    let value = realm.new_record(&settings).unwrap();
    assert_eq!(value.get_or_default::<f64>(&mut realm, "retries").unwrap(), 0.0);
    assert_eq!(value.get_or_default::<String>(&mut realm, "missing").unwrap(), "");
    let Record(back) = value.to::<Record<Settings>>(&mut realm).unwrap();
    assert_eq!(back, settings);
}

#[test]
fn test_conversion_error_names_field() {
    let (_runtime, mut realm) = realm();
    let err = realm
        .eval::<Record<Settings>>("({ name: 'svc', tags: ['a', 7] })")
        .unwrap_err();
    match err {
        BridgeError::Conversion(conv) => assert_eq!(conv.field(), "tags[1]"),
        other => panic!("expected conversion error, got {other:?}"),
    }
}

#[test]
fn test_closed_record_rejects_extra_fields() {
    let (_runtime, mut realm) = realm();
    assert!(realm.eval::<Record<Point>>("({ x: 1, y: 2 })").is_ok());
    let err = realm.eval::<Record<Point>>("({ x: 1, y: 2, z: 3 })").unwrap_err();
    match err {
        BridgeError::Conversion(conv) => assert_eq!(conv.field(), "z"),
        other => panic!("expected conversion error, got {other:?}"),
    }
}

#[test]
fn test_host_value_snapshot() {
    let (_runtime, mut realm) = realm();
    let value: HostValue = realm.eval("({ n: 1.5, list: [true, null], s: 'x' })").unwrap();
    assert_eq!(value.get("n").and_then(HostValue::as_f64), Some(1.5));
    assert_eq!(value.get("s").and_then(HostValue::as_str), Some("x"));
    assert_eq!(
        value.get("list"),
        Some(&HostValue::Array(vec![HostValue::Bool(true), HostValue::Null]))
    );
}

fos_bridge::script_enum! {
    enum Level {
        Low = 1,
        High = 5,
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Perms: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

#[test]
fn test_enums_and_flags_cross_as_numbers() {
    let (_runtime, mut realm) = realm();
    let fos_bridge::Enum(level) = realm.eval::<fos_bridge::Enum<Level>>("5").unwrap();
    assert_eq!(level, Level::High);
    assert!(realm.eval::<fos_bridge::Enum<Level>>("3").is_err());
    let low = realm.new_value(fos_bridge::Enum(Level::Low)).unwrap();
    assert_eq!(low.as_number(&mut realm).unwrap(), 1.0);

    let Flags(perms) = realm.eval::<Flags<Perms>>("1 | 4").unwrap();
    assert_eq!(perms, Perms::READ | Perms::EXEC);

    let value = realm.new_value(Flags(Perms::READ | Perms::WRITE)).unwrap();
    assert_eq!(value.as_number(&mut realm).unwrap(), 3.0);
    let global = realm.global().unwrap();
    global.set_property(&mut realm, "perms", &value).unwrap();
    assert_eq!(realm.eval::<f64>("perms & 2").unwrap(), 2.0);
    assert!(realm.eval::<Flags<Perms>>("8").is_err());
}

// ============================================================================
// VALUE OPERATIONS
// ============================================================================

#[test]
fn test_equality_and_shape() {
    let (_runtime, mut realm) = realm();
    let nan = realm.eval_code("NaN", EvalOptions::script()).unwrap();
    let other = realm.eval_code("0 / 0", EvalOptions::script()).unwrap();
    assert!(!nan.strict_equals(&mut realm, &other).unwrap());
    assert!(nan.same_value(&mut realm, &other).unwrap());

    let object = realm.eval_code("({ a: 1, b: [1, 2, 3] })", EvalOptions::script()).unwrap();
    let alias = object.dup(&mut realm).unwrap();
    assert!(object.strict_equals(&mut realm, &alias).unwrap());
    assert_eq!(object.keys(&mut realm).unwrap(), vec!["a", "b"]);
    let list = object.get_property(&mut realm, "b").unwrap();
    assert_eq!(list.length(&mut realm).unwrap(), 3);
    assert_eq!(realm.to_json(&object, 0).unwrap(), r#"{"a":1,"b":[1,2,3]}"#);
}

#[test]
fn test_promise_state() {
    let (_runtime, mut realm) = realm();
    let pending = realm.eval_code("new Promise(() => {})", EvalOptions::script()).unwrap();
    assert_eq!(pending.promise_state(&mut realm).unwrap(), PromiseState::Pending);
    let fulfilled = realm.eval_code("Promise.resolve(1)", EvalOptions::script()).unwrap();
    assert_eq!(fulfilled.promise_state(&mut realm).unwrap(), PromiseState::Fulfilled);

    let number = realm.eval_code("1", EvalOptions::script()).unwrap();
    assert!(matches!(number.promise_state(&mut realm), Err(BridgeError::TypeMismatch { .. })));
}

#[test]
fn test_host_built_error_value() {
    let (_runtime, mut realm) = realm();
    realm
        .with_globals(|globals| {
            globals.function("makeError", |scope: &mut Scope<'_>, _: &CallArgs| {
                Ok(scope.new_error("custom failure")?)
            });
        })
        .unwrap();
    let message: String = realm
        .eval("const e = makeError(); e instanceof Error ? e.message : ''")
        .unwrap();
    assert_eq!(message, "custom failure");
}

#[test]
fn test_runtime_diagnostics() {
    let (runtime, mut realm) = realm();
    realm.eval::<()>("globalThis.data = new Array(1000).fill('x')").unwrap();
    runtime.run_gc().unwrap();
    assert!(runtime.memory_usage_report().unwrap().contains("heap:"));
    assert!(!runtime.engine_version().is_empty());
    assert!(!runtime.is_job_pending().unwrap());
    runtime.set_max_stack_size(1 << 20).unwrap();
    assert_eq!(runtime.realm_count(), 1);
}

#[test]
fn test_one_shot_eval() {
    assert_eq!(fos_bridge::eval("[1, 'two'].length").unwrap(), HostValue::Number(2.0));
}

#[test]
fn test_dump_runs_no_script_code() {
    let (_runtime, mut realm) = realm();
    let value = realm
        .eval_code(
            "globalThis.reads = 0;
            ({
                plain: [1, 'two'],
                get counted() { globalThis.reads++; return 2; },
                toJSON() { globalThis.reads++; return 'replaced'; },
                nested: new Proxy({}, { ownKeys() { globalThis.reads++; return []; } }),
            })",
            EvalOptions::script(),
        )
        .unwrap();
    let text = realm.dump(&value).unwrap();
    assert_eq!(realm.eval::<f64>("reads").unwrap(), 0.0);
    assert!(text.contains(r#""plain":[1,"two"]"#), "{text}");
    assert!(text.contains(r#""counted":[Getter]"#), "{text}");
    assert!(text.contains("[Function: toJSON]"), "{text}");
    assert!(text.contains(r#""nested":[Proxy]"#), "{text}");

    let error = realm
        .eval_code(
            "const e = new Error('boom');
            Object.defineProperty(e, 'cause', { get() { globalThis.reads++; return 1; } });
            e",
            EvalOptions::script(),
        )
        .unwrap();
    let text = realm.dump(&error).unwrap();
    assert!(text.starts_with("Error: boom"), "{text}");
    assert!(text.contains("Caused by: [Getter]"), "{text}");
    assert_eq!(realm.eval::<f64>("reads").unwrap(), 0.0);
}

#[test]
fn test_bigint_keeps_precision() {
    let (_runtime, mut realm) = realm();
    let value: HostValue = realm.eval("2n ** 64n + 1n").unwrap();
    assert_eq!(value, HostValue::BigInt(18_446_744_073_709_551_617));
    assert_eq!(realm.eval::<u64>("2n ** 60n + 1n").unwrap(), (1u64 << 60) + 1);
    assert_eq!(realm.eval::<i128>("-(2n ** 100n)").unwrap(), -(1i128 << 100));
    assert_eq!(realm.eval::<i64>("42").unwrap(), 42);
    assert!(realm.eval::<u64>("-1n").is_err());
    assert!(realm.eval::<i128>("2n ** 200n").is_err());

    let small = realm.new_value(7u64).unwrap();
    assert_eq!(small.tag(), ScriptType::Number);
    let big = realm.new_value(u64::MAX).unwrap();
    assert_eq!(big.tag(), ScriptType::BigInt);
    assert_eq!(big.as_bigint(&mut realm).unwrap(), i128::from(u64::MAX));
    let global = realm.global().unwrap();
    global.set_property(&mut realm, "big", &big).unwrap();
    assert_eq!(realm.eval::<String>("String(big + 1n)").unwrap(), "18446744073709551616");
}

#[test]
fn test_bytes_cross_as_uint8array() {
    let (_runtime, mut realm) = realm();
    let blob = realm.new_value(Bytes(vec![1, 2, 255])).unwrap();
    assert_eq!(blob.tag(), ScriptType::Bytes);
    let global = realm.global().unwrap();
    global.set_property(&mut realm, "blob", &blob).unwrap();
    assert_eq!(
        realm.eval::<String>("blob instanceof Uint8Array ? Array.from(blob).join(',') : ''").unwrap(),
        "1,2,255"
    );

    let Bytes(buffer) = realm.eval::<Bytes>("new Uint8Array([9, 8]).buffer").unwrap();
    assert_eq!(buffer, vec![9, 8]);
    let Bytes(view) = realm.eval::<Bytes>("new Uint8Array([1, 2, 3, 4]).subarray(1, 3)").unwrap();
    assert_eq!(view, vec![2, 3]);

    let record: HostValue = realm.eval("({ data: new Uint8Array([7]) })").unwrap();
    assert_eq!(record.get("data"), Some(&HostValue::Bytes(vec![7])));
}

#[test]
fn test_instance_of() {
    let (_runtime, mut realm) = realm();
    let map = realm.eval_code("new Map()", EvalOptions::script()).unwrap();
    let map_ctor = realm.eval_code("Map", EvalOptions::script()).unwrap();
    let array_ctor = realm.eval_code("Array", EvalOptions::script()).unwrap();
    assert!(map.instance_of(&mut realm, &map_ctor).unwrap());
    assert!(!map.instance_of(&mut realm, &array_ctor).unwrap());

    let number = realm.new_value(1).unwrap();
    let err = map.instance_of(&mut realm, &number).unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Runtime));
    assert_eq!(engine_error(&err).script_error.as_ref().and_then(|e| e.name.as_deref()), Some("TypeError"));
}

#[test]
fn test_failed_host_value_frees_partial_containers() {
    let (runtime, mut realm) = realm();
    realm.eval::<()>("0").unwrap();
    let baseline = report_number(&runtime, "pinned values: ");
    let used = report_number(&runtime, "heap: ");
    runtime.set_memory_limit(Some(used + (256 << 10))).unwrap();

    let huge = HostValue::String("x".repeat(4 << 20));
    let value = HostValue::Object(vec![(
        "list".to_string(),
        HostValue::Array(vec![HostValue::Number(1.0), huge]),
    )]);
    assert!(realm.new_value(value).is_err());

    runtime.set_memory_limit(None).unwrap();
    assert_eq!(report_number(&runtime, "pinned values: "), baseline);
    assert_eq!(realm.eval::<f64>("1 + 1").unwrap(), 2.0);
}

// ============================================================================
// HOST FUNCTIONS
// ============================================================================

#[test]
fn test_sync_host_function() {
    let (_runtime, mut realm) = realm();
    realm
        .with_globals(|globals| {
            globals.function("add", |scope: &mut Scope<'_>, args: &CallArgs| {
                let a: f64 = args.arg(scope, 0)?;
                let b: f64 = args.arg(scope, 1)?;
                Ok(a + b)
            });
            globals.value("appName", "bridge");
        })
        .unwrap();
    assert_eq!(realm.eval::<f64>("add(2, 3)").unwrap(), 5.0);
    assert_eq!(realm.eval::<String>("appName").unwrap(), "bridge");
}

#[test]
fn test_host_error_becomes_script_error() {
    let (_runtime, mut realm) = realm();
    realm
        .with_globals(|globals| {
            globals.function("readConfig", |_: &mut Scope<'_>, _: &CallArgs| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("disk full")).context("failed to read config")
            });
        })
        .unwrap();

    let caught: Vec<String> = realm
        .eval("try { readConfig(); [] } catch (e) { [e.name, e.message, e.cause.message] }")
        .unwrap();
    assert_eq!(caught, ["HostError", "failed to read config", "disk full"]);

    let err = realm.eval::<()>("readConfig()").unwrap_err();
    let engine = engine_error(&err);
    assert_eq!(engine.cause, Some(RuntimeCause::HostFunction));
    let chain: Vec<&str> = engine
        .script_error
        .as_ref()
        .unwrap()
        .chain()
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(chain, ["failed to read config", "disk full"]);

    // Still usable afterwards
    assert_eq!(realm.eval::<f64>("1 + 1").unwrap(), 2.0);
}

#[test]
fn test_globals_sealed_after_first_eval() {
    let (_runtime, mut realm) = realm();
    realm.eval::<()>("0").unwrap();
    let err = realm.with_globals(|globals| {
        globals.value("late", 1);
    });
    assert!(matches!(err, Err(BridgeError::GlobalsSealed)));
}

#[test]
fn test_reentrant_call_is_rejected() {
    let runtime = Rc::new(Runtime::new().unwrap());
    let mut realm = runtime.create_realm().unwrap();
    let nested = Rc::clone(&runtime);
    realm
        .with_globals(|globals| {
            globals.function("collect", move |_: &mut Scope<'_>, _: &CallArgs| {
                nested.run_gc()?;
                Ok(())
            });
        })
        .unwrap();

    let err = realm.eval::<()>("collect()").unwrap_err();
    let message = engine_error(&err).script_message().unwrap().to_string();
    assert!(message.contains("already in use"), "{message}");
    drop(realm);
}

#[test]
fn test_host_module_import() {
    let (_runtime, mut realm) = realm();
    realm
        .register_module("math", |module| {
            module.function("add", |scope: &mut Scope<'_>, args: &CallArgs| {
                let a: f64 = args.arg(scope, 0)?;
                let b: f64 = args.arg(scope, 1)?;
                Ok(a + b)
            });
            module.value("version", "1.0");
        })
        .unwrap();

    let source = "import { add, version } from 'math';\nglobalThis.sum = add(2, 3);\nglobalThis.ver = version;";
    let done = realm.eval_code(source, EvalOptions::module("main.js")).unwrap();
    smol::block_on(realm.resolve::<()>(done)).unwrap();
    assert_eq!(realm.eval::<f64>("sum").unwrap(), 5.0);
    assert_eq!(realm.eval::<String>("ver").unwrap(), "1.0");

    let missing = realm.eval_code("import { x } from 'nope';", EvalOptions::detect());
    let err = match missing {
        Ok(done) => smol::block_on(realm.resolve::<()>(done)).unwrap_err(),
        Err(err) => err,
    };
    assert!(err.to_string().contains("nope"), "{err}");
}

#[test]
fn test_host_call_releases_arguments() {
    let (runtime, mut realm) = realm();
    realm
        .with_globals(|globals| {
            globals.function("width", |scope: &mut Scope<'_>, args: &CallArgs| {
                let text: String = args.arg(scope, 0)?;
                Ok(text.len() as f64)
            });
        })
        .unwrap();
    realm.eval::<f64>("width('warm')").unwrap();
    let baseline = report_number(&runtime, "pinned values: ");

    let total: f64 = realm
        .eval("let n = 0; for (let i = 0; i < 100; i++) n += width('abc', {}, [i]); n")
        .unwrap();
    assert_eq!(total, 300.0);
    assert_eq!(report_number(&runtime, "pinned values: "), baseline);
}

#[test]
fn test_host_modules_leave_no_globals() {
    let (_runtime, mut realm) = realm();
    let before: Vec<String> = realm.eval("Object.getOwnPropertyNames(globalThis)").unwrap();
    realm
        .register_module("config", |module| {
            module.value("mode", "fast");
        })
        .unwrap();
    let done = realm
        .eval_code("import { mode } from 'config';\nglobalThis.mode = mode;", EvalOptions::module("app.js"))
        .unwrap();
    smol::block_on(realm.resolve::<()>(done)).unwrap();
    assert_eq!(realm.eval::<String>("mode").unwrap(), "fast");

    let after: Vec<String> = realm.eval("Object.getOwnPropertyNames(globalThis)").unwrap();
    let added: Vec<&String> = after.iter().filter(|name| !before.contains(name)).collect();
    assert_eq!(added, vec!["mode"]);
}

// ============================================================================
// ASYNC BRIDGE
// ============================================================================

#[test]
fn test_eval_async_settles_promises() {
    let (_runtime, mut realm) = realm();
    let value: f64 = smol::block_on(realm.eval_async("Promise.resolve(42)", EvalOptions::script())).unwrap();
    assert_eq!(value, 42.0);

    let err = smol::block_on(realm.eval_async::<()>("Promise.reject('oops')", EvalOptions::script())).unwrap_err();
    assert_eq!(engine_error(&err).script_message(), Some("oops"));
    assert_eq!(realm.unhandled_rejections(), 0);

    let plain: String = smol::block_on(realm.eval_async("'sync'", EvalOptions::script())).unwrap();
    assert_eq!(plain, "sync");
}

#[test]
fn test_stalled_promise() {
    let (_runtime, mut realm) = realm();
    let err = smol::block_on(realm.eval_async::<()>("new Promise(() => {})", EvalOptions::script())).unwrap_err();
    assert!(matches!(err, BridgeError::Stalled));
}

#[test]
fn test_async_host_function() {
    let (_runtime, mut realm) = realm();
    realm
        .with_globals(|globals| {
            globals.function_async("fetchData", |args: Vec<HostValue>| async move {
                let id = args.first().and_then(HostValue::as_f64).unwrap_or_default();
                smol::Timer::after(Duration::from_millis(5)).await;
                Ok::<_, anyhow::Error>(format!("Item {id}"))
            });
            globals.function_async("failing", |_: Vec<HostValue>| async move {
                Err::<(), _>(anyhow::anyhow!("backend offline"))
            });
        })
        .unwrap();

    let item: String = smol::block_on(realm.eval_async("fetchData(42)", EvalOptions::script())).unwrap();
    assert_eq!(item, "Item 42");

    let chained: String = smol::block_on(realm.eval_async(
        "fetchData(1).then(a => fetchData(2).then(b => a + ', ' + b))",
        EvalOptions::script(),
    ))
    .unwrap();
    assert_eq!(chained, "Item 1, Item 2");

    let message: String = smol::block_on(realm.eval_async(
        "failing().catch(e => e.name + ': ' + e.message)",
        EvalOptions::script(),
    ))
    .unwrap();
    assert_eq!(message, "HostError: backend offline");
    assert_eq!(realm.pending_tasks(), 0);
}

#[test]
fn test_unhandled_rejection_callback() {
    let (_runtime, mut realm) = realm();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    realm.on_unhandled_rejection(move |scope, reason, handled_late| {
        let text = reason.as_string(scope).unwrap_or_default();
        sink.borrow_mut().push((text, handled_late));
    });

    realm.eval::<()>("globalThis.p = Promise.reject('boom'); 0").unwrap();
    let report = realm.drain().unwrap();
    assert_eq!(report.rejections_reported, 1);
    assert_eq!(*seen.borrow(), [("boom".to_string(), false)]);

    realm.eval::<()>("p.catch(() => {}); 0").unwrap();
    realm.drain().unwrap();
    assert_eq!(
        *seen.borrow(),
        [("boom".to_string(), false), ("boom".to_string(), true)]
    );
}

#[test]
fn test_catch_before_drain_is_silent() {
    let (_runtime, mut realm) = realm();
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    realm.on_unhandled_rejection(move |_, _, _| counter.set(counter.get() + 1));

    realm
        .eval::<()>("const q = Promise.reject(new Error('x')); q.catch(() => {}); 0")
        .unwrap();
    let report = realm.drain().unwrap();
    assert_eq!(report.rejections_reported, 0);
    assert_eq!(calls.get(), 0);
}

#[test]
fn test_cancelled_await_leaves_realm_usable() {
    let (_runtime, mut realm) = realm();
    realm
        .with_globals(|globals| {
            globals.function_async("slow", |_: Vec<HostValue>| async move {
                smol::Timer::after(Duration::from_millis(20)).await;
                Ok::<_, anyhow::Error>(1)
            });
        })
        .unwrap();

    {
        let future = realm.eval_async::<f64>(
            "slow().then(v => { globalThis.done = v; return v })",
            EvalOptions::script(),
        );
        let mut future = std::pin::pin!(future);
        let mut cx = Context::from_waker(Waker::noop());
        assert!(future.as_mut().poll(&mut cx).is_pending());
    }

    assert_eq!(realm.pending_tasks(), 1);
    smol::block_on(realm.run_until_idle()).unwrap();
    assert_eq!(realm.eval::<f64>("done").unwrap(), 1.0);
}

#[test]
fn test_shutdown_async_finishes_tasks() {
    let runtime = Runtime::new().unwrap();
    let mut realm = runtime.create_realm().unwrap();
    let finished = Rc::new(Cell::new(false));
    let flag = Rc::clone(&finished);
    realm
        .with_globals(|globals| {
            globals.function_async("work", move |_: Vec<HostValue>| {
                let flag = Rc::clone(&flag);
                async move {
                    smol::Timer::after(Duration::from_millis(5)).await;
                    flag.set(true);
                    Ok::<_, anyhow::Error>(())
                }
            });
        })
        .unwrap();
    realm.eval::<()>("work(); 0").unwrap();

    smol::block_on(runtime.shutdown_async()).unwrap();
    assert!(finished.get());
    assert!(realm.is_disposed());
}

// ============================================================================
// BYTECODE
// ============================================================================

/// An envelope claiming a different engine build
fn foreign_envelope(bytecode: &CompiledBytecode) -> CompiledBytecode {
    let header = bytecode.header().unwrap();
    let mut bytes = b"FOSB".to_vec();
    bytes.extend_from_slice(&1u16.to_le_bytes());
    for part in [header.backend.name.as_str(), header.backend.version.as_str(), "some other engine"] {
        bytes.extend_from_slice(&(part.len() as u16).to_le_bytes());
        bytes.extend_from_slice(part.as_bytes());
    }
    bytes.extend_from_slice(&0u32.to_le_bytes());
    CompiledBytecode::from_bytes(bytes)
}

#[test]
fn test_compile_matches_eval() {
    let (runtime, mut realm) = realm();
    let source = "const xs = [1, 2, 3]; xs.map(x => x * 2).join(',')";
    let bytecode = realm.compile(source, &EvalOptions::script()).unwrap();
    assert_eq!(&bytecode.header().unwrap().backend, runtime.backend_id());

    let compiled = realm.evaluate_compiled(&bytecode).unwrap();
    assert_eq!(compiled.as_string(&mut realm).unwrap(), "2,4,6");

    let mut other = runtime.create_realm().unwrap();
    assert_eq!(other.eval::<String>(source).unwrap(), "2,4,6");
}

#[test]
fn test_mismatched_bytecode_is_compilation_failure() {
    let (_runtime, mut realm) = realm();
    realm.eval::<()>("globalThis.ran = false").unwrap();
    let bytecode = realm.compile("globalThis.ran = true", &EvalOptions::script()).unwrap();

    let err = realm.evaluate_compiled(&foreign_envelope(&bytecode)).unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation));

    let err = realm
        .evaluate_compiled(&CompiledBytecode::from_bytes(b"not bytecode".to_vec()))
        .unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation));
    assert!(!realm.eval::<bool>("ran").unwrap());
}

#[test]
fn test_syntax_errors_are_compilation_failures() {
    let (_runtime, mut realm) = realm();
    let err = realm.compile("let = ;", &EvalOptions::script()).unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation));

    let err = realm.eval::<()>("function (").unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation));

    let err = realm.eval::<()>("null.x").unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Runtime));
    assert_eq!(engine_error(&err).cause, Some(RuntimeCause::Threw));
}

#[test]
fn test_cache_recompiles_stale_entries() {
    let (_runtime, mut realm) = realm();
    let options = EvalOptions::script();
    let source = "6 * 7";
    let fresh = realm.compile(source, &options).unwrap();

    let mut cache = BytecodeCache::new();
    cache.insert(source, &options, foreign_envelope(&fresh));

    let value = cache.evaluate(&mut realm, source, &options).unwrap();
    assert_eq!(value.as_number(&mut realm).unwrap(), 42.0);
    assert_eq!(cache.stats().recompiles, 1);
    assert_eq!(cache.get(source, &options), Some(&fresh));

    cache.evaluate(&mut realm, source, &options).unwrap();
    cache.evaluate(&mut realm, "1", &options).unwrap();
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.recompiles), (1, 1, 1));
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_compile_runs_nothing() {
    let (_runtime, mut realm) = realm();
    let err = realm
        .compile("}); globalThis.pwned = 1; (function(){", &EvalOptions::script())
        .unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation));
    assert_eq!(realm.eval::<String>("typeof pwned").unwrap(), "undefined");

    let bytecode = realm.compile("globalThis.pwned = 1; 7", &EvalOptions::script()).unwrap();
    assert_eq!(realm.eval::<String>("typeof pwned").unwrap(), "undefined");
    let value = realm.evaluate_compiled(&bytecode).unwrap();
    assert_eq!(value.as_number(&mut realm).unwrap(), 7.0);
    assert_eq!(realm.eval::<f64>("pwned").unwrap(), 1.0);
}

#[test]
fn test_top_level_return_is_compilation_failure() {
    let (_runtime, mut realm) = realm();
    let err = realm.eval::<()>("return 5").unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation), "{err:?}");
    let err = realm.compile("return 5", &EvalOptions::script()).unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation), "{err:?}");
}

#[test]
fn test_module_bytecode() {
    let (_runtime, mut realm) = realm();
    realm
        .register_module("math", |module| {
            module.function("add", |scope: &mut Scope<'_>, args: &CallArgs| {
                let a: f64 = args.arg(scope, 0)?;
                let b: f64 = args.arg(scope, 1)?;
                Ok(a + b)
            });
        })
        .unwrap();

    let source = "import { add } from 'math';\nglobalThis.total = add(20, 22);";
    let bytecode = realm.compile(source, &EvalOptions::module("calc.js")).unwrap();
    assert_eq!(realm.eval::<String>("typeof total").unwrap(), "undefined");

    let done = realm.evaluate_compiled(&bytecode).unwrap();
    smol::block_on(realm.resolve::<()>(done)).unwrap();
    assert_eq!(realm.eval::<f64>("total").unwrap(), 42.0);

    let err = realm.compile("export const = 1;", &EvalOptions::module("bad.js")).unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation));
}

#[test]
fn test_corrupt_payload_is_compilation_failure() {
    let (runtime, mut realm) = realm();
    let bytecode = realm.compile("1 + 1", &EvalOptions::script()).unwrap();
    let mut bytes = bytecode.into_bytes();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    let err = realm.evaluate_compiled(&CompiledBytecode::from_bytes(bytes)).unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Compilation));
    assert_eq!(runtime.realm_count(), 1);
}

// ============================================================================
// LIMITS
// ============================================================================

#[test]
fn test_interrupt_handler_stops_runaway_script() {
    let (runtime, mut realm) = realm();
    let checks = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&checks);
    runtime
        .enable_interrupt_handler(move || {
            counter.set(counter.get() + 1);
            counter.get() > 50
        })
        .unwrap();

    let err = realm.eval::<()>("while (true) {}").unwrap_err();
    assert!(err.is_interrupted(), "{err:?}");
    assert_eq!(err.kind(), Some(FailureKind::Runtime));
    assert!(checks.get() > 50);

    runtime.disable_interrupt_handler().unwrap();
    assert_eq!(realm.eval::<f64>("1 + 1").unwrap(), 2.0);
}

#[test]
fn test_eval_timeout() {
    let config = RuntimeConfig::default().with_eval_timeout(Duration::from_millis(20));
    let runtime = Runtime::with_config(config).unwrap();
    let mut realm = runtime.create_realm().unwrap();
    let err = realm.eval::<()>("for (;;) {}").unwrap_err();
    assert!(err.is_interrupted());

    runtime.set_eval_timeout(None);
    assert_eq!(realm.eval::<f64>("3").unwrap(), 3.0);
}

#[test]
fn test_memory_limit_is_runtime_failure() {
    let config = RuntimeConfig::default().with_memory_limit(8 << 20);
    let runtime = Runtime::with_config(config).unwrap();
    let mut realm = runtime.create_realm().unwrap();

    let err = realm
        .eval::<()>("(() => { const chunks = []; for (;;) chunks.push(new Array(100000).fill(1)); })()")
        .unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Runtime));
    assert!(engine_error(&err).is_memory_limit(), "{err:?}");

    runtime.set_memory_limit(None).unwrap();
    assert_eq!(realm.eval::<f64>("2 * 21").unwrap(), 42.0);
}

#[test]
fn test_out_of_memory_text_is_not_a_memory_limit() {
    let config = RuntimeConfig::default().with_memory_limit(64 << 20);
    let runtime = Runtime::with_config(config).unwrap();
    let mut realm = runtime.create_realm().unwrap();

    for source in [
        "throw 'out of memory'",
        "throw null",
        "const e = new Error('out of memory'); e.name = 'InternalError'; throw e",
    ] {
        let err = realm.eval::<()>(source).unwrap_err();
        let err = engine_error(&err);
        assert!(!err.is_memory_limit(), "{source}: {err:?}");
        assert_eq!(err.cause, Some(RuntimeCause::Threw), "{source}");
    }
}
