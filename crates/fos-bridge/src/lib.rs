//! fOS Script Bridge
//!
//! Embeds sandboxed JavaScript realms behind a small backend contract.
//!
//! Features:
//! - Pluggable execution backends (in-process QuickJS via rquickjs)
//! - Scoped value handles with leak accounting
//! - Typed marshaling, including serde records, enums and flag sets
//! - Host functions, host modules and async host calls
//! - Promise, job and unhandled-rejection integration with smol
//! - Engine-stamped bytecode and a recompiling cache
//! - Interrupt and memory-limit enforcement
//! - Console and timer APIs

pub mod abi;
pub mod backend;
mod bridge;
mod bytecode;
mod config;
mod console;
mod error;
mod handle;
mod host;
pub mod marshal;
mod realm;
mod runtime;
mod scope;
mod timers;

pub use backend::{Backend, BackendFactory, BackendFault, BackendId};
pub use bridge::{DrainReport, RejectionCallback};
pub use bytecode::{BytecodeCache, BytecodeHeader, CacheStats, CompiledBytecode};
pub use config::{EvalKind, EvalOptions, RuntimeConfig, detect_module};
pub use console::{ConsoleLevel, ConsoleSink, install_console, install_console_with};
pub use error::{
    BridgeError, ConversionError, FailureKind, PathSegment, Result, RuntimeCause, ScriptError, TranslatedError,
    translate_exception, translate_fault,
};
pub use handle::{PromiseState, RealmId, ScriptIterator, ScriptType, ValueHandle};
pub use host::{Bindings, CallArgs, HOST_ERROR_NAME};
pub use marshal::{Bytes, Enum, Flags, FromScript, HostValue, IntoScript, Record, ScriptEnum, from_host};
pub use realm::Realm;
pub use runtime::Runtime;
pub use scope::{AsScope, Scope};
pub use timers::install_timers;

/// Evaluate a script in a throwaway realm
#[cfg(feature = "native")]
pub fn eval(code: &str) -> Result<HostValue> {
    let runtime = Runtime::new()?;
    let mut realm = runtime.create_realm()?;
    realm.eval(code)
}
