//! Error translation
//!
//! Classifies backend faults and script exceptions into [`TranslatedError`],
//! and defines the crate-wide [`BridgeError`].

use std::fmt;

use crate::backend::{BackendFault, BackendId};
use crate::handle::{RealmId, ScriptType};
use crate::marshal::HostValue;

/// Result alias used throughout the bridge
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Everything that can go wrong at the bridge boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Engine(#[from] TranslatedError),

    #[error("{0} used after dispose")]
    UseAfterDispose(&'static str),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: ScriptType,
    },

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("value belongs to realm {found}, not realm {expected}")]
    RealmMismatch { expected: RealmId, found: RealmId },

    #[error("realm is already in use by an active call")]
    Reentrant,

    #[error("globals must be registered before the first evaluation")]
    GlobalsSealed,

    #[error("awaited promise can never settle: no pending jobs or host tasks")]
    Stalled,
}

impl BridgeError {
    /// The translated engine error, if this is one
    pub fn as_engine(&self) -> Option<&TranslatedError> {
        match self {
            BridgeError::Engine(err) => Some(err),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        self.as_engine().map(|err| err.kind)
    }

    pub fn is_interrupted(&self) -> bool {
        self.as_engine().is_some_and(TranslatedError::is_interrupted)
    }
}

// ============================================================================
// TRANSLATED ERRORS
// ============================================================================

/// The four fault classes a backend can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Compilation,
    Instantiation,
    Runtime,
    Trap,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Compilation => "compilation failure",
            FailureKind::Instantiation => "instantiation failure",
            FailureKind::Runtime => "runtime failure",
            FailureKind::Trap => "trap",
        };
        f.write_str(name)
    }
}

/// Why a runtime failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeCause {
    /// The script threw a catchable value
    Threw,
    /// The interrupt predicate or evaluation deadline fired
    Interrupted,
    /// The heap ceiling was hit
    MemoryLimit,
    /// A host function failed and its error escaped the script
    HostFunction,
    /// The backend reported a generic execution failure
    Backend,
}

/// A script-level exception marshaled into host form
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub name: Option<String>,
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Box<ScriptError>>,
    /// Host snapshot of the thrown value
    pub value: HostValue,
}

impl ScriptError {
    /// Messages along the cause chain, outermost first
    pub fn chain(&self) -> impl Iterator<Item = &ScriptError> {
        std::iter::successors(Some(self), |err| err.cause.as_deref())
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Structured error produced at the realm boundary
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} in {backend}: {message}")]
pub struct TranslatedError {
    pub kind: FailureKind,
    pub backend: BackendId,
    pub trap_code: Option<String>,
    pub cause: Option<RuntimeCause>,
    pub message: String,
    pub script_error: Option<ScriptError>,
}

impl TranslatedError {
    pub fn is_interrupted(&self) -> bool {
        self.cause == Some(RuntimeCause::Interrupted)
    }

    pub fn is_memory_limit(&self) -> bool {
        self.cause == Some(RuntimeCause::MemoryLimit)
    }

    /// Message of the thrown script value, if the script threw
    pub fn script_message(&self) -> Option<&str> {
        self.script_error.as_ref().map(|err| err.message.as_str())
    }

    pub(crate) fn compilation(backend: &BackendId, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Compilation,
            backend: backend.clone(),
            trap_code: None,
            cause: None,
            message: message.into(),
            script_error: None,
        }
    }
}

/// Translate a raw backend fault
pub fn translate_fault(backend: &BackendId, fault: BackendFault) -> TranslatedError {
    let (kind, trap_code, cause, message) = match fault {
        BackendFault::Compilation(message) => (FailureKind::Compilation, None, None, message),
        BackendFault::Instantiation(message) => (FailureKind::Instantiation, None, None, message),
        BackendFault::Runtime(message) => {
            (FailureKind::Runtime, None, Some(RuntimeCause::Backend), message)
        }
        BackendFault::Trap { code, message } => {
            tracing::warn!(backend = %backend, code = %code, "Backend trap: {}", message);
            (FailureKind::Trap, Some(code), None, message)
        }
    };
    TranslatedError {
        kind,
        backend: backend.clone(),
        trap_code,
        cause,
        message,
        script_error: None,
    }
}

/// Classify a caught script exception.
///
/// `out_of_memory` is reported by the backend when its allocator refused a
/// request during the step; the exception text alone never implies it. An
/// interrupt that fired during the evaluation wins over an out-of-memory
/// report from the same step.
pub fn translate_exception(
    backend: &BackendId,
    error: ScriptError,
    compile_phase: bool,
    interrupted: bool,
    out_of_memory: bool,
) -> TranslatedError {
    let internal = error.name.as_deref() == Some("InternalError");
    let cause = if interrupted || (internal && error.message == "interrupted") {
        RuntimeCause::Interrupted
    } else if out_of_memory {
        RuntimeCause::MemoryLimit
    } else if error.name.as_deref() == Some(crate::host::HOST_ERROR_NAME) {
        RuntimeCause::HostFunction
    } else {
        RuntimeCause::Threw
    };

    let kind = if compile_phase && cause == RuntimeCause::Threw {
        FailureKind::Compilation
    } else {
        FailureKind::Runtime
    };
    let message = match cause {
        RuntimeCause::Interrupted => "interrupted".to_string(),
        RuntimeCause::MemoryLimit => "memory limit exceeded".to_string(),
        _ => error.to_string(),
    };

    TranslatedError {
        kind,
        backend: backend.clone(),
        trap_code: None,
        cause: (kind == FailureKind::Runtime).then_some(cause),
        message,
        script_error: Some(error),
    }
}

// ============================================================================
// CONVERSION ERRORS
// ============================================================================

/// One step of the path to a failing field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A script value did not fit the requested host shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
    pub path: Vec<PathSegment>,
    pub message: String,
}

impl ConversionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            path: Vec::new(),
            message: message.into(),
        }
    }

    pub(crate) fn at_key(mut self, key: &str) -> Self {
        self.path.insert(0, PathSegment::Key(key.to_string()));
        self
    }

    pub(crate) fn at_index(mut self, index: usize) -> Self {
        self.path.insert(0, PathSegment::Index(index));
        self
    }

    /// Dotted path of the first incompatible field, e.g. `items[2].name`
    pub fn field(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            match segment {
                PathSegment::Key(key) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(key);
                }
                PathSegment::Index(index) => out.push_str(&format!("[{index}]")),
            }
        }
        out
    }
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "conversion failed: {}", self.message)
        } else {
            write!(f, "conversion failed at `{}`: {}", self.field(), self.message)
        }
    }
}

impl std::error::Error for ConversionError {}

impl serde::de::Error for ConversionError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        ConversionError::new(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        ConversionError::new("missing required field").at_key(field)
    }

    // The map access records which key failed
    fn unknown_field(_field: &str, _expected: &'static [&'static str]) -> Self {
        ConversionError::new("field is not part of the closed record")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> BackendId {
        BackendId::new("test", "1")
    }

    fn script_error(name: &str, message: &str) -> ScriptError {
        ScriptError {
            name: Some(name.to_string()),
            message: message.to_string(),
            stack: None,
            cause: None,
            value: HostValue::Undefined,
        }
    }

    #[test]
    fn test_trap_keeps_code() {
        let err = translate_fault(&backend(), BackendFault::trap("memory_out_of_bounds", "oob"));
        assert_eq!(err.kind, FailureKind::Trap);
        assert_eq!(err.trap_code.as_deref(), Some("memory_out_of_bounds"));
        assert_eq!(err.backend, backend());
    }

    #[test]
    fn test_syntax_error_in_compile_phase() {
        let err = translate_exception(&backend(), script_error("SyntaxError", "unexpected token"), true, false, false);
        assert_eq!(err.kind, FailureKind::Compilation);
        assert!(err.cause.is_none());
    }

    #[test]
    fn test_interrupt_wins_over_memory_limit() {
        let err = translate_exception(&backend(), script_error("InternalError", "out of memory"), false, true, true);
        assert!(err.is_interrupted());
        assert!(!err.is_memory_limit());
    }

    #[test]
    fn test_out_of_memory_is_memory_limit() {
        let err = translate_exception(&backend(), script_error("InternalError", "out of memory"), false, false, true);
        assert_eq!(err.kind, FailureKind::Runtime);
        assert!(err.is_memory_limit());
        assert_eq!(err.message, "memory limit exceeded");
    }

    #[test]
    fn test_out_of_memory_text_alone_is_a_throw() {
        let err = translate_exception(&backend(), script_error("InternalError", "out of memory"), false, false, false);
        assert_eq!(err.cause, Some(RuntimeCause::Threw));
        assert!(!err.is_memory_limit());

        let bare = ScriptError {
            name: None,
            message: "out of memory".to_string(),
            stack: None,
            cause: None,
            value: HostValue::String("out of memory".to_string()),
        };
        let err = translate_exception(&backend(), bare, false, false, false);
        assert_eq!(err.cause, Some(RuntimeCause::Threw));
    }

    #[test]
    fn test_thrown_value_keeps_message() {
        let err = translate_exception(&backend(), script_error("TypeError", "x is not a function"), false, false, false);
        assert_eq!(err.cause, Some(RuntimeCause::Threw));
        assert_eq!(err.script_message(), Some("x is not a function"));
    }

    #[test]
    fn test_escaped_host_error() {
        let err = translate_exception(&backend(), script_error("HostError", "disk full"), false, false, false);
        assert_eq!(err.cause, Some(RuntimeCause::HostFunction));
        assert_eq!(err.message, "HostError: disk full");
    }

    #[test]
    fn test_conversion_error_path() {
        let err = ConversionError::new("expected number")
            .at_key("name")
            .at_index(2)
            .at_key("items");
        assert_eq!(err.field(), "items[2].name");
        assert!(err.to_string().contains("items[2].name"));
    }
}
