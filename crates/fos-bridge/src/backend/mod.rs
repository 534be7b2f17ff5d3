//! Backend contract
//!
//! The capability set a concrete execution engine must provide: module
//! loading, instantiation against host imports, export invocation, linear
//! memory access and the interrupt/memory-limit hooks.

#[cfg(feature = "native")]
pub mod native;

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A primitive value crossing the export/import boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F64(f64),
}

impl Val {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Val::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val::I64(v) => Some(*v),
            Val::I32(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Identity of a backend implementation, carried by every translated error
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendId {
    pub name: String,
    pub version: String,
}

impl BackendId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A module accepted by [`Backend::load_module`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u32);

/// A live instantiation of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub u32);

/// Low-level fault reported by a backend.
///
/// Traps are recoverable at the call boundary; a backend must never turn
/// one into a process-level fault.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendFault {
    #[error("module compilation failed: {0}")]
    Compilation(String),

    #[error("module instantiation failed: {0}")]
    Instantiation(String),

    #[error("execution failed: {0}")]
    Runtime(String),

    #[error("trap `{code}`: {message}")]
    Trap { code: String, message: String },
}

impl BackendFault {
    pub fn trap(code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendFault::Trap {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Re-entry point handed to host imports while the backend is executing.
///
/// Imports may call back into exports of the same instance and touch its
/// memory, but only through this handle.
pub trait Caller {
    fn call_export(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>, BackendFault>;
    fn read_memory(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), BackendFault>;
    fn write_memory(&mut self, offset: u32, data: &[u8]) -> Result<(), BackendFault>;
}

/// Host function satisfying one module import
pub type HostImport = Rc<dyn Fn(&mut dyn Caller, &[Val]) -> Result<Vec<Val>, BackendFault>>;

/// Interrupt predicate polled by the backend during execution
pub type InterruptCheck = Box<dyn FnMut() -> bool>;

/// Named host functions offered to [`Backend::instantiate`]
#[derive(Default, Clone)]
pub struct ImportTable {
    imports: HashMap<String, HostImport>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define an import, replacing any previous definition with the same name
    pub fn define<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&mut dyn Caller, &[Val]) -> Result<Vec<Val>, BackendFault> + 'static,
    {
        self.imports.insert(name.to_string(), Rc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<HostImport> {
        self.imports.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.imports.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.imports.keys().map(String::as_str)
    }
}

impl fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportTable")
            .field("imports", &self.imports.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Execution engine contract.
///
/// Side effects stay inside the instance; the only shared state is the
/// per-backend interrupt predicate and memory ceiling.
pub trait Backend {
    fn id(&self) -> &BackendId;

    fn load_module(&mut self, bytes: &[u8]) -> Result<ModuleHandle, BackendFault>;

    fn instantiate(
        &mut self,
        module: &ModuleHandle,
        imports: ImportTable,
    ) -> Result<InstanceHandle, BackendFault>;

    fn call_export(
        &mut self,
        instance: &InstanceHandle,
        name: &str,
        args: &[Val],
    ) -> Result<Vec<Val>, BackendFault>;

    fn read_memory(
        &self,
        instance: &InstanceHandle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), BackendFault>;

    fn write_memory(
        &mut self,
        instance: &InstanceHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), BackendFault>;

    /// Install or clear the predicate polled during long-running execution
    fn set_interrupt_check(&mut self, check: Option<InterruptCheck>);

    /// Cap heap growth; `None` removes the ceiling
    fn set_memory_limit(&mut self, bytes: Option<usize>);
}

/// Constructs backends for [`crate::Runtime::initialize`]
pub trait BackendFactory {
    fn create(&self) -> Result<Box<dyn Backend>, BackendFault>;

    /// The compiled engine module this backend expects to load
    fn module_image(&self) -> Vec<u8>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Result<Box<dyn Backend>, BackendFault>,
{
    fn create(&self) -> Result<Box<dyn Backend>, BackendFault> {
        self()
    }

    fn module_image(&self) -> Vec<u8> {
        crate::abi::module_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_val_accessors() {
        assert_eq!(Val::I32(7).as_i32(), Some(7));
        assert_eq!(Val::I32(7).as_i64(), Some(7));
        assert_eq!(Val::F64(1.5).as_f64(), Some(1.5));
        assert_eq!(Val::F64(1.5).as_i32(), None);
    }

    #[test]
    fn test_backend_id_display() {
        let id = BackendId::new("native-quickjs", "0.9");
        assert_eq!(id.to_string(), "native-quickjs@0.9");
    }

    #[test]
    fn test_import_table_define() {
        let mut imports = ImportTable::new();
        imports.define("noop", |_caller, _args| Ok(Vec::new()));
        assert!(imports.contains("noop"));
        assert!(imports.get("missing").is_none());
        assert_eq!(imports.names().count(), 1);
    }
}
