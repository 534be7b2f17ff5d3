//! Runtime and evaluation configuration

use std::time::Duration;

use serde::Deserialize;

use crate::abi::EvalFlags;

/// Runtime-wide settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Heap ceiling in bytes
    pub memory_limit: Option<usize>,
    /// Native stack budget in bytes
    pub max_stack_size: Option<usize>,
    /// Allocation volume that triggers a collection
    pub gc_threshold: Option<usize>,
    /// Wall-clock budget per evaluation, in milliseconds
    pub eval_timeout_ms: Option<u64>,
    /// Engine module image; `None` uses the backend's own
    #[serde(skip)]
    pub module_image: Option<Vec<u8>>,
}

impl RuntimeConfig {
    /// Parse from JSON, e.g. `{"memory_limit": 1048576}`
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.eval_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn eval_timeout(&self) -> Option<Duration> {
        self.eval_timeout_ms.map(Duration::from_millis)
    }
}

/// How source text is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalKind {
    #[default]
    Script,
    Module,
    /// Module if the source has top-level `import`/`export` statements
    Detect,
}

/// Options for a single evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalOptions {
    pub filename: String,
    pub kind: EvalKind,
    pub strict: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            filename: "<eval>".to_string(),
            kind: EvalKind::Script,
            strict: false,
        }
    }
}

impl EvalOptions {
    pub fn script() -> Self {
        Self::default()
    }

    pub fn module(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            kind: EvalKind::Module,
            strict: false,
        }
    }

    pub fn detect() -> Self {
        Self {
            kind: EvalKind::Detect,
            ..Self::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub(crate) fn flags(&self, source: &str) -> EvalFlags {
        let module = match self.kind {
            EvalKind::Script => false,
            EvalKind::Module => true,
            EvalKind::Detect => detect_module(source),
        };
        let mut flags = EvalFlags::empty();
        flags.set(EvalFlags::MODULE, module);
        flags.set(EvalFlags::STRICT, self.strict);
        flags
    }
}

/// Whether `source` looks like an ES module
pub fn detect_module(source: &str) -> bool {
    source.lines().map(str::trim_start).any(|line| {
        let static_import = line
            .strip_prefix("import")
            .is_some_and(|rest| rest.starts_with([' ', '{', '*', '"', '\'']));
        let export = line
            .strip_prefix("export")
            .is_some_and(|rest| rest.starts_with([' ', '{', '*']));
        static_import || export
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config = RuntimeConfig::from_json(r#"{"memory_limit": 1048576, "eval_timeout_ms": 50}"#).unwrap();
        assert_eq!(config.memory_limit, Some(1 << 20));
        assert_eq!(config.eval_timeout(), Some(Duration::from_millis(50)));
        assert!(config.module_image.is_none());
    }

    #[test]
    fn test_detect_module() {
        assert!(detect_module("import { x } from 'lib';\nx()"));
        assert!(detect_module("  export const a = 1;"));
        assert!(detect_module("import * as ns from \"ns\""));
        assert!(!detect_module("const m = await import('lib')"));
        assert!(!detect_module("import('lib').then(run)"));
        assert!(!detect_module("let exported = 1"));
    }

    #[test]
    fn test_eval_flags() {
        assert_eq!(EvalOptions::script().flags("1"), EvalFlags::empty());
        assert_eq!(EvalOptions::module("m.js").flags("1"), EvalFlags::MODULE);
        assert_eq!(
            EvalOptions::detect().strict().flags("export default 1"),
            EvalFlags::MODULE | EvalFlags::STRICT
        );
    }
}
