//! Compiled bytecode
//!
//! Bytecode is engine-specific. [`CompiledBytecode`] wraps the engine
//! payload in an envelope naming the backend and engine version that
//! produced it; loading it anywhere else is a compilation failure.
//! [`BytecodeCache`] memoizes compilation per source and recompiles
//! entries that went stale.

use std::collections::HashMap;

use crate::backend::BackendId;
use crate::config::EvalOptions;
use crate::error::Result;
use crate::handle::ValueHandle;
use crate::realm::Realm;

const MAGIC: &[u8; 4] = b"FOSB";
const FORMAT: u16 = 1;

/// Provenance recorded in a bytecode envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeHeader {
    pub backend: BackendId,
    pub engine_version: String,
}

/// Opaque, engine-specific compiled program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBytecode {
    bytes: Vec<u8>,
}

fn put_str(out: &mut Vec<u8>, s: &str) -> std::result::Result<(), String> {
    let len = u16::try_from(s.len()).map_err(|_| format!("envelope field is {} bytes long", s.len()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < len {
            return None;
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Some(head)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str(&mut self) -> Option<&'a str> {
        let len = self.u16()? as usize;
        std::str::from_utf8(self.take(len)?).ok()
    }
}

impl CompiledBytecode {
    /// Wrap an engine payload; fails if a field does not fit the envelope
    pub(crate) fn seal(
        backend: &BackendId,
        engine_version: &str,
        payload: &[u8],
    ) -> std::result::Result<Self, String> {
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| format!("payload is {} bytes long", payload.len()))?;
        let mut bytes = Vec::with_capacity(payload.len() + 64);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT.to_le_bytes());
        put_str(&mut bytes, &backend.name)?;
        put_str(&mut bytes, &backend.version)?;
        put_str(&mut bytes, engine_version)?;
        bytes.extend_from_slice(&payload_len.to_le_bytes());
        bytes.extend_from_slice(payload);
        Ok(Self { bytes })
    }

    fn parse(&self) -> Option<(BytecodeHeader, &[u8])> {
        let mut reader = Reader { bytes: &self.bytes };
        if reader.take(4)? != MAGIC || reader.u16()? != FORMAT {
            return None;
        }
        let name = reader.str()?;
        let version = reader.str()?;
        let engine_version = reader.str()?.to_string();
        let len = reader.u32()? as usize;
        let payload = reader.take(len)?;
        let header = BytecodeHeader {
            backend: BackendId::new(name, version),
            engine_version,
        };
        Some((header, payload))
    }

    /// The engine payload, if this envelope matches the running engine
    pub(crate) fn open(&self, backend: &BackendId, engine_version: &str) -> std::result::Result<&[u8], String> {
        let (header, payload) = self.parse().ok_or_else(|| "malformed bytecode envelope".to_string())?;
        if &header.backend != backend || header.engine_version != engine_version {
            return Err(format!(
                "bytecode was produced by {} ({}) and cannot run on {} ({})",
                header.backend, header.engine_version, backend, engine_version
            ));
        }
        Ok(payload)
    }

    /// Who produced this bytecode; `None` when the envelope is malformed
    pub fn header(&self) -> Option<BytecodeHeader> {
        self.parse().map(|(header, _)| header)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Counters for [`BytecodeCache`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Cached entries rejected by the engine and compiled again
    pub recompiles: u64,
}

/// What a cache entry was compiled from; compared in full on lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    source: String,
    filename: String,
    flags: u32,
}

impl CacheKey {
    fn new(source: &str, options: &EvalOptions) -> Self {
        Self {
            source: source.to_string(),
            filename: options.filename.clone(),
            flags: options.flags(source).bits(),
        }
    }
}

/// Per-source bytecode memo
#[derive(Debug, Default)]
pub struct BytecodeCache {
    entries: HashMap<CacheKey, CompiledBytecode>,
    stats: CacheStats,
}

impl BytecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &str, options: &EvalOptions) -> Option<&CompiledBytecode> {
        self.entries.get(&CacheKey::new(source, options))
    }

    /// Seed the cache, e.g. with bytecode loaded from disk
    pub fn insert(&mut self, source: &str, options: &EvalOptions, bytecode: CompiledBytecode) {
        self.entries.insert(CacheKey::new(source, options), bytecode);
    }

    /// Evaluate through the cache, compiling on a miss and recompiling
    /// entries the engine rejects
    pub fn evaluate(&mut self, realm: &mut Realm, source: &str, options: &EvalOptions) -> Result<ValueHandle> {
        let key = CacheKey::new(source, options);
        match self.entries.get(&key).cloned() {
            Some(bytecode) => match realm.evaluate_compiled(&bytecode) {
                Err(err) if err.kind() == Some(crate::error::FailureKind::Compilation) => {
                    tracing::debug!("Cached bytecode rejected, recompiling: {}", err);
                    self.entries.remove(&key);
                    self.stats.recompiles += 1;
                }
                other => {
                    self.stats.hits += 1;
                    return other;
                }
            },
            None => self.stats.misses += 1,
        }
        let bytecode = realm.compile(source, options)?;
        let result = realm.evaluate_compiled(&bytecode);
        self.entries.insert(key, bytecode);
        result
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> BackendId {
        BackendId::new("native-quickjs", "0.9")
    }

    #[test]
    fn test_envelope_roundtrip() {
        let bytecode = CompiledBytecode::seal(&backend(), "engine 1", b"payload").unwrap();
        assert_eq!(bytecode.open(&backend(), "engine 1").unwrap(), b"payload");
        let header = bytecode.header().unwrap();
        assert_eq!(header.backend, backend());
        assert_eq!(header.engine_version, "engine 1");
    }

    #[test]
    fn test_envelope_rejects_other_engine() {
        let bytecode = CompiledBytecode::seal(&backend(), "engine 1", b"payload").unwrap();
        let err = bytecode.open(&BackendId::new("wasm", "1"), "engine 1").unwrap_err();
        assert!(err.contains("wasm@1"));
        assert!(bytecode.open(&backend(), "engine 2").is_err());
    }

    #[test]
    fn test_seal_rejects_oversized_field() {
        let long = "v".repeat(usize::from(u16::MAX) + 1);
        let err = CompiledBytecode::seal(&BackendId::new("native-quickjs", long), "engine 1", b"payload").unwrap_err();
        assert!(err.contains("65536 bytes"));
    }

    #[test]
    fn test_cache_compares_full_source() {
        let options = EvalOptions::default();
        let mut cache = BytecodeCache::new();
        let bytecode = CompiledBytecode::from_bytes(b"first".to_vec());
        cache.insert("1 + 1", &options, bytecode.clone());
        assert_eq!(cache.get("1 + 1", &options), Some(&bytecode));
        assert!(cache.get("1 + 2", &options).is_none());

        let renamed = EvalOptions {
            filename: "other.js".to_string(),
            ..EvalOptions::default()
        };
        assert!(cache.get("1 + 1", &renamed).is_none());
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        let bytecode = CompiledBytecode::from_bytes(b"FOSB\x01".to_vec());
        assert!(bytecode.header().is_none());
        assert!(bytecode.open(&backend(), "engine 1").is_err());
    }
}
