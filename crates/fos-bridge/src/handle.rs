//! Value handles
//!
//! A [`ValueHandle`] pins one engine value on behalf of host code. Handles
//! live in a per-realm arena indexed by `(index, generation)`, so script
//! objects that capture host callbacks never form native ownership cycles;
//! the engine's collector alone decides reachability.

use std::fmt;
use std::rc::Weak;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::abi::{tag, Equality};
use crate::error::{BridgeError, Result};
use crate::marshal::{FromScript, HostValue, IntoScript};
use crate::realm::RealmShared;
use crate::scope::AsScope;

static NEXT_REALM_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique realm identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealmId(u32);

impl RealmId {
    pub(crate) fn next() -> Self {
        RealmId(NEXT_REALM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Script-level kind of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    Undefined,
    Null,
    Boolean,
    Number,
    BigInt,
    String,
    Symbol,
    Object,
    Array,
    Function,
    Promise,
    Error,
    /// `ArrayBuffer` or `Uint8Array`
    Bytes,
}

impl ScriptType {
    pub(crate) fn from_tag(code: i32) -> Self {
        match code {
            tag::UNDEFINED => ScriptType::Undefined,
            tag::NULL => ScriptType::Null,
            tag::BOOLEAN => ScriptType::Boolean,
            tag::NUMBER => ScriptType::Number,
            tag::BIGINT => ScriptType::BigInt,
            tag::STRING => ScriptType::String,
            tag::SYMBOL => ScriptType::Symbol,
            tag::ARRAY => ScriptType::Array,
            tag::FUNCTION => ScriptType::Function,
            tag::PROMISE => ScriptType::Promise,
            tag::ERROR => ScriptType::Error,
            tag::BYTES => ScriptType::Bytes,
            _ => ScriptType::Object,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScriptType::Undefined => "undefined",
            ScriptType::Null => "null",
            ScriptType::Boolean => "boolean",
            ScriptType::Number => "number",
            ScriptType::BigInt => "bigint",
            ScriptType::String => "string",
            ScriptType::Symbol => "symbol",
            ScriptType::Object => "object",
            ScriptType::Array => "array",
            ScriptType::Function => "function",
            ScriptType::Promise => "promise",
            ScriptType::Error => "error",
            ScriptType::Bytes => "bytes",
        }
    }

    /// Objects in the engine sense: anything with properties
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            ScriptType::Object
                | ScriptType::Array
                | ScriptType::Function
                | ScriptType::Promise
                | ScriptType::Error
                | ScriptType::Bytes
        )
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, ScriptType::Undefined | ScriptType::Null)
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settlement state of a promise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

// ============================================================================
// HANDLE TABLE
// ============================================================================

/// Arena slot key of a live handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandleId {
    pub(crate) realm: RealmId,
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    raw: u32,
    generation: u32,
    live: bool,
}

/// Per-realm arena of pinned values
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl HandleTable {
    pub(crate) fn insert(&mut self, raw: u32) -> (u32, u32) {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.raw = raw;
            slot.live = true;
            return (index, slot.generation);
        }
        self.slots.push(Slot {
            raw,
            generation: 0,
            live: true,
        });
        (self.slots.len() as u32 - 1, 0)
    }

    pub(crate) fn get(&self, index: u32, generation: u32) -> Option<u32> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.live && slot.generation == generation)
            .map(|slot| slot.raw)
    }

    /// Vacate a slot; stale ids stop matching
    pub(crate) fn remove(&mut self, index: u32, generation: u32) -> Option<u32> {
        let slot = self.slots.get_mut(index as usize)?;
        if !slot.live || slot.generation != generation {
            return None;
        }
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        Some(slot.raw)
    }

    /// Empty the table, returning every pinned pointer
    pub(crate) fn drain(&mut self) -> Vec<u32> {
        let raws = self
            .slots
            .iter()
            .filter(|slot| slot.live)
            .map(|slot| slot.raw)
            .collect();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.live {
                slot.live = false;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live = 0;
        raws
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }
}

// ============================================================================
// VALUE HANDLE
// ============================================================================

/// Owned reference to a script value.
///
/// Not `Clone`: use [`ValueHandle::dup`] for a second independently-owned
/// handle. Dropping a handle without disposing it releases it lazily on
/// the realm's next access.
pub struct ValueHandle {
    pub(crate) id: HandleId,
    tag: ScriptType,
    owner: Weak<RealmShared>,
}

impl ValueHandle {
    pub(crate) fn new(id: HandleId, tag: ScriptType, owner: Weak<RealmShared>) -> Self {
        Self { id, tag, owner }
    }

    /// Script-level kind, fixed at creation
    pub fn tag(&self) -> ScriptType {
        self.tag
    }

    pub fn realm_id(&self) -> RealmId {
        self.id.realm
    }

    pub fn is_undefined(&self) -> bool {
        self.tag == ScriptType::Undefined
    }

    fn require(&self, expected: &'static str, ok: bool) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(BridgeError::TypeMismatch {
                expected,
                found: self.tag,
            })
        }
    }

    pub fn as_number(&self, cx: &mut impl AsScope) -> Result<f64> {
        self.require("number", self.tag == ScriptType::Number)?;
        cx.as_scope()?.to_number(self)
    }

    pub fn as_bool(&self, cx: &mut impl AsScope) -> Result<bool> {
        self.require("boolean", self.tag == ScriptType::Boolean)?;
        cx.as_scope()?.to_bool(self)
    }

    pub fn as_string(&self, cx: &mut impl AsScope) -> Result<String> {
        self.require("string", self.tag == ScriptType::String)?;
        cx.as_scope()?.to_string(self)
    }

    /// Exact value of a BigInt; errors if it does not fit in `i128`
    pub fn as_bigint(&self, cx: &mut impl AsScope) -> Result<i128> {
        self.require("bigint", self.tag == ScriptType::BigInt)?;
        cx.as_scope()?.to_bigint(self)
    }

    /// Copy of the contents of an `ArrayBuffer` or `Uint8Array`
    pub fn as_bytes(&self, cx: &mut impl AsScope) -> Result<Vec<u8>> {
        self.require("bytes", self.tag == ScriptType::Bytes)?;
        cx.as_scope()?.to_bytes(self)
    }

    /// `self instanceof constructor`; may run a `Symbol.hasInstance` hook
    pub fn instance_of(&self, cx: &mut impl AsScope, constructor: &ValueHandle) -> Result<bool> {
        cx.as_scope()?.instance_of(self, constructor)
    }

    pub fn get_property(&self, cx: &mut impl AsScope, key: &str) -> Result<ValueHandle> {
        self.require("object", self.tag.is_object())?;
        cx.as_scope()?.get_property(self, key)
    }

    pub fn get_index(&self, cx: &mut impl AsScope, index: u32) -> Result<ValueHandle> {
        self.require("object", self.tag.is_object())?;
        cx.as_scope()?.get_index(self, index)
    }

    pub fn set_property(&self, cx: &mut impl AsScope, key: &str, value: impl IntoScript) -> Result<()> {
        self.require("object", self.tag.is_object())?;
        let mut scope = cx.as_scope()?;
        let value = value.into_script(&mut scope)?;
        let result = scope.set_property(self, key, &value);
        scope.dispose(&value)?;
        result
    }

    /// Call this function value with an explicit `this`
    pub fn invoke(
        &self,
        cx: &mut impl AsScope,
        this: Option<&ValueHandle>,
        args: &[ValueHandle],
    ) -> Result<ValueHandle> {
        self.require("function", self.tag == ScriptType::Function)?;
        cx.as_scope()?.invoke(self, this, args)
    }

    /// Call the method `name` on this object
    pub fn call_method(
        &self,
        cx: &mut impl AsScope,
        name: &str,
        args: &[ValueHandle],
    ) -> Result<ValueHandle> {
        let mut scope = cx.as_scope()?;
        let method = self.get_property(&mut scope, name)?;
        let result = method.invoke(&mut scope, Some(self), args);
        scope.dispose(&method)?;
        result
    }

    /// Own enumerable string keys
    pub fn keys(&self, cx: &mut impl AsScope) -> Result<Vec<String>> {
        self.require("object", self.tag.is_object())?;
        cx.as_scope()?.keys(self)
    }

    /// Numeric `length` of an array-like value
    pub fn length(&self, cx: &mut impl AsScope) -> Result<usize> {
        self.require("array-like", self.tag.is_object() || self.tag == ScriptType::String)?;
        match cx.as_scope()?.length(self)? {
            Some(len) => Ok(len),
            None => Err(BridgeError::TypeMismatch {
                expected: "array-like",
                found: self.tag,
            }),
        }
    }

    /// Start the iterator protocol over an iterable value
    pub fn iter(&self, cx: &mut impl AsScope) -> Result<ScriptIterator> {
        self.require("iterable", self.tag.is_object() || self.tag == ScriptType::String)?;
        let mut scope = cx.as_scope()?;
        let iterator = scope.iterator(self)?;
        let next = match iterator.get_property(&mut scope, "next") {
            Ok(next) => next,
            Err(err) => {
                scope.dispose(&iterator)?;
                return Err(err);
            }
        };
        Ok(ScriptIterator {
            iterator,
            next,
            done: false,
        })
    }

    /// Marshal into a host type
    pub fn to<T: FromScript>(&self, cx: &mut impl AsScope) -> Result<T> {
        T::from_script(&mut cx.as_scope()?, self)
    }

    /// Marshal property `key`, or `T::default()` when it is missing
    pub fn get_or_default<T: FromScript + Default>(&self, cx: &mut impl AsScope, key: &str) -> Result<T> {
        let mut scope = cx.as_scope()?;
        let value = self.get_property(&mut scope, key)?;
        let result = if value.tag.is_nullish() {
            Ok(T::default())
        } else {
            T::from_script(&mut scope, &value).map_err(|err| match err {
                BridgeError::Conversion(conv) => BridgeError::Conversion(conv.at_key(key)),
                other => other,
            })
        };
        scope.dispose(&value)?;
        result
    }

    /// Snapshot into a [`HostValue`] tree
    pub fn to_host(&self, cx: &mut impl AsScope) -> Result<HostValue> {
        cx.as_scope()?.snapshot(self)
    }

    /// Diagnostic rendering; never runs user code with side effects
    pub fn dump(&self, cx: &mut impl AsScope) -> Result<String> {
        cx.as_scope()?.dump(self)
    }

    pub fn strict_equals(&self, cx: &mut impl AsScope, other: &ValueHandle) -> Result<bool> {
        cx.as_scope()?.equals(self, other, Equality::Strict)
    }

    /// `Object.is` semantics
    pub fn same_value(&self, cx: &mut impl AsScope, other: &ValueHandle) -> Result<bool> {
        cx.as_scope()?.equals(self, other, Equality::SameValue)
    }

    pub fn promise_state(&self, cx: &mut impl AsScope) -> Result<PromiseState> {
        self.require("promise", self.tag == ScriptType::Promise)?;
        match cx.as_scope()?.promise_state(self)? {
            Some(state) => Ok(state),
            None => Err(BridgeError::TypeMismatch {
                expected: "promise",
                found: self.tag,
            }),
        }
    }

    /// A second handle to the same value
    pub fn dup(&self, cx: &mut impl AsScope) -> Result<ValueHandle> {
        cx.as_scope()?.dup(self)
    }

    /// Release the pinned value; a second call fails with `UseAfterDispose`
    pub fn dispose(&self, cx: &mut impl AsScope) -> Result<()> {
        cx.as_scope()?.dispose(self)
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle")
            .field("realm", &self.id.realm)
            .field("index", &self.id.index)
            .field("generation", &self.id.generation)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Drop for ValueHandle {
    fn drop(&mut self) {
        if let Some(realm) = self.owner.upgrade() {
            realm.defer_release(self.id);
        }
    }
}

// ============================================================================
// ITERATION
// ============================================================================

/// Cursor over the script iterator protocol
pub struct ScriptIterator {
    iterator: ValueHandle,
    next: ValueHandle,
    done: bool,
}

impl ScriptIterator {
    /// Advance; `None` once the iterator reports `done`
    pub fn next(&mut self, cx: &mut impl AsScope) -> Result<Option<ValueHandle>> {
        if self.done {
            return Ok(None);
        }
        let mut scope = cx.as_scope()?;
        let step = self.next.invoke(&mut scope, Some(&self.iterator), &[])?;
        if !step.tag.is_object() {
            scope.dispose(&step)?;
            self.finish(&mut scope)?;
            return Err(BridgeError::TypeMismatch {
                expected: "iterator result object",
                found: step.tag,
            });
        }
        let done = step.get_property(&mut scope, "done")?;
        let is_done = scope.to_bool(&done)?;
        scope.dispose(&done)?;
        if is_done {
            scope.dispose(&step)?;
            self.finish(&mut scope)?;
            return Ok(None);
        }
        let value = step.get_property(&mut scope, "value");
        scope.dispose(&step)?;
        value.map(Some)
    }

    /// Drain the remaining items
    pub fn collect(mut self, cx: &mut impl AsScope) -> Result<Vec<ValueHandle>> {
        let mut scope = cx.as_scope()?;
        let mut items = Vec::new();
        while let Some(item) = self.next(&mut scope)? {
            items.push(item);
        }
        Ok(items)
    }

    /// Release the iterator early
    pub fn dispose(mut self, cx: &mut impl AsScope) -> Result<()> {
        let mut scope = cx.as_scope()?;
        self.finish(&mut scope)
    }

    fn finish(&mut self, cx: &mut impl AsScope) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let mut scope = cx.as_scope()?;
        scope.dispose(&self.next)?;
        scope.dispose(&self.iterator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_generations() {
        let mut table = HandleTable::default();
        let (index, generation) = table.insert(10);
        assert_eq!(table.get(index, generation), Some(10));
        assert_eq!(table.remove(index, generation), Some(10));
        assert_eq!(table.remove(index, generation), None);

        let (reused, next_generation) = table.insert(20);
        assert_eq!(reused, index);
        assert_ne!(next_generation, generation);
        assert_eq!(table.get(index, generation), None);
        assert_eq!(table.get(reused, next_generation), Some(20));
    }

    #[test]
    fn test_table_drain() {
        let mut table = HandleTable::default();
        table.insert(1);
        let (index, generation) = table.insert(2);
        table.insert(3);
        table.remove(index, generation);
        let mut raws = table.drain();
        raws.sort();
        assert_eq!(raws, vec![1, 3]);
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn test_script_type_tags() {
        assert_eq!(ScriptType::from_tag(tag::PROMISE), ScriptType::Promise);
        assert_eq!(ScriptType::from_tag(99), ScriptType::Object);
        assert!(ScriptType::Array.is_object());
        assert!(!ScriptType::String.is_object());
        assert_eq!(ScriptType::BigInt.to_string(), "bigint");
    }
}
