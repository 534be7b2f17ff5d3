//! Engine heap accounting
//!
//! The memory limit is enforced by the allocator handed to the engine rather
//! than by the engine itself, so a refused allocation is observed directly
//! and cannot be confused with a script throwing a look-alike error.

use std::cell::Cell;
use std::ptr;
use std::rc::Rc;

use rquickjs::allocator::{Allocator, RustAllocator};

/// Usage and limit shared between the allocator and the backend
#[derive(Debug, Default)]
pub(super) struct HeapState {
    limit: Cell<Option<usize>>,
    used: Cell<usize>,
    exhausted: Cell<bool>,
}

impl HeapState {
    pub(super) fn set_limit(&self, limit: Option<usize>) {
        self.limit.set(limit);
    }

    pub(super) fn limit(&self) -> Option<usize> {
        self.limit.get()
    }

    pub(super) fn used(&self) -> usize {
        self.used.get()
    }

    /// Whether an allocation was refused since the last reset
    pub(super) fn exhausted(&self) -> bool {
        self.exhausted.get()
    }

    pub(super) fn reset_exhausted(&self) {
        self.exhausted.set(false);
    }

    fn admit(&self, additional: usize) -> bool {
        let fits = match self.limit.get() {
            Some(limit) => self.used.get().saturating_add(additional) <= limit,
            None => true,
        };
        if !fits {
            tracing::trace!(
                "Refused engine allocation of {} bytes ({} in use)",
                additional,
                self.used.get()
            );
            self.exhausted.set(true);
        }
        fits
    }

    fn grow(&self, bytes: usize) {
        self.used.set(self.used.get().saturating_add(bytes));
    }

    fn shrink(&self, bytes: usize) {
        self.used.set(self.used.get().saturating_sub(bytes));
    }
}

/// Global-allocator backed engine allocator with a byte budget
pub(super) struct LimitedAllocator {
    inner: RustAllocator,
    state: Rc<HeapState>,
}

impl LimitedAllocator {
    pub(super) fn new(state: Rc<HeapState>) -> Self {
        Self {
            inner: RustAllocator,
            state,
        }
    }
}

unsafe impl Allocator for LimitedAllocator {
    fn alloc(&mut self, size: usize) -> *mut u8 {
        if !self.state.admit(size) {
            return ptr::null_mut();
        }
        let ptr = self.inner.alloc(size);
        if !ptr.is_null() {
            self.state.grow(unsafe { RustAllocator::usable_size(ptr) });
        }
        ptr
    }

    fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        if !self.state.admit(total) {
            return ptr::null_mut();
        }
        let ptr = self.inner.calloc(count, size);
        if !ptr.is_null() {
            self.state.grow(unsafe { RustAllocator::usable_size(ptr) });
        }
        ptr
    }

    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.state.shrink(RustAllocator::usable_size(ptr));
        self.inner.dealloc(ptr);
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        let old_size = RustAllocator::usable_size(ptr);
        if new_size > old_size && !self.state.admit(new_size - old_size) {
            return ptr::null_mut();
        }
        let new_ptr = self.inner.realloc(ptr, new_size);
        if !new_ptr.is_null() {
            self.state.shrink(old_size);
            self.state.grow(RustAllocator::usable_size(new_ptr));
        }
        new_ptr
    }

    unsafe fn usable_size(ptr: *mut u8) -> usize {
        RustAllocator::usable_size(ptr)
    }
}
