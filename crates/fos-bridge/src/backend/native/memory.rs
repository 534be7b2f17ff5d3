//! Linear memory
//!
//! Byte-addressed scratch memory shared between host and engine, with a
//! first-fit allocator behind `malloc`/`free`. Offset 0 is never handed out.
//! Freed blocks are merged with free neighbours, and a free block ending at
//! the high-water mark is returned to it.

use std::collections::{BTreeMap, HashMap};

use crate::backend::BackendFault;

const ALIGN: u32 = 8;
const PAGE: usize = 64 * 1024;
/// Hard ceiling on linear memory growth
const MAX_SIZE: usize = 256 * 1024 * 1024;

/// Growable linear memory with a block allocator
#[derive(Debug)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    top: u32,
    blocks: HashMap<u32, u32>,
    /// Free blocks by start offset
    free_list: BTreeMap<u32, u32>,
}

impl Default for LinearMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearMemory {
    pub fn new() -> Self {
        Self {
            bytes: vec![0; PAGE],
            // Keep the null page unused
            top: ALIGN,
            blocks: HashMap::new(),
            free_list: BTreeMap::new(),
        }
    }

    /// Allocate `size` bytes; returns 0 when memory is exhausted
    pub fn malloc(&mut self, size: u32) -> u32 {
        let size = size.max(1).div_ceil(ALIGN) * ALIGN;

        let fit = self
            .free_list
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&ptr, &len)| (ptr, len));
        if let Some((ptr, len)) = fit {
            self.free_list.remove(&ptr);
            if len > size {
                self.free_list.insert(ptr + size, len - size);
            }
            self.blocks.insert(ptr, size);
            return ptr;
        }

        let ptr = self.top;
        let end = ptr as usize + size as usize;
        if end > MAX_SIZE {
            return 0;
        }
        if end > self.bytes.len() {
            let grown = end.div_ceil(PAGE) * PAGE;
            self.bytes.resize(grown, 0);
        }
        self.top = end as u32;
        self.blocks.insert(ptr, size);
        ptr
    }

    pub fn free(&mut self, ptr: u32) -> Result<(), BackendFault> {
        if ptr == 0 {
            return Ok(());
        }
        match self.blocks.remove(&ptr) {
            Some(size) => {
                self.release(ptr, size);
                Ok(())
            }
            None => Err(BackendFault::trap(
                "invalid_free",
                format!("free of unallocated pointer {ptr:#x}"),
            )),
        }
    }

    fn release(&mut self, mut ptr: u32, mut size: u32) {
        let before = self.free_list.range(..ptr).next_back().map(|(&p, &l)| (p, l));
        if let Some((prev, prev_len)) = before {
            if prev + prev_len == ptr {
                self.free_list.remove(&prev);
                ptr = prev;
                size += prev_len;
            }
        }
        if let Some(next_len) = self.free_list.remove(&(ptr + size)) {
            size += next_len;
        }
        if ptr + size == self.top {
            self.top = ptr;
        } else {
            self.free_list.insert(ptr, size);
        }
    }

    pub fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), BackendFault> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), BackendFault> {
        let range = self.range(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read_vec(&self, offset: u32, len: u32) -> Result<Vec<u8>, BackendFault> {
        let mut buf = vec![0; len as usize];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn read_string(&self, offset: u32, len: u32) -> Result<String, BackendFault> {
        String::from_utf8(self.read_vec(offset, len)?)
            .map_err(|_| BackendFault::trap("bad_utf8", "string argument is not valid UTF-8"))
    }

    pub fn write_i32(&mut self, offset: u32, value: i32) -> Result<(), BackendFault> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Allocate and fill a block; 0 when memory is exhausted
    pub fn alloc(&mut self, data: &[u8]) -> Result<u32, BackendFault> {
        let ptr = self.malloc(data.len() as u32);
        if ptr == 0 {
            return Err(BackendFault::trap("out_of_memory", "linear memory exhausted"));
        }
        self.write(ptr, data)?;
        Ok(ptr)
    }

    /// Number of bytes currently handed out
    pub fn allocated(&self) -> usize {
        self.blocks.values().map(|&size| size as usize).sum()
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, BackendFault> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&end| end <= self.bytes.len());
        match end {
            Some(end) if offset != 0 || len == 0 => Ok(start..end),
            _ => Err(BackendFault::trap(
                "memory_out_of_bounds",
                format!("access of {len} bytes at {offset:#x} is out of bounds"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_never_returns_null() {
        let mut mem = LinearMemory::new();
        let a = mem.malloc(0);
        let b = mem.malloc(16);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_free_reuses_block() {
        let mut mem = LinearMemory::new();
        let a = mem.malloc(32);
        mem.free(a).unwrap();
        let b = mem.malloc(16);
        assert_eq!(a, b);
    }

    #[test]
    fn test_free_merges_neighbours() {
        let mut mem = LinearMemory::new();
        let a = mem.malloc(16);
        let b = mem.malloc(16);
        let c = mem.malloc(16);
        let _guard = mem.malloc(8);
        mem.free(a).unwrap();
        mem.free(c).unwrap();
        mem.free(b).unwrap();
        assert_eq!(mem.free_list.len(), 1);
        let whole = mem.malloc(48);
        assert_eq!(whole, a);
    }

    #[test]
    fn test_free_at_top_shrinks_heap() {
        let mut mem = LinearMemory::new();
        let a = mem.malloc(16);
        let b = mem.malloc(16);
        mem.free(b).unwrap();
        mem.free(a).unwrap();
        assert!(mem.free_list.is_empty());
        assert_eq!(mem.malloc(64), a);
    }

    #[test]
    fn test_double_free_traps() {
        let mut mem = LinearMemory::new();
        let a = mem.malloc(8);
        mem.free(a).unwrap();
        let err = mem.free(a).unwrap_err();
        assert!(matches!(err, BackendFault::Trap { ref code, .. } if code == "invalid_free"));
    }

    #[test]
    fn test_out_of_bounds_traps() {
        let mut mem = LinearMemory::new();
        let mut buf = [0u8; 4];
        assert!(mem.read(u32::MAX - 1, &mut buf).is_err());
        assert!(mem.write(0, &[1]).is_err());
    }

    #[test]
    fn test_grows_past_first_page() {
        let mut mem = LinearMemory::new();
        let big = mem.alloc(&vec![7u8; PAGE * 2]).unwrap();
        let mut buf = [0u8; 1];
        mem.read(big + (PAGE as u32) * 2 - 1, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
        assert!(mem.allocated() >= PAGE * 2);
    }
}
