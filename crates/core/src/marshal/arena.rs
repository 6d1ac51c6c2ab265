//! Bump arena for short-lived parameter buffers
//!
//! Array payloads handed to the accelerator only live for the duration
//! of one queued operation, so they come out of a linear allocator that
//! is reset between tasks instead of being freed individually. When the
//! arena is exhausted (or absent) conversion falls back to the system
//! allocator.
//!
//! Allocation is a locked bump of an 8-byte-aligned offset. Pointers
//! handed out are only valid until the next `reset`; the scheduler
//! worker resets between tasks, never mid-task.

use parking_lot::Mutex;

/// Default arena capacity: 64 MiB.
pub const DEFAULT_ARENA_CAPACITY: usize = 64 * 1024 * 1024;

const ALIGN: usize = 8;

struct ArenaInner {
    block: Box<[u8]>,
    offset: usize,
    high_water: usize,
    failed_allocs: u64,
}

/// Linear allocator for parameter arrays.
pub struct Arena {
    inner: Mutex<ArenaInner>,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                block: vec![0u8; capacity].into_boxed_slice(),
                offset: 0,
                high_water: 0,
                failed_allocs: 0,
            }),
        }
    }

    /// Bump-allocate `len` bytes, 8-byte aligned. Returns the offset of
    /// the reservation, or `None` when the arena is exhausted.
    fn bump(&self, len: usize) -> Option<(*mut u8, usize)> {
        let mut inner = self.inner.lock();
        let aligned = inner.offset.checked_add(ALIGN - 1)? & !(ALIGN - 1);
        let end = aligned.checked_add(len)?;
        if end > inner.block.len() {
            inner.failed_allocs += 1;
            return None;
        }
        inner.offset = end;
        if end > inner.high_water {
            inner.high_water = end;
        }
        let ptr = inner.block.as_mut_ptr();
        // Safety: `aligned + len <= block.len()`, checked above.
        Some((unsafe { ptr.add(aligned) }, aligned))
    }

    /// Copy a float slice into the arena, returning the arena-backed
    /// pointer for FFI use. `None` when the arena cannot satisfy the
    /// request; callers then keep the heap-backed copy.
    pub fn stage_f32(&self, data: &[f32]) -> Option<*mut f32> {
        let bytes = std::mem::size_of_val(data);
        let (ptr, _) = self.bump(bytes)?;
        let dst = ptr as *mut f32;
        // Safety: the reservation is `bytes` long, 8-byte aligned (which
        // satisfies f32 alignment), and disjoint from `data`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Some(dst)
    }

    /// Copy an i32 slice into the arena. Same contract as `stage_f32`.
    pub fn stage_i32(&self, data: &[i32]) -> Option<*mut i32> {
        let bytes = std::mem::size_of_val(data);
        let (ptr, _) = self.bump(bytes)?;
        let dst = ptr as *mut i32;
        // Safety: see stage_f32.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Some(dst)
    }

    /// Invalidate every outstanding allocation. Called by the scheduler
    /// worker between tasks; no task-scoped pointer may survive this.
    pub fn reset(&self) {
        self.inner.lock().offset = 0;
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.inner.lock().offset
    }

    /// Peak bytes allocated since creation.
    pub fn high_water(&self) -> usize {
        self.inner.lock().high_water
    }

    /// Allocation requests the arena could not satisfy.
    pub fn failed_allocs(&self) -> u64 {
        self.inner.lock().failed_allocs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumps_are_aligned_and_accounted() {
        let arena = Arena::new(1024);
        let a = arena.stage_f32(&[1.0, 2.0, 3.0]).unwrap();
        let b = arena.stage_i32(&[4, 5]).unwrap();
        assert_eq!(a as usize % 8, 0);
        assert_eq!(b as usize % 8, 0);
        assert!(arena.used() >= 12 + 8);
        // staged data is readable through the returned pointers
        unsafe {
            assert_eq!(*a, 1.0);
            assert_eq!(*b.add(1), 5);
        }
    }

    #[test]
    fn exhaustion_falls_through_and_counts() {
        let arena = Arena::new(16);
        assert!(arena.stage_f32(&[0.0; 2]).is_some());
        assert!(arena.stage_f32(&[0.0; 64]).is_none());
        assert_eq!(arena.failed_allocs(), 1);
    }

    #[test]
    fn reset_reclaims_everything() {
        let arena = Arena::new(64);
        assert!(arena.stage_f32(&[0.0; 8]).is_some());
        let used = arena.used();
        assert!(used >= 32);
        arena.reset();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.high_water(), used);
        assert!(arena.stage_f32(&[0.0; 8]).is_some());
    }
}
