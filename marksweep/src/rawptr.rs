//! Word level access to managed heap memory.
//!
//! Every place the collector treats heap bytes as words, and possibly as
//! pointers, goes through this module. Accesses are relaxed atomic word
//! operations so marker threads may read words that a mutator is writing.
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::constants::WORD;

/// An untyped, word aligned pointer into the managed heap.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawPtr {
    ptr: NonNull<usize>,
}

// SAFETY: a RawPtr is an address; the memory behind it is only touched through
// atomic word operations
unsafe impl Send for RawPtr {}
// SAFETY: see above
unsafe impl Sync for RawPtr {}

impl RawPtr {
    /// Create a new RawPtr from a word address. Returns `None` for null or
    /// misaligned addresses.
    pub fn new(addr: usize) -> Option<RawPtr> {
        if addr % WORD != 0 {
            return None;
        }
        NonNull::new(addr as *mut usize).map(|ptr| RawPtr { ptr })
    }

    /// Get the pointer value as a word-sized integer
    pub fn as_word(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *const usize {
        self.ptr.as_ptr()
    }

    /// The pointer `words` words further on
    pub fn offset_words(&self, words: usize) -> RawPtr {
        RawPtr {
            // SAFETY: heap addresses never wrap to zero
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().wrapping_add(words)) },
        }
    }

    /// Read word `index` of the object.
    ///
    /// # Safety
    /// The word must lie inside an object the collector still owns. Use
    /// `Collector::load()` for a bounds checked read.
    pub unsafe fn load(&self, index: usize) -> usize {
        load_word(self.as_word() + index * WORD)
    }

    /// Write word `index` of the object.
    ///
    /// # Safety
    /// As for `load()`. Use `Collector::store()` for a bounds checked write.
    pub unsafe fn store(&self, index: usize, value: usize) {
        store_word(self.as_word() + index * WORD, value)
    }
}

impl fmt::Debug for RawPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RawPtr({:#x})", self.as_word())
    }
}

/// # Safety
/// `addr` must be word aligned and inside a live heap block.
#[inline]
pub(crate) unsafe fn load_word(addr: usize) -> usize {
    (*(addr as *const AtomicUsize)).load(Ordering::Relaxed)
}

/// # Safety
/// `addr` must be word aligned and inside a live heap block.
#[inline]
pub(crate) unsafe fn store_word(addr: usize, value: usize) {
    (*(addr as *const AtomicUsize)).store(value, Ordering::Relaxed)
}

/// Zero `words` words starting at `addr`.
///
/// # Safety
/// The whole range must be inside one live heap block.
pub(crate) unsafe fn clear_words(addr: usize, words: usize) {
    for i in 0..words {
        store_word(addr + i * WORD, 0);
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_rejects_null_and_misaligned() {
        assert!(RawPtr::new(0).is_none());
        assert!(RawPtr::new(WORD + 1).is_none());
        assert!(RawPtr::new(WORD * 4).is_some());
    }

    #[test]
    fn test_load_store() {
        let mut words = vec![0usize; 4];
        let ptr = RawPtr::new(words.as_mut_ptr() as usize).unwrap();

        unsafe {
            ptr.store(2, 0xdead);
            let got = ptr.load(2);
            println!("test_load_store got {:#x} expected {:#x}", got, 0xdead);
            assert!(got == 0xdead);

            assert!(ptr.offset_words(2).load(0) == 0xdead);

            clear_words(ptr.as_word(), 4);
            assert!(load_word(ptr.as_word() + 2 * WORD) == 0);
        }
    }
}
