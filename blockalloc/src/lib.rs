//! A block allocator for heap blocks that must be:
//!  - powers of two in size
//!  - aligned to their size
//!  - zero filled when handed out
//!
//! Blocks are obtained either directly with `Block::new()` or through a
//! `PageAllocator`, the seam a collector uses to acquire and give back heap
//! memory.
//!
//! Usage:
//! ```
//! use blockalloc::{Block, PageAllocator, SystemPages};
//!
//! let pages = SystemPages::new();
//! let block = pages.acquire_block(32768).unwrap();
//! assert!(block.size() == 32768);
//! pages.release_block(block);
//! ```
//!
//! Normal scoping rules will call Block::drop() when a `Block` goes out of
//! scope causing the block to be fully deallocated.
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type BlockPtr = NonNull<u8>;
pub type BlockSize = usize;

/// Set of possible block allocation failures
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BlockError {
    /// Usually means requested block size, and therefore alignment, wasn't a
    /// power of two
    BadRequest,
    /// Insufficient memory, couldn't allocate a block
    OOM,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockError::BadRequest => write!(f, "block size must be a non-zero power of two"),
            BlockError::OOM => write!(f, "out of memory allocating block"),
        }
    }
}

impl std::error::Error for BlockError {}

/// A block-size-aligned block of memory
pub struct Block {
    ptr: BlockPtr,
    size: BlockSize,
}

// SAFETY: a Block exclusively owns its allocation, nothing else aliases the pointer
unsafe impl Send for Block {}
// SAFETY: shared access only exposes the address and size
unsafe impl Sync for Block {}

impl Block {
    /// Instantiate a new zeroed block of the given size. Size must be a power of two.
    pub fn new(size: BlockSize) -> Result<Block, BlockError> {
        if !size.is_power_of_two() {
            return Err(BlockError::BadRequest);
        }

        Ok(Block {
            ptr: internal::alloc_block(size)?,
            size,
        })
    }

    /// Return the size in bytes of the block
    pub fn size(&self) -> BlockSize {
        self.size
    }

    /// Return a bare pointer to the base of the block
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Return the base address of the block as a word
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last address in the block
    pub fn limit(&self) -> usize {
        self.base() + self.size
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        internal::dealloc_block(self.ptr, self.size);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Block({:#x}, {})", self.base(), self.size)
    }
}

/// The source of heap blocks for a collector. Implementations must hand out
/// zeroed, size-aligned blocks and take them back when the collector finds
/// them entirely empty.
pub trait PageAllocator: Send + Sync {
    /// Acquire a block of `size` bytes, a power of two
    fn acquire_block(&self, size: BlockSize) -> Result<Block, BlockError>;

    /// Give a block back
    fn release_block(&self, block: Block);
}

/// The default page allocator: blocks come straight from the global
/// allocator. Keeps count of what is currently handed out.
#[derive(Debug, Default)]
pub struct SystemPages {
    live_blocks: AtomicUsize,
    live_bytes: AtomicUsize,
    limit: Option<usize>,
}

impl SystemPages {
    pub fn new() -> SystemPages {
        SystemPages::default()
    }

    /// A page allocator that refuses to hand out more than `limit` bytes at once
    pub fn with_limit(limit: usize) -> SystemPages {
        SystemPages {
            limit: Some(limit),
            ..SystemPages::default()
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

impl PageAllocator for SystemPages {
    fn acquire_block(&self, size: BlockSize) -> Result<Block, BlockError> {
        if let Some(limit) = self.limit {
            if self.live_bytes() + size > limit {
                return Err(BlockError::OOM);
            }
        }

        let block = Block::new(size)?;
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(block)
    }

    fn release_block(&self, block: Block) {
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(block.size(), Ordering::Relaxed);
        drop(block);
    }
}

mod internal {
    use super::{BlockError, BlockPtr, BlockSize};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::ptr::NonNull;

    pub fn alloc_block(size: BlockSize) -> Result<BlockPtr, BlockError> {
        let layout = Layout::from_size_align(size, size).map_err(|_| BlockError::BadRequest)?;

        // SAFETY: layout has a non-zero, power of two size
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(BlockError::OOM)
    }

    pub fn dealloc_block(ptr: BlockPtr, size: BlockSize) {
        // SAFETY: the same layout was validated when the block was allocated
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, size);

            dealloc(ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {

    use crate::{Block, BlockError, BlockSize, PageAllocator, SystemPages};

    fn alloc_dealloc(size: BlockSize) -> Result<(), BlockError> {
        let block = Block::new(size)?;

        // the block address bitwise AND the alignment bits (size - 1) should
        // be a mutually exclusive set of bits
        let mask = size - 1;
        assert!((block.ptr.as_ptr() as usize & mask) ^ mask == mask);

        drop(block);
        Ok(())
    }

    #[test]
    fn test_bad_sizealign() {
        assert!(alloc_dealloc(999) == Err(BlockError::BadRequest))
    }

    #[test]
    fn test_zero_size() {
        assert!(alloc_dealloc(0) == Err(BlockError::BadRequest))
    }

    #[test]
    fn test_4k() {
        assert!(alloc_dealloc(4096).is_ok())
    }

    #[test]
    fn test_32k() {
        assert!(alloc_dealloc(32768).is_ok())
    }

    #[test]
    fn test_16m() {
        assert!(alloc_dealloc(16 * 1024 * 1024).is_ok())
    }

    #[test]
    fn test_zeroed() {
        let block = Block::new(4096).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), block.size()) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(block.limit() - block.base() == 4096);
    }

    #[test]
    fn test_system_pages_counts() {
        let pages = SystemPages::new();

        let a = pages.acquire_block(32768).unwrap();
        let b = pages.acquire_block(65536).unwrap();
        assert!(pages.live_blocks() == 2);
        assert!(pages.live_bytes() == 32768 + 65536);

        pages.release_block(a);
        assert!(pages.live_blocks() == 1);
        assert!(pages.live_bytes() == 65536);

        pages.release_block(b);
        assert!(pages.live_blocks() == 0);
    }

    #[test]
    fn test_system_pages_limit() {
        let pages = SystemPages::with_limit(65536);

        let a = pages.acquire_block(32768).unwrap();
        let b = pages.acquire_block(32768).unwrap();
        let got = pages.acquire_block(32768).err();
        println!("test_system_pages_limit got {:?} expected {:?}", got, Some(BlockError::OOM));
        assert!(got == Some(BlockError::OOM));

        pages.release_block(a);
        assert!(pages.acquire_block(32768).is_ok());
        drop(b);
    }
}
