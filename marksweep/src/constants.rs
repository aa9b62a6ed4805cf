use std::mem::size_of;

pub const WORD: usize = size_of::<usize>();
pub const WORD_BITS: usize = WORD * 8;

pub const BLOCK_SIZE_BITS: usize = 15;
pub const BLOCK_SIZE: usize = 1 << BLOCK_SIZE_BITS;
pub const BLOCK_PTR_MASK: usize = !(BLOCK_SIZE - 1);

/// Small objects are sized in granules of two words. The first word of a
/// free object holds the free list link.
pub const GRANULE_BYTES: usize = WORD * 2;

/// Anything bigger gets a block (or a run of blocks) to itself
pub const MAX_SMALL_OBJECT: usize = BLOCK_SIZE / 2;
pub const SIZE_CLASS_COUNT: usize = MAX_SMALL_OBJECT / GRANULE_BYTES + 1;

pub const MAX_ALLOC_SIZE: usize = std::u32::MAX as usize;

/// Length descriptors longer than this are scanned one head segment at a time
pub const SPLIT_RANGE_BYTES: usize = 128 * WORD;
/// Ranges longer than this are halved when marking in parallel
pub const SHARE_BYTES: usize = 2048;

/// Bytes of scanning a single `mark_from` call may do before returning
pub const MARK_CREDIT_BYTES: isize = 4096;
/// Credit charged for one custom scan procedure call
pub const PROC_CREDIT_BYTES: isize = 100;

/// Number of object words a bitmap descriptor can describe. Two bits are lost
/// to the tag when the descriptor is stored in a heap word.
pub const BITMAP_MAX_WORDS: usize = WORD_BITS - 2;

pub const INITIAL_MARK_STACK_SIZE: usize = 4096;
pub const MAX_MARK_STACK_SIZE: usize = 1 << 22;
pub const LOCAL_MARK_STACK_SIZE: usize = 1024;

/// Entries a helper steals from the shared stack in one go
pub const ENTRIES_TO_GET: usize = 5;

pub const MAX_KINDS: usize = 16;
pub const MAX_SCAN_PROCS: usize = 64;
