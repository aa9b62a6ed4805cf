use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use blockalloc::Block;

use crate::constants::{WORD, WORD_BITS};
use crate::descriptor::Descriptor;
use crate::kind::KindId;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct BlockFlags: u8 {
        /// The kind has a disclaim callback; allocation is tracked per slot
        const HAS_DISCLAIM = 1 << 0;
        /// Push the contents of every allocated object each cycle
        const MARK_UNCONDITIONALLY = 1 << 1;
        /// A single object spanning the whole block run
        const LARGE = 1 << 2;
        /// Marks survive clearing; contents are pushed at cycle start
        const UNCOLLECTABLE = 1 << 3;
        /// Acquired while a mark cycle was running; the next sweep skips it
        const FRESH = 1 << 4;
        /// Objects are handed out one word past their base, behind a header
        /// word, and are referenced by that address
        const HEADER_WORD = 1 << 5;
    }
}

/// A fixed size bit vector that can be set from several marker threads at once
pub struct MarkBits {
    words: Box<[AtomicUsize]>,
}

impl MarkBits {
    pub fn new(bits: usize) -> MarkBits {
        let words = (bits + WORD_BITS - 1) / WORD_BITS;
        MarkBits {
            words: (0..words).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    fn locate(index: usize) -> (usize, usize) {
        (index / WORD_BITS, 1 << (index % WORD_BITS))
    }

    /// Set the bit, returning true if this call set it
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        self.words[word].fetch_or(bit, Ordering::Relaxed) & bit == 0
    }

    /// Clear the bit, returning true if it was set
    #[inline]
    pub fn clear(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        self.words[word].fetch_and(!bit, Ordering::Relaxed) & bit != 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        let (word, bit) = Self::locate(index);
        self.words[word].load(Ordering::Relaxed) & bit != 0
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

/// Everything the collector knows about one heap block: a homogeneous array
/// of same-sized objects, or a single large object.
pub struct BlockHeader {
    block: Block,
    object_size: usize,
    objects: usize,
    kind: KindId,
    descriptor: Descriptor,
    flags: AtomicU8,
    marks: MarkBits,
    n_marks: AtomicUsize,
    allocated: Option<MarkBits>,
    last_reclaimed: AtomicU64,
}

impl BlockHeader {
    /// Header for a block carved into `object_size` byte slots
    pub fn new(
        block: Block,
        kind: KindId,
        object_size: usize,
        descriptor: Descriptor,
        flags: BlockFlags,
        gc_no: u64,
    ) -> BlockHeader {
        let objects = if flags.contains(BlockFlags::LARGE) {
            1
        } else {
            block.size() / object_size
        };

        let allocated = if flags.contains(BlockFlags::HAS_DISCLAIM) {
            Some(MarkBits::new(objects))
        } else {
            None
        };

        BlockHeader {
            block,
            object_size,
            objects,
            kind,
            descriptor: descriptor.clamp_to(object_size),
            flags: AtomicU8::new(flags.bits()),
            marks: MarkBits::new(objects),
            n_marks: AtomicUsize::new(0),
            allocated,
            last_reclaimed: AtomicU64::new(gc_no),
        }
    }

    pub fn base(&self) -> usize {
        self.block.base()
    }

    /// One past the last byte that belongs to an object
    pub fn limit(&self) -> usize {
        self.base() + self.objects * self.object_size
    }

    /// Bytes of heap the block occupies
    pub fn span(&self) -> usize {
        self.block.size()
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn objects(&self) -> usize {
        self.objects
    }

    pub fn kind(&self) -> KindId {
        self.kind
    }

    /// The descriptor pushed with every object in this block
    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn insert_flags(&self, flags: BlockFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn remove_flags(&self, flags: BlockFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    pub fn is_large(&self) -> bool {
        self.flags().contains(BlockFlags::LARGE)
    }

    pub fn object_at(&self, slot: usize) -> usize {
        self.base() + slot * self.object_size
    }

    /// The slot holding `addr`, if `addr` falls inside an object
    pub fn slot_of(&self, addr: usize) -> Option<usize> {
        if addr < self.base() || addr >= self.limit() {
            return None;
        }
        Some((addr - self.base()) / self.object_size)
    }

    /// Resolve a candidate pointer to the base of the object it refers to.
    /// Without interior pointers only the exact object base is accepted, or
    /// the address just past the header word for blocks that have one.
    pub fn object_base(&self, addr: usize, interior: bool) -> Option<usize> {
        let base = self.object_at(self.slot_of(addr)?);
        if interior || base == addr {
            return Some(base);
        }
        if addr == base + WORD && self.flags().contains(BlockFlags::HEADER_WORD) {
            return Some(base);
        }
        None
    }

    /// Set the mark bit of a slot, returning true if it was not already set
    pub fn mark(&self, slot: usize) -> bool {
        let newly = self.marks.set(slot);
        if newly {
            self.n_marks.fetch_add(1, Ordering::Relaxed);
        }
        newly
    }

    pub fn unmark(&self, slot: usize) {
        if self.marks.clear(slot) {
            self.n_marks.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn is_marked(&self, slot: usize) -> bool {
        self.marks.get(slot)
    }

    pub fn clear_marks(&self) {
        self.marks.clear_all();
        self.n_marks.store(0, Ordering::Relaxed);
    }

    pub fn marked_count(&self) -> usize {
        self.n_marks.load(Ordering::Relaxed)
    }

    /// Iterate the slots whose mark bit is set
    pub fn marked_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.objects).filter(move |slot| self.marks.get(*slot))
    }

    pub fn tracks_allocation(&self) -> bool {
        self.allocated.is_some()
    }

    /// Whether a slot currently holds an allocated object. Blocks that don't
    /// track allocation answer true for every slot.
    pub fn is_allocated(&self, slot: usize) -> bool {
        match &self.allocated {
            Some(bits) => bits.get(slot),
            None => true,
        }
    }

    pub fn set_allocated(&self, slot: usize, allocated: bool) {
        if let Some(bits) = &self.allocated {
            if allocated {
                bits.set(slot);
            } else {
                bits.clear(slot);
            }
        }
    }

    pub fn last_reclaimed(&self) -> u64 {
        self.last_reclaimed.load(Ordering::Relaxed)
    }

    pub fn set_last_reclaimed(&self, gc_no: u64) {
        self.last_reclaimed.store(gc_no, Ordering::Relaxed);
    }

    /// Give up the header, returning the block so it can be released
    pub fn into_block(self) -> Block {
        self.block
    }
}
