//! The descriptor driven scanning loop.
//!
//! `Marker::mark_from()` pops mark stack entries and scans the memory they
//! describe, treating each candidate word as a possible heap pointer. A
//! candidate that resolves to an unmarked object gets its mark bit set and
//! an entry for its contents pushed. Every entry on the stack describes
//! memory inside a heap block; anything coming from outside (scan
//! procedures, roots) is validated against the block table before it is
//! read or pushed.
use std::sync::Arc;

use log::trace;

use crate::blockmeta::BlockHeader;
use crate::constants::{
    BITMAP_MAX_WORDS, PROC_CREDIT_BYTES, SHARE_BYTES, SPLIT_RANGE_BYTES, WORD,
};
use crate::descriptor::{Descriptor, Indirect};
use crate::heap::BlockTable;
use crate::markstack::{MarkEntry, MarkStack};
use crate::rawptr::{load_word, RawPtr};

/// A custom scan procedure, for objects whose layout a descriptor can't
/// express, e.g. variable length arrays of pointer-containing elements.
pub trait Scannable: Send + Sync {
    fn scan(&self, object: RawPtr, env: usize, tracer: &mut Tracer<'_>);
}

impl<F> Scannable for F
where
    F: Fn(RawPtr, usize, &mut Tracer<'_>) + Send + Sync,
{
    fn scan(&self, object: RawPtr, env: usize, tracer: &mut Tracer<'_>) {
        self(object, env, tracer)
    }
}

/// Scanning context: the heap, the registered scan procedures and the
/// pointer recognition mode
pub struct Marker<'a> {
    blocks: &'a BlockTable,
    procs: &'a [Arc<dyn Scannable>],
    interior_pointers: bool,
    parallel: bool,
}

impl<'a> Marker<'a> {
    pub fn new(
        blocks: &'a BlockTable,
        procs: &'a [Arc<dyn Scannable>],
        interior_pointers: bool,
        parallel: bool,
    ) -> Marker<'a> {
        Marker {
            blocks,
            procs,
            interior_pointers,
            parallel,
        }
    }

    pub fn blocks(&self) -> &'a BlockTable {
        self.blocks
    }

    /// Treat `word` as a candidate pointer. If it refers to an unmarked
    /// object, mark it and push its contents. Returns true if the object was
    /// newly marked.
    pub fn mark_word(&self, word: usize, stack: &mut MarkStack) -> bool {
        let (least, greatest) = self.blocks.bounds();
        if word < least || word >= greatest {
            return false;
        }

        let (_, header, base) = match self.blocks.find_object(word, self.interior_pointers) {
            Some(found) => found,
            None => return false,
        };

        let slot = (base - header.base()) / header.object_size();
        if !header.mark(slot) {
            return false;
        }

        let descr = header.descriptor();
        if !descr.is_empty() {
            stack.push(MarkEntry::new(base, descr));
        }
        true
    }

    /// Push the contents of one object of a block, without touching its mark
    pub fn push_object(&self, header: &BlockHeader, slot: usize, stack: &mut MarkStack) {
        let descr = header.descriptor();
        if !descr.is_empty() {
            stack.push(MarkEntry::new(header.object_at(slot), descr));
        }
    }

    /// Drain the stack until it is empty or `credit` bytes worth of scanning
    /// has been done
    pub fn mark_from(&self, stack: &mut MarkStack, mut credit: isize) {
        while credit > 0 {
            let entry = match stack.pop() {
                Some(entry) => entry,
                None => break,
            };
            credit -= self.scan_entry(entry, stack);
        }
    }

    /// Scan one entry, returning the credit used
    fn scan_entry(&self, entry: MarkEntry, stack: &mut MarkStack) -> isize {
        let start = entry.start;

        match entry.descr {
            Descriptor::Length(len) => {
                let len = len & !(WORD - 1);
                if len <= SPLIT_RANGE_BYTES {
                    self.scan_range(start, start + len, stack);
                    return len as isize;
                }

                if self.parallel && len > SHARE_BYTES && stack.has_room(2) {
                    // halve, so an idle helper can take one of the halves
                    let half = (len / 2) & !(WORD - 1);
                    stack.push(MarkEntry::new(start + half, Descriptor::Length(len - half)));
                    stack.push(MarkEntry::new(start, Descriptor::Length(half)));
                    return WORD as isize;
                }

                stack.push(MarkEntry::new(
                    start + SPLIT_RANGE_BYTES,
                    Descriptor::Length(len - SPLIT_RANGE_BYTES),
                ));
                self.scan_range(start, start + SPLIT_RANGE_BYTES, stack);
                SPLIT_RANGE_BYTES as isize
            }

            Descriptor::Bitmap(bits) => {
                self.scan_bitmap(start, bits, stack);
                (BITMAP_MAX_WORDS * WORD / 2) as isize
            }

            Descriptor::Proc { proc, env } => {
                match self.procs.get(proc.index()) {
                    Some(scan) => {
                        if let Some(object) = RawPtr::new(start) {
                            let mut tracer = Tracer { marker: self, stack };
                            scan.scan(object, env, &mut tracer);
                        }
                    }
                    None => trace!("Unknown scan procedure {} at {:#x}", proc.index(), start),
                }
                PROC_CREDIT_BYTES
            }

            Descriptor::PerObject(indirect) => match self.resolve(start, indirect) {
                Some(descr) => self.scan_entry(MarkEntry::new(start, descr), stack),
                None => WORD as isize,
            },
        }
    }

    fn scan_range(&self, start: usize, end: usize, stack: &mut MarkStack) {
        for addr in (start..end).step_by(WORD) {
            // SAFETY: entries only ever describe memory inside heap blocks
            let word = unsafe { load_word(addr) };
            self.mark_word(word, stack);
        }
    }

    fn scan_bitmap(&self, start: usize, mut bits: usize, stack: &mut MarkStack) {
        while bits != 0 {
            let index = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            // SAFETY: as for scan_range, bitmaps are clamped to the object
            let word = unsafe { load_word(start + index * WORD) };
            self.mark_word(word, stack);
        }
    }

    /// Find the descriptor of an object that carries its own. The result is
    /// clamped to the object. Zero descriptors, type descriptor pointers
    /// that don't point into the heap, and further indirection are skipped.
    fn resolve(&self, start: usize, indirect: Indirect) -> Option<Descriptor> {
        let (_, header) = self.blocks.lookup(start)?;
        let object_end = header.object_base(start, true)? + header.object_size();

        let descr_addr = match indirect {
            Indirect::InObject { offset } => start.checked_add(offset)?,
            Indirect::InTypeDescriptor { offset } => {
                // SAFETY: start is an object base inside a live block
                let type_descr = unsafe { load_word(start) };
                if type_descr == 0 {
                    return None;
                }
                let addr = type_descr.checked_add(offset)?;
                if !self.blocks.contains_range(addr, WORD) {
                    return None;
                }
                addr
            }
        };

        if let Indirect::InObject { .. } = indirect {
            if descr_addr % WORD != 0 || descr_addr + WORD > object_end {
                return None;
            }
        }

        // SAFETY: checked to be inside the object or another heap object above
        let word = unsafe { load_word(descr_addr) };
        match Descriptor::decode(word)? {
            Descriptor::PerObject(_) => None,
            descr => Some(descr.clamp_to(object_end - start)),
        }
    }
}

/// The interface a custom scan procedure sees. All reads and pushes are
/// checked against the heap.
pub struct Tracer<'a> {
    marker: &'a Marker<'a>,
    stack: &'a mut MarkStack,
}

impl<'a> Tracer<'a> {
    /// Read a heap word. `None` if `addr` is not inside a heap object.
    pub fn load(&self, addr: usize) -> Option<usize> {
        if !self.marker.blocks.contains_range(addr, WORD) {
            return None;
        }
        // SAFETY: validated above
        Some(unsafe { load_word(addr) })
    }

    /// Word `index` of an object
    pub fn load_field(&self, object: RawPtr, index: usize) -> Option<usize> {
        self.load(object.as_word().checked_add(index.checked_mul(WORD)?)?)
    }

    /// Treat `word` as a candidate pointer
    pub fn mark(&mut self, word: usize) -> bool {
        self.marker.mark_word(word, self.stack)
    }

    /// Queue `len` bytes from `start` to be scanned conservatively
    pub fn push_range(&mut self, start: usize, len: usize) -> bool {
        self.push(start, Descriptor::Length(len))
    }

    /// Queue memory to be scanned with a descriptor. The memory must lie
    /// inside a single heap object run; anything else is refused.
    pub fn push(&mut self, start: usize, descr: Descriptor) -> bool {
        if descr.is_empty() {
            return false;
        }
        let valid = match descr.extent() {
            Some(len) => self.marker.blocks.contains_range(start, len),
            None => self.marker.blocks.contains_range(start, WORD),
        };
        if valid {
            self.stack.push(MarkEntry::new(start, descr));
        }
        valid
    }

    /// Size of the object `object` points into
    pub fn object_size(&self, object: RawPtr) -> Option<usize> {
        self.marker
            .blocks
            .lookup(object.as_word())
            .map(|(_, header)| header.object_size())
    }
}
