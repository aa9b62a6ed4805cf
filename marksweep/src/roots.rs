//! Root enumeration and the dirty-block oracle.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mark::Marker;
use crate::markstack::MarkStack;
use crate::rawptr::RawPtr;

/// Something that holds pointers into the heap from outside it: stacks,
/// registers, static data, handles kept by the embedding program.
pub trait RootSource: Send + Sync {
    fn enumerate_roots(&self, roots: &mut RootSet<'_>);
}

impl<F> RootSource for F
where
    F: Fn(&mut RootSet<'_>) + Send + Sync,
{
    fn enumerate_roots(&self, roots: &mut RootSet<'_>) {
        self(roots)
    }
}

/// Handed to a `RootSource`; every word given to it is treated as a
/// candidate pointer straight away.
///
/// Root words are numbered across all sources in registration order, so a
/// push that stopped part way can pick up again at a later word.
pub struct RootSet<'a> {
    marker: &'a Marker<'a>,
    stack: &'a mut MarkStack,
    index: usize,
    start: usize,
    /// Stop once the stack holds this many entries
    threshold: usize,
    resume: Option<usize>,
}

impl<'a> RootSet<'a> {
    pub(crate) fn new(
        marker: &'a Marker<'a>,
        stack: &'a mut MarkStack,
        start: usize,
        threshold: usize,
    ) -> RootSet<'a> {
        RootSet {
            marker,
            stack,
            index: 0,
            start,
            threshold: threshold.max(1),
            resume: None,
        }
    }

    pub fn scan_word(&mut self, word: usize) {
        let index = self.index;
        self.index += 1;
        if index < self.start || self.resume.is_some() {
            return;
        }
        if self.stack.len() >= self.threshold {
            self.resume = Some(index);
            return;
        }
        self.marker.mark_word(word, self.stack);
    }

    pub fn scan_words(&mut self, words: &[usize]) {
        for word in words {
            self.scan_word(*word);
        }
    }
}

/// Push root words from number `start` on, until the stack holds
/// `threshold` entries. Roots are marked eagerly, so a root source is never
/// itself placed on the mark stack. Returns the word to resume from, or
/// `None` once every root has been pushed.
pub(crate) fn push_roots(
    sources: &[Arc<dyn RootSource>],
    marker: &Marker,
    stack: &mut MarkStack,
    start: usize,
    threshold: usize,
) -> Option<usize> {
    let mut roots = RootSet::new(marker, stack, start, threshold);
    for source in sources {
        source.enumerate_roots(&mut roots);
        if roots.resume.is_some() {
            break;
        }
    }
    roots.resume
}

/// A fixed array of root slots the embedding program writes handles into.
/// Slots hold raw words; zero is empty.
pub struct RootSlots {
    slots: Mutex<Vec<usize>>,
}

impl RootSlots {
    pub fn new(count: usize) -> RootSlots {
        RootSlots {
            slots: Mutex::new(vec![0; count]),
        }
    }

    /// Store a handle. Out of range indices are ignored.
    pub fn set(&self, index: usize, object: Option<RawPtr>) {
        if let Some(slot) = self.slots.lock().get_mut(index) {
            *slot = object.map_or(0, |ptr| ptr.as_word());
        }
    }

    pub fn get(&self, index: usize) -> Option<RawPtr> {
        self.slots.lock().get(index).and_then(|word| RawPtr::new(*word))
    }

    /// Append a handle, returning its index
    pub fn push(&self, object: RawPtr) -> usize {
        let mut slots = self.slots.lock();
        slots.push(object.as_word());
        slots.len() - 1
    }

    /// Empty every slot
    pub fn clear(&self) {
        for slot in self.slots.lock().iter_mut() {
            *slot = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl RootSource for RootSlots {
    fn enumerate_roots(&self, roots: &mut RootSet<'_>) {
        roots.scan_words(&self.slots.lock());
    }
}

/// Answers whether a heap block may have been written since marking began.
/// Without a write barrier every block is assumed dirty.
pub trait DirtyOracle: Send + Sync {
    fn was_written(&self, block_base: usize) -> bool;
}

/// The oracle used when nothing better is known
pub struct AllDirty;

impl DirtyOracle for AllDirty {
    fn was_written(&self, _block_base: usize) -> bool {
        true
    }
}

impl<F> DirtyOracle for F
where
    F: Fn(usize) -> bool + Send + Sync,
{
    fn was_written(&self, block_base: usize) -> bool {
        self(block_base)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::blockmeta::{BlockFlags, BlockHeader};
    use crate::constants::{BLOCK_SIZE, GRANULE_BYTES};
    use crate::descriptor::Descriptor;
    use crate::heap::BlockTable;
    use crate::kind::KindId;
    use crate::mark::Scannable;
    use blockalloc::Block;

    #[test]
    fn test_root_slots() {
        let slots = RootSlots::new(2);
        let ptr = RawPtr::new(0x1000).unwrap();

        slots.set(1, Some(ptr));
        slots.set(5, Some(ptr));
        assert!(slots.get(1) == Some(ptr));
        assert!(slots.get(0).is_none());

        let index = slots.push(ptr);
        assert!(index == 2);
        assert!(slots.len() == 3);

        slots.clear();
        assert!(slots.get(1).is_none());
        assert!(slots.len() == 3);
    }

    #[test]
    fn test_roots_mark_eagerly() {
        let mut table = BlockTable::new();
        let id = table.insert(BlockHeader::new(
            Block::new(BLOCK_SIZE).unwrap(),
            KindId::NORMAL,
            GRANULE_BYTES,
            Descriptor::Length(GRANULE_BYTES),
            BlockFlags::empty(),
            0,
        ));
        let header = table.get(id).unwrap();
        let (a, b) = (header.object_at(0), header.object_at(1));

        let slots = Arc::new(RootSlots::new(0));
        slots.push(RawPtr::new(a).unwrap());
        let closure_root = move |roots: &mut RootSet<'_>| roots.scan_words(&[b, 12345]);
        let mut sources: Vec<Arc<dyn RootSource>> = Vec::new();
        sources.push(slots);
        sources.push(Arc::new(closure_root));

        let procs: Vec<Arc<dyn Scannable>> = Vec::new();
        let marker = Marker::new(&table, &procs, false, false);
        let mut stack = MarkStack::new(16);
        assert!(push_roots(&sources, &marker, &mut stack, 0, 16).is_none());

        let got = header.marked_count();
        println!("test_roots_mark_eagerly got {} expected {}", got, 2);
        assert!(got == 2);
        assert!(stack.len() == 2);
    }

    #[test]
    fn test_roots_pushed_in_runs() {
        let mut table = BlockTable::new();
        let id = table.insert(BlockHeader::new(
            Block::new(BLOCK_SIZE).unwrap(),
            KindId::NORMAL,
            GRANULE_BYTES,
            Descriptor::Length(GRANULE_BYTES),
            BlockFlags::empty(),
            0,
        ));
        let header = table.get(id).unwrap();

        let slots = Arc::new(RootSlots::new(0));
        for slot in 0..10 {
            slots.push(RawPtr::new(header.object_at(slot)).unwrap());
        }
        let sources: Vec<Arc<dyn RootSource>> = vec![slots as Arc<dyn RootSource>];

        let procs: Vec<Arc<dyn Scannable>> = Vec::new();
        let marker = Marker::new(&table, &procs, false, false);
        let mut stack = MarkStack::new(16);

        let mut resume = Some(0);
        let mut runs = 0;
        while let Some(start) = resume {
            resume = push_roots(&sources, &marker, &mut stack, start, 4);
            assert!(stack.len() <= 4);
            assert!(!stack.take_overflow());
            stack.clear();
            runs += 1;
        }

        println!("test_roots_pushed_in_runs got {} expected {}", runs, 3);
        assert!(runs == 3);
        assert!(header.marked_count() == 10);
    }

    #[test]
    fn test_dirty_oracles() {
        assert!(AllDirty.was_written(0x8000));
        let clean = |_base: usize| false;
        assert!(!clean.was_written(0x8000));
    }
}
