//! Object kinds: allocation categories sharing free lists and a scanning and
//! disclaim policy.
use std::fmt;
use std::sync::Arc;

use fnv::FnvHashSet;

use crate::allocator::AllocError;
use crate::blockmeta::BlockFlags;
use crate::constants::{GRANULE_BYTES, MAX_KINDS, SIZE_CLASS_COUNT, WORD};
use crate::descriptor::Descriptor;
use crate::disclaim::Disclaimable;
use crate::heap::BlockId;
use crate::rawptr::{clear_words, load_word, store_word};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindId(u8);

impl KindId {
    /// Objects that never contain pointers
    pub const PTRFREE: KindId = KindId(0);
    /// Conservatively scanned objects
    pub const NORMAL: KindId = KindId(1);
    /// Scanned but never reclaimed unless explicitly freed
    pub const UNCOLLECTABLE: KindId = KindId(2);

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Properties fixed when a kind is registered
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KindProperties {
    pub name: &'static str,
    /// Descriptor used for every object of the kind
    pub descriptor: Descriptor,
    /// Add the object size to a length descriptor, so `Length(0)` means
    /// "scan the whole object"
    pub relocate_descriptor: bool,
    /// Zero objects as they go back on a free list
    pub clear_on_free: bool,
    pub uncollectable: bool,
    /// Objects carry a header word and are referenced by the address just
    /// past it
    pub header_word: bool,
}

impl KindProperties {
    /// Conservatively scanned objects
    pub fn normal(name: &'static str) -> KindProperties {
        KindProperties {
            name,
            descriptor: Descriptor::NONE,
            relocate_descriptor: true,
            clear_on_free: true,
            uncollectable: false,
            header_word: false,
        }
    }

    /// Objects the collector never looks inside
    pub fn pointer_free(name: &'static str) -> KindProperties {
        KindProperties {
            name,
            descriptor: Descriptor::NONE,
            relocate_descriptor: false,
            clear_on_free: false,
            uncollectable: false,
            header_word: false,
        }
    }

    /// Objects scanned with a fixed descriptor
    pub fn typed(name: &'static str, descriptor: Descriptor) -> KindProperties {
        KindProperties {
            name,
            descriptor,
            relocate_descriptor: false,
            clear_on_free: true,
            uncollectable: false,
            header_word: false,
        }
    }

    /// Whether scanning an object of the kind can find pointers
    pub fn holds_pointers(&self) -> bool {
        match self.descriptor {
            Descriptor::Length(_) if self.relocate_descriptor => true,
            descr => !descr.is_empty(),
        }
    }
}

/// A registered kind: free list heads per size class, the blocks waiting to
/// be reclaimed lazily per size class, and the disclaim policy
pub struct ObjectKind {
    props: KindProperties,
    free_lists: Vec<usize>,
    reclaim_lists: Vec<Vec<BlockId>>,
    disclaim: Option<Arc<dyn Disclaimable>>,
    mark_unconditionally: bool,
    block_count: usize,
}

impl ObjectKind {
    fn new(props: KindProperties) -> ObjectKind {
        ObjectKind {
            props,
            free_lists: vec![0; SIZE_CLASS_COUNT],
            reclaim_lists: vec![Vec::new(); SIZE_CLASS_COUNT],
            disclaim: None,
            mark_unconditionally: false,
            block_count: 0,
        }
    }

    pub fn properties(&self) -> &KindProperties {
        &self.props
    }

    /// The descriptor for objects of `object_size` bytes
    pub fn descriptor_for(&self, object_size: usize) -> Descriptor {
        match self.props.descriptor {
            Descriptor::Length(len) if self.props.relocate_descriptor => {
                Descriptor::Length(len + object_size)
            }
            descr => descr,
        }
    }

    pub fn block_flags(&self) -> BlockFlags {
        let mut flags = BlockFlags::empty();
        if self.props.uncollectable {
            flags |= BlockFlags::UNCOLLECTABLE;
        }
        if self.disclaim.is_some() {
            flags |= BlockFlags::HAS_DISCLAIM;
        }
        if self.mark_unconditionally {
            flags |= BlockFlags::MARK_UNCONDITIONALLY;
        }
        if self.props.header_word {
            flags |= BlockFlags::HEADER_WORD;
        }
        flags
    }

    pub fn disclaim(&self) -> Option<&Arc<dyn Disclaimable>> {
        self.disclaim.as_ref()
    }

    pub fn clears_on_free(&self) -> bool {
        self.props.clear_on_free
    }

    pub fn is_uncollectable(&self) -> bool {
        self.props.uncollectable
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub(crate) fn block_added(&mut self) {
        self.block_count += 1;
    }

    pub(crate) fn block_removed(&mut self) {
        self.block_count -= 1;
    }

    /// Link an object onto the free list for its size class, zeroing it first
    /// if the kind asks for that
    pub(crate) fn push_free(&mut self, granules: usize, addr: usize) {
        // SAFETY: free list entries are object slots in live blocks of this kind
        unsafe {
            if self.props.clear_on_free {
                clear_words(addr + WORD, granules * GRANULE_BYTES / WORD - 1);
            }
            store_word(addr, self.free_lists[granules]);
        }
        self.free_lists[granules] = addr;
    }

    /// Unlink the head of a free list, leaving its link word zeroed
    pub(crate) fn pop_free(&mut self, granules: usize) -> Option<usize> {
        let head = self.free_lists[granules];
        if head == 0 {
            return None;
        }
        // SAFETY: as for push_free
        unsafe {
            self.free_lists[granules] = load_word(head);
            store_word(head, 0);
        }
        Some(head)
    }

    /// Walk a free list, for diagnostics and leak reports
    pub(crate) fn free_objects(&self, granules: usize) -> Vec<usize> {
        let mut objects = Vec::new();
        let mut cursor = self.free_lists[granules];
        while cursor != 0 {
            objects.push(cursor);
            // SAFETY: as for push_free
            cursor = unsafe { load_word(cursor) };
        }
        objects
    }

    pub(crate) fn queue_reclaim(&mut self, granules: usize, id: BlockId) {
        self.reclaim_lists[granules].push(id);
    }

    pub(crate) fn next_reclaim(&mut self, granules: usize) -> Option<BlockId> {
        self.reclaim_lists[granules].pop()
    }

    pub(crate) fn queued_reclaims(&self) -> usize {
        self.reclaim_lists.iter().map(|list| list.len()).sum()
    }

    fn clear_free_lists(&mut self) {
        for head in self.free_lists.iter_mut() {
            *head = 0;
        }
    }

    fn clear_reclaim_lists(&mut self) {
        for list in self.reclaim_lists.iter_mut() {
            list.clear();
        }
    }
}

/// The kind registry. Built-in kinds always exist; at most `MAX_KINDS`
/// kinds can be registered in total.
pub struct KindTable {
    kinds: Vec<ObjectKind>,
}

impl KindTable {
    pub fn new() -> KindTable {
        let mut uncollectable = KindProperties::normal("uncollectable");
        uncollectable.uncollectable = true;

        KindTable {
            kinds: vec![
                ObjectKind::new(KindProperties::pointer_free("ptrfree")),
                ObjectKind::new(KindProperties::normal("normal")),
                ObjectKind::new(uncollectable),
            ],
        }
    }

    /// Register a kind. Registering the same name with the same properties
    /// again returns the existing id. Kinds that hold pointers must clear
    /// objects as they are freed.
    pub fn register(&mut self, props: KindProperties) -> Result<KindId, AllocError> {
        if props.holds_pointers() && !props.clear_on_free {
            return Err(AllocError::BadRequest);
        }

        if let Some(index) = self.kinds.iter().position(|kind| kind.props.name == props.name) {
            return if self.kinds[index].props == props {
                Ok(KindId(index as u8))
            } else {
                Err(AllocError::BadRequest)
            };
        }

        if self.kinds.len() >= MAX_KINDS {
            return Err(AllocError::TooManyKinds);
        }

        self.kinds.push(ObjectKind::new(props));
        Ok(KindId((self.kinds.len() - 1) as u8))
    }

    /// Attach a disclaim callback. Blocks created from now on track which
    /// slots are allocated, so this must happen before the kind owns blocks.
    pub fn set_disclaim(
        &mut self,
        id: KindId,
        disclaim: Arc<dyn Disclaimable>,
        mark_unconditionally: bool,
    ) -> Result<(), AllocError> {
        let kind = self.get_mut(id).ok_or(AllocError::BadRequest)?;
        if kind.block_count > 0 {
            return Err(AllocError::KindInUse);
        }
        kind.disclaim = Some(disclaim);
        kind.mark_unconditionally = mark_unconditionally;
        Ok(())
    }

    pub fn get(&self, id: KindId) -> Option<&ObjectKind> {
        self.kinds.get(id.index())
    }

    pub fn get_mut(&mut self, id: KindId) -> Option<&mut ObjectKind> {
        self.kinds.get_mut(id.index())
    }

    pub fn find(&self, name: &str) -> Option<KindId> {
        self.kinds
            .iter()
            .position(|kind| kind.props.name == name)
            .map(|index| KindId(index as u8))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = KindId> {
        (0..self.kinds.len()).map(|index| KindId(index as u8))
    }

    pub fn clear_free_lists(&mut self) {
        for kind in self.kinds.iter_mut() {
            kind.clear_free_lists();
        }
    }

    pub fn clear_reclaim_lists(&mut self) {
        for kind in self.kinds.iter_mut() {
            kind.clear_reclaim_lists();
        }
    }

    /// Every object currently on any free list
    pub fn all_free_objects(&self) -> FnvHashSet<usize> {
        let mut free = FnvHashSet::default();
        for kind in self.kinds.iter() {
            for granules in 0..SIZE_CLASS_COUNT {
                free.extend(kind.free_objects(granules));
            }
        }
        free
    }
}

impl Default for KindTable {
    fn default() -> KindTable {
        KindTable::new()
    }
}
