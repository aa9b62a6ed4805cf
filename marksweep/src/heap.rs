use fnv::FnvHashMap;

use crate::blockmeta::BlockHeader;
use crate::constants::{BLOCK_PTR_MASK, BLOCK_SIZE, WORD};

/// Index of a block header in the block table
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

impl BlockId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The heap as an arena of blocks indexed by address. Pointer validation is
/// a range check followed by a hash lookup of the enclosing block base, never
/// arithmetic on typed pointers.
pub struct BlockTable {
    headers: Vec<Option<BlockHeader>>,
    vacant: Vec<usize>,
    index: FnvHashMap<usize, BlockId>,
    least_plausible: usize,
    greatest_plausible: usize,
    heap_bytes: usize,
}

impl BlockTable {
    pub fn new() -> BlockTable {
        BlockTable {
            headers: Vec::new(),
            vacant: Vec::new(),
            index: FnvHashMap::default(),
            least_plausible: usize::MAX,
            greatest_plausible: 0,
            heap_bytes: 0,
        }
    }

    /// Register a block. Every block-sized chunk of a multi-block run is
    /// indexed so interior addresses of large objects resolve.
    pub fn insert(&mut self, header: BlockHeader) -> BlockId {
        let base = header.base();
        let span = header.span();

        let id = match self.vacant.pop() {
            Some(index) => {
                self.headers[index] = Some(header);
                BlockId(index)
            }
            None => {
                self.headers.push(Some(header));
                BlockId(self.headers.len() - 1)
            }
        };

        for chunk in (base..base + span).step_by(BLOCK_SIZE) {
            self.index.insert(chunk, id);
        }

        self.least_plausible = self.least_plausible.min(base);
        self.greatest_plausible = self.greatest_plausible.max(base + span);
        self.heap_bytes += span;

        id
    }

    /// Unregister a block, handing back its header. The plausible address
    /// bounds are not narrowed.
    pub fn remove(&mut self, id: BlockId) -> Option<BlockHeader> {
        let header = self.headers.get_mut(id.0)?.take()?;

        let base = header.base();
        for chunk in (base..base + header.span()).step_by(BLOCK_SIZE) {
            self.index.remove(&chunk);
        }

        self.vacant.push(id.0);
        self.heap_bytes -= header.span();
        Some(header)
    }

    pub fn get(&self, id: BlockId) -> Option<&BlockHeader> {
        self.headers.get(id.0).and_then(|slot| slot.as_ref())
    }

    /// Find the block containing `addr`
    pub fn lookup(&self, addr: usize) -> Option<(BlockId, &BlockHeader)> {
        if addr < self.least_plausible || addr >= self.greatest_plausible {
            return None;
        }
        let id = *self.index.get(&(addr & BLOCK_PTR_MASK))?;
        self.get(id).map(|header| (id, header))
    }

    /// Resolve a candidate pointer to the block and base of the object it
    /// points into
    pub fn find_object(&self, addr: usize, interior: bool) -> Option<(BlockId, &BlockHeader, usize)> {
        let (id, header) = self.lookup(addr)?;
        let base = header.object_base(addr, interior)?;
        Some((id, header, base))
    }

    /// True if `[start, start + len)` is word aligned and lies inside the
    /// objects of a single block
    pub fn contains_range(&self, start: usize, len: usize) -> bool {
        if start % WORD != 0 || len == 0 {
            return false;
        }
        match self.lookup(start) {
            Some((_, header)) => start.checked_add(len).map_or(false, |end| end <= header.limit()),
            None => false,
        }
    }

    /// The first occupied block at or after `cursor`, for walks that are
    /// spread across several calls
    pub fn next_from(&self, cursor: usize) -> Option<BlockId> {
        (cursor..self.headers.len())
            .find(|index| self.headers[*index].is_some())
            .map(BlockId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BlockHeader)> {
        self.headers
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|header| (BlockId(index), header)))
    }

    pub fn ids(&self) -> Vec<BlockId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Take every header out of the table
    pub fn drain(&mut self) -> Vec<BlockHeader> {
        self.index.clear();
        self.vacant.clear();
        self.heap_bytes = 0;
        self.headers.drain(..).flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.headers.len() - self.vacant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes
    }

    /// Bounds outside of which no word can be a heap pointer
    pub fn bounds(&self) -> (usize, usize) {
        (self.least_plausible, self.greatest_plausible)
    }
}

impl Default for BlockTable {
    fn default() -> BlockTable {
        BlockTable::new()
    }
}
