//! The collector: allocation, explicit free, and the mark/sweep cycle
//! driven over shared heap state.
//!
//! Lock order is the allocator state lock, then the block table, then the
//! parallel mark lock. The block table and the scan procedure table are
//! only ever written with the state lock held, so marker helper threads
//! that read them while the collecting thread holds the state lock never
//! contend with a writer.
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use blockalloc::{PageAllocator, SystemPages};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::allocator::{AllocError, AllocRaw, SizeClass};
use crate::blockmeta::{BlockFlags, BlockHeader};
use crate::config::GcConfig;
use crate::constants::{BLOCK_SIZE, GRANULE_BYTES, MAX_SCAN_PROCS, SIZE_CLASS_COUNT, WORD};
use crate::descriptor::ProcId;
use crate::disclaim::{Disclaimable, FinalizedDisclaim, FinalizerTable};
use crate::heap::{BlockId, BlockTable};
use crate::kind::{KindId, KindProperties, KindTable};
use crate::mark::{Marker, Scannable};
use crate::markstack::MarkStack;
use crate::parallel::ParallelMark;
use crate::rawptr::{load_word, store_word, RawPtr};
use crate::reclaim::{reclaim_block, SweepReport, Sweeper};
use crate::roots::{AllDirty, DirtyOracle, RootSource};
use crate::state::{MarkPhase, MarkState, SliceContext};

/// A reachable object, as seen by `Collector::enumerate_reachable`
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ObjectInfo {
    pub address: RawPtr,
    pub size: usize,
    pub kind: KindId,
}

/// A snapshot of collector counters
#[derive(Clone, Debug, PartialEq)]
pub struct GcStats {
    /// Completed mark cycles
    pub collections: u64,
    /// Sweeps that reclaimed memory
    pub sweeps: u64,
    pub blocks: usize,
    pub heap_bytes: usize,
    /// Bytes handed out since the last sweep
    pub bytes_allocated: usize,
    pub marked: usize,
    pub mark_stack_size: usize,
    pub state: MarkState,
}

/// Everything guarded by the allocator lock
struct GcState {
    kinds: KindTable,
    phase: MarkPhase,
    stack: MarkStack,
    /// Number of real sweeps so far; blocks record the sweep that last
    /// rebuilt their free slots
    gc_no: u64,
    collections: u64,
    bytes_allocd: usize,
    /// Marks reflect a completed cycle
    marks_valid: bool,
    /// Those marks have already been swept
    swept: bool,
    finalized_kind: Option<KindId>,
}

impl GcState {
    fn new(config: &GcConfig) -> GcState {
        GcState {
            kinds: KindTable::new(),
            phase: MarkPhase::new(),
            stack: MarkStack::new(config.initial_mark_stack_size),
            gc_no: 0,
            collections: 0,
            bytes_allocd: 0,
            marks_valid: false,
            swept: false,
            finalized_kind: None,
        }
    }

    /// New objects are born marked while marking runs, and while the marks
    /// of a finished cycle are still waiting to be swept
    fn allocates_black(&self) -> bool {
        !self.phase.is_idle() || (self.marks_valid && !self.swept)
    }
}

/// State shared between the collector handle and its marker threads
struct CollectorShared {
    config: GcConfig,
    state: Mutex<GcState>,
    blocks: RwLock<BlockTable>,
    procs: RwLock<Vec<Arc<dyn Scannable>>>,
    roots: RwLock<Vec<Arc<dyn RootSource>>>,
    pages: Box<dyn PageAllocator>,
    dirty: Box<dyn DirtyOracle>,
    parallel: Option<ParallelMark>,
    finalizers: Arc<Mutex<FinalizerTable>>,
}

/// A conservative mark-sweep collector over blocks from a page allocator.
///
/// Every operation takes `&self`; a `Collector` can be shared between
/// threads behind an `Arc`.
pub struct Collector {
    inner: Arc<CollectorShared>,
    helpers: Vec<JoinHandle<()>>,
}

impl Collector {
    /// A collector over system memory that treats every block as dirty
    pub fn new(config: GcConfig) -> Collector {
        Collector::with_pages(config, Box::new(SystemPages::new()), Box::new(AllDirty))
    }

    /// A collector over the given page source and dirty block oracle
    pub fn with_pages(
        config: GcConfig,
        pages: Box<dyn PageAllocator>,
        dirty: Box<dyn DirtyOracle>,
    ) -> Collector {
        let config = config.normalized();
        let parallel = if config.markers > 1 {
            Some(ParallelMark::new(config.markers))
        } else {
            None
        };

        let inner = Arc::new(CollectorShared {
            state: Mutex::new(GcState::new(&config)),
            blocks: RwLock::new(BlockTable::new()),
            procs: RwLock::new(Vec::new()),
            roots: RwLock::new(Vec::new()),
            pages,
            dirty,
            parallel,
            finalizers: Arc::new(Mutex::new(FinalizerTable::new())),
            config,
        });

        let mut helpers = Vec::new();
        for index in 1..inner.config.markers {
            let shared = inner.clone();
            let spawned = thread::Builder::new()
                .name(format!("marksweep-marker-{}", index))
                .spawn(move || shared.helper_loop());
            match spawned {
                Ok(handle) => helpers.push(handle),
                Err(e) => warn!("Could not start marker thread {}: {}", index, e),
            }
        }

        info!(
            "Collector started: {} markers, incremental {}, find_leak {}",
            inner.config.markers, inner.config.incremental, inner.config.find_leak
        );
        Collector { inner, helpers }
    }

    pub fn config(&self) -> &GcConfig {
        &self.inner.config
    }

    /// Register an object kind, or look up an identical existing one
    pub fn register_kind(&self, props: KindProperties) -> Result<KindId, AllocError> {
        self.inner.state.lock().kinds.register(props)
    }

    pub fn find_kind(&self, name: &str) -> Option<KindId> {
        self.inner.state.lock().kinds.find(name)
    }

    /// Attach a disclaim callback to a kind that has no blocks yet. With
    /// `mark_unconditionally` the allocated objects of the kind are traced
    /// every cycle, so whatever they reference outlives them by a cycle.
    pub fn register_disclaim_callback(
        &self,
        kind: KindId,
        disclaim: Arc<dyn Disclaimable>,
        mark_unconditionally: bool,
    ) -> Result<(), AllocError> {
        self.inner
            .state
            .lock()
            .kinds
            .set_disclaim(kind, disclaim, mark_unconditionally)
    }

    /// Register a scan procedure for use in `Descriptor::Proc` descriptors
    pub fn register_scan_proc(&self, proc: Arc<dyn Scannable>) -> Result<ProcId, AllocError> {
        let _state = self.inner.state.lock();
        let mut procs = self.inner.procs.write();
        if procs.len() >= MAX_SCAN_PROCS {
            return Err(AllocError::BadRequest);
        }
        procs.push(proc);
        Ok(ProcId((procs.len() - 1) as u8))
    }

    pub fn add_roots(&self, source: Arc<dyn RootSource>) {
        let _state = self.inner.state.lock();
        self.inner.roots.write().push(source);
    }

    /// Allocate `bytes` bytes of the given kind. The memory is zeroed unless
    /// the kind skips clearing on free. Falls back to one full collection
    /// when the page allocator is exhausted.
    pub fn allocate(&self, kind: KindId, bytes: usize) -> Result<RawPtr, AllocError> {
        let class = SizeClass::get_for_size(bytes)?;

        let mut state = self.inner.state.lock();
        if state.kinds.get(kind).is_none() {
            return Err(AllocError::BadRequest);
        }

        let (result, report) = self.inner.allocate_or_collect(&mut state, kind, class);
        drop(state);

        if let Some(report) = report {
            self.inner.report_leaks(&report);
        }
        result
    }

    /// Take an object from the kind's free lists or queued blocks only,
    /// without growing the heap
    pub fn allocate_from_kind(&self, kind: KindId, class: SizeClass) -> Option<RawPtr> {
        let granules = match class {
            SizeClass::Small(granules) => granules,
            SizeClass::Large(_) => return None,
        };
        let mut state = self.inner.state.lock();
        let addr = self.inner.take_small(&mut state, kind, granules)?;
        self.inner.note_allocated(&mut state, addr, class.bytes());
        RawPtr::new(addr)
    }

    /// Allocate an object whose `finalizer` runs once, when it is found
    /// unreachable. The object is traced every cycle, so what it references
    /// stays alive until the cycle after the object itself is reclaimed.
    ///
    /// The finalizer runs with the allocator lock held and must not call
    /// back into the collector.
    pub fn allocate_finalized<F>(&self, bytes: usize, finalizer: F) -> Result<RawPtr, AllocError>
    where
        F: FnOnce(RawPtr) + Send + 'static,
    {
        let total = bytes.checked_add(WORD).ok_or(AllocError::BadRequest)?;
        let class = SizeClass::get_for_size(total)?;

        let mut state = self.inner.state.lock();
        let kind = self.inner.finalized_kind(&mut state)?;
        let (result, report) = self.inner.allocate_or_collect(&mut state, kind, class);

        let result = result.map(|object| {
            let tagged = self.inner.finalizers.lock().insert(Box::new(finalizer));
            // SAFETY: the object was just allocated and is at least two words long
            unsafe { object.store(0, tagged) };
            object.offset_words(1)
        });
        drop(state);

        if let Some(report) = report {
            self.inner.report_leaks(&report);
        }
        result
    }

    /// Give an object back. The address must be the one `allocate` returned.
    pub fn free(&self, object: RawPtr) -> Result<(), AllocError> {
        let mut state = self.inner.state.lock();
        self.inner.free_locked(&mut state, object)
    }

    /// Start a mark cycle. Returns false if one is already running; a cycle
    /// left `Invalid` by `abandon_cycle` is resumed instead.
    pub fn begin_cycle(&self) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.begin_cycle_locked(&mut state)
    }

    /// Do one bounded slice of marking, returning true once marking is
    /// complete. With no cycle running this does nothing and returns true.
    pub fn advance_one_slice(&self) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.advance_locked(&mut state)
    }

    /// Give up on the marks of the running cycle. The next slice rescans
    /// from the marks already set.
    pub fn abandon_cycle(&self) {
        let mut state = self.inner.state.lock();
        if !state.phase.is_idle() {
            debug!("Abandoning mark cycle in state {}", state.phase.state());
        }
        state.phase.invalidate();
        state.stack.clear();
    }

    /// Run a complete cycle and sweep. In leak finding mode nothing is
    /// reclaimed and the report lists the unreachable objects.
    pub fn collect(&self) -> SweepReport {
        let report = {
            let mut state = self.inner.state.lock();
            self.inner.collect_locked(&mut state)
        };
        self.inner.report_leaks(&report);
        report
    }

    /// Sweep the marks of the last completed cycle. Deferred, changing
    /// nothing, while a cycle runs or when there is nothing new to sweep.
    pub fn sweep(&self, report_only: bool) -> SweepReport {
        let report = {
            let mut state = self.inner.state.lock();
            self.inner.sweep_locked(&mut state, report_only)
        };
        self.inner.report_leaks(&report);
        report
    }

    /// Rebuild the free lists of every queued block now rather than on
    /// demand
    pub fn reclaim_all(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.reclaim_all_locked(&mut state)
    }

    /// Call `f` with every marked object. Returns false, without calling
    /// `f`, unless the marks of a completed cycle are available.
    pub fn enumerate_reachable<F>(&self, mut f: F) -> bool
    where
        F: FnMut(ObjectInfo),
    {
        let objects = {
            let state = self.inner.state.lock();
            if !state.phase.is_idle() || !state.marks_valid {
                return false;
            }

            let blocks = self.inner.blocks.read();
            let mut objects = Vec::new();
            for (_, header) in blocks.iter() {
                for slot in header.marked_slots() {
                    if let Some(address) = RawPtr::new(header.object_at(slot)) {
                        objects.push(ObjectInfo {
                            address,
                            size: header.object_size(),
                            kind: header.kind(),
                        });
                    }
                }
            }
            objects
        };

        for object in objects {
            f(object);
        }
        true
    }

    /// Whether the object `object` points to, or into when interior
    /// pointers are on, is marked
    pub fn is_marked(&self, object: RawPtr) -> bool {
        let blocks = self.inner.blocks.read();
        match blocks.find_object(object.as_word(), self.inner.config.interior_pointers) {
            Some((_, header, base)) => header.slot_of(base).map_or(false, |slot| header.is_marked(slot)),
            None => false,
        }
    }

    pub fn mark_state(&self) -> MarkState {
        self.inner.state.lock().phase.state()
    }

    pub fn stats(&self) -> GcStats {
        let state = self.inner.state.lock();
        let blocks = self.inner.blocks.read();
        GcStats {
            collections: state.collections,
            sweeps: state.gc_no,
            blocks: blocks.len(),
            heap_bytes: blocks.heap_bytes(),
            bytes_allocated: state.bytes_allocd,
            marked: blocks.iter().map(|(_, header)| header.marked_count()).sum(),
            mark_stack_size: state.stack.limit(),
            state: state.phase.state(),
        }
    }

    /// Number of objects on the free lists of a kind
    pub fn free_list_len(&self, kind: KindId) -> usize {
        let state = self.inner.state.lock();
        state.kinds.get(kind).map_or(0, |kind| {
            (0..SIZE_CLASS_COUNT)
                .map(|granules| kind.free_objects(granules).len())
                .sum()
        })
    }

    /// The objects on the free lists of a kind
    pub fn free_objects(&self, kind: KindId) -> Vec<RawPtr> {
        let state = self.inner.state.lock();
        match state.kinds.get(kind) {
            Some(kind) => (0..SIZE_CLASS_COUNT)
                .flat_map(|granules| kind.free_objects(granules))
                .filter_map(RawPtr::new)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Size in bytes of the object `object` refers to
    pub fn object_size(&self, object: RawPtr) -> Option<usize> {
        let blocks = self.inner.blocks.read();
        blocks
            .find_object(object.as_word(), self.inner.config.interior_pointers)
            .map(|(_, header, _)| header.object_size())
    }

    /// Read word `index` of an object, checked against the object's bounds
    pub fn load(&self, object: RawPtr, index: usize) -> Result<usize, AllocError> {
        let blocks = self.inner.blocks.read();
        let addr = checked_field(&blocks, object, index, self.inner.config.interior_pointers)?;
        // SAFETY: addr is a word inside a live object, and the read lock
        // keeps the block from being released
        Ok(unsafe { load_word(addr) })
    }

    /// Write word `index` of an object, checked against the object's bounds.
    ///
    /// While a cycle is running the stored word is marked and queued for
    /// scanning, so moving a pointer into an object the marker has already
    /// scanned can't hide its target.
    pub fn store(&self, object: RawPtr, index: usize, value: usize) -> Result<(), AllocError> {
        let mut state = self.inner.state.lock();
        let blocks = self.inner.blocks.read();
        let addr = checked_field(&blocks, object, index, self.inner.config.interior_pointers)?;
        // SAFETY: as for load
        unsafe { store_word(addr, value) };

        if !state.phase.is_idle() {
            let procs = self.inner.procs.read();
            let marker = Marker::new(
                &blocks,
                &procs,
                self.inner.config.interior_pointers,
                self.inner.parallel.is_some(),
            );
            if marker.mark_word(value, &mut state.stack) {
                trace!("Store barrier marked {:#x}", value);
            }
        }
        Ok(())
    }
}

fn checked_field(
    blocks: &BlockTable,
    object: RawPtr,
    index: usize,
    interior: bool,
) -> Result<usize, AllocError> {
    let (_, header, base) = blocks
        .find_object(object.as_word(), interior)
        .ok_or(AllocError::BadRequest)?;
    let addr = index
        .checked_mul(WORD)
        .and_then(|offset| object.as_word().checked_add(offset))
        .ok_or(AllocError::BadRequest)?;
    if addr % WORD != 0 || addr >= base + header.object_size() {
        return Err(AllocError::BadRequest);
    }
    Ok(addr)
}

impl AllocRaw for Collector {
    fn alloc(&self, kind: KindId, bytes: usize) -> Result<RawPtr, AllocError> {
        self.allocate(kind, bytes)
    }

    fn free(&self, object: RawPtr) -> Result<(), AllocError> {
        Collector::free(self, object)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Some(parallel) = &self.inner.parallel {
            parallel.shutdown();
        }
        for handle in self.helpers.drain(..) {
            if handle.join().is_err() {
                error!("Marker thread panicked");
            }
        }
    }
}

impl CollectorShared {
    fn helper_loop(&self) {
        let parallel = match &self.parallel {
            Some(parallel) => parallel,
            None => return,
        };

        let mut last_helped = 0;
        while let Some(job) = parallel.wait_for_work(&mut last_helped) {
            let blocks = self.blocks.read_recursive();
            let procs = self.procs.read_recursive();
            let marker = Marker::new(&blocks, &procs, self.config.interior_pointers, true);
            parallel.help(&marker, &job);
        }
        trace!("Marker thread exiting");
    }

    fn allocate_or_collect(
        &self,
        state: &mut GcState,
        kind: KindId,
        class: SizeClass,
    ) -> (Result<RawPtr, AllocError>, Option<SweepReport>) {
        match self.allocate_locked(state, kind, class) {
            Err(AllocError::OOM) => {
                debug!("Heap exhausted allocating {} bytes, collecting", class.bytes());
                let report = self.collect_locked(state);
                (self.allocate_locked(state, kind, class), Some(report))
            }
            result => (result, None),
        }
    }

    fn allocate_locked(
        &self,
        state: &mut GcState,
        kind: KindId,
        class: SizeClass,
    ) -> Result<RawPtr, AllocError> {
        let addr = match class {
            SizeClass::Small(granules) => match self.take_small(state, kind, granules) {
                Some(addr) => addr,
                None => {
                    let id = self.add_block(state, kind, granules * GRANULE_BYTES, BLOCK_SIZE, false)?;
                    {
                        let blocks = self.blocks.read();
                        reclaim_block(&blocks, &mut state.kinds, id, state.gc_no);
                    }
                    self.take_small(state, kind, granules).ok_or(AllocError::OOM)?
                }
            },
            SizeClass::Large(bytes) => {
                let span = bytes
                    .max(BLOCK_SIZE)
                    .checked_next_power_of_two()
                    .ok_or(AllocError::BadRequest)?;
                let id = self.add_block(state, kind, bytes, span, true)?;
                let blocks = self.blocks.read();
                blocks.get(id).map(|header| header.base()).ok_or(AllocError::OOM)?
            }
        };

        self.note_allocated(state, addr, class.bytes());
        RawPtr::new(addr).ok_or(AllocError::OOM)
    }

    /// Pop from a free list, rebuilding queued blocks while the list is empty
    fn take_small(&self, state: &mut GcState, kind: KindId, granules: usize) -> Option<usize> {
        loop {
            if let Some(addr) = state.kinds.get_mut(kind)?.pop_free(granules) {
                return Some(addr);
            }
            let id = state.kinds.get_mut(kind)?.next_reclaim(granules)?;
            let blocks = self.blocks.read();
            reclaim_block(&blocks, &mut state.kinds, id, state.gc_no);
        }
    }

    fn add_block(
        &self,
        state: &mut GcState,
        kind: KindId,
        object_size: usize,
        span: usize,
        large: bool,
    ) -> Result<BlockId, AllocError> {
        if state.kinds.get(kind).is_none() {
            return Err(AllocError::BadRequest);
        }
        let block = self.pages.acquire_block(span)?;

        let marking = !state.phase.is_idle();
        let gc_no = state.gc_no;
        let kind_entry = state.kinds.get_mut(kind).ok_or(AllocError::BadRequest)?;

        let mut flags = kind_entry.block_flags();
        if large {
            flags |= BlockFlags::LARGE;
        }
        if marking {
            flags |= BlockFlags::FRESH;
        }
        let descr = kind_entry.descriptor_for(object_size);
        kind_entry.block_added();

        let header = BlockHeader::new(block, kind, object_size, descr, flags, gc_no);
        let id = self.blocks.write().insert(header);
        trace!(
            "Added block {} for kind {}: {} byte objects over {} bytes",
            id.index(),
            kind,
            object_size,
            span
        );
        Ok(id)
    }

    fn note_allocated(&self, state: &mut GcState, addr: usize, bytes: usize) {
        let black = state.allocates_black();
        let blocks = self.blocks.read();
        if let Some((_, header)) = blocks.lookup(addr) {
            if let Some(slot) = header.slot_of(addr) {
                header.set_allocated(slot, true);
                if black || header.flags().contains(BlockFlags::UNCOLLECTABLE) {
                    header.mark(slot);
                }
            }
        }
        state.bytes_allocd += bytes;
    }

    fn finalized_kind(&self, state: &mut GcState) -> Result<KindId, AllocError> {
        if let Some(kind) = state.finalized_kind {
            return Ok(kind);
        }

        let mut props = KindProperties::normal("finalized");
        props.header_word = true;
        let kind = state.kinds.register(props)?;
        state.kinds.set_disclaim(
            kind,
            Arc::new(FinalizedDisclaim::new(self.finalizers.clone())),
            true,
        )?;
        state.finalized_kind = Some(kind);
        Ok(kind)
    }

    fn free_locked(&self, state: &mut GcState, object: RawPtr) -> Result<(), AllocError> {
        let (id, base, large) = {
            let blocks = self.blocks.read();
            let (id, header, base) = blocks
                .find_object(object.as_word(), false)
                .ok_or(AllocError::BadRequest)?;
            let slot = header.slot_of(base).ok_or(AllocError::BadRequest)?;
            if header.tracks_allocation() && !header.is_allocated(slot) {
                warn!("Object at {:#x} freed twice", base);
                return Err(AllocError::BadRequest);
            }

            if Some(header.kind()) == state.finalized_kind {
                // SAFETY: base is an allocated object of a live block
                let tagged = unsafe { load_word(base) };
                drop(self.finalizers.lock().take(tagged));
            }

            header.unmark(slot);
            header.set_allocated(slot, false);

            if !header.is_large() && header.last_reclaimed() == state.gc_no {
                let granules = header.object_size() / GRANULE_BYTES;
                if let Some(kind) = state.kinds.get_mut(header.kind()) {
                    kind.push_free(granules, base);
                }
            }
            (id, base, header.is_large())
        };

        // a large block with a cycle running is left for the sweep
        if large && state.phase.is_idle() {
            let header = self.blocks.write().remove(id);
            if let Some(header) = header {
                if let Some(kind) = state.kinds.get_mut(header.kind()) {
                    kind.block_removed();
                }
                self.pages.release_block(header.into_block());
            }
        }
        trace!("Freed object at {:#x}", base);
        Ok(())
    }

    fn begin_cycle_locked(&self, state: &mut GcState) -> bool {
        match state.phase.state() {
            MarkState::Idle => {
                self.reclaim_all_locked(state);

                let blocks = self.blocks.read();
                for (_, header) in blocks.iter() {
                    if !header.flags().contains(BlockFlags::UNCOLLECTABLE) {
                        header.clear_marks();
                    }
                    header.remove_flags(BlockFlags::FRESH);
                }

                state.phase.start();
                state.stack.clear();
                state.marks_valid = false;
                state.swept = false;
                debug!("Starting mark cycle {} over {} blocks", state.collections + 1, blocks.len());
                true
            }
            MarkState::Invalid => {
                debug!("Resuming abandoned mark cycle");
                true
            }
            _ => false,
        }
    }

    fn advance_locked(&self, state: &mut GcState) -> bool {
        if state.phase.is_idle() {
            return true;
        }

        let blocks = self.blocks.read();
        let procs = self.procs.read();
        let roots = self.roots.read();
        let marker = Marker::new(
            &blocks,
            &procs,
            self.config.interior_pointers,
            self.parallel.is_some(),
        );
        let ctx = SliceContext {
            marker: &marker,
            roots: &roots,
            dirty: self.dirty.as_ref(),
            parallel: self.parallel.as_ref(),
            incremental: self.config.incremental,
            max_stack: self.config.max_mark_stack_size,
        };

        let done = state.phase.advance(&mut state.stack, &ctx);
        if done {
            state.marks_valid = true;
            state.swept = false;
            state.collections += 1;
            debug!("Mark cycle {} complete", state.collections);
        }
        done
    }

    fn collect_locked(&self, state: &mut GcState) -> SweepReport {
        self.begin_cycle_locked(state);
        while !self.advance_locked(state) {}
        self.sweep_locked(state, self.config.find_leak)
    }

    fn sweep_locked(&self, state: &mut GcState, report_only: bool) -> SweepReport {
        if !state.phase.is_idle() || !state.marks_valid || state.swept {
            debug!("Sweep deferred in state {}", state.phase.state());
            return SweepReport {
                deferred: true,
                ..SweepReport::default()
            };
        }

        let gc_no = if report_only { state.gc_no } else { state.gc_no + 1 };
        let report = {
            let mut blocks = self.blocks.write();
            Sweeper {
                blocks: &mut blocks,
                kinds: &mut state.kinds,
                pages: self.pages.as_ref(),
                nearly_full_fraction: self.config.nearly_full_fraction,
                release_empty_blocks: self.config.release_empty_blocks,
                gc_no,
            }
            .sweep(report_only)
        };

        if !report_only {
            state.gc_no = gc_no;
            state.swept = true;
            state.bytes_allocd = 0;
        }
        report
    }

    fn reclaim_all_locked(&self, state: &mut GcState) -> usize {
        let blocks = self.blocks.read();
        let kinds: Vec<KindId> = state.kinds.ids().collect();

        let mut freed = 0;
        for kind in kinds {
            for granules in 0..SIZE_CLASS_COUNT {
                loop {
                    let id = match state.kinds.get_mut(kind).and_then(|k| k.next_reclaim(granules)) {
                        Some(id) => id,
                        None => break,
                    };
                    freed += reclaim_block(&blocks, &mut state.kinds, id, state.gc_no);
                }
            }
        }
        if freed > 0 {
            trace!("Reclaimed {} objects from queued blocks", freed);
        }
        freed
    }

    fn report_leaks(&self, report: &SweepReport) {
        if report.leaks.is_empty() {
            return;
        }
        for leak in &report.leaks {
            warn!(
                "Leaked {} byte object of kind {} at {:#x}",
                leak.size, leak.kind, leak.address
            );
        }
        warn!("Found {} leaked objects", report.leaks.len());

        if self.config.abort_on_leak {
            error!("Aborting on leak");
            std::process::abort();
        }
    }
}

impl Drop for CollectorShared {
    fn drop(&mut self) {
        let headers = self.blocks.get_mut().drain();
        debug!("Releasing {} blocks", headers.len());
        for header in headers {
            self.pages.release_block(header.into_block());
        }
    }
}
