//! The sweep: turning the marks of a completed cycle back into free memory.
//!
//! Whole blocks with nothing marked go back to the page allocator. Blocks
//! with a few survivors are queued per kind and size class and have their
//! free lists rebuilt lazily, when allocation runs dry. Blocks that are
//! nearly full are left alone until the next cycle.
use blockalloc::PageAllocator;
use fnv::FnvHashSet;
use log::{debug, trace};

use crate::blockmeta::BlockFlags;
use crate::constants::GRANULE_BYTES;
use crate::disclaim::Disposition;
use crate::heap::{BlockId, BlockTable};
use crate::kind::{KindId, KindTable};
use crate::rawptr::RawPtr;

/// An unreachable object found by a reporting sweep
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LeakReport {
    pub address: usize,
    pub size: usize,
    pub kind: KindId,
}

/// What a sweep did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SweepReport {
    /// A mark cycle was in progress, so nothing was swept
    pub deferred: bool,
    pub blocks_released: usize,
    pub objects_reclaimed: usize,
    pub bytes_reclaimed: usize,
    /// Blocks queued for lazy free list rebuilding
    pub blocks_queued: usize,
    /// Disclaim callback invocations
    pub disclaimed: usize,
    /// Objects a disclaim callback chose to keep
    pub resurrected: usize,
    pub leaks: Vec<LeakReport>,
}

pub struct Sweeper<'a> {
    pub blocks: &'a mut BlockTable,
    pub kinds: &'a mut KindTable,
    pub pages: &'a dyn PageAllocator,
    pub nearly_full_fraction: f64,
    pub release_empty_blocks: bool,
    pub gc_no: u64,
}

impl<'a> Sweeper<'a> {
    /// Sweep every block. A reporting sweep changes nothing and lists the
    /// unmarked objects that are not on a free list.
    pub fn sweep(mut self, report_only: bool) -> SweepReport {
        let mut report = SweepReport::default();
        let free = self.kinds.all_free_objects();

        if !report_only {
            self.kinds.clear_free_lists();
            self.kinds.clear_reclaim_lists();
        }

        for id in self.blocks.ids() {
            let (flags, large) = match self.blocks.get(id) {
                Some(header) => (header.flags(), header.is_large()),
                None => continue,
            };

            if flags.contains(BlockFlags::FRESH) {
                trace!("Deferring block {} acquired during marking", id.index());
                continue;
            }

            if report_only {
                self.report_block(id, &free, &mut report);
            } else if large {
                self.sweep_large(id, &mut report);
            } else {
                self.sweep_small(id, &free, &mut report);
            }
        }

        debug!(
            "Swept: {} blocks released, {} queued, {} objects reclaimed, {} disclaimed, {} resurrected",
            report.blocks_released,
            report.blocks_queued,
            report.objects_reclaimed,
            report.disclaimed,
            report.resurrected
        );
        report
    }

    fn report_block(&self, id: BlockId, free: &FnvHashSet<usize>, report: &mut SweepReport) {
        let header = match self.blocks.get(id) {
            Some(header) => header,
            None => return,
        };

        for slot in 0..header.objects() {
            let address = header.object_at(slot);
            if !header.is_marked(slot) && header.is_allocated(slot) && !free.contains(&address) {
                report.leaks.push(LeakReport {
                    address,
                    size: header.object_size(),
                    kind: header.kind(),
                });
            }
        }
    }

    fn sweep_large(&mut self, id: BlockId, report: &mut SweepReport) {
        let release = match self.blocks.get(id) {
            Some(header) => {
                if header.is_marked(0) {
                    header.set_last_reclaimed(self.gc_no);
                    false
                } else if !header.is_allocated(0) {
                    true
                } else {
                    let disclaim = self.kinds.get(header.kind()).and_then(|kind| kind.disclaim());
                    let keep = match (disclaim, RawPtr::new(header.base())) {
                        (Some(disclaim), Some(object)) => {
                            report.disclaimed += 1;
                            disclaim.disclaim(object) == Disposition::Keep
                        }
                        _ => false,
                    };

                    if keep {
                        header.mark(0);
                        header.set_last_reclaimed(self.gc_no);
                        report.resurrected += 1;
                    } else {
                        report.objects_reclaimed += 1;
                        report.bytes_reclaimed += header.object_size();
                    }
                    !keep
                }
            }
            None => false,
        };

        if release {
            self.release(id, report);
        }
    }

    fn sweep_small(&mut self, id: BlockId, free: &FnvHashSet<usize>, report: &mut SweepReport) {
        let header = match self.blocks.get(id) {
            Some(header) => header,
            None => return,
        };
        let capacity = header.objects();
        let granules = header.object_size() / GRANULE_BYTES;
        let kind_id = header.kind();
        let disclaim = if header.tracks_allocation() {
            self.kinds.get(kind_id).and_then(|kind| kind.disclaim()).cloned()
        } else {
            None
        };

        // judged on reachability, before any callback keeps an object
        let nearly_full = header.marked_count() as f64 > self.nearly_full_fraction * capacity as f64;

        let mut released = Vec::new();
        if let Some(disclaim) = disclaim {
            for slot in 0..capacity {
                if header.is_marked(slot) || !header.is_allocated(slot) {
                    continue;
                }
                if let Some(object) = RawPtr::new(header.object_at(slot)) {
                    report.disclaimed += 1;
                    if disclaim.disclaim(object) == Disposition::Keep {
                        header.mark(slot);
                        report.resurrected += 1;
                    } else {
                        released.push(slot);
                    }
                }
            }
        }

        if nearly_full {
            // The block is left alone apart from objects a callback released,
            // which go straight to the free list so they are not offered again
            if let Some(kind) = self.kinds.get_mut(kind_id) {
                for slot in released.iter().rev() {
                    header.set_allocated(*slot, false);
                    kind.push_free(granules, header.object_at(*slot));
                }
                report.objects_reclaimed += released.len();
                report.bytes_reclaimed += released.len() * header.object_size();
            }
            header.set_last_reclaimed(self.gc_no);
            return;
        }

        // everything unmarked here is freed now or by lazy reclaim
        let dead = (0..capacity)
            .filter(|slot| {
                !header.is_marked(*slot)
                    && header.is_allocated(*slot)
                    && !free.contains(&header.object_at(*slot))
            })
            .count();
        report.objects_reclaimed += dead;
        report.bytes_reclaimed += dead * header.object_size();

        if header.marked_count() == 0 && self.release_empty_blocks {
            self.release(id, report);
        } else if let Some(kind) = self.kinds.get_mut(kind_id) {
            kind.queue_reclaim(granules, id);
            report.blocks_queued += 1;
        }
    }

    fn release(&mut self, id: BlockId, report: &mut SweepReport) {
        if let Some(header) = self.blocks.remove(id) {
            if let Some(kind) = self.kinds.get_mut(header.kind()) {
                kind.block_removed();
            }
            self.pages.release_block(header.into_block());
            report.blocks_released += 1;
        }
    }
}

/// Rebuild the free list entries of one queued block: every unmarked slot
/// is linked in, lowest address first. Returns the number of slots freed.
pub fn reclaim_block(blocks: &BlockTable, kinds: &mut KindTable, id: BlockId, gc_no: u64) -> usize {
    let header = match blocks.get(id) {
        Some(header) => header,
        None => return 0,
    };
    let kind = match kinds.get_mut(header.kind()) {
        Some(kind) => kind,
        None => return 0,
    };

    let granules = header.object_size() / GRANULE_BYTES;
    let mut freed = 0;
    for slot in (0..header.objects()).rev() {
        if header.is_marked(slot) {
            continue;
        }
        header.set_allocated(slot, false);
        kind.push_free(granules, header.object_at(slot));
        freed += 1;
    }

    header.set_last_reclaimed(gc_no);
    freed
}
