//! Parallel marking.
//!
//! The coordinator publishes the contents of its mark stack as a `MarkJob`
//! and then marks alongside any helper threads that join. Every marker
//! works on a private local stack:
//!
//! * entries are **stolen** from the shared job one compare-and-swap of the
//!   shared cursor at a time, so no entry is ever claimed twice
//! * a local stack that grows past half its capacity **returns** all of
//!   its entries to the shared job; one that has work while others sit idle
//!   and the shared job is empty returns its bottom half
//! * a marker with no local work and nothing to steal goes idle; the last
//!   one to go idle while the shared job is empty ends the phase
//!
//! The shared job's slots are only ever appended to. A return writes slots
//! above `top` under the mark lock and then publishes them with a Release
//! store of `top`; a stealer's Acquire load of `top` makes those slot writes
//! visible before it claims one.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::constants::{ENTRIES_TO_GET, LOCAL_MARK_STACK_SIZE, MARK_CREDIT_BYTES};
use crate::descriptor::Descriptor;
use crate::mark::Marker;
use crate::markstack::{MarkEntry, MarkStack};

struct Slot {
    start: AtomicUsize,
    descr: AtomicUsize,
}

/// The shared stack of one parallel phase
pub struct MarkJob {
    slots: Box<[Slot]>,
    top: AtomicUsize,
    first_nonempty: AtomicUsize,
    overflowed: AtomicBool,
}

impl MarkJob {
    fn new(capacity: usize, entries: &[MarkEntry]) -> MarkJob {
        let capacity = capacity.max(entries.len());
        let slots: Box<[Slot]> = (0..capacity)
            .map(|_| Slot {
                start: AtomicUsize::new(0),
                descr: AtomicUsize::new(0),
            })
            .collect();

        for (slot, entry) in slots.iter().zip(entries) {
            slot.start.store(entry.start, Ordering::Relaxed);
            slot.descr.store(entry.descr.encode(), Ordering::Relaxed);
        }

        MarkJob {
            slots,
            top: AtomicUsize::new(entries.len()),
            first_nonempty: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
        }
    }

    /// True if every published entry has been claimed
    pub fn is_empty(&self) -> bool {
        self.first_nonempty.load(Ordering::Acquire) >= self.top.load(Ordering::Acquire)
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    fn set_overflowed(&self) {
        self.overflowed.store(true, Ordering::Release);
    }

    /// Claim a batch of entries onto `local`, returning how many were taken.
    /// Long ranges count for more than one entry.
    fn steal(&self, local: &mut MarkStack) -> usize {
        let available = self
            .top
            .load(Ordering::Acquire)
            .saturating_sub(self.first_nonempty.load(Ordering::Acquire));
        let batch = if available < 2 * ENTRIES_TO_GET {
            1
        } else {
            ENTRIES_TO_GET
        };

        let mut taken = 0;
        let mut weight = 0;
        while weight < batch {
            let top = self.top.load(Ordering::Acquire);
            let cursor = self.first_nonempty.load(Ordering::Acquire);
            if cursor >= top {
                break;
            }
            if self
                .first_nonempty
                .compare_exchange(cursor, cursor + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let slot = &self.slots[cursor];
            let start = slot.start.load(Ordering::Relaxed);
            if let Some(descr) = Descriptor::decode(slot.descr.load(Ordering::Relaxed)) {
                weight += match descr {
                    Descriptor::Length(len) => 1 + (len >> 8),
                    _ => 1,
                };
                local.push(MarkEntry::new(start, descr));
            } else {
                weight += 1;
            }
            taken += 1;
        }
        taken
    }
}

struct MarkLock {
    help_wanted: bool,
    mark_no: u64,
    shutdown: bool,
    job: Option<Arc<MarkJob>>,
}

/// Coordination between the collecting thread and the marker helpers
pub struct ParallelMark {
    lock: Mutex<MarkLock>,
    cond: Condvar,
    /// Markers taking part in the current phase, coordinator included
    helper_count: AtomicUsize,
    /// Markers that currently hold, or are looking for, work
    active_count: AtomicUsize,
    markers: usize,
}

impl ParallelMark {
    pub fn new(markers: usize) -> ParallelMark {
        ParallelMark {
            lock: Mutex::new(MarkLock {
                help_wanted: false,
                mark_no: 0,
                shutdown: false,
                job: None,
            }),
            cond: Condvar::new(),
            helper_count: AtomicUsize::new(0),
            active_count: AtomicUsize::new(0),
            markers,
        }
    }

    /// Markers including the coordinator
    pub fn markers(&self) -> usize {
        self.markers
    }

    /// Mark everything reachable from the entries on `stack`, with the help
    /// of whichever helpers join. Returns true if entries were lost to
    /// overflow, in which case the marks are incomplete.
    pub fn mark(&self, marker: &Marker, stack: &mut MarkStack) -> bool {
        let entries = stack.drain_all();
        let job = Arc::new(MarkJob::new(2 * stack.limit(), &entries));
        debug!("Starting parallel mark with {} entries", entries.len());

        {
            let mut lock = self.lock.lock();
            lock.job = Some(job.clone());
            lock.help_wanted = true;
            lock.mark_no += 1;
            self.helper_count.store(1, Ordering::SeqCst);
            self.active_count.store(1, Ordering::SeqCst);
            self.cond.notify_all();
        }

        self.mark_local(marker, &job);

        let mut lock = self.lock.lock();
        while self.helper_count.load(Ordering::SeqCst) != 0 {
            self.cond.wait(&mut lock);
        }
        lock.job = None;

        let overflowed = job.overflowed();
        if overflowed {
            debug!("Parallel mark overflowed");
        }
        overflowed
    }

    /// Block until there is a phase this helper hasn't joined yet, and join
    /// it. Returns `None` once the collector shuts down.
    pub fn wait_for_work(&self, last_helped: &mut u64) -> Option<Arc<MarkJob>> {
        let mut lock = self.lock.lock();
        loop {
            if lock.shutdown {
                return None;
            }
            if lock.help_wanted && lock.mark_no != *last_helped {
                if let Some(job) = lock.job.clone() {
                    *last_helped = lock.mark_no;
                    self.helper_count.fetch_add(1, Ordering::SeqCst);
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    return Some(job);
                }
            }
            self.cond.wait(&mut lock);
        }
    }

    /// Work on a joined phase until it is complete
    pub fn help(&self, marker: &Marker, job: &MarkJob) {
        self.mark_local(marker, job);
    }

    pub fn shutdown(&self) {
        let mut lock = self.lock.lock();
        lock.shutdown = true;
        self.cond.notify_all();
    }

    fn mark_local(&self, marker: &Marker, job: &MarkJob) {
        let mut local = MarkStack::new(LOCAL_MARK_STACK_SIZE);

        'work: loop {
            if !local.is_empty() {
                self.do_local_mark(marker, &mut local, job);
                continue;
            }
            if job.steal(&mut local) > 0 {
                continue;
            }

            let mut lock = self.lock.lock();
            if !job.is_empty() {
                continue;
            }

            if self.active_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                // last one out with nothing left to claim
                lock.help_wanted = false;
                self.cond.notify_all();
                break 'work;
            }

            loop {
                self.cond.wait(&mut lock);
                if !lock.help_wanted {
                    break 'work;
                }
                if !job.is_empty() {
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    break;
                }
            }
        }

        let _lock = self.lock.lock();
        self.helper_count.fetch_sub(1, Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn do_local_mark(&self, marker: &Marker, local: &mut MarkStack, job: &MarkJob) {
        loop {
            marker.mark_from(local, MARK_CREDIT_BYTES);
            if local.take_overflow() {
                job.set_overflowed();
            }
            if local.is_empty() {
                return;
            }

            if local.len() >= local.limit() / 2 {
                self.return_entries(job, local.drain_all());
                return;
            }

            let idle = self.active_count.load(Ordering::Relaxed) < self.helper_count.load(Ordering::Relaxed);
            if idle && local.len() > 1 && job.is_empty() {
                let half = local.len() / 2;
                self.return_entries(job, local.drain_bottom(half));
            }
        }
    }

    /// Append entries to the shared job. If they don't fit they are dropped
    /// and the phase is flagged as overflowed.
    fn return_entries(&self, job: &MarkJob, entries: Vec<MarkEntry>) {
        let _lock = self.lock.lock();

        let top = job.top.load(Ordering::Relaxed);
        if top + entries.len() > job.slots.len() {
            trace!("No room to return {} mark entries", entries.len());
            job.set_overflowed();
            return;
        }

        for (slot, entry) in job.slots[top..].iter().zip(entries.iter()) {
            slot.start.store(entry.start, Ordering::Relaxed);
            slot.descr.store(entry.descr.encode(), Ordering::Relaxed);
        }
        job.top.store(top + entries.len(), Ordering::Release);
        self.cond.notify_all();
    }
}
