//! The incremental mark phase.
//!
//! A cycle is advanced one bounded slice at a time. Every slice either
//! pushes a little more of the root set (roots proper, plus the contents of
//! objects that must be treated as live), or drains part of the mark stack.
//! Mark stack overflow at any point makes the marks untrustworthy: the phase
//! goes `Invalid` and recovers by rescanning every marked object before it
//! accepts the roots again.
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::blockmeta::{BlockFlags, BlockHeader};
use crate::constants::MARK_CREDIT_BYTES;
use crate::mark::Marker;
use crate::markstack::MarkStack;
use crate::parallel::ParallelMark;
use crate::roots::{push_roots, DirtyOracle, RootSource};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkState {
    /// No cycle in progress
    Idle,
    /// Rescanning marked objects in blocks written since marking began
    PushDirtyRoots,
    /// Pushing uncollectable objects, objects marked unconditionally, then
    /// the roots
    PushAllRoots,
    /// Roots are pushed; draining the mark stack
    RootsPushed,
    /// Marks are incomplete and the stack contents can't be trusted
    Invalid,
    /// Rescanning every marked object on the way out of `Invalid`
    PartiallyInvalid,
}

impl fmt::Display for MarkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MarkState::Idle => "idle",
            MarkState::PushDirtyRoots => "push-dirty-roots",
            MarkState::PushAllRoots => "push-all-roots",
            MarkState::RootsPushed => "roots-pushed",
            MarkState::Invalid => "invalid",
            MarkState::PartiallyInvalid => "partially-invalid",
        };
        write!(f, "{}", name)
    }
}

/// What one slice needs to see of the collector
pub struct SliceContext<'a> {
    pub marker: &'a Marker<'a>,
    pub roots: &'a [Arc<dyn RootSource>],
    pub dirty: &'a dyn DirtyOracle,
    pub parallel: Option<&'a ParallelMark>,
    pub incremental: bool,
    pub max_stack: usize,
}

pub struct MarkPhase {
    state: MarkState,
    /// Index of the next block to look at when walking the heap
    scan_cursor: usize,
    /// Next slot of the block at the cursor, when a block was left part way
    scan_slot: usize,
    /// The heap walk of the current state is done and roots are being pushed
    walked: bool,
    /// Number of the next root word to push
    root_cursor: usize,
    /// Whether marks set this cycle may exist
    objects_are_marked: bool,
    /// The stack overflowed, or came close to it while pushing roots
    too_small: bool,
    /// The incremental rescue pass has been done
    rescued: bool,
}

impl MarkPhase {
    pub fn new() -> MarkPhase {
        MarkPhase {
            state: MarkState::Idle,
            scan_cursor: 0,
            scan_slot: 0,
            walked: false,
            root_cursor: 0,
            objects_are_marked: false,
            too_small: false,
            rescued: false,
        }
    }

    pub fn state(&self) -> MarkState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == MarkState::Idle
    }

    /// Begin a cycle over freshly cleared marks
    pub fn start(&mut self) {
        self.enter(MarkState::PushAllRoots);
        self.objects_are_marked = false;
        self.rescued = false;
    }

    /// Declare the marks untrustworthy. The cycle resumes with a rescan.
    pub fn invalidate(&mut self) {
        if self.state != MarkState::Idle {
            self.state = MarkState::Invalid;
            self.objects_are_marked = true;
        }
    }

    /// Do one bounded slice of marking. Returns true once the mark phase is
    /// complete; calling it again after that is a no-op that returns true.
    ///
    /// The slice that completes the cycle pushes every root and drains the
    /// stack before returning, so root and heap writes made between slices
    /// are all seen by the end.
    pub fn advance(&mut self, stack: &mut MarkStack, ctx: &SliceContext) -> bool {
        let done = self.step(stack, ctx);

        if stack.take_overflow() {
            debug!("Mark stack overflowed in state {}", self.state);
            self.state = MarkState::Invalid;
            self.objects_are_marked = true;
            self.too_small = true;
            return false;
        }
        done
    }

    fn step(&mut self, stack: &mut MarkStack, ctx: &SliceContext) -> bool {
        match self.state {
            MarkState::Idle => true,

            MarkState::PushDirtyRoots => {
                if stack.len() >= rescue_threshold(stack) {
                    self.too_small = true;
                    self.drain(stack, ctx);
                    return false;
                }

                let dirty = ctx.dirty;
                let finished = self.push_next(stack, ctx, |header| {
                    dirty.was_written(header.base()) && has_live_contents(header)
                });
                if finished {
                    return self.finish(stack, ctx);
                }
                false
            }

            MarkState::PushAllRoots => {
                if !self.walked {
                    if stack.len() >= push_threshold(stack) {
                        self.drain(stack, ctx);
                        return false;
                    }
                    self.walked = self.push_next(stack, ctx, |header| {
                        header
                            .flags()
                            .intersects(BlockFlags::UNCOLLECTABLE | BlockFlags::MARK_UNCONDITIONALLY)
                    });
                    return false;
                }

                if self.push_roots_step(stack, ctx) {
                    self.state = MarkState::RootsPushed;
                }
                false
            }

            MarkState::RootsPushed => {
                if !stack.is_empty() {
                    self.drain(stack, ctx);
                    if self.state != MarkState::RootsPushed || !stack.is_empty() {
                        return false;
                    }
                }

                if ctx.incremental && !self.rescued {
                    self.rescued = true;
                    self.enter(MarkState::PushDirtyRoots);
                    return false;
                }
                self.finish(stack, ctx)
            }

            MarkState::Invalid | MarkState::PartiallyInvalid => {
                if !self.objects_are_marked {
                    self.enter(MarkState::PushAllRoots);
                    return false;
                }
                if !stack.is_empty() {
                    ctx.marker.mark_from(stack, MARK_CREDIT_BYTES);
                    return false;
                }
                if self.state == MarkState::Invalid && self.scan_cursor == 0 && self.scan_slot == 0 {
                    self.grow_if_too_small(stack, ctx.max_stack);
                    self.enter(MarkState::PartiallyInvalid);
                }

                // an Invalid walk that started part way finishes before the
                // full rescan begins
                if self.state == MarkState::Invalid || !self.walked {
                    let finished = self.push_next(stack, ctx, has_live_contents);
                    if self.state == MarkState::PartiallyInvalid {
                        self.walked = finished;
                    }
                    return false;
                }

                if self.push_roots_step(stack, ctx) {
                    self.state = MarkState::RootsPushed;
                }
                false
            }
        }
    }

    /// Switch to a state that starts with a heap walk
    fn enter(&mut self, state: MarkState) {
        self.state = state;
        self.scan_cursor = 0;
        self.scan_slot = 0;
        self.walked = false;
        self.root_cursor = 0;
    }

    /// Drain the stack, in parallel if there are helpers
    fn drain(&mut self, stack: &mut MarkStack, ctx: &SliceContext) {
        match ctx.parallel {
            Some(parallel) => {
                if parallel.mark(ctx.marker, stack) {
                    self.state = MarkState::Invalid;
                    self.objects_are_marked = true;
                    self.too_small = true;
                }
            }
            None => ctx.marker.mark_from(stack, MARK_CREDIT_BYTES),
        }
    }

    /// Push the next run of roots, draining first if the stack is filling
    /// up. A run cut short by the stack only records that the stack is too
    /// small. Returns true once every root has been pushed.
    fn push_roots_step(&mut self, stack: &mut MarkStack, ctx: &SliceContext) -> bool {
        let threshold = push_threshold(stack);
        if stack.len() >= threshold {
            self.drain(stack, ctx);
            return false;
        }

        self.objects_are_marked = true;
        match push_roots(ctx.roots, ctx.marker, stack, self.root_cursor, threshold) {
            Some(next) => {
                self.root_cursor = next;
                self.too_small = true;
                false
            }
            None => {
                self.root_cursor = 0;
                true
            }
        }
    }

    /// Push every root and drain the stack to empty, all within this slice,
    /// then end the cycle. Overflow on the way leaves the cycle to recover
    /// through `Invalid`.
    fn finish(&mut self, stack: &mut MarkStack, ctx: &SliceContext) -> bool {
        let state = self.state;
        self.objects_are_marked = true;
        let mut cursor = 0;
        loop {
            let threshold = push_threshold(stack);
            let resume = push_roots(ctx.roots, ctx.marker, stack, cursor, threshold);
            while !stack.is_empty() && self.state == state && !stack.overflowed() {
                self.drain(stack, ctx);
            }
            if self.state != state || stack.overflowed() {
                return false;
            }
            match resume {
                Some(next) => cursor = next,
                None => break,
            }
        }

        self.grow_if_too_small(stack, ctx.max_stack);
        self.state = MarkState::Idle;
        true
    }

    /// Push the live contents of the next selected block, stopping early if
    /// the stack fills up. Returns true, and rewinds the cursor, when the
    /// heap walk is finished.
    fn push_next<F>(&mut self, stack: &mut MarkStack, ctx: &SliceContext, select: F) -> bool
    where
        F: Fn(&BlockHeader) -> bool,
    {
        let blocks = ctx.marker.blocks();

        while let Some(id) = blocks.next_from(self.scan_cursor) {
            let header = match blocks.get(id) {
                Some(header) => header,
                None => break,
            };
            let resuming = self.scan_cursor == id.index() && self.scan_slot > 0;
            if !resuming && (header.descriptor().is_empty() || !select(header)) {
                self.scan_cursor = id.index() + 1;
                self.scan_slot = 0;
                continue;
            }

            let unconditional = header.flags().contains(BlockFlags::MARK_UNCONDITIONALLY);
            let start = if resuming { self.scan_slot } else { 0 };
            for slot in start..header.objects() {
                if !stack.has_room(1) {
                    self.scan_cursor = id.index();
                    self.scan_slot = slot;
                    return false;
                }
                let live = if unconditional {
                    header.is_allocated(slot)
                } else {
                    header.is_marked(slot)
                };
                if live {
                    ctx.marker.push_object(header, slot, stack);
                }
            }

            self.scan_cursor = id.index() + 1;
            self.scan_slot = 0;
            return false;
        }

        self.scan_cursor = 0;
        self.scan_slot = 0;
        true
    }

    fn grow_if_too_small(&mut self, stack: &mut MarkStack, max_stack: usize) {
        if !self.too_small {
            return;
        }
        self.too_small = false;

        let size = (stack.limit() * 2).min(max_stack);
        if size <= stack.limit() {
            return;
        }
        if stack.grow(size) {
            debug!("Grew mark stack to {} entries", size);
        } else {
            warn!("Failed to grow mark stack to {} entries", size);
        }
    }
}

impl Default for MarkPhase {
    fn default() -> MarkPhase {
        MarkPhase::new()
    }
}

/// Stack depth at which pushing roots or uncollectable objects stops to
/// drain
fn push_threshold(stack: &MarkStack) -> usize {
    (stack.limit() / 4).max(1)
}

/// Stack depth at which the dirty block rescan stops to drain
fn rescue_threshold(stack: &MarkStack) -> usize {
    (stack.limit() / 4 * 3).max(1)
}

/// Whether a block holds objects whose contents must be scanned
fn has_live_contents(header: &BlockHeader) -> bool {
    header.marked_count() > 0 || header.flags().contains(BlockFlags::MARK_UNCONDITIONALLY)
}
