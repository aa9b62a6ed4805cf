//! A conservative, non-moving mark-sweep collector.
//!
//! Objects live in size-segregated blocks obtained from a `PageAllocator`.
//! Any word that resolves to an allocated object is treated as a pointer to
//! it. Marking can run in bounded slices, with helper threads, and survives
//! mark stack overflow by rescanning the heap.

extern crate blockalloc;

mod allocator;
mod blockmeta;
mod collector;
mod config;
mod constants;
mod descriptor;
mod disclaim;
mod heap;
mod kind;
mod mark;
mod markstack;
mod parallel;
mod rawptr;
mod reclaim;
mod roots;
mod state;

pub use allocator::{AllocError, AllocRaw, SizeClass};

pub use collector::{Collector, GcStats, ObjectInfo};

pub use config::{CollectorCreateInfo, GcConfig};

pub use constants::{BLOCK_SIZE, GRANULE_BYTES, MAX_SMALL_OBJECT, WORD};

pub use descriptor::{Descriptor, Indirect, ProcId};

pub use disclaim::{Disclaimable, Disposition};

pub use kind::{KindId, KindProperties};

pub use mark::{Scannable, Tracer};

pub use rawptr::RawPtr;

pub use reclaim::{LeakReport, SweepReport};

pub use roots::{AllDirty, DirtyOracle, RootSet, RootSlots, RootSource};

pub use state::MarkState;
