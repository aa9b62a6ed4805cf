//! Finalize-on-reclaim support.
//!
//! A kind may carry a `Disclaimable` callback that sees every candidate-dead
//! object of the kind before its slot is reused, and can keep it alive for
//! another cycle. Finalized allocation builds on that: each object carries
//! a tagged closure id in its first word and the closure runs once when the
//! object is reclaimed.
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::rawptr::RawPtr;

/// What to do with an unreachable object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Treat the object as live for the rest of this cycle
    Keep,
    /// Reclaim the object
    Release,
}

/// A per-kind hook run on each unreachable object before reclamation.
///
/// Called with the allocator lock held: implementations must not allocate
/// from, or otherwise call into, the collector.
pub trait Disclaimable: Send + Sync {
    fn disclaim(&self, object: RawPtr) -> Disposition;
}

impl<F> Disclaimable for F
where
    F: Fn(RawPtr) -> Disposition + Send + Sync,
{
    fn disclaim(&self, object: RawPtr) -> Disposition {
        self(object)
    }
}

/// Low bit of the first word of a live finalized object. Free list links are
/// word aligned so never have it set.
pub const FINALIZER_FLAG: usize = 1;

pub type Finalizer = Box<dyn FnOnce(RawPtr) + Send>;

/// Pending finalizer closures by id
#[derive(Default)]
pub struct FinalizerTable {
    next_id: usize,
    closures: FnvHashMap<usize, Finalizer>,
}

impl FinalizerTable {
    pub fn new() -> FinalizerTable {
        FinalizerTable::default()
    }

    /// Store a closure, returning the tagged word to put in the object header
    pub fn insert(&mut self, closure: Finalizer) -> usize {
        self.next_id += 1;
        self.closures.insert(self.next_id, closure);
        (self.next_id << 1) | FINALIZER_FLAG
    }

    pub fn take(&mut self, tagged: usize) -> Option<Finalizer> {
        if tagged & FINALIZER_FLAG == 0 {
            return None;
        }
        self.closures.remove(&(tagged >> 1))
    }

    pub fn len(&self) -> usize {
        self.closures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closures.is_empty()
    }
}

/// The disclaim callback of the finalized kind
pub struct FinalizedDisclaim {
    table: Arc<Mutex<FinalizerTable>>,
}

impl FinalizedDisclaim {
    pub fn new(table: Arc<Mutex<FinalizerTable>>) -> FinalizedDisclaim {
        FinalizedDisclaim { table }
    }
}

impl Disclaimable for FinalizedDisclaim {
    fn disclaim(&self, object: RawPtr) -> Disposition {
        // SAFETY: the collector only offers objects in live blocks
        let tagged = unsafe { object.load(0) };

        // a free fragment, or an object whose closure already ran
        if tagged & FINALIZER_FLAG == 0 {
            return Disposition::Release;
        }

        let closure = self.table.lock().take(tagged);
        // SAFETY: as above
        unsafe { object.store(0, 0) };

        if let Some(closure) = closure {
            closure(object.offset_words(1));
        }
        Disposition::Release
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_disclaim() {
        let keep = |_obj: RawPtr| Disposition::Keep;
        let mut word = 0usize;
        let ptr = RawPtr::new(&mut word as *mut usize as usize).unwrap();
        assert!(keep.disclaim(ptr) == Disposition::Keep);
    }

    #[test]
    fn test_table_tags() {
        let mut table = FinalizerTable::new();
        let tagged = table.insert(Box::new(|_| {}));

        assert!(tagged & FINALIZER_FLAG == FINALIZER_FLAG);
        assert!(table.len() == 1);
        assert!(table.take(tagged & !FINALIZER_FLAG).is_none());
        assert!(table.take(tagged).is_some());
        assert!(table.take(tagged).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_finalized_disclaim_runs_once() {
        let table = Arc::new(Mutex::new(FinalizerTable::new()));
        let disclaim = FinalizedDisclaim::new(table.clone());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut object = [0usize; 3];
        let ptr = RawPtr::new(object.as_mut_ptr() as usize).unwrap();
        let body = ptr.offset_words(1).as_word();

        let counter = runs.clone();
        let tagged = table.lock().insert(Box::new(move |got: RawPtr| {
            assert!(got.as_word() == body);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        unsafe { ptr.store(0, tagged) };

        assert!(disclaim.disclaim(ptr) == Disposition::Release);
        assert!(disclaim.disclaim(ptr) == Disposition::Release);

        let got = runs.load(Ordering::SeqCst);
        println!("test_finalized_disclaim_runs_once got {} expected {}", got, 1);
        assert!(got == 1);
        assert!(table.lock().is_empty());
    }
}
