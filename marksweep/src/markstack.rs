use log::debug;

use crate::descriptor::Descriptor;

/// Memory not yet fully scanned: a start address and how to scan from it
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MarkEntry {
    pub start: usize,
    pub descr: Descriptor,
}

impl MarkEntry {
    pub fn new(start: usize, descr: Descriptor) -> MarkEntry {
        MarkEntry { start, descr }
    }
}

/// A bounded LIFO of mark entries.
///
/// Pushing onto a full stack drops the most recently pushed entries and
/// records the overflow. The objects those entries describe are already
/// marked, so the owner must treat the marks as incomplete and rescan.
pub struct MarkStack {
    entries: Vec<MarkEntry>,
    limit: usize,
    overflowed: bool,
}

impl MarkStack {
    pub fn new(limit: usize) -> MarkStack {
        let limit = limit.max(2);
        MarkStack {
            entries: Vec::with_capacity(limit),
            limit,
            overflowed: false,
        }
    }

    pub fn push(&mut self, entry: MarkEntry) {
        if self.entries.len() >= self.limit {
            let discard = (self.limit / 8).max(1);
            debug!(
                "Mark stack overflow; current size: {} entries, discarding {}",
                self.limit, discard
            );
            let keep = self.entries.len() - discard;
            self.entries.truncate(keep);
            self.overflowed = true;
        }
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Option<MarkEntry> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn has_room(&self, entries: usize) -> bool {
        self.entries.len() + entries <= self.limit
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether entries were dropped since the last `take_overflow`
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Report, and reset, whether entries were dropped since the last call
    pub fn take_overflow(&mut self) -> bool {
        std::mem::replace(&mut self.overflowed, false)
    }

    /// Raise the limit. Fails, keeping the old limit, if the memory can't be
    /// had.
    pub fn grow(&mut self, limit: usize) -> bool {
        if limit <= self.limit {
            return false;
        }
        match self.entries.try_reserve_exact(limit - self.entries.len()) {
            Ok(()) => {
                self.limit = limit;
                true
            }
            Err(_) => false,
        }
    }

    /// Take every entry, oldest first
    pub fn drain_all(&mut self) -> Vec<MarkEntry> {
        self.entries.drain(..).collect()
    }

    /// Take the `count` oldest entries
    pub fn drain_bottom(&mut self, count: usize) -> Vec<MarkEntry> {
        let count = count.min(self.entries.len());
        self.entries.drain(..count).collect()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn entry(start: usize) -> MarkEntry {
        MarkEntry::new(start, Descriptor::Length(64))
    }

    #[test]
    fn test_lifo() {
        let mut stack = MarkStack::new(16);
        stack.push(entry(8));
        stack.push(entry(16));

        assert!(stack.pop() == Some(entry(16)));
        assert!(stack.pop() == Some(entry(8)));
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_overflow_discards() {
        let mut stack = MarkStack::new(16);
        for i in 0..16 {
            stack.push(entry(i * 8));
        }
        assert!(!stack.take_overflow());

        stack.push(entry(1000));

        let got = stack.len();
        println!("test_overflow_discards got {} expected {}", got, 15);
        assert!(got == 15);
        assert!(stack.pop() == Some(entry(1000)));
        assert!(stack.take_overflow());
        assert!(!stack.take_overflow());
    }

    #[test]
    fn test_grow() {
        let mut stack = MarkStack::new(4);
        assert!(stack.grow(8));
        assert!(stack.limit() == 8);
        assert!(!stack.grow(8));
        assert!(stack.has_room(8));
        assert!(!stack.has_room(9));
    }

    #[test]
    fn test_drain() {
        let mut stack = MarkStack::new(16);
        for i in 0..6 {
            stack.push(entry(i * 8));
        }

        let bottom = stack.drain_bottom(2);
        assert!(bottom == vec![entry(0), entry(8)]);
        assert!(stack.len() == 4);

        let rest = stack.drain_all();
        assert!(rest.len() == 4);
        assert!(stack.is_empty());
        stack.push(entry(0));
        assert!(stack.len() == 1);
    }
}
