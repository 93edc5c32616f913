//! Load interest bookkeeping and candidate ranking

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Why a stub is wanted. Requests are counted per reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadReason {
    /// Tools and generation
    Editor,
    /// A live view of the dataset
    Instance,
    /// Speculative warm-up
    Preload,
    Custom(u32),
}

#[derive(Clone, Copy, Debug)]
struct RequestEntry {
    reason: LoadReason,
    count: u32,
    priority: f32,
}

/// Reference-counted load requests on one stub
#[derive(Clone, Debug, Default)]
pub struct RequestHeader {
    entries: Vec<RequestEntry>,
}

impl RequestHeader {
    /// Add one request for `reason`. The reason's priority becomes `priority`.
    /// Returns the total reference count afterwards.
    pub fn add(&mut self, reason: LoadReason, priority: f32) -> u32 {
        match self.entries.iter_mut().find(|e| e.reason == reason) {
            Some(entry) => {
                entry.count += 1;
                entry.priority = priority;
            }
            None => self.entries.push(RequestEntry {
                reason,
                count: 1,
                priority,
            }),
        }
        self.ref_count()
    }

    /// Drop one request for `reason`. Returns the total reference count
    /// afterwards, or `None` if no such request was outstanding.
    pub fn remove(&mut self, reason: LoadReason) -> Option<u32> {
        let pos = self.entries.iter().position(|e| e.reason == reason)?;
        self.entries[pos].count -= 1;
        if self.entries[pos].count == 0 {
            self.entries.swap_remove(pos);
        }
        Some(self.ref_count())
    }

    pub fn ref_count(&self) -> u32 {
        self.entries.iter().map(|e| e.count).sum()
    }

    pub fn count_for(&self, reason: LoadReason) -> u32 {
        self.entries
            .iter()
            .find(|e| e.reason == reason)
            .map_or(0, |e| e.count)
    }

    /// Highest priority over all outstanding requests, or 0 with none
    pub fn cumulative_priority(&self) -> f32 {
        self.entries
            .iter()
            .map(|e| e.priority)
            .reduce(f32::max)
            .unwrap_or(0.0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Ranking of one queued stub within its TOC
#[derive(Clone, Copy, Debug)]
pub struct StubRank {
    pub stub: usize,
    pub priority: f32, // Higher = more important
    pub heat: f32,     // Breaks priority ties
}

// Max-heap order: priority, then heat, then lower stub index first
impl Eq for StubRank {}

impl PartialEq for StubRank {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for StubRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| self.heat.total_cmp(&other.heat))
            .then_with(|| other.stub.cmp(&self.stub))
    }
}

impl PartialOrd for StubRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Picks the best-ranked stubs of a TOC's load queue
#[derive(Debug, Default)]
pub struct CandidateQueue {
    heap: BinaryHeap<StubRank>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rank: StubRank) {
        self.heap.push(rank);
    }

    pub fn pop(&mut self) -> Option<StubRank> {
        self.heap.pop()
    }

    /// Up to `n` best stubs, best first
    pub fn take_best(&mut self, n: usize) -> Vec<StubRank> {
        std::iter::from_fn(|| self.heap.pop()).take(n).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_refcount_per_reason() {
        let mut header = RequestHeader::default();
        assert_eq!(header.add(LoadReason::Instance, 1.0), 1);
        assert_eq!(header.add(LoadReason::Instance, 2.0), 2);
        assert_eq!(header.add(LoadReason::Editor, 0.5), 3);
        assert_eq!(header.count_for(LoadReason::Instance), 2);

        assert_eq!(header.remove(LoadReason::Preload), None);
        assert_eq!(header.remove(LoadReason::Instance), Some(2));
        assert_eq!(header.remove(LoadReason::Instance), Some(1));
        assert_eq!(header.remove(LoadReason::Editor), Some(0));
        assert_eq!(header.ref_count(), 0);
    }

    #[test]
    fn test_cumulative_priority_is_max() {
        let mut header = RequestHeader::default();
        assert_eq!(header.cumulative_priority(), 0.0);
        header.add(LoadReason::Instance, 3.0);
        header.add(LoadReason::Preload, 7.0);
        header.add(LoadReason::Custom(4), 5.0);
        assert_eq!(header.cumulative_priority(), 7.0);
        header.remove(LoadReason::Preload);
        assert_eq!(header.cumulative_priority(), 5.0);
    }

    #[test]
    fn test_rank_ordering() {
        let low = StubRank { stub: 0, priority: 1.0, heat: 9.0 };
        let high = StubRank { stub: 1, priority: 2.0, heat: 0.0 };
        let warm = StubRank { stub: 2, priority: 2.0, heat: 1.0 };
        assert!(high > low);
        assert!(warm > high);
    }

    #[test]
    fn test_take_best() {
        let mut queue = CandidateQueue::new();
        for (stub, priority) in [(0, 1.0), (1, 5.0), (2, 3.0), (3, 5.0)] {
            queue.push(StubRank { stub, priority, heat: 0.0 });
        }
        let best: Vec<usize> = queue.take_best(3).iter().map(|r| r.stub).collect();
        assert_eq!(best, [1, 3, 2]);
        assert_eq!(queue.len(), 1);
    }
}
