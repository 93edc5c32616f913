//! Cross-TOC round-robin load queue

use crate::core::types::TocId;
use crate::streaming::registry::TocKind;

/// A stub chosen for loading, with everything needed to issue its read
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadCandidate {
    pub toc: TocId,
    pub stub: usize,
    pub kind: TocKind,
    pub offset: u64,
    pub length: u32,
    pub priority: f32,
}

/// The merged load queue shared by every TOC of a container.
///
/// Rebuilt on each scheduler pass by interleaving the TOCs' short-lists one
/// item at a time. Reads are then taken from the front, favouring the TOC
/// after the one served last.
#[derive(Debug, Default)]
pub struct LoadScheduler {
    queue: Vec<LoadCandidate>,
    toc_count: usize,
    cursor: usize,
    /// Reads issued since the main thread last looked
    started: Vec<(TocId, usize)>,
}

impl LoadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the queue with a round-robin merge of per-TOC lists, one list per TOC.
    pub fn rebuild(&mut self, lists: Vec<Vec<LoadCandidate>>) {
        self.toc_count = lists.len();
        if self.toc_count > 0 {
            self.cursor %= self.toc_count;
        } else {
            self.cursor = 0;
        }

        self.queue.clear();
        let mut iters: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
        loop {
            let before = self.queue.len();
            for it in iters.iter_mut() {
                if let Some(candidate) = it.next() {
                    self.queue.push(candidate);
                }
            }
            if self.queue.len() == before {
                break;
            }
        }
    }

    /// Take the next candidate to read.
    ///
    /// Only the first `min(toc_count, len)` entries are considered. Starting
    /// at the cursor, each TOC in turn is checked for an entry in that
    /// window; the cursor advances past every TOC checked.
    pub fn next(&mut self) -> Option<LoadCandidate> {
        if self.queue.is_empty() || self.toc_count == 0 {
            return None;
        }

        let peek = self.toc_count.min(self.queue.len());
        let start = self.cursor;
        loop {
            let favored = self.cursor;
            let hit = self.queue[..peek].iter().position(|c| c.toc.index() == favored);
            self.cursor = (self.cursor + 1) % self.toc_count;

            if let Some(pos) = hit {
                return Some(self.queue.remove(pos));
            }
            if self.cursor == start {
                return None;
            }
        }
    }

    /// Drop any queued entry for this stub.
    pub fn forget(&mut self, toc: TocId, stub: usize) {
        self.queue.retain(|c| !(c.toc == toc && c.stub == stub));
    }

    pub fn mark_started(&mut self, toc: TocId, stub: usize) {
        self.started.push((toc, stub));
    }

    pub fn take_started(&mut self) -> Vec<(TocId, usize)> {
        std::mem::take(&mut self.started)
    }

    pub fn has_started(&self) -> bool {
        !self.started.is_empty()
    }

    pub fn queue(&self) -> &[LoadCandidate] {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(toc: usize, count: usize) -> Vec<LoadCandidate> {
        (0..count)
            .map(|stub| LoadCandidate {
                toc: TocId(toc),
                stub,
                kind: TocKind::Texture,
                offset: 100 + stub as u64,
                length: 16,
                priority: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_rebuild_interleaves() {
        let mut sched = LoadScheduler::new();
        sched.rebuild(vec![list(0, 3), list(1, 1), list(2, 2)]);
        let order: Vec<(usize, usize)> = sched.queue().iter().map(|c| (c.toc.index(), c.stub)).collect();
        assert_eq!(order, [(0, 0), (1, 0), (2, 0), (0, 1), (2, 1), (0, 2)]);
    }

    #[test]
    fn test_round_robin_fairness() {
        let (n, k) = (4, 5);
        let mut sched = LoadScheduler::new();
        sched.rebuild((0..n).map(|t| list(t, k)).collect());

        let mut per_toc = vec![0; n];
        for i in 0..n * k {
            let c = sched.next().expect("queue ran dry");
            assert_eq!(c.toc.index(), i % n, "item {} out of cyclic order", i);
            per_toc[c.toc.index()] += 1;
        }
        assert!(per_toc.iter().all(|&c| c == k));
        assert!(sched.next().is_none());
    }

    #[test]
    fn test_cursor_persists_across_rebuilds() {
        let mut sched = LoadScheduler::new();
        sched.rebuild(vec![list(0, 2), list(1, 2), list(2, 2)]);
        assert_eq!(sched.next().unwrap().toc, TocId(0));

        sched.rebuild(vec![list(0, 2), list(1, 2), list(2, 2)]);
        assert_eq!(sched.next().unwrap().toc, TocId(1));
        assert_eq!(sched.next().unwrap().toc, TocId(2));
        assert_eq!(sched.next().unwrap().toc, TocId(0));
    }

    #[test]
    fn test_skips_idle_tocs() {
        let mut sched = LoadScheduler::new();
        sched.rebuild(vec![Vec::new(), list(1, 2), Vec::new()]);
        assert_eq!(sched.next().unwrap().stub, 0);
        assert_eq!(sched.next().unwrap().stub, 1);
        assert!(sched.next().is_none());
    }

    #[test]
    fn test_forget_and_started() {
        let mut sched = LoadScheduler::new();
        sched.rebuild(vec![list(0, 3)]);
        sched.forget(TocId(0), 1);
        assert_eq!(sched.len(), 2);

        sched.mark_started(TocId(0), 0);
        assert!(sched.has_started());
        assert_eq!(sched.take_started(), [(TocId(0), 0)]);
        assert!(!sched.has_started());
    }
}
