//! Priority queue of pending tile loads.
//!
//! Lower priority values are more urgent. Ties are served in insertion order.
//! Each key appears at most once: re-enqueuing a key only takes effect if
//! the new request is more urgent, in which case the old entry is discarded
//! lazily when it reaches the top of the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::Serialize;

use crate::tile::TileKey;

/// A request to fetch one tile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadRequest {
    pub key: TileKey,

    /// Lower is more urgent
    pub priority: f64,

    /// Speculative load for a tile not currently visible
    pub is_prefetch: bool,
}

impl LoadRequest {
    pub fn visible(key: TileKey, priority: f64) -> Self {
        Self {
            key,
            priority,
            is_prefetch: false,
        }
    }

    pub fn prefetch(key: TileKey, priority: f64) -> Self {
        Self {
            key,
            priority,
            is_prefetch: true,
        }
    }
}

/// Heap entry; ordered so that `BinaryHeap` pops the lowest priority first.
#[derive(Debug)]
struct Entry {
    request: LoadRequest,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .request
            .priority
            .total_cmp(&self.request.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Live entry for a key: its sequence number and request.
#[derive(Debug, Clone, Copy)]
struct Pending {
    seq: u64,
    request: LoadRequest,
}

/// Deduplicating min-priority queue with a prefetch backlog cap.
#[derive(Debug)]
pub struct LoadQueue {
    heap: BinaryHeap<Entry>,
    pending: HashMap<TileKey, Pending>,
    next_seq: u64,
    max_len: usize,
    dropped_prefetch: u64,
}

impl LoadQueue {
    /// Create a queue that sheds prefetch requests beyond `max_len` entries.
    pub fn new(max_len: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_seq: 0,
            max_len: max_len.max(1),
            dropped_prefetch: 0,
        }
    }

    /// Enqueue a request.
    ///
    /// Returns `false` if the key is already queued at an equal or better
    /// priority, or if the request is a prefetch and the queue is full.
    pub fn push(&mut self, request: LoadRequest) -> bool {
        if let Some(existing) = self.pending.get(&request.key) {
            if existing.request.priority <= request.priority {
                return false;
            }
        } else if self.pending.len() >= self.max_len {
            if request.is_prefetch {
                self.dropped_prefetch += 1;
                return false;
            }
            self.drop_prefetch();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(request.key, Pending { seq, request });
        self.heap.push(Entry { request, seq });
        true
    }

    /// Pop the most urgent request.
    pub fn pop(&mut self) -> Option<LoadRequest> {
        while let Some(entry) = self.heap.pop() {
            let live = self
                .pending
                .get(&entry.request.key)
                .is_some_and(|pending| pending.seq == entry.seq);
            if live {
                self.pending.remove(&entry.request.key);
                return Some(entry.request);
            }
        }
        None
    }

    /// Remove a queued request.
    pub fn remove(&mut self, key: &TileKey) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Drop every queued prefetch request. Returns how many were dropped.
    pub fn drop_prefetch(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, pending| !pending.request.is_prefetch);
        self.compact();

        let dropped = before - self.pending.len();
        self.dropped_prefetch += dropped as u64;
        dropped
    }

    /// Turn queued visible requests whose key is not in `keep` into prefetch
    /// requests `penalty` behind their old priority, then shed the least
    /// urgent prefetch requests beyond the backlog cap.
    ///
    /// Returns how many requests were demoted.
    pub fn demote_visible(&mut self, keep: &HashSet<TileKey>, penalty: f64) -> usize {
        let mut stale: Vec<Pending> = self
            .pending
            .values()
            .filter(|pending| {
                !pending.request.is_prefetch && !keep.contains(&pending.request.key)
            })
            .copied()
            .collect();
        if stale.is_empty() {
            return 0;
        }
        stale.sort_by_key(|pending| pending.seq);

        for old in &stale {
            let request = LoadRequest::prefetch(old.request.key, old.request.priority + penalty);
            let seq = self.next_seq;
            self.next_seq += 1;
            self.pending.insert(request.key, Pending { seq, request });
            self.heap.push(Entry { request, seq });
        }

        self.shed_excess();
        self.compact();
        stale.len()
    }

    /// Drop the least urgent prefetch requests until the backlog fits.
    fn shed_excess(&mut self) {
        let excess = self.pending.len().saturating_sub(self.max_len);
        if excess == 0 {
            return;
        }

        let mut prefetch: Vec<Pending> = self
            .pending
            .values()
            .filter(|pending| pending.request.is_prefetch)
            .copied()
            .collect();
        prefetch.sort_by(|a, b| {
            b.request
                .priority
                .total_cmp(&a.request.priority)
                .then_with(|| b.seq.cmp(&a.seq))
        });

        for pending in prefetch.into_iter().take(excess) {
            self.pending.remove(&pending.request.key);
            self.dropped_prefetch += 1;
        }
    }

    /// Discard heap entries that no longer match a live request.
    fn compact(&mut self) {
        let pending = &self.pending;
        self.heap.retain(|entry| {
            pending
                .get(&entry.request.key)
                .is_some_and(|live| live.seq == entry.seq)
        });
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total prefetch requests shed because of the backlog cap.
    pub fn dropped_prefetch(&self) -> u64 {
        self.dropped_prefetch
    }
}
