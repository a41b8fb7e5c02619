//! Priority queue of not-yet-started completion requests.
//!
//! Ordering key is `(priority rank, submitted_at, sequence)` ascending. The
//! sequence counter makes ordering total and deterministic; object identity
//! never participates.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::handle::HandleSlot;
use super::types::CompletionRequest;

/// A request waiting for a worker, together with its resolver.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub request: CompletionRequest,
    pub slot: HandleSlot,
}

impl QueuedRequest {
    fn key(&self) -> (u8, std::time::Instant, u64) {
        (
            self.request.priority.rank(),
            self.request.submitted_at,
            self.request.sequence,
        )
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // BinaryHeap is a max-heap; reverse so the smallest key pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    heap: BinaryHeap<QueuedRequest>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueuedRequest) {
        self.heap.push(entry);
    }

    /// Highest-priority request, if any.
    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.heap.pop()
    }

    /// Remove a specific request. Returns it if it was still queued.
    pub fn remove(&mut self, request_id: &str) -> Option<QueuedRequest> {
        if !self
            .heap
            .iter()
            .any(|e| e.request.request_id == request_id)
        {
            return None;
        }
        let mut removed = None;
        let remaining: Vec<QueuedRequest> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .filter_map(|entry| {
                if removed.is_none() && entry.request.request_id == request_id {
                    removed = Some(entry);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        self.heap = BinaryHeap::from(remaining);
        removed
    }

    /// Take every queued request, in no particular order.
    pub fn drain(&mut self) -> Vec<QueuedRequest> {
        std::mem::take(&mut self.heap).into_vec()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
