//! Per-tag bounded send queue.
//!
//! Entries wait here between `emit` and the flush that frames them into a
//! chunk. The queue keeps exact running counters of entry count and
//! estimated byte cost, applies the four configurable limits at push time,
//! and pops chunks oldest-tag-first preserving per-tag FIFO order.

use std::collections::{HashMap, VecDeque};

use rmpv::Value;

use crate::core::error::{DropReason, EmitError};
use crate::event::handle::Settlement;
use crate::protocol::{Entry, EventMode};

/// Fixed byte overhead charged per entry on top of its key/value costs.
///
/// Covers the tag share, the event time and framing. The estimate is a
/// monotone approximation of the serialized cost, not a wire contract.
pub const ENTRY_OVERHEAD: usize = 10;

/// A `{size, length}` limit pair; unset members never trigger.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeLimit {
    /// Estimated byte threshold.
    pub size: Option<usize>,
    /// Entry count threshold.
    pub length: Option<usize>,
}

impl SizeLimit {
    /// Limit on size only.
    pub fn size(size: usize) -> Self {
        Self {
            size: Some(size),
            length: None,
        }
    }

    /// Limit on length only.
    pub fn length(length: usize) -> Self {
        Self {
            size: None,
            length: Some(length),
        }
    }

    fn exceeded_by(&self, size: usize, length: usize) -> bool {
        self.size.is_some_and(|s| size > s) || self.length.is_some_and(|l| length > l)
    }
}

/// The queue's four independent limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueLimits {
    /// Hard cap; a push that would exceed it rejects the new event.
    pub max: Option<SizeLimit>,
    /// Cap applied only while the socket is not writable.
    pub not_flushable: Option<SizeLimit>,
    /// Exceeding this on push replaces the scheduled flush with an
    /// immediate one.
    pub interval_flush: Option<SizeLimit>,
    /// Exceeding this on push triggers an in-line flush before `emit`
    /// returns.
    pub sync_flush: Option<SizeLimit>,
}

/// What the client should do after a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushHint {
    /// Let the scheduled flush stand.
    Scheduled,
    /// Cancel the scheduled flush and flush now.
    Immediate,
    /// Flush in-line before returning to the caller.
    Sync,
}

/// Outcome of a push.
#[derive(Debug)]
pub enum PushOutcome {
    /// Entry enqueued; the hint drives flush scheduling.
    Queued(FlushHint),
    /// Entry rejected by a limit; its settlement is already rejected.
    Rejected,
}

struct QueuedEntry {
    entry: Entry,
    cost: usize,
    settlement: Settlement,
}

/// A batch popped from the queue, owning its settlements.
pub struct PoppedChunk {
    /// Tag shared by every entry.
    pub tag: String,
    items: Vec<QueuedEntry>,
}

impl PoppedChunk {
    /// Number of entries in the chunk.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Clone out the entries for framing.
    pub fn entries(&self) -> Vec<Entry> {
        self.items.iter().map(|item| item.entry.clone()).collect()
    }

    /// Consume the chunk, yielding its settlements.
    pub fn into_settlements(self) -> Vec<Settlement> {
        self.items.into_iter().map(|item| item.settlement).collect()
    }
}

/// The per-tag bounded queue between `emit` and the socket.
pub struct SendQueue {
    limits: QueueLimits,
    /// Tags in oldest-pending-first order.
    tag_order: VecDeque<String>,
    entries: HashMap<String, VecDeque<QueuedEntry>>,
    total_length: usize,
    total_size: usize,
}

impl SendQueue {
    /// Create a queue with the given limits.
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            limits,
            tag_order: VecDeque::new(),
            entries: HashMap::new(),
            total_length: 0,
            total_size: 0,
        }
    }

    /// Entries currently queued.
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Estimated bytes currently queued.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Whether any entry is queued.
    pub fn has_pending(&self) -> bool {
        self.total_length > 0
    }

    /// Enqueue one event.
    ///
    /// A rejected event's settlement is settled here; the queue remains
    /// healthy either way. `writable` selects whether the not-flushable
    /// limit applies.
    pub fn push(
        &mut self,
        tag: String,
        entry: Entry,
        settlement: Settlement,
        writable: bool,
    ) -> PushOutcome {
        let cost = estimate_entry_cost(&entry.record);
        let new_size = self.total_size + cost;
        let new_length = self.total_length + 1;

        if self
            .limits
            .max
            .is_some_and(|l| l.exceeded_by(new_size, new_length))
        {
            settlement.reject(EmitError::Dropped(DropReason::QueueLimit));
            return PushOutcome::Rejected;
        }
        if !writable
            && self
                .limits
                .not_flushable
                .is_some_and(|l| l.exceeded_by(new_size, new_length))
        {
            settlement.reject(EmitError::Dropped(DropReason::NotFlushable));
            return PushOutcome::Rejected;
        }

        if !self.entries.contains_key(&tag) {
            self.tag_order.push_back(tag.clone());
        }
        self.entries.entry(tag).or_default().push_back(QueuedEntry {
            entry,
            cost,
            settlement,
        });
        self.total_length = new_length;
        self.total_size = new_size;

        let hint = if self
            .limits
            .sync_flush
            .is_some_and(|l| l.exceeded_by(self.total_size, self.total_length))
        {
            FlushHint::Sync
        } else if self
            .limits
            .interval_flush
            .is_some_and(|l| l.exceeded_by(self.total_size, self.total_length))
        {
            FlushHint::Immediate
        } else {
            FlushHint::Scheduled
        };
        PushOutcome::Queued(hint)
    }

    /// Pop the next chunk: oldest pending tag first, per-tag FIFO.
    ///
    /// `Message` mode pops a single entry; packed modes additionally stop
    /// at `max_size` estimated bytes. At least one entry is always popped
    /// from a non-empty queue.
    pub fn pop_chunk(
        &mut self,
        mode: EventMode,
        max_size: usize,
        max_length: usize,
    ) -> Option<PoppedChunk> {
        let tag = self.tag_order.front()?.clone();
        let queue = self.entries.get_mut(&tag)?;

        let max_length = match mode {
            EventMode::Message => 1,
            _ => max_length.max(1),
        };
        let size_capped = mode.is_packed();

        let mut items = Vec::new();
        let mut popped_size = 0;
        while items.len() < max_length {
            let front_cost = match queue.front() {
                Some(front) => front.cost,
                None => break,
            };
            if size_capped && !items.is_empty() && popped_size + front_cost > max_size {
                break;
            }
            if let Some(item) = queue.pop_front() {
                popped_size += item.cost;
                items.push(item);
            }
        }

        if queue.is_empty() {
            self.entries.remove(&tag);
            self.tag_order.pop_front();
        }
        self.total_length -= items.len();
        self.total_size -= popped_size;

        Some(PoppedChunk { tag, items })
    }

    /// Return a popped chunk to the head of the queue, preserving order.
    ///
    /// Used when a chunk write fails but its entries should survive for a
    /// later flush.
    pub fn push_front_chunk(&mut self, chunk: PoppedChunk) {
        if chunk.items.is_empty() {
            return;
        }
        let PoppedChunk { tag, items } = chunk;
        let restored_size: usize = items.iter().map(|item| item.cost).sum();
        let restored_length = items.len();

        let queue = self.entries.entry(tag.clone()).or_default();
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
        if !self.tag_order.iter().any(|t| *t == tag) {
            self.tag_order.push_front(tag);
        }
        self.total_length += restored_length;
        self.total_size += restored_size;
    }

    /// Reject every queued entry and empty the queue.
    pub fn drop_all(&mut self, reason: DropReason) {
        for (_, queue) in self.entries.drain() {
            for item in queue {
                item.settlement.reject(EmitError::Dropped(reason));
            }
        }
        self.tag_order.clear();
        self.total_length = 0;
        self.total_size = 0;
    }
}

/// Estimated byte cost of one entry's record.
pub fn estimate_entry_cost(record: &Value) -> usize {
    let content = match record {
        Value::Map(pairs) => pairs
            .iter()
            .map(|(key, val)| estimate_value(key) + estimate_value(val))
            .sum(),
        other => estimate_value(other),
    };
    ENTRY_OVERHEAD + content
}

fn estimate_value(value: &Value) -> usize {
    match value {
        Value::Nil | Value::Boolean(_) | Value::Integer(_) | Value::F32(_) | Value::F64(_) => 8,
        Value::String(s) => s.as_bytes().len(),
        Value::Binary(b) => b.len(),
        Value::Array(items) => 2 + items.iter().map(estimate_value).sum::<usize>(),
        Value::Map(pairs) => {
            2 + pairs
                .iter()
                .map(|(key, val)| estimate_value(key) + estimate_value(val))
                .sum::<usize>()
        }
        Value::Ext(_, data) => 1 + data.len(),
    }
}
