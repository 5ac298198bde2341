//! Store-and-forward queue.
//!
//! Holds messages whose destination is currently unreachable. Bounded by a
//! global byte cap and a per-destination byte cap; when a new entry would
//! breach either, the earliest-created entries are evicted to make room and
//! reported back so the application hears an expiry for each. Entries also
//! age out after the retention window.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use log::{debug, trace};

use crate::error::{MeshError, Result};
use crate::protocol::{MeshMessage, MessageId, PeerId};

/// A message waiting for its destination, with its flush-retry count.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub message: MeshMessage,
    pub retries: u32,
}

/// Outcome of re-enqueueing an entry after a failed flush
#[derive(Debug)]
pub enum RequeueResult {
    /// Back in the queue; ids evicted to make room, if any
    Queued { evicted: Vec<MessageId> },
    /// Retry budget spent; the entry is gone
    Exhausted,
}

/// FIFO (by creation time) message queue with byte-budget eviction.
pub struct ForwardQueue {
    entries: VecDeque<QueuedEntry>,
    total_bytes: usize,
    max_bytes: usize,
    max_destination_bytes: usize,
    retention: Duration,
    max_retries: u32,
}

impl ForwardQueue {
    pub fn new(
        max_bytes: usize,
        max_destination_bytes: usize,
        retention: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
            max_destination_bytes,
            retention,
            max_retries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    fn destination_bytes(&self, destination: &PeerId) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.message.destination == *destination)
            .map(|entry| entry.message.size_bytes())
            .sum()
    }

    /// Hold a message until its destination becomes reachable.
    ///
    /// Returns the ids of entries evicted to make room; each should be
    /// surfaced as expired. Fails with `QueueFull` only when the message by
    /// itself cannot fit within the caps.
    pub fn enqueue(&mut self, message: MeshMessage) -> Result<Vec<MessageId>> {
        let size = message.size_bytes();
        if size > self.max_bytes || size > self.max_destination_bytes {
            return Err(MeshError::QueueFull {
                destination: message.destination.to_string(),
            });
        }

        let mut evicted = Vec::new();

        // Per-destination budget first, then the global one. Earliest-created
        // entries go first in both cases.
        while self.destination_bytes(&message.destination) + size > self.max_destination_bytes {
            if let Some(id) = self.evict_oldest_for(Some(&message.destination)) {
                evicted.push(id);
            } else {
                break;
            }
        }
        while self.total_bytes + size > self.max_bytes {
            if let Some(id) = self.evict_oldest_for(None) {
                evicted.push(id);
            } else {
                break;
            }
        }

        trace!(
            "Queued {} for {} ({} bytes held)",
            message.id.short(),
            message.destination.short(),
            self.total_bytes + size
        );
        self.total_bytes += size;
        let entry = QueuedEntry {
            message,
            retries: 0,
        };
        let created = entry.message.created_at;
        // Keep the deque ordered by creation time; re-enqueued entries may
        // predate the current tail.
        let pos = self
            .entries
            .iter()
            .position(|e| e.message.created_at > created)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);

        Ok(evicted)
    }

    /// Remove and return the earliest-created entry, optionally restricted to
    /// one destination.
    fn evict_oldest_for(&mut self, destination: Option<&PeerId>) -> Option<MessageId> {
        let index = self.entries.iter().position(|entry| match destination {
            Some(dest) => entry.message.destination == *dest,
            None => true,
        })?;
        let entry = self.entries.remove(index)?;
        self.total_bytes -= entry.message.size_bytes();
        debug!(
            "Evicted {} from queue to make room",
            entry.message.id.short()
        );
        Some(entry.message.id)
    }

    /// Drain every entry held for `destination`, in creation order.
    /// Entries are removed unconditionally; a failed flush comes back
    /// through `requeue`.
    pub fn flush(&mut self, destination: &PeerId) -> Vec<QueuedEntry> {
        let mut flushed = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].message.destination == *destination {
                if let Some(entry) = self.entries.remove(index) {
                    self.total_bytes -= entry.message.size_bytes();
                    flushed.push(entry);
                }
            } else {
                index += 1;
            }
        }
        flushed
    }

    /// Put a flushed entry back after the destination vanished mid-flush.
    pub fn requeue(&mut self, mut entry: QueuedEntry) -> Result<RequeueResult> {
        entry.retries += 1;
        if entry.retries > self.max_retries {
            debug!(
                "Dropping {}: retry budget spent",
                entry.message.id.short()
            );
            return Ok(RequeueResult::Exhausted);
        }
        let retries = entry.retries;
        let id = entry.message.id;
        let evicted = self.enqueue(entry.message)?;
        // Restore the retry count the enqueue reset.
        if let Some(stored) = self.entries.iter_mut().find(|e| e.message.id == id) {
            stored.retries = retries;
        }
        Ok(RequeueResult::Queued { evicted })
    }

    /// Remove entries older than the retention window; returns their ids.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<MessageId> {
        let retention = self.retention;
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if now - self.entries[index].message.created_at > retention {
                if let Some(entry) = self.entries.remove(index) {
                    self.total_bytes -= entry.message.size_bytes();
                    debug!("Message {} expired in queue", entry.message.id.short());
                    expired.push(entry.message.id);
                }
            } else {
                index += 1;
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn sized_message(id: u8, destination: u8, payload_len: usize, created: DateTime<Utc>) -> MeshMessage {
        MeshMessage {
            id: MessageId([id; 32]),
            frame_type: FrameType::Data,
            sender: peer(0),
            destination: peer(destination),
            ttl: 7,
            payload: vec![0u8; payload_len],
            tag: [0u8; 16],
            created_at: created,
        }
    }

    fn queue(max: usize, per_dest: usize) -> ForwardQueue {
        ForwardQueue::new(max, per_dest, Duration::hours(1), 3)
    }

    #[test]
    fn flush_returns_entries_in_creation_order() {
        let mut q = queue(1 << 20, 1 << 20);
        let now = Utc::now();
        for i in 0..3u8 {
            let msg = sized_message(i + 1, 9, 10, now + Duration::seconds(i as i64));
            q.enqueue(msg).unwrap();
        }
        let flushed = q.flush(&peer(9));
        let ids: Vec<u8> = flushed.iter().map(|e| e.message.id.0[0]).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(q.is_empty());
        assert_eq!(q.total_bytes(), 0);
    }

    #[test]
    fn oldest_entries_are_evicted_when_the_cap_is_hit() {
        // Ten ~1 KB messages against a 5 KB budget: the oldest five go.
        let mut q = queue(5 * 1024, 5 * 1024);
        let now = Utc::now();
        let per_message = sized_message(0, 9, 0, now).size_bytes();
        let payload = 1024 - per_message;

        let mut evicted_total = Vec::new();
        for i in 0..10u8 {
            let msg = sized_message(i + 1, 9, payload, now + Duration::seconds(i as i64));
            evicted_total.extend(q.enqueue(msg).unwrap());
        }

        assert_eq!(q.len(), 5);
        let evicted: Vec<u8> = evicted_total.iter().map(|id| id.0[0]).collect();
        assert_eq!(evicted, vec![1, 2, 3, 4, 5]);
        let kept: Vec<u8> = q.flush(&peer(9)).iter().map(|e| e.message.id.0[0]).collect();
        assert_eq!(kept, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn per_destination_cap_does_not_evict_other_destinations() {
        let mut q = queue(1 << 20, 2048);
        let now = Utc::now();
        let overhead = sized_message(0, 9, 0, now).size_bytes();
        let payload = 1024 - overhead;

        q.enqueue(sized_message(1, 8, payload, now)).unwrap();
        q.enqueue(sized_message(2, 9, payload, now + Duration::seconds(1)))
            .unwrap();
        q.enqueue(sized_message(3, 9, payload, now + Duration::seconds(2)))
            .unwrap();

        // A third message for peer 9 evicts peer 9's oldest, not peer 8's.
        let evicted = q
            .enqueue(sized_message(4, 9, payload, now + Duration::seconds(3)))
            .unwrap();
        assert_eq!(evicted, vec![MessageId([2; 32])]);
        assert_eq!(q.flush(&peer(8)).len(), 1);
    }

    #[test]
    fn oversized_message_is_rejected_outright() {
        let mut q = queue(1024, 1024);
        let now = Utc::now();
        let err = q.enqueue(sized_message(1, 9, 4096, now)).unwrap_err();
        assert!(matches!(err, MeshError::QueueFull { .. }));
        assert!(q.is_empty());
    }

    #[test]
    fn entries_expire_after_retention() {
        let mut q = ForwardQueue::new(1 << 20, 1 << 20, Duration::seconds(60), 3);
        let now = Utc::now();
        q.enqueue(sized_message(1, 9, 10, now - Duration::seconds(120)))
            .unwrap();
        q.enqueue(sized_message(2, 9, 10, now)).unwrap();

        let expired = q.expire(now);
        assert_eq!(expired, vec![MessageId([1; 32])]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn requeue_preserves_retry_budget() {
        let mut q = queue(1 << 20, 1 << 20);
        let now = Utc::now();
        q.enqueue(sized_message(1, 9, 10, now)).unwrap();

        let mut entry = q.flush(&peer(9)).pop().unwrap();
        for _ in 0..3 {
            match q.requeue(entry).unwrap() {
                RequeueResult::Queued { .. } => {}
                RequeueResult::Exhausted => panic!("exhausted too early"),
            }
            entry = q.flush(&peer(9)).pop().unwrap();
        }
        assert!(matches!(
            q.requeue(entry).unwrap(),
            RequeueResult::Exhausted
        ));
    }
}
