//! Forwarding decisions.
//!
//! `Router::route` is a pure decision function: it inspects a message, the
//! current topology, and the recently-seen cache, and returns what should
//! happen to the message. The engine executes the disposition; nothing here
//! touches the link or the queue.

use std::collections::{HashSet, VecDeque};

use log::trace;

use crate::protocol::{FrameType, MeshMessage, MessageId, PeerId};
use crate::topology::TopologyTracker;

/// Where a message entered the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOrigin {
    /// Freshly submitted by the local application
    Local,
    /// Flushed from the store-and-forward queue
    Queue,
    /// Received over a link from a direct neighbor
    Remote { from: PeerId },
}

/// What the engine should do with a routed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Addressed to this node: decrypt and hand to the application
    Deliver,
    /// Send to a single known next hop
    Forward { next_hop: PeerId },
    /// No route: send to every neighbor except the arrival link
    Flood { exclude: Option<PeerId> },
    /// Destination unreachable: hold for later delivery
    Enqueue,
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Duplicate of a message already processed
    AlreadySeen,
    /// Cannot survive another hop
    TtlExpired,
    /// Unreachable and not eligible for queueing
    Unroutable,
}

/// Bounded FIFO set of recently-seen message ids.
struct SeenCache {
    set: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert an id; returns false if it was already present.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

/// Per-node routing decision state.
pub struct Router {
    local: PeerId,
    seen: SeenCache,
}

impl Router {
    pub fn new(local: PeerId, dedup_cache_size: usize) -> Self {
        Self {
            local,
            seen: SeenCache::new(dedup_cache_size),
        }
    }

    /// Decide what to do with `message`.
    ///
    /// Remote messages are checked against the seen cache first, so a
    /// duplicate is dropped before it can be delivered or relayed again.
    /// Queue-origin messages skip that check: their id was recorded when
    /// they were first submitted.
    pub fn route(
        &mut self,
        message: &MeshMessage,
        origin: RouteOrigin,
        topology: &TopologyTracker,
    ) -> Disposition {
        match origin {
            RouteOrigin::Local => {
                self.seen.insert(message.id);
            }
            RouteOrigin::Queue => {}
            RouteOrigin::Remote { .. } => {
                if !self.seen.insert(message.id) {
                    trace!("Dropping duplicate {}", message.id.short());
                    return Disposition::Drop(DropReason::AlreadySeen);
                }
            }
        }

        if message.destination == self.local {
            return Disposition::Deliver;
        }

        // Relayed traffic must have a hop left after the decrement.
        if let RouteOrigin::Remote { .. } = origin {
            if message.ttl <= 1 {
                trace!("Dropping {}: TTL exhausted", message.id.short());
                return Disposition::Drop(DropReason::TtlExpired);
            }
        }

        if let Some(next_hop) = topology.next_hop(&message.destination) {
            return Disposition::Forward { next_hop };
        }

        match origin {
            // Acknowledgements are fire-and-forget; everything else the
            // local node originated waits for the destination to appear.
            RouteOrigin::Local | RouteOrigin::Queue => {
                if message.frame_type == FrameType::Ack {
                    Disposition::Drop(DropReason::Unroutable)
                } else {
                    Disposition::Enqueue
                }
            }
            RouteOrigin::Remote { from } => Disposition::Flood {
                exclude: Some(from),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn message(id: u8, sender: u8, destination: u8, ttl: u8) -> MeshMessage {
        MeshMessage {
            id: MessageId([id; 32]),
            frame_type: FrameType::Data,
            sender: peer(sender),
            destination: peer(destination),
            ttl,
            payload: vec![0u8; 16],
            tag: [0u8; 16],
            created_at: Utc::now(),
        }
    }

    fn topology_with_neighbor(local: u8, neighbor: u8) -> TopologyTracker {
        let mut t =
            TopologyTracker::new(peer(local), Duration::seconds(30), Duration::seconds(300));
        t.on_neighbor_seen(peer(neighbor), 1.0, Utc::now());
        t
    }

    #[test]
    fn delivers_messages_addressed_to_self() {
        let mut router = Router::new(peer(0), 16);
        let topology = topology_with_neighbor(0, 1);
        let msg = message(1, 1, 0, 3);
        assert_eq!(
            router.route(&msg, RouteOrigin::Remote { from: peer(1) }, &topology),
            Disposition::Deliver
        );
    }

    #[test]
    fn duplicate_remote_messages_are_dropped() {
        let mut router = Router::new(peer(0), 16);
        let topology = topology_with_neighbor(0, 1);
        let msg = message(1, 1, 0, 3);
        let origin = RouteOrigin::Remote { from: peer(1) };

        assert_eq!(router.route(&msg, origin, &topology), Disposition::Deliver);
        assert_eq!(
            router.route(&msg, origin, &topology),
            Disposition::Drop(DropReason::AlreadySeen)
        );
    }

    #[test]
    fn forwards_along_known_route() {
        let mut router = Router::new(peer(0), 16);
        let topology = topology_with_neighbor(0, 1);
        let msg = message(2, 0, 1, 3);
        assert_eq!(
            router.route(&msg, RouteOrigin::Local, &topology),
            Disposition::Forward { next_hop: peer(1) }
        );
    }

    #[test]
    fn relayed_message_without_remaining_ttl_is_dropped() {
        let mut router = Router::new(peer(0), 16);
        let topology = topology_with_neighbor(0, 2);
        let msg = message(3, 1, 2, 1);
        assert_eq!(
            router.route(&msg, RouteOrigin::Remote { from: peer(1) }, &topology),
            Disposition::Drop(DropReason::TtlExpired)
        );
    }

    #[test]
    fn local_traffic_to_unknown_destination_is_enqueued() {
        let mut router = Router::new(peer(0), 16);
        let topology = topology_with_neighbor(0, 1);
        let msg = message(4, 0, 9, 3);
        assert_eq!(
            router.route(&msg, RouteOrigin::Local, &topology),
            Disposition::Enqueue
        );
    }

    #[test]
    fn acks_are_never_enqueued() {
        let mut router = Router::new(peer(0), 16);
        let topology = topology_with_neighbor(0, 1);
        let mut msg = message(5, 0, 9, 3);
        msg.frame_type = FrameType::Ack;
        assert_eq!(
            router.route(&msg, RouteOrigin::Local, &topology),
            Disposition::Drop(DropReason::Unroutable)
        );
    }

    #[test]
    fn relayed_traffic_without_route_floods_away_from_arrival() {
        let mut router = Router::new(peer(0), 16);
        let topology = topology_with_neighbor(0, 1);
        let msg = message(6, 1, 9, 3);
        assert_eq!(
            router.route(&msg, RouteOrigin::Remote { from: peer(1) }, &topology),
            Disposition::Flood {
                exclude: Some(peer(1))
            }
        );
    }

    #[test]
    fn queue_origin_bypasses_the_seen_cache() {
        let mut router = Router::new(peer(0), 16);
        let empty =
            TopologyTracker::new(peer(0), Duration::seconds(30), Duration::seconds(300));
        let msg = message(7, 0, 1, 3);

        // The first submission records the id and parks the message.
        assert_eq!(
            router.route(&msg, RouteOrigin::Local, &empty),
            Disposition::Enqueue
        );

        // The flush after the destination appears must still route.
        let topology = topology_with_neighbor(0, 1);
        assert_eq!(
            router.route(&msg, RouteOrigin::Queue, &topology),
            Disposition::Forward { next_hop: peer(1) }
        );
    }

    #[test]
    fn seen_cache_evicts_oldest_at_capacity() {
        let mut router = Router::new(peer(0), 2);
        let topology = topology_with_neighbor(0, 1);
        let origin = RouteOrigin::Remote { from: peer(1) };

        let first = message(1, 1, 0, 3);
        router.route(&first, origin, &topology);
        router.route(&message(2, 1, 0, 3), origin, &topology);
        router.route(&message(3, 1, 0, 3), origin, &topology);

        // The first id has been evicted, so its retransmission routes again.
        assert_eq!(router.route(&first, origin, &topology), Disposition::Deliver);
    }
}
