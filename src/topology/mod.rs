//! Peer discovery and topology tracking.
//!
//! Maintains a best-effort, eventually-consistent view of which peers are one
//! hop away and which are reachable multi-hop, from direct contact and from
//! periodic topology announcements merged distance-vector style.
//!
//! Peer records and route entries live in flat tables keyed by identity —
//! mesh graphs contain cycles, so there is deliberately no pointer graph
//! here. Each record walks the state machine
//! `Discovered → Active → Stale → Evicted`, driven only by discovery and
//! timeout events.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::protocol::{Announcement, AnnouncementEntry, PeerId};

/// Lifecycle state of a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Known only through announcements, never heard directly
    Discovered,
    /// In direct contact (one hop away)
    Active,
    /// Silent past the silence window; unreachable but remembered
    Stale,
}

/// Everything tracked about a remote peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub state: PeerState,
    pub last_seen: DateTime<Utc>,
    pub link_quality: f32,
    pub verified: bool,
}

/// A learned next-hop path toward a destination.
/// Invariant: `hop_count >= 1`; freshness only ever moves forward.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub destination: PeerId,
    pub next_hop: PeerId,
    pub hop_count: u8,
    pub refreshed_at: DateTime<Utc>,
    pub stale: bool,
}

/// Application-facing view of a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub state: PeerState,
    pub hop_count: Option<u8>,
    pub link_quality: f32,
    pub verified: bool,
    pub last_seen: DateTime<Utc>,
}

/// Result of feeding an event into the tracker
#[derive(Debug, Default)]
pub struct TopologyChange {
    /// The peer list visible to the application changed
    pub changed: bool,
    /// Destinations that went from unreachable to reachable
    pub newly_reachable: Vec<PeerId>,
}

/// Tracks peers and routes for one node.
pub struct TopologyTracker {
    local: PeerId,
    peers: HashMap<PeerId, PeerRecord>,
    routes: HashMap<PeerId, RouteEntry>,
    origin_seqs: HashMap<PeerId, u64>,
    announce_seq: u64,
    silence_window: Duration,
    evict_grace: Duration,
}

impl TopologyTracker {
    pub fn new(local: PeerId, silence_window: Duration, evict_grace: Duration) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            routes: HashMap::new(),
            origin_seqs: HashMap::new(),
            announce_seq: 0,
            silence_window,
            evict_grace,
        }
    }

    /// Direct contact with a peer: refresh or create its record and its
    /// one-hop route.
    pub fn on_neighbor_seen(
        &mut self,
        peer: PeerId,
        link_quality: f32,
        now: DateTime<Utc>,
    ) -> TopologyChange {
        if peer == self.local {
            return TopologyChange::default();
        }

        let was_reachable = self.is_reachable(&peer);
        let mut changed = false;

        let record = self.peers.entry(peer).or_insert_with(|| {
            debug!("Discovered neighbor {}", peer.short());
            changed = true;
            PeerRecord {
                id: peer,
                state: PeerState::Active,
                last_seen: now,
                link_quality,
                verified: false,
            }
        });
        if record.state != PeerState::Active {
            record.state = PeerState::Active;
            changed = true;
        }
        record.last_seen = now;
        record.link_quality = link_quality;

        // A directly heard peer is always a one-hop route, displacing any
        // longer path.
        let route = self.routes.entry(peer).or_insert_with(|| RouteEntry {
            destination: peer,
            next_hop: peer,
            hop_count: 1,
            refreshed_at: now,
            stale: false,
        });
        route.next_hop = peer;
        route.hop_count = 1;
        route.refreshed_at = now;
        route.stale = false;

        let newly_reachable = if !was_reachable {
            changed = true;
            vec![peer]
        } else {
            Vec::new()
        };

        TopologyChange {
            changed,
            newly_reachable,
        }
    }

    /// Record that a handshake verified this peer's identity.
    pub fn mark_verified(&mut self, peer: &PeerId) -> bool {
        match self.peers.get_mut(peer) {
            Some(record) if !record.verified => {
                record.verified = true;
                true
            }
            _ => false,
        }
    }

    /// Link-layer loss of a direct neighbor: the record goes stale
    /// immediately, along with every route through it.
    pub fn on_neighbor_lost(&mut self, peer: &PeerId, now: DateTime<Utc>) -> TopologyChange {
        let mut changed = false;

        if let Some(record) = self.peers.get_mut(peer) {
            if record.state == PeerState::Active {
                record.state = PeerState::Stale;
                // Backdate so the eviction grace clock starts from the loss.
                record.last_seen = now - self.silence_window;
                changed = true;
                debug!("Neighbor lost: {}", peer.short());
            }
        }

        for route in self.routes.values_mut() {
            if route.next_hop == *peer && !route.stale {
                route.stale = true;
                changed = true;
            }
        }

        TopologyChange {
            changed,
            newly_reachable: Vec::new(),
        }
    }

    /// Merge a topology announcement from a direct neighbor.
    ///
    /// Accepted only when `announcement.sequence` is strictly newer than the
    /// last accepted sequence from that origin; hop counts are the announced
    /// value plus one; equal-length paths prefer the freshest information.
    pub fn on_announcement(
        &mut self,
        from: PeerId,
        announcement: &Announcement,
        now: DateTime<Utc>,
    ) -> TopologyChange {
        let last = self.origin_seqs.get(&from).copied().unwrap_or(0);
        if announcement.sequence <= last {
            trace!(
                "Rejecting stale announcement from {} (seq {} <= {})",
                from.short(),
                announcement.sequence,
                last
            );
            return TopologyChange::default();
        }
        self.origin_seqs.insert(from, announcement.sequence);

        let mut change = self.on_neighbor_seen(from, 1.0, now);

        for entry in &announcement.entries {
            let dest = entry.destination;
            if dest == self.local || dest == from {
                continue;
            }

            let hop_count = entry.hop_count.saturating_add(1);
            let was_reachable = self.is_reachable(&dest);

            let accept = match self.routes.get(&dest) {
                None => true,
                Some(existing) => {
                    existing.stale
                        // Distance-vector: the advertising next hop overrides
                        // its own previous advertisement.
                        || existing.next_hop == from
                        || hop_count < existing.hop_count
                        // Tie: the incoming path is the freshest.
                        || hop_count == existing.hop_count
                }
            };

            if !accept {
                continue;
            }

            self.routes.insert(
                dest,
                RouteEntry {
                    destination: dest,
                    next_hop: from,
                    hop_count,
                    refreshed_at: now,
                    stale: false,
                },
            );

            // Multi-hop peers get a Discovered record so the application can
            // list them; direct contact later upgrades it to Active.
            let record = self.peers.entry(dest).or_insert_with(|| PeerRecord {
                id: dest,
                state: PeerState::Discovered,
                last_seen: now,
                link_quality: 0.0,
                verified: false,
            });
            if record.state == PeerState::Stale {
                record.state = PeerState::Discovered;
            }
            record.last_seen = now;

            if !was_reachable {
                change.changed = true;
                change.newly_reachable.push(dest);
            }
        }

        change
    }

    /// Snapshot of currently reachable destinations.
    pub fn reachable_peers(&self) -> Vec<PeerId> {
        self.routes
            .values()
            .filter(|route| !route.stale)
            .map(|route| route.destination)
            .collect()
    }

    pub fn is_reachable(&self, dest: &PeerId) -> bool {
        self.routes.get(dest).map(|r| !r.stale).unwrap_or(false)
    }

    /// Direct neighbors currently in contact.
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|record| record.state == PeerState::Active)
            .map(|record| record.id)
            .collect()
    }

    pub fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .map(|record| record.state == PeerState::Active)
            .unwrap_or(false)
    }

    /// Next hop toward `dest`, if a usable route exists.
    pub fn next_hop(&self, dest: &PeerId) -> Option<PeerId> {
        let route = self.routes.get(dest).filter(|route| !route.stale)?;
        if self.is_neighbor(&route.next_hop) {
            Some(route.next_hop)
        } else {
            None
        }
    }

    /// Age out silent records: Active/Discovered go Stale past the silence
    /// window; Stale records past the grace period are evicted entirely.
    /// Returns whether the visible peer list changed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        for record in self.peers.values_mut() {
            if record.state != PeerState::Stale && now - record.last_seen > self.silence_window {
                debug!("Peer {} went stale", record.id.short());
                record.state = PeerState::Stale;
                if let Some(route) = self.routes.get_mut(&record.id) {
                    route.stale = true;
                }
                changed = true;
            }
        }

        // Routes through stale next hops are unusable.
        let stale_hops: Vec<PeerId> = self
            .peers
            .values()
            .filter(|r| r.state == PeerState::Stale)
            .map(|r| r.id)
            .collect();
        for route in self.routes.values_mut() {
            if !route.stale && stale_hops.contains(&route.next_hop) {
                route.stale = true;
                changed = true;
            }
        }

        let grace = self.silence_window + self.evict_grace;
        let evicted: Vec<PeerId> = self
            .peers
            .values()
            .filter(|record| record.state == PeerState::Stale && now - record.last_seen > grace)
            .map(|record| record.id)
            .collect();
        for peer in evicted {
            debug!("Evicting peer {}", peer.short());
            self.peers.remove(&peer);
            self.routes.remove(&peer);
            self.origin_seqs.remove(&peer);
            changed = true;
        }

        changed
    }

    /// Build this node's next topology announcement: one entry per live
    /// route, with a fresh per-origin sequence number.
    pub fn local_announcement(&mut self) -> Announcement {
        self.announce_seq += 1;
        let entries = self
            .routes
            .values()
            .filter(|route| !route.stale)
            .map(|route| AnnouncementEntry {
                destination: route.destination,
                hop_count: route.hop_count,
            })
            .collect();
        Announcement {
            sequence: self.announce_seq,
            entries,
        }
    }

    /// Application-facing peer list.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .values()
            .map(|record| PeerSnapshot {
                id: record.id,
                state: record.state,
                hop_count: self
                    .routes
                    .get(&record.id)
                    .filter(|route| !route.stale)
                    .map(|route| route.hop_count),
                link_quality: record.link_quality,
                verified: record.verified,
                last_seen: record.last_seen,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}
