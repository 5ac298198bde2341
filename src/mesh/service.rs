//! The engine task.
//!
//! `MeshService` runs the event loop: commands from the application, events
//! from the link layer, and three timers (topology announcements, the sweep,
//! and the advertise refresh). Nothing in frame handling may kill the task;
//! bad input is logged and dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::config::MeshConfig;
use crate::crypto::{Identity, ReplayLog, SessionManager};
use crate::error::{MeshError, Result};
use crate::link::{LinkAddr, LinkEvent, LinkTransport};
use crate::protocol::{
    AckPayload, Announcement, DataPayload, Frame, FrameType, HandshakePayload, MeshMessage,
    MessageId, PeerId, TAG_LEN,
};
use crate::routing::{Disposition, ForwardQueue, RequeueResult, RouteOrigin, Router};
use crate::topology::{PeerSnapshot, TopologyTracker};

use super::{Command, MeshEvent, MeshHandle};

const COMMAND_BUFFER: usize = 64;

/// One running mesh node.
pub struct MeshService {
    config: MeshConfig,
    local_id: PeerId,
    sessions: SessionManager,
    topology: TopologyTracker,
    router: Router,
    queue: ForwardQueue,
    transport: Arc<dyn LinkTransport>,

    // Transport addresses are bound to identities by the sender field of
    // link-local frames (handshake, topology).
    addr_to_peer: HashMap<LinkAddr, PeerId>,
    peer_to_addr: HashMap<PeerId, LinkAddr>,
    connected: HashSet<LinkAddr>,

    session_idle: chrono::Duration,
    events: mpsc::UnboundedSender<MeshEvent>,
    peer_cache: Arc<RwLock<Vec<PeerSnapshot>>>,
}

impl MeshService {
    /// Start a node with an in-memory replay log.
    pub async fn spawn(
        config: MeshConfig,
        identity: Identity,
        transport: Arc<dyn LinkTransport>,
    ) -> Result<(MeshHandle, mpsc::UnboundedReceiver<MeshEvent>)> {
        Self::spawn_with_replay(config, identity, ReplayLog::in_memory(), transport).await
    }

    /// Start a node; replay floors persist through `replay`.
    ///
    /// The returned handle submits work to the engine task; the receiver
    /// carries [`MeshEvent`]s until shutdown.
    pub async fn spawn_with_replay(
        config: MeshConfig,
        identity: Identity,
        replay: ReplayLog,
        transport: Arc<dyn LinkTransport>,
    ) -> Result<(MeshHandle, mpsc::UnboundedReceiver<MeshEvent>)> {
        let local_id = identity.peer_id();
        let link_events = transport.scan().await?;
        transport.advertise().await?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peer_cache = Arc::new(RwLock::new(Vec::new()));

        let chrono_or_zero = |d: std::time::Duration| {
            chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
        };

        let service = MeshService {
            local_id,
            sessions: SessionManager::new(identity, replay),
            topology: TopologyTracker::new(
                local_id,
                chrono_or_zero(config.silence_window),
                chrono_or_zero(config.evict_grace),
            ),
            router: Router::new(local_id, config.dedup_cache_size),
            queue: ForwardQueue::new(
                config.queue_max_bytes,
                config.queue_max_destination_bytes,
                chrono_or_zero(config.queue_retention),
                config.max_retries,
            ),
            transport,
            addr_to_peer: HashMap::new(),
            peer_to_addr: HashMap::new(),
            connected: HashSet::new(),
            session_idle: chrono_or_zero(config.session_idle_timeout),
            events: event_tx,
            peer_cache: Arc::clone(&peer_cache),
            config,
        };

        info!("Mesh node {} starting", local_id.short());
        tokio::spawn(service.run(command_rx, link_events));

        Ok((
            MeshHandle::new(local_id, command_tx, peer_cache),
            event_rx,
        ))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_events: BoxStream<'static, LinkEvent>,
    ) {
        let mut announce = tokio::time::interval(self.config.announce_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        let mut advertise = tokio::time::interval(self.config.advertise_interval);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { destination, plaintext, reply }) => {
                        let _ = reply.send(self.handle_send(destination, plaintext).await);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = link_events.next() => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => {
                        warn!("Link event stream closed; stopping");
                        break;
                    }
                },
                _ = announce.tick() => self.broadcast_announcement().await,
                _ = sweep.tick() => self.run_sweep(Utc::now()),
                _ = advertise.tick() => {
                    // Radios drop advertisements over time; keep ours alive.
                    if let Err(e) = self.transport.advertise().await {
                        warn!("Advertise refresh failed: {e}");
                    }
                }
            }
        }

        info!("Mesh node {} stopped", self.local_id.short());
    }

    /// Encrypt and route a locally submitted message.
    async fn handle_send(&mut self, destination: PeerId, plaintext: Vec<u8>) -> Result<MessageId> {
        let sealed = self.sessions.encrypt(&destination, &plaintext)?;
        let id = MessageId::for_data(&self.local_id, sealed.counter, &sealed.ciphertext);
        let payload = DataPayload {
            destination,
            epoch_pub: sealed.epoch_pub,
            counter: sealed.counter,
            ciphertext: sealed.ciphertext,
        };

        let message = MeshMessage {
            id,
            frame_type: FrameType::Data,
            sender: self.local_id,
            destination,
            ttl: self.config.max_ttl,
            payload: payload.encode(),
            tag: sealed.tag,
            created_at: Utc::now(),
        };

        self.route_and_execute(message, RouteOrigin::Local).await?;
        Ok(id)
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Discovered(addr) => self.handle_discovered(addr).await,
            LinkEvent::Lost(addr) => self.handle_lost(addr),
            LinkEvent::Frame { from, bytes } => self.handle_frame(from, &bytes).await,
        }
    }

    /// A device came into range: connect and introduce ourselves with a
    /// topology announcement so it learns our identity.
    async fn handle_discovered(&mut self, addr: LinkAddr) {
        debug!("Discovered {addr}");
        if let Err(e) = self.transport.connect(&addr).await {
            warn!("Connect to {addr} failed: {e}");
            return;
        }
        self.connected.insert(addr.clone());
        self.send_announcement_to(&addr).await;
    }

    fn handle_lost(&mut self, addr: LinkAddr) {
        debug!("Lost {addr}");
        self.connected.remove(&addr);
        let Some(peer) = self.addr_to_peer.remove(&addr) else {
            return;
        };
        self.peer_to_addr.remove(&peer);

        // Any in-flight handshake or session dies with the link; replay
        // floors survive in the log.
        self.sessions.teardown(&peer);
        let change = self.topology.on_neighbor_lost(&peer, Utc::now());
        if change.changed {
            self.publish_peer_list();
        }
    }

    async fn handle_frame(&mut self, from: LinkAddr, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(MeshError::ProtocolMismatch { remote, .. }) => {
                let peer = self.addr_to_peer.get(&from).copied();
                warn!("Incompatible protocol version {remote} from {from}");
                self.emit(MeshEvent::IncompatiblePeer {
                    peer,
                    remote_version: remote,
                });
                return;
            }
            Err(e) => {
                warn!("Dropping malformed frame from {from}: {e}");
                return;
            }
        };

        match frame.frame_type {
            FrameType::Topology => self.handle_topology_frame(from, frame).await,
            FrameType::Handshake => self.handle_handshake_frame(from, frame).await,
            FrameType::Data | FrameType::Ack => self.handle_routed_frame(from, frame).await,
        }
    }

    /// Topology frames are link-local: the frame sender is the neighbor on
    /// the other end of `from`, which is what lets us bind the address.
    async fn handle_topology_frame(&mut self, from: LinkAddr, frame: Frame) {
        let announcement = match Announcement::decode(&frame.payload) {
            Ok(announcement) => announcement,
            Err(e) => {
                warn!("Bad announcement from {from}: {e}");
                return;
            }
        };

        self.bind(from, frame.sender);
        let change = self
            .topology
            .on_announcement(frame.sender, &announcement, Utc::now());

        // Tiebreak for crossed handshakes: the lower id initiates.
        if self.local_id < frame.sender && !self.sessions.is_verified(&frame.sender) {
            self.initiate_handshake(frame.sender).await;
        }

        if change.changed {
            self.publish_peer_list();
        }
        for destination in change.newly_reachable {
            self.flush_queue_for(destination).await;
        }
    }

    async fn handle_handshake_frame(&mut self, from: LinkAddr, frame: Frame) {
        let payload = match HandshakePayload::decode(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad handshake from {from}: {e}");
                return;
            }
        };

        self.bind(from.clone(), frame.sender);

        // A handshake frame makes its sender a one-hop neighbor exactly as a
        // topology frame would, so reachability changes are handled the same
        // way: publish and flush whatever was parked for it.
        let change = self.topology.on_neighbor_seen(frame.sender, 1.0, Utc::now());
        let mut list_changed = change.changed;

        match self.sessions.handshake_receive(&frame.sender, &payload) {
            Ok(response) => {
                list_changed |= self.topology.mark_verified(&frame.sender);
                if let Some(response) = response {
                    self.send_handshake(&from, frame.sender, response).await;
                }
            }
            Err(MeshError::ProtocolMismatch { remote, .. }) => {
                warn!(
                    "Peer {} speaks protocol version {remote}; ignoring",
                    frame.sender.short()
                );
                self.emit(MeshEvent::IncompatiblePeer {
                    peer: Some(frame.sender),
                    remote_version: remote,
                });
            }
            Err(e) => {
                warn!("Handshake with {} failed: {e}", frame.sender.short());
            }
        }

        if list_changed {
            self.publish_peer_list();
        }
        for destination in change.newly_reachable {
            self.flush_queue_for(destination).await;
        }
    }

    /// Data and ack frames go through the router. The originator in the
    /// frame header is not the link neighbor, so the relay origin comes from
    /// the address binding.
    async fn handle_routed_frame(&mut self, from: LinkAddr, frame: Frame) {
        let destination = match frame.frame_type {
            FrameType::Data => DataPayload::decode(&frame.payload).map(|p| p.destination),
            _ => AckPayload::decode(&frame.payload).map(|p| p.destination),
        };
        let destination = match destination {
            Ok(destination) => destination,
            Err(e) => {
                warn!("Dropping unparseable payload from {from}: {e}");
                return;
            }
        };

        let relay = self.addr_to_peer.get(&from).copied().unwrap_or(frame.sender);
        let message = MeshMessage {
            id: frame.message_id,
            frame_type: frame.frame_type,
            sender: frame.sender,
            destination,
            ttl: frame.ttl,
            payload: frame.payload,
            tag: frame.tag,
            created_at: Utc::now(),
        };

        if let Err(e) = self
            .route_and_execute(message, RouteOrigin::Remote { from: relay })
            .await
        {
            debug!("Routing failed for frame from {from}: {e}");
        }
    }

    /// Run the router and carry out its decision.
    async fn route_and_execute(&mut self, message: MeshMessage, origin: RouteOrigin) -> Result<()> {
        let disposition = self.router.route(&message, origin, &self.topology);
        trace!(
            "Routed {} ({:?}): {:?}",
            message.id.short(),
            origin,
            disposition
        );

        match disposition {
            Disposition::Deliver => self.deliver(message).await,
            Disposition::Forward { next_hop } => {
                let ttl = self.relay_ttl(&message, origin);
                self.send_to_peer(&next_hop, &message.to_frame(ttl)).await;
                Ok(())
            }
            Disposition::Flood { exclude } => {
                let ttl = self.relay_ttl(&message, origin);
                let frame = message.to_frame(ttl);
                let targets: Vec<PeerId> = self
                    .topology
                    .neighbors()
                    .into_iter()
                    .filter(|peer| Some(*peer) != exclude && *peer != message.sender)
                    .collect();
                for peer in targets {
                    self.send_to_peer(&peer, &frame).await;
                }
                Ok(())
            }
            Disposition::Enqueue => {
                let evicted = self.queue.enqueue(message)?;
                self.report_expired(evicted);
                Ok(())
            }
            Disposition::Drop(reason) => {
                trace!("Dropped {}: {:?}", message.id.short(), reason);
                Ok(())
            }
        }
    }

    /// Remaining hop budget to stamp on an outgoing frame: relays spend a
    /// hop, the originator does not.
    fn relay_ttl(&self, message: &MeshMessage, origin: RouteOrigin) -> u8 {
        match origin {
            RouteOrigin::Remote { .. } => message.ttl.saturating_sub(1),
            RouteOrigin::Local | RouteOrigin::Queue => message.ttl,
        }
    }

    /// A message addressed to this node: decrypt (data) or resolve (ack),
    /// then notify the application. Delivered data is acknowledged back to
    /// its sender through normal routing.
    async fn deliver(&mut self, message: MeshMessage) -> Result<()> {
        match message.frame_type {
            FrameType::Data => {
                let payload = DataPayload::decode(&message.payload)?;
                let plaintext = match self.sessions.decrypt(
                    &message.sender,
                    &payload.epoch_pub,
                    payload.counter,
                    &payload.ciphertext,
                    &message.tag,
                ) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        warn!(
                            "Rejected message {} from {}: {e}",
                            message.id.short(),
                            message.sender.short()
                        );
                        return Ok(());
                    }
                };

                debug!(
                    "Delivered {} from {}",
                    message.id.short(),
                    message.sender.short()
                );
                self.emit(MeshEvent::MessageDelivered {
                    from: message.sender,
                    id: message.id,
                    payload: plaintext,
                });

                if message.sender != self.local_id {
                    self.send_ack(message.sender, message.id).await;
                }
                Ok(())
            }
            FrameType::Ack => {
                let payload = AckPayload::decode(&message.payload)?;
                debug!("Acked {}", payload.acked.short());
                self.emit(MeshEvent::MessageAcked { id: payload.acked });
                Ok(())
            }
            // Link-local frame types never reach the router.
            FrameType::Handshake | FrameType::Topology => Ok(()),
        }
    }

    /// Confirm end-to-end receipt back to the originator.
    async fn send_ack(&mut self, to: PeerId, acked: MessageId) {
        let payload = AckPayload {
            destination: to,
            acked,
        };
        let message = MeshMessage {
            id: MessageId::for_ack(&self.local_id, &acked),
            frame_type: FrameType::Ack,
            sender: self.local_id,
            destination: to,
            ttl: self.config.max_ttl,
            payload: payload.encode(),
            tag: [0u8; TAG_LEN],
            created_at: Utc::now(),
        };
        // Boxed: acks re-enter the routing path that called us.
        if let Err(e) = Box::pin(self.route_and_execute(message, RouteOrigin::Local)).await {
            debug!("Ack toward {} not routed: {e}", to.short());
        }
    }

    /// A destination became reachable: drain its queued messages in creation
    /// order. Entries that still cannot be routed go back with one retry
    /// spent; an exhausted entry expires.
    async fn flush_queue_for(&mut self, destination: PeerId) {
        let entries = self.queue.flush(&destination);
        if entries.is_empty() {
            return;
        }
        debug!(
            "Flushing {} queued message(s) for {}",
            entries.len(),
            destination.short()
        );

        for entry in entries {
            let disposition = self
                .router
                .route(&entry.message, RouteOrigin::Queue, &self.topology);
            match disposition {
                Disposition::Enqueue => {
                    let id = entry.message.id;
                    match self.queue.requeue(entry) {
                        Ok(RequeueResult::Queued { evicted }) => self.report_expired(evicted),
                        Ok(RequeueResult::Exhausted) => {
                            self.emit(MeshEvent::MessageExpired { id });
                        }
                        Err(e) => warn!("Requeue failed: {e}"),
                    }
                }
                other => {
                    let message = entry.message;
                    if let Err(e) = self.execute_flushed(message, other).await {
                        warn!("Queued message not routed: {e}");
                    }
                }
            }
        }
    }

    /// Execute a non-enqueue disposition for a flushed entry.
    async fn execute_flushed(
        &mut self,
        message: MeshMessage,
        disposition: Disposition,
    ) -> Result<()> {
        match disposition {
            Disposition::Deliver => self.deliver(message).await,
            Disposition::Forward { next_hop } => {
                let frame = message.to_frame(message.ttl);
                self.send_to_peer(&next_hop, &frame).await;
                Ok(())
            }
            Disposition::Flood { exclude } => {
                let frame = message.to_frame(message.ttl);
                let targets: Vec<PeerId> = self
                    .topology
                    .neighbors()
                    .into_iter()
                    .filter(|peer| Some(*peer) != exclude)
                    .collect();
                for peer in targets {
                    self.send_to_peer(&peer, &frame).await;
                }
                Ok(())
            }
            Disposition::Enqueue => Ok(()),
            Disposition::Drop(reason) => {
                trace!("Dropped flushed {}: {:?}", message.id.short(), reason);
                Ok(())
            }
        }
    }

    async fn initiate_handshake(&mut self, peer: PeerId) {
        let Some(addr) = self.peer_to_addr.get(&peer).cloned() else {
            return;
        };
        match self.sessions.handshake_init(&peer) {
            Ok(payload) => {
                debug!("Initiating handshake with {}", peer.short());
                self.send_handshake(&addr, peer, payload).await;
            }
            Err(e) => warn!("Cannot start handshake with {}: {e}", peer.short()),
        }
    }

    async fn send_handshake(&mut self, addr: &LinkAddr, peer: PeerId, payload: HandshakePayload) {
        let encoded = payload.encode();
        let frame = Frame::control(
            FrameType::Handshake,
            self.local_id,
            MessageId::for_data(&self.local_id, u64::from(payload.flags), &encoded),
            1,
            encoded,
        );
        if let Err(e) = self.transport.send(addr, &frame.encode()).await {
            warn!("Handshake frame to {} failed: {e}", peer.short());
        }
    }

    /// Broadcast our current route table to every connected device.
    async fn broadcast_announcement(&mut self) {
        let announcement = self.topology.local_announcement();
        let payload = announcement.encode();
        let frame = Frame::control(
            FrameType::Topology,
            self.local_id,
            MessageId::for_data(&self.local_id, announcement.sequence, &payload),
            1,
            payload,
        );
        let encoded = frame.encode();

        for addr in self.connected.clone() {
            if let Err(e) = self.transport.send(&addr, &encoded).await {
                trace!("Announcement to {addr} failed: {e}");
            }
        }
    }

    async fn send_announcement_to(&mut self, addr: &LinkAddr) {
        let announcement = self.topology.local_announcement();
        let payload = announcement.encode();
        let frame = Frame::control(
            FrameType::Topology,
            self.local_id,
            MessageId::for_data(&self.local_id, announcement.sequence, &payload),
            1,
            payload,
        );
        if let Err(e) = self.transport.send(addr, &frame.encode()).await {
            trace!("Announcement to {addr} failed: {e}");
        }
    }

    /// Periodic maintenance: topology aging, queue expiry, idle sessions.
    fn run_sweep(&mut self, now: DateTime<Utc>) {
        if self.topology.sweep(now) {
            self.publish_peer_list();
        }
        let expired = self.queue.expire(now);
        self.report_expired(expired);
        self.sessions.sweep_idle(now, self.session_idle);
    }

    async fn send_to_peer(&mut self, peer: &PeerId, frame: &Frame) {
        let Some(addr) = self.peer_to_addr.get(peer).cloned() else {
            debug!("No link address for {}", peer.short());
            return;
        };
        if let Err(e) = self.transport.send(&addr, &frame.encode()).await {
            warn!("Send to {} failed: {e}", peer.short());
        }
    }

    fn bind(&mut self, addr: LinkAddr, peer: PeerId) {
        self.connected.insert(addr.clone());
        if let Some(previous) = self.addr_to_peer.insert(addr.clone(), peer) {
            if previous != peer {
                self.peer_to_addr.remove(&previous);
            }
        }
        self.peer_to_addr.insert(peer, addr);
    }

    fn report_expired(&mut self, ids: Vec<MessageId>) {
        for id in ids {
            self.emit(MeshEvent::MessageExpired { id });
        }
    }

    fn publish_peer_list(&mut self) {
        let snapshot = self.topology.snapshot();
        *self.peer_cache.write() = snapshot.clone();
        self.emit(MeshEvent::PeerListChanged { peers: snapshot });
    }

    fn emit(&self, event: MeshEvent) {
        // A dropped receiver means the application stopped listening.
        let _ = self.events.send(event);
    }
}
