//! The mesh engine.
//!
//! One tokio task owns every piece of mutable state (topology, router, queue,
//! sessions, address bindings) and is fed through channels; the rest of the
//! crate is passive data structures. Applications talk to the task through
//! [`MeshHandle`] and listen on the [`MeshEvent`] receiver.

mod service;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::error::{MeshError, Result};
use crate::protocol::{MessageId, PeerId};
use crate::topology::PeerSnapshot;

pub use service::MeshService;

/// Notifications delivered to the application
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A message addressed to this node was decrypted and verified
    MessageDelivered {
        from: PeerId,
        id: MessageId,
        payload: Vec<u8>,
    },
    /// The destination confirmed end-to-end receipt of a message we sent
    MessageAcked { id: MessageId },
    /// A queued message was dropped before it could be delivered
    MessageExpired { id: MessageId },
    /// The set of known peers or their reachability changed
    PeerListChanged { peers: Vec<PeerSnapshot> },
    /// A nearby device speaks an incompatible protocol version
    IncompatiblePeer {
        peer: Option<PeerId>,
        remote_version: u8,
    },
}

pub(crate) enum Command {
    Send {
        destination: PeerId,
        plaintext: Vec<u8>,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    Shutdown,
}

/// Cloneable application-side handle to a running mesh node.
#[derive(Clone)]
pub struct MeshHandle {
    local_id: PeerId,
    commands: mpsc::Sender<Command>,
    peers: Arc<RwLock<Vec<PeerSnapshot>>>,
}

impl MeshHandle {
    pub(crate) fn new(
        local_id: PeerId,
        commands: mpsc::Sender<Command>,
        peers: Arc<RwLock<Vec<PeerSnapshot>>>,
    ) -> Self {
        Self {
            local_id,
            commands,
            peers,
        }
    }

    /// Submit a message for end-to-end encrypted delivery.
    ///
    /// Returns as soon as the engine has accepted the message; delivery
    /// confirmation arrives later as [`MeshEvent::MessageAcked`]. An
    /// unreachable destination is not an error here: the message is parked
    /// in the store-and-forward queue.
    pub async fn send(&self, destination: PeerId, plaintext: Vec<u8>) -> Result<MessageId> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                destination,
                plaintext,
                reply,
            })
            .await
            .map_err(|_| MeshError::EngineStopped)?;
        response.await.map_err(|_| MeshError::EngineStopped)?
    }

    /// Latest peer list snapshot. Cheap; does not round-trip to the engine.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.peers.read().clone()
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Stop the engine task. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}
