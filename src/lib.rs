//! Peer-to-peer mesh communication core.
//!
//! A node discovers nearby devices over a link transport, exchanges
//! end-to-end encrypted messages, relays traffic for others over multiple
//! hops, and parks messages for currently unreachable peers in a
//! store-and-forward queue.
//!
//! The pieces:
//!
//! - [`protocol`]: the binary frame format and typed payloads
//! - [`crypto`]: identities, per-peer sessions, handshake, replay protection
//! - [`topology`]: peer lifecycle and distance-vector route learning
//! - [`routing`]: forwarding decisions and the forward queue
//! - [`link`]: the transport seam and an in-memory implementation
//! - [`mesh`]: the engine task tying everything together
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshphone::{Identity, MemoryHub, MeshConfig, MeshService};
//!
//! # async fn demo() -> meshphone::Result<()> {
//! let hub = MemoryHub::new();
//! let identity = Identity::generate()?;
//! let transport = Arc::new(hub.attach("node-a"));
//! let (handle, mut events) = MeshService::spawn(
//!     MeshConfig::default(),
//!     identity,
//!     transport,
//! ).await?;
//!
//! let peer = handle.peers().first().map(|p| p.id);
//! if let Some(peer) = peer {
//!     handle.send(peer, b"hello".to_vec()).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod link;
pub mod mesh;
pub mod protocol;
pub mod routing;
pub mod topology;

pub use config::MeshConfig;
pub use crypto::{Identity, ReplayLog};
pub use error::{MeshError, Result};
pub use link::{LinkAddr, LinkEvent, LinkTransport, MemoryHub, MemoryLink};
pub use mesh::{MeshEvent, MeshHandle, MeshService};
pub use protocol::{MessageId, PeerId};
pub use topology::{PeerSnapshot, PeerState};
