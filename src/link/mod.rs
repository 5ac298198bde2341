//! Link-layer abstraction.
//!
//! The mesh engine talks to radios through `LinkTransport` and never sees
//! anything transport-specific: addresses are opaque strings, discovery and
//! inbound frames arrive on one event stream. A BLE implementation plugs in
//! behind the same trait; `MemoryHub` provides the in-process transport used
//! for tests and simulation.

mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use memory::{MemoryHub, MemoryLink};

/// Opaque transport-level address of a nearby device.
///
/// Distinct from `PeerId`: the engine learns which address speaks for which
/// identity from the sender field of received frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddr(pub String);

impl std::fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Something the link layer noticed
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A device came into range
    Discovered(LinkAddr),
    /// A device went out of range
    Lost(LinkAddr),
    /// An encoded frame arrived
    Frame { from: LinkAddr, bytes: Vec<u8> },
}

/// A radio (or radio stand-in) the mesh can run over.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Make this node visible to nearby devices.
    async fn advertise(&self) -> Result<()>;

    /// Start watching for devices and frames. The stream stays open for the
    /// life of the transport.
    async fn scan(&self) -> Result<BoxStream<'static, LinkEvent>>;

    /// Establish a connection to a discovered device.
    async fn connect(&self, addr: &LinkAddr) -> Result<()>;

    /// Send one encoded frame to a connected device.
    async fn send(&self, addr: &LinkAddr, bytes: &[u8]) -> Result<()>;
}
