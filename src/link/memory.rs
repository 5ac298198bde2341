//! In-process transport for tests and simulation.
//!
//! A `MemoryHub` stands in for the radio environment: it owns an explicit
//! adjacency graph, and each attached `MemoryLink` only sees the devices the
//! hub has placed in its range. Frames are delivered instantly; range changes
//! surface as `Discovered`/`Lost` events, exactly as a radio scan would.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use log::trace;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{MeshError, Result};

use super::{LinkAddr, LinkEvent, LinkTransport};

struct HubInner {
    senders: Mutex<HashMap<LinkAddr, mpsc::UnboundedSender<LinkEvent>>>,
    adjacency: Mutex<HashMap<LinkAddr, HashSet<LinkAddr>>>,
}

impl HubInner {
    fn deliver(&self, to: &LinkAddr, event: LinkEvent) {
        if let Some(sender) = self.senders.lock().get(to) {
            // A dropped receiver just means the node shut down.
            let _ = sender.send(event);
        }
    }

    fn in_range(&self, a: &LinkAddr, b: &LinkAddr) -> bool {
        self.adjacency
            .lock()
            .get(a)
            .map(|set| set.contains(b))
            .unwrap_or(false)
    }
}

/// Simulated radio environment shared by a set of `MemoryLink`s.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                senders: Mutex::new(HashMap::new()),
                adjacency: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a node and hand back its transport endpoint.
    pub fn attach(&self, addr: impl Into<String>) -> MemoryLink {
        let addr = LinkAddr(addr.into());
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.senders.lock().insert(addr.clone(), tx);
        MemoryLink {
            addr,
            hub: Arc::clone(&self.inner),
            events: Mutex::new(Some(rx)),
        }
    }

    /// Bring two nodes into range of each other. Both sides hear
    /// `Discovered`.
    pub fn join(&self, a: impl Into<String>, b: impl Into<String>) {
        let a = LinkAddr(a.into());
        let b = LinkAddr(b.into());
        {
            let mut adjacency = self.inner.adjacency.lock();
            adjacency.entry(a.clone()).or_default().insert(b.clone());
            adjacency.entry(b.clone()).or_default().insert(a.clone());
        }
        self.inner.deliver(&a, LinkEvent::Discovered(b.clone()));
        self.inner.deliver(&b, LinkEvent::Discovered(a));
    }

    /// Take two nodes out of range. Both sides hear `Lost`.
    pub fn sever(&self, a: impl Into<String>, b: impl Into<String>) {
        let a = LinkAddr(a.into());
        let b = LinkAddr(b.into());
        {
            let mut adjacency = self.inner.adjacency.lock();
            if let Some(set) = adjacency.get_mut(&a) {
                set.remove(&b);
            }
            if let Some(set) = adjacency.get_mut(&b) {
                set.remove(&a);
            }
        }
        self.inner.deliver(&a, LinkEvent::Lost(b.clone()));
        self.inner.deliver(&b, LinkEvent::Lost(a));
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's endpoint on a `MemoryHub`.
pub struct MemoryLink {
    addr: LinkAddr,
    hub: Arc<HubInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl MemoryLink {
    pub fn addr(&self) -> &LinkAddr {
        &self.addr
    }
}

#[async_trait]
impl LinkTransport for MemoryLink {
    async fn advertise(&self) -> Result<()> {
        trace!("{} advertising", self.addr);
        Ok(())
    }

    async fn scan(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let rx = self
            .events
            .lock()
            .take()
            .ok_or_else(|| MeshError::Link("scan may only be started once".into()))?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }

    async fn connect(&self, addr: &LinkAddr) -> Result<()> {
        if self.hub.in_range(&self.addr, addr) {
            Ok(())
        } else {
            Err(MeshError::Link(format!("{addr} is out of range")))
        }
    }

    async fn send(&self, addr: &LinkAddr, bytes: &[u8]) -> Result<()> {
        if !self.hub.in_range(&self.addr, addr) {
            return Err(MeshError::Link(format!("{addr} is out of range")));
        }
        self.hub.deliver(
            addr,
            LinkEvent::Frame {
                from: self.addr.clone(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn join_emits_discovered_on_both_sides() {
        let hub = MemoryHub::new();
        let a = hub.attach("a");
        let b = hub.attach("b");
        let mut a_events = a.scan().await.unwrap();
        let mut b_events = b.scan().await.unwrap();

        hub.join("a", "b");

        match a_events.next().await.unwrap() {
            LinkEvent::Discovered(addr) => assert_eq!(addr, LinkAddr::from("b")),
            other => panic!("unexpected event: {other:?}"),
        }
        match b_events.next().await.unwrap() {
            LinkEvent::Discovered(addr) => assert_eq!(addr, LinkAddr::from("a")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_only_cross_adjacent_links() {
        let hub = MemoryHub::new();
        let a = hub.attach("a");
        let b = hub.attach("b");
        let _c = hub.attach("c");
        let mut b_events = b.scan().await.unwrap();

        hub.join("a", "b");
        b_events.next().await; // Discovered

        a.send(&LinkAddr::from("b"), b"hello").await.unwrap();
        match b_events.next().await.unwrap() {
            LinkEvent::Frame { from, bytes } => {
                assert_eq!(from, LinkAddr::from("a"));
                assert_eq!(bytes, b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // No adjacency, no delivery.
        assert!(a.send(&LinkAddr::from("c"), b"nope").await.is_err());
    }

    #[tokio::test]
    async fn sever_emits_lost() {
        let hub = MemoryHub::new();
        let a = hub.attach("a");
        let _b = hub.attach("b");
        let mut a_events = a.scan().await.unwrap();

        hub.join("a", "b");
        a_events.next().await; // Discovered
        hub.sever("a", "b");

        match a_events.next().await.unwrap() {
            LinkEvent::Lost(addr) => assert_eq!(addr, LinkAddr::from("b")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(a.connect(&LinkAddr::from("b")).await.is_err());
    }
}
