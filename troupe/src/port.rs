//! Port abstraction consumed by channels.

use std::{
    any::Any,
    collections::HashMap,
    fmt::{self, Debug},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

use crate::{envelope::Packet, error::Error, queue::Queue};

/// Bidirectional, transferable-aware message port.
///
/// Posting is fire-and-forget; receiving is asynchronous. Closing
/// either half ends the conversation in both directions.
#[async_trait]
pub trait PortLike: Send + Sync {
    /// Post a packet to the peer.
    fn post(&self, packet: Packet) -> Result<(), Error>;

    /// Receive the next packet from the peer, FIFO.
    async fn recv(&self) -> Result<Packet, Error>;

    /// Close the port.
    fn close(&self);

    /// Returns `true` if the port is closed.
    fn is_closed(&self) -> bool;

    /// Downcast support for adapters that transfer concrete ports.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// A boxed port; the thing a channel owns and a packet can transfer.
pub struct Port(Box<dyn PortLike>);

static PAIR_FACTORY: OnceCell<fn() -> (Port, Port)> = OnceCell::new();

impl Port {
    /// Wrap a port implementation.
    pub fn new<P: PortLike + 'static>(inner: P) -> Self {
        Port(Box::new(inner))
    }

    /// Create two linked ports.
    ///
    /// Uses the installed pair factory when an adapter registered one
    /// (ports that must cross a real process boundary), in-process
    /// queue pairs otherwise.
    pub fn pair() -> (Port, Port) {
        match PAIR_FACTORY.get() {
            Some(factory) => factory(),
            None => Self::in_process_pair(),
        }
    }

    /// Create two linked in-process ports.
    pub fn in_process_pair() -> (Port, Port) {
        let left_to_right = Arc::new(Queue::new());
        let right_to_left = Arc::new(Queue::new());
        let left = Pair {
            outgoing: left_to_right.clone(),
            incoming: right_to_left.clone(),
        };
        let right = Pair {
            outgoing: right_to_left,
            incoming: left_to_right,
        };
        (Port::new(left), Port::new(right))
    }

    /// Install the pair factory used by [`Port::pair`].
    ///
    /// Called once by transport adapters whose ports can cross a real
    /// process boundary; later installations are ignored.
    pub fn install_pair_factory(factory: fn() -> (Port, Port)) {
        let _ = PAIR_FACTORY.set(factory);
    }

    pub fn post(&self, packet: Packet) -> Result<(), Error> {
        self.0.post(packet)
    }

    pub async fn recv(&self) -> Result<Packet, Error> {
        self.0.recv().await
    }

    pub fn close(&self) {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Unwrap the implementation, for adapters that transfer it.
    pub fn into_inner(self) -> Box<dyn PortLike> {
        self.0
    }
}

impl Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Port")
    }
}

/// In-process half of a port pair: two cross-wired packet queues.
struct Pair {
    outgoing: Arc<Queue<Packet>>,
    incoming: Arc<Queue<Packet>>,
}

#[async_trait]
impl PortLike for Pair {
    fn post(&self, packet: Packet) -> Result<(), Error> {
        self.outgoing.push(packet)
    }

    async fn recv(&self) -> Result<Packet, Error> {
        self.incoming.pop().await
    }

    fn close(&self) {
        self.outgoing.close();
        self.incoming.close();
    }

    fn is_closed(&self) -> bool {
        self.incoming.is_closed()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.close();
    }
}

type Bus = Vec<Weak<Queue<Packet>>>;

static BUSES: Lazy<Mutex<HashMap<String, Bus>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Member port of a named broadcast bus.
///
/// Posting delivers a copy of the envelope to every other live member;
/// the member's own queue never sees its own posts. Transferables are
/// refused, the bus has no side channel to move them through.
pub(crate) struct Broadcast {
    name: String,
    incoming: Arc<Queue<Packet>>,
}

impl Broadcast {
    pub fn join(name: &str) -> Self {
        let incoming = Arc::new(Queue::new());
        BUSES
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(Arc::downgrade(&incoming));
        Broadcast {
            name: name.to_string(),
            incoming,
        }
    }
}

#[async_trait]
impl PortLike for Broadcast {
    fn post(&self, packet: Packet) -> Result<(), Error> {
        if self.incoming.is_closed() {
            return Err(Error::Closed);
        }
        if !packet.transfers.is_empty() {
            return Err(Error::Unsupported("transferables on a broadcast bus"));
        }
        let mut buses = BUSES.lock();
        if let Some(members) = buses.get_mut(&self.name) {
            members.retain(|member| {
                let Some(member) = member.upgrade() else {
                    return false;
                };
                if !Arc::ptr_eq(&member, &self.incoming) {
                    let _ = member.push(Packet::plain(packet.envelope.clone()));
                }
                true
            });
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Packet, Error> {
        self.incoming.pop().await
    }

    fn close(&self) {
        self.incoming.close();
        let mut buses = BUSES.lock();
        if let Some(members) = buses.get_mut(&self.name) {
            members.retain(|member| match member.upgrade() {
                Some(member) => !Arc::ptr_eq(&member, &self.incoming),
                None => false,
            });
            if members.is_empty() {
                buses.remove(&self.name);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.incoming.is_closed()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl Drop for Broadcast {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use crate::envelope::{Envelope, Packet, Plain, Transferable};

    use super::Port;

    #[cfg(target_arch = "wasm32")]
    use wasm_bindgen_test::{wasm_bindgen_test, wasm_bindgen_test_configure};
    #[cfg(target_arch = "wasm32")]
    wasm_bindgen_test_configure!(run_in_browser);

    fn number(value: i64) -> Packet {
        Packet::plain(Envelope::Plain(Plain::Int(value)))
    }

    async fn test_pair_inner() {
        let (left, right) = Port::in_process_pair();

        left.post(number(1)).unwrap();
        left.post(number(2)).unwrap();
        right.post(number(3)).unwrap();

        assert_eq!(right.recv().await.unwrap().envelope, number(1).envelope);
        assert_eq!(right.recv().await.unwrap().envelope, number(2).envelope);
        assert_eq!(left.recv().await.unwrap().envelope, number(3).envelope);
    }

    async fn test_close_inner() {
        let (left, right) = Port::in_process_pair();

        left.post(number(1)).unwrap();
        left.close();

        assert!(right.recv().await.is_ok());
        assert!(right.recv().await.is_err());
        assert!(right.post(number(2)).is_err());
    }

    async fn test_transfer_inner() {
        let (left, right) = Port::in_process_pair();
        let (inner, _keep) = Port::in_process_pair();

        let mut packet = number(7);
        packet.transfers.push(Transferable::Port(inner));
        left.post(packet).unwrap();

        let received = right.recv().await.unwrap();
        assert_eq!(received.transferables().len(), 1);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_pair() {
        test_pair_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_close() {
        test_close_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_transfer() {
        test_transfer_inner().await
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    async fn test_pair() {
        test_pair_inner().await
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    async fn test_close() {
        test_close_inner().await
    }
}
