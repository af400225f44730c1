//! Ordered duplex of values over a port, codec-aware.

use std::{
    fmt::{self, Debug},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::{future::BoxFuture, stream::FusedStream, Stream};
use parking_lot::Mutex;

use crate::{
    error::Error,
    live::Live,
    port::{Broadcast, Port},
    queue::Queue,
    wire::Wire,
};

enum Flavor {
    /// Port plus wire: values are encoded into packets and back.
    Wired { port: Port, wire: Wire },
    /// In-process queue: what is sent is what is received, no
    /// serialization.
    Local { queue: Arc<Queue<Live>> },
}

/// Ordered duplex of values.
///
/// Sending is fire-and-forget; receiving is asynchronous and strictly
/// FIFO. A channel is itself a value: sending one across another
/// channel moves it (port-backed channels only).
pub struct Channel {
    flavor: Flavor,
}

impl Channel {
    /// Channel over a port, encoding through the given wire.
    pub fn new(port: Port, wire: Wire) -> Self {
        Channel {
            flavor: Flavor::Wired { port, wire },
        }
    }

    /// Two linked channels over a freshly created port pair.
    pub fn pair(wire: &Wire) -> (Channel, Channel) {
        let (left, right) = Port::pair();
        (
            Channel::new(left, wire.clone()),
            Channel::new(right, wire.clone()),
        )
    }

    /// Channel on a named broadcast bus.
    ///
    /// Every value sent is received by every other channel joined to
    /// the same name; transferables cannot ride a bus.
    pub fn broadcast(name: &str, wire: &Wire) -> Channel {
        Channel::new(Port::new(Broadcast::join(name)), wire.clone())
    }

    /// Channel wrapping an in-process queue as sender and receiver.
    ///
    /// No serialization happens; sent values come back out of the same
    /// queue.
    pub fn from_queue(queue: Arc<Queue<Live>>) -> Channel {
        Channel {
            flavor: Flavor::Local { queue },
        }
    }

    /// Send a value.
    ///
    /// Encoding errors are fatal to this send only; nothing is written
    /// on failure.
    pub fn send(&self, value: Live) -> Result<(), Error> {
        match &self.flavor {
            Flavor::Wired { port, wire } => {
                let packet = wire.encode(value)?;
                port.post(packet)
            }
            Flavor::Local { queue } => queue.push(value),
        }
    }

    /// Receive the next value, FIFO.
    pub async fn recv(&self) -> Result<Live, Error> {
        match &self.flavor {
            Flavor::Wired { port, wire } => {
                let packet = port.recv().await?;
                wire.decode(packet)
            }
            Flavor::Local { queue } => queue.pop().await,
        }
    }

    /// Close the channel, signalling end-of-stream to consumers on
    /// both sides.
    pub fn close(&self) {
        match &self.flavor {
            Flavor::Wired { port, .. } => port.close(),
            Flavor::Local { queue } => queue.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.flavor {
            Flavor::Wired { port, .. } => port.is_closed(),
            Flavor::Local { queue } => queue.is_closed(),
        }
    }

    /// Stream of received values.
    ///
    /// Ends when the channel closes; errors other than closure are
    /// skipped.
    pub fn stream(&self) -> Messages<'_> {
        Messages {
            channel: self,
            future: None,
            terminated: false,
        }
    }

    /// The underlying port, for moving the channel across a boundary.
    ///
    /// Queue-backed channels have no port and cannot cross.
    pub(crate) fn into_port(self) -> Result<Port, Error> {
        match self.flavor {
            Flavor::Wired { port, .. } => Ok(port),
            Flavor::Local { .. } => Err(Error::Unencodable("queue channel")),
        }
    }
}

impl Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.flavor {
            Flavor::Wired { .. } => f.write_str("Channel(port)"),
            Flavor::Local { .. } => f.write_str("Channel(queue)"),
        }
    }
}

/// Stream of received values.
///
/// Returned by [stream] method.
///
/// [stream]: Channel::stream
pub struct Messages<'a> {
    channel: &'a Channel,
    future: Option<BoxFuture<'a, Result<Live, Error>>>,
    terminated: bool,
}

impl<'a> Unpin for Messages<'a> {}

impl<'a> Stream for Messages<'a> {
    type Item = Live;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        loop {
            let channel = self.channel;
            let future = self.future.get_or_insert_with(|| Box::pin(channel.recv()));
            match future.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    self.future = None;
                    match result {
                        Ok(value) => return Poll::Ready(Some(value)),
                        Err(Error::Closed) => {
                            self.terminated = true;
                            return Poll::Ready(None);
                        }
                        Err(_) => continue,
                    }
                }
            }
        }
    }
}

impl<'a> FusedStream for Messages<'a> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Fan-in of several channels into one receiver.
///
/// Receives compete fairly (rotating poll order); each received value
/// is tagged with the index of the channel it arrived on. Inputs that
/// close are skipped until every input has closed.
pub struct Select {
    inputs: Vec<Channel>,
    done: Mutex<Vec<bool>>,
    next: AtomicUsize,
}

impl Select {
    pub fn new(inputs: Vec<Channel>) -> Self {
        let done = Mutex::new(vec![false; inputs.len()]);
        Select {
            inputs,
            done,
            next: AtomicUsize::new(0),
        }
    }

    /// Receive the next value from whichever input produces one first.
    pub async fn recv(&self) -> Result<(usize, Live), Error> {
        loop {
            let candidates: Vec<usize> = {
                let done = self.done.lock();
                let start = self.next.fetch_add(1, Ordering::Relaxed);
                (0..self.inputs.len())
                    .map(|offset| (start + offset) % self.inputs.len())
                    .filter(|index| !done[*index])
                    .collect()
            };
            if candidates.is_empty() {
                return Err(Error::Closed);
            }
            let races: Vec<BoxFuture<'_, (usize, Result<Live, Error>)>> = candidates
                .into_iter()
                .map(|index| {
                    let input = &self.inputs[index];
                    let future: BoxFuture<'_, _> =
                        Box::pin(async move { (index, input.recv().await) });
                    future
                })
                .collect();
            let ((index, result), _, _) = futures::future::select_all(races).await;
            match result {
                Ok(value) => return Ok((index, value)),
                Err(Error::Closed) => {
                    self.done.lock()[index] = true;
                    continue;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Close every input.
    pub fn close(&self) {
        for input in &self.inputs {
            input.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inputs.iter().all(Channel::is_closed)
    }
}

/// Fan-out to several channels.
///
/// Sending clones the value to every output; a value that cannot be
/// cloned is refused before anything is written.
pub struct Fanout {
    outputs: Vec<Channel>,
}

impl Fanout {
    pub fn new(outputs: Vec<Channel>) -> Self {
        Fanout { outputs }
    }

    pub fn send(&self, value: Live) -> Result<(), Error> {
        let mut copies = Vec::with_capacity(self.outputs.len());
        for _ in 1..self.outputs.len() {
            copies.push(value.try_clone()?);
        }
        copies.push(value);
        for (output, copy) in self.outputs.iter().zip(copies) {
            output.send(copy)?;
        }
        Ok(())
    }

    /// Close every output.
    pub fn close(&self) {
        for output in &self.outputs {
            output.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::{FutureExt, StreamExt};

    use super::{Channel, Fanout, Select};
    use crate::{error::Error, live::Live, queue::Queue, wire::Wire};

    #[cfg(target_arch = "wasm32")]
    use wasm_bindgen_test::{wasm_bindgen_test, wasm_bindgen_test_configure};
    #[cfg(target_arch = "wasm32")]
    wasm_bindgen_test_configure!(run_in_browser);

    async fn test_pair_echo_inner() {
        let wire = Wire::new();
        let (a, b) = Channel::pair(&wire);

        a.send(Live::map([("n", Live::Int(42))])).unwrap();

        assert_eq!(
            b.recv().await.unwrap(),
            Live::map([("n", Live::Int(42))])
        );
    }

    async fn test_fifo_inner() {
        let wire = Wire::new();
        let (a, b) = Channel::pair(&wire);

        for n in 0..16 {
            a.send(Live::Int(n)).unwrap();
        }
        for n in 0..16 {
            assert_eq!(b.recv().await.unwrap(), Live::Int(n));
        }
    }

    async fn test_channel_over_channel_inner() {
        let wire = Wire::new();
        let (a, b) = Channel::pair(&wire);
        let (inner_a, inner_b) = Channel::pair(&wire);

        inner_a.send(Live::from("carried over")).unwrap();
        a.send(Live::Channel(inner_b)).unwrap();

        let Live::Channel(received) = b.recv().await.unwrap() else {
            panic!("channel did not survive the trip");
        };
        assert_eq!(received.recv().await.unwrap(), Live::from("carried over"));
    }

    async fn test_stream_inner() {
        let wire = Wire::new();
        let (a, b) = Channel::pair(&wire);

        a.send(Live::Int(1)).unwrap();
        a.send(Live::Int(2)).unwrap();
        a.send(Live::Int(3)).unwrap();
        a.close();

        assert_eq!(
            b.stream().collect::<Vec<Live>>().await,
            vec![Live::Int(1), Live::Int(2), Live::Int(3)]
        );
    }

    async fn test_from_queue_inner() {
        let queue = Arc::new(Queue::new());
        let channel = Channel::from_queue(queue);

        channel.send(Live::from("loop")).unwrap();
        assert_eq!(channel.recv().await.unwrap(), Live::from("loop"));
    }

    async fn test_select_inner() {
        let wire = Wire::new();
        let (a_in, a_out) = Channel::pair(&wire);
        let (b_in, b_out) = Channel::pair(&wire);

        let select = Select::new(vec![a_out, b_out]);

        a_in.send(Live::Int(1)).unwrap();
        b_in.send(Live::Int(2)).unwrap();

        let mut received = vec![select.recv().await.unwrap(), select.recv().await.unwrap()];
        received.sort_by_key(|(index, _)| *index);
        assert_eq!(received, vec![(0, Live::Int(1)), (1, Live::Int(2))]);

        a_in.close();
        b_in.send(Live::Int(3)).unwrap();
        assert_eq!(select.recv().await.unwrap(), (1, Live::Int(3)));

        b_in.close();
        assert_eq!(select.recv().await.unwrap_err(), Error::Closed);
    }

    async fn test_fanout_inner() {
        let wire = Wire::new();
        let (a_in, a_out) = Channel::pair(&wire);
        let (b_in, b_out) = Channel::pair(&wire);

        let fanout = Fanout::new(vec![a_in, b_in]);
        fanout.send(Live::from("all")).unwrap();

        assert_eq!(a_out.recv().await.unwrap(), Live::from("all"));
        assert_eq!(b_out.recv().await.unwrap(), Live::from("all"));

        let (port, _keep) = crate::port::Port::in_process_pair();
        assert_eq!(
            fanout.send(Live::Port(port)).unwrap_err(),
            Error::NotClonable("port")
        );
        assert!(a_out.stream().next().now_or_never().is_none());
    }

    async fn test_broadcast_inner() {
        let wire = Wire::new();
        let a = Channel::broadcast("test-bus", &wire);
        let b = Channel::broadcast("test-bus", &wire);
        let c = Channel::broadcast("test-bus", &wire);

        a.send(Live::Int(9)).unwrap();

        assert_eq!(b.recv().await.unwrap(), Live::Int(9));
        assert_eq!(c.recv().await.unwrap(), Live::Int(9));
        // no self-delivery
        assert!(a.stream().next().now_or_never().is_none());
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_pair_echo() {
        test_pair_echo_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_fifo() {
        test_fifo_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_channel_over_channel() {
        test_channel_over_channel_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_stream() {
        test_stream_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_from_queue() {
        test_from_queue_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_select() {
        test_select_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_fanout() {
        test_fanout_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_broadcast() {
        test_broadcast_inner().await
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    async fn test_pair_echo() {
        test_pair_echo_inner().await
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    async fn test_select() {
        test_select_inner().await
    }
}
