//! Channel wrapper adding buffered selective receive.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll, Waker},
};

use futures::{future::BoxFuture, future::FusedFuture, stream::FusedStream, Stream};
use parking_lot::Mutex;

use crate::{channel::Channel, error::Error, live::Live};

type Predicate = Box<dyn FnMut(&Live) -> bool + Send>;

struct Waiter {
    predicate: Predicate,
    waker: Waker,
    delivered: Option<Live>,
}

struct Shared {
    /// Messages pumped from the channel that no waiter wanted,
    /// in arrival order.
    buffer: VecDeque<Live>,
    /// Waiters in registration order; dead entries are pruned lazily.
    waiters: Vec<Weak<Mutex<Waiter>>>,
    /// Exactly one waiter at a time pumps the underlying channel.
    pumping: bool,
    /// The channel reported end-of-stream.
    closed: bool,
}

impl Shared {
    /// Offer a message to the waiters in registration order; the first
    /// whose predicate matches gets it. Unwanted messages are buffered.
    fn offer(&mut self, message: Live, to_front: bool) {
        self.waiters.retain(|waiter| waiter.strong_count() > 0);
        let mut chosen = None;
        for waiter in &self.waiters {
            if let Some(waiter) = waiter.upgrade() {
                let mut guard = waiter.lock();
                if guard.delivered.is_none() && (guard.predicate)(&message) {
                    drop(guard);
                    chosen = Some(waiter);
                    break;
                }
            }
        }
        match chosen {
            Some(waiter) => {
                let mut guard = waiter.lock();
                guard.delivered = Some(message);
                guard.waker.wake_by_ref();
            }
            None => {
                if to_front {
                    self.buffer.push_front(message);
                } else {
                    self.buffer.push_back(message);
                }
            }
        }
    }

    /// Wake a waiter with nothing delivered yet, so it can take over
    /// pumping.
    fn wake_next_idle(&mut self) {
        for waiter in &self.waiters {
            if let Some(waiter) = waiter.upgrade() {
                let guard = waiter.lock();
                if guard.delivered.is_none() {
                    guard.waker.wake_by_ref();
                    break;
                }
            }
        }
    }

    fn wake_all(&mut self) {
        for waiter in &self.waiters {
            if let Some(waiter) = waiter.upgrade() {
                waiter.lock().waker.wake_by_ref();
            }
        }
    }
}

/// A channel with an out-of-order buffer and selective receive.
///
/// [take] is the selective-receive primitive: it returns the first
/// buffered-or-incoming message satisfying a predicate, stashing
/// non-matching earlier messages for later [recv] calls. Relative
/// order of stashed messages is preserved.
///
/// [take]: Mailbox::take
/// [recv]: Mailbox::recv
pub struct Mailbox {
    channel: Channel,
    shared: Mutex<Shared>,
}

impl Mailbox {
    /// Wrap a channel.
    pub fn new(channel: Channel) -> Self {
        Mailbox {
            channel,
            shared: Mutex::new(Shared {
                buffer: VecDeque::new(),
                waiters: Vec::new(),
                pumping: false,
                closed: false,
            }),
        }
    }

    /// Send a value on the wrapped channel.
    pub fn send(&self, value: Live) -> Result<(), Error> {
        self.channel.send(value)
    }

    /// Receive the oldest stashed message, or the next fresh one.
    #[must_use]
    pub fn recv(&self) -> Take<'_> {
        self.take(|_| true)
    }

    /// Receive the first message satisfying the predicate.
    ///
    /// Earlier non-matching messages are stashed in arrival order.
    /// Concurrent `take` calls are allowed; a message is delivered to
    /// at most one of them (the first whose predicate matches, in call
    /// order). Fails with [`Error::Closed`] if the channel closes while
    /// waiting.
    #[must_use]
    pub fn take<P>(&self, predicate: P) -> Take<'_>
    where
        P: FnMut(&Live) -> bool + Send + 'static,
    {
        Take {
            mailbox: self,
            predicate: Some(Box::new(predicate)),
            waiter: None,
            recv: None,
            pumper: false,
            terminated: false,
        }
    }

    /// Close the wrapped channel.
    pub fn close(&self) {
        self.channel.close();
        let mut shared = self.shared.lock();
        shared.wake_all();
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Stream of messages: stashed ones first, then fresh.
    pub fn stream(&self) -> MailboxStream<'_> {
        MailboxStream {
            mailbox: self,
            future: None,
            terminated: false,
        }
    }

    /// Number of currently stashed messages.
    pub fn stashed(&self) -> usize {
        self.shared.lock().buffer.len()
    }
}

/// Future returned by [take] and [recv] methods.
///
/// [take]: Mailbox::take
/// [recv]: Mailbox::recv
pub struct Take<'a> {
    mailbox: &'a Mailbox,
    predicate: Option<Predicate>,
    waiter: Option<Arc<Mutex<Waiter>>>,
    recv: Option<BoxFuture<'a, Result<Live, Error>>>,
    pumper: bool,
    terminated: bool,
}

impl<'a> Unpin for Take<'a> {}

impl<'a> Take<'a> {
    /// Stop pumping and hand the duty to another waiter.
    fn resign(&mut self, shared: &mut Shared) {
        if self.pumper {
            self.pumper = false;
            shared.pumping = false;
            shared.wake_next_idle();
        }
    }
}

impl<'a> Future for Take<'a> {
    type Output = Result<Live, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.terminated {
            return Poll::Pending;
        }
        let this = &mut *self;
        loop {
            {
                let mut shared = this.mailbox.shared.lock();
                match this.waiter.clone() {
                    None => {
                        // First poll: scan the buffer in insertion order.
                        let mut predicate = this.predicate.take().unwrap();
                        if let Some(index) = shared.buffer.iter().position(|m| predicate(m)) {
                            let message = shared.buffer.remove(index).unwrap();
                            this.terminated = true;
                            return Poll::Ready(Ok(message));
                        }
                        if shared.closed {
                            this.terminated = true;
                            return Poll::Ready(Err(Error::Closed));
                        }
                        let waiter = Arc::new(Mutex::new(Waiter {
                            predicate,
                            waker: cx.waker().clone(),
                            delivered: None,
                        }));
                        shared.waiters.push(Arc::downgrade(&waiter));
                        this.waiter = Some(waiter);
                    }
                    Some(waiter) => {
                        let mut guard = waiter.lock();
                        if let Some(message) = guard.delivered.take() {
                            drop(guard);
                            this.resign(&mut shared);
                            this.terminated = true;
                            return Poll::Ready(Ok(message));
                        }
                        guard.waker = cx.waker().clone();
                        drop(guard);
                        if shared.closed {
                            this.resign(&mut shared);
                            this.terminated = true;
                            return Poll::Ready(Err(Error::Closed));
                        }
                    }
                }
                if !shared.pumping {
                    shared.pumping = true;
                    this.pumper = true;
                }
            }
            if !this.pumper {
                return Poll::Pending;
            }
            // Pump the channel on behalf of every waiter.
            let mailbox = this.mailbox;
            let recv = this
                .recv
                .get_or_insert_with(|| Box::pin(mailbox.channel.recv()));
            match recv.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    this.recv = None;
                    let mut shared = this.mailbox.shared.lock();
                    match result {
                        Ok(message) => {
                            shared.offer(message, false);
                            // Re-check own delivery, keep pumping.
                        }
                        Err(Error::Closed) => {
                            shared.closed = true;
                            this.pumper = false;
                            shared.pumping = false;
                            shared.wake_all();
                            this.terminated = true;
                            return Poll::Ready(Err(Error::Closed));
                        }
                        Err(error) => {
                            this.resign(&mut shared);
                            this.terminated = true;
                            return Poll::Ready(Err(error));
                        }
                    }
                }
            }
        }
    }
}

impl<'a> FusedFuture for Take<'a> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl<'a> Drop for Take<'a> {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        let mut shared = self.mailbox.shared.lock();
        if let Some(waiter) = self.waiter.take() {
            let message = waiter.lock().delivered.take();
            if let Some(message) = message {
                // Delivered but never consumed; it predates anything
                // buffered since, so it goes back to the front.
                shared.offer(message, true);
            }
        }
        self.resign(&mut shared);
    }
}

/// Stream of messages from a mailbox.
///
/// Returned by [stream] method.
///
/// [stream]: Mailbox::stream
pub struct MailboxStream<'a> {
    mailbox: &'a Mailbox,
    future: Option<Take<'a>>,
    terminated: bool,
}

impl<'a> Unpin for MailboxStream<'a> {}

impl<'a> Stream for MailboxStream<'a> {
    type Item = Live;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        let mailbox = self.mailbox;
        let future = self.future.get_or_insert_with(|| mailbox.recv());
        match Pin::new(future).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.future = None;
                match result {
                    Ok(value) => Poll::Ready(Some(value)),
                    Err(_) => {
                        self.terminated = true;
                        Poll::Ready(None)
                    }
                }
            }
        }
    }
}

impl<'a> FusedStream for MailboxStream<'a> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;

    use super::Mailbox;
    use crate::{channel::Channel, error::Error, live::Live, queue::Queue, wire::Wire};

    #[cfg(target_arch = "wasm32")]
    use wasm_bindgen_test::{wasm_bindgen_test, wasm_bindgen_test_configure};
    #[cfg(target_arch = "wasm32")]
    wasm_bindgen_test_configure!(run_in_browser);

    fn loopback() -> Mailbox {
        Mailbox::new(Channel::from_queue(Arc::new(Queue::new())))
    }

    async fn test_selective_receive_inner() {
        let mailbox = loopback();

        mailbox.send(Live::Int(1)).unwrap();
        mailbox.send(Live::from("skip")).unwrap();
        mailbox.send(Live::Int(2)).unwrap();
        mailbox.send(Live::from("skip")).unwrap();

        let number = |m: &Live| matches!(m, Live::Int(_));
        assert_eq!(mailbox.take(number).await.unwrap(), Live::Int(1));
        assert_eq!(mailbox.take(number).await.unwrap(), Live::Int(2));
        assert_eq!(mailbox.recv().await.unwrap(), Live::from("skip"));
        assert_eq!(mailbox.recv().await.unwrap(), Live::from("skip"));
    }

    async fn test_buffer_order_inner() {
        let mailbox = loopback();

        for n in 0..8 {
            mailbox.send(Live::Int(n)).unwrap();
        }

        // Pull out the odd ones; evens stay stashed in arrival order.
        for n in [1, 3, 5, 7] {
            assert_eq!(
                mailbox.take(|m| matches!(m, Live::Int(i) if i % 2 == 1)).await.unwrap(),
                Live::Int(n)
            );
        }
        for n in [0, 2, 4, 6] {
            assert_eq!(mailbox.recv().await.unwrap(), Live::Int(n));
        }
    }

    async fn test_closed_inner() {
        let mailbox = loopback();

        mailbox.send(Live::from("last")).unwrap();
        mailbox.close();

        assert_eq!(mailbox.recv().await.unwrap(), Live::from("last"));
        assert_eq!(mailbox.recv().await.unwrap_err(), Error::Closed);
        assert_eq!(
            mailbox.take(|_| true).await.unwrap_err(),
            Error::Closed
        );
    }

    async fn test_stream_inner() {
        let mailbox = loopback();

        mailbox.send(Live::Int(1)).unwrap();
        mailbox.send(Live::from("text")).unwrap();
        mailbox.send(Live::Int(2)).unwrap();

        // Stash "text" first.
        assert_eq!(
            mailbox.take(|m| matches!(m, Live::Int(i) if *i == 2)).await.unwrap(),
            Live::Int(2)
        );
        mailbox.close();

        assert_eq!(
            mailbox.stream().collect::<Vec<Live>>().await,
            vec![Live::Int(1), Live::from("text")]
        );
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_selective_receive() {
        test_selective_receive_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_buffer_order() {
        test_buffer_order_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_closed() {
        test_closed_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_stream() {
        test_stream_inner().await
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_concurrent_takes() {
        use futures::future::join;

        let wire = Wire::new();
        let (sender, receiver) = Channel::pair(&wire);
        let mailbox = Mailbox::new(receiver);

        let numbers = mailbox.take(|m| matches!(m, Live::Int(_)));
        let texts = mailbox.take(|m| matches!(m, Live::Text(_)));

        let feeder = async {
            sender.send(Live::from("hello")).unwrap();
            tokio::task::yield_now().await;
            sender.send(Live::Int(5)).unwrap();
        };

        let ((number, text), ()) = join(join(numbers, texts), feeder).await;
        assert_eq!(number.unwrap(), Live::Int(5));
        assert_eq!(text.unwrap(), Live::from("hello"));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[tokio::test]
    async fn test_take_while_waiting() {
        let wire = Wire::new();
        let (sender, receiver) = Channel::pair(&wire);
        let mailbox = Arc::new(Mailbox::new(receiver));

        let mailbox_clone = mailbox.clone();
        let waiter = tokio::spawn(async move {
            mailbox_clone
                .take(|m| matches!(m, Live::Int(i) if *i > 10))
                .await
                .unwrap()
        });

        for n in 0..=20 {
            sender.send(Live::Int(n)).unwrap();
            tokio::task::yield_now().await;
        }

        assert_eq!(waiter.await.unwrap(), Live::Int(11));
        // Everything before the match is stashed, in order.
        for n in 0..=10 {
            assert_eq!(mailbox.recv().await.unwrap(), Live::Int(n));
        }
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    async fn test_selective_receive() {
        test_selective_receive_inner().await
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    async fn test_buffer_order() {
        test_buffer_order_inner().await
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    async fn test_closed() {
        test_closed_inner().await
    }
}
