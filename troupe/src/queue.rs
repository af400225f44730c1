//! Waker-based unbounded async queue.
//!
//! The primitive under in-process ports, loopback channels and actor
//! inboxes. Any number of producers may [push], any number of consumers
//! may [pop]; items come out in the order they went in.
//!
//! [push]: Queue::push
//! [pop]: Queue::pop

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll, Waker},
};

use futures::future::FusedFuture;
use parking_lot::Mutex;

use crate::error::Error;

struct State<T> {
    items: VecDeque<T>,
    wakers: VecDeque<Weak<Mutex<PopWaker>>>,
    closed: bool,
}

impl<T> State<T> {
    fn new() -> Self {
        State {
            items: VecDeque::new(),
            wakers: VecDeque::new(),
            closed: false,
        }
    }

    /// Wake next waiting consumer.
    fn wake_next(&mut self) {
        while let Some(waker) = self.wakers.pop_front() {
            if let Some(waker) = waker.upgrade() {
                let mut waker = waker.lock();
                waker.woken = true;
                waker.waker.wake_by_ref();
                break;
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.wake_next();
    }
}

impl<T> Drop for State<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.close();
        }
    }
}

/// Unbounded FIFO queue with asynchronous consumers.
pub struct Queue<T> {
    state: Mutex<State<T>>,
}

impl<T> Queue<T> {
    /// Create new empty queue.
    pub fn new() -> Self {
        Queue {
            state: Mutex::new(State::new()),
        }
    }

    /// Push item into the queue, waking a waiting consumer.
    ///
    /// Fails if the queue was closed.
    pub fn push(&self, item: T) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        state.items.push_front(item);
        state.wake_next();
        Ok(())
    }

    /// Pop next item.
    ///
    /// Resolves when an item is available; fails with [`Error::Closed`]
    /// once the queue is closed and drained.
    #[must_use]
    pub fn pop(&self) -> Pop<'_, T> {
        Pop {
            state: &self.state,
            terminated: false,
            waker: None,
        }
    }

    /// Close the queue.
    ///
    /// Items already queued can still be popped; consumers waiting past
    /// the last item fail with [`Error::Closed`].
    pub fn close(&self) {
        self.state.lock().close();
    }

    /// Returns `true` if the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns `true` if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PopWaker {
    waker: Waker,
    woken: bool,
}

impl PopWaker {
    fn new(waker: Waker) -> Self {
        PopWaker {
            waker,
            woken: false,
        }
    }

    fn update(&mut self, waker: &Waker) {
        if !self.waker.will_wake(waker) {
            self.waker = waker.clone();
        }
    }
}

/// Future returned by [pop] method.
///
/// [pop]: Queue::pop
pub struct Pop<'a, T> {
    state: &'a Mutex<State<T>>,
    terminated: bool,
    waker: Option<Arc<Mutex<PopWaker>>>,
}

impl<'a, T> Unpin for Pop<'a, T> {}

impl<'a, T> Drop for Pop<'a, T> {
    fn drop(&mut self) {
        // We were woken but didn't consume anything, wake up another
        if self.waker.take().map_or(false, |waker| waker.lock().woken) {
            self.state.lock().wake_next();
        }
    }
}

impl<'a, T> Future for Pop<'a, T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.terminated {
            Poll::Pending
        } else {
            let mut state = self.state.lock();
            match state.items.pop_back() {
                Some(item) => {
                    self.terminated = true;
                    self.waker = None;
                    Poll::Ready(Ok(item))
                }
                None => {
                    if state.closed {
                        self.terminated = true;
                        Poll::Ready(Err(Error::Closed))
                    } else {
                        if let Some(waker) = &self.waker {
                            let mut waker = waker.lock();
                            waker.update(cx.waker());
                            waker.woken = false;
                        } else {
                            let waker = Arc::new(Mutex::new(PopWaker::new(cx.waker().clone())));
                            self.waker = Some(waker);
                        }
                        state
                            .wakers
                            .push_back(Arc::downgrade(self.waker.as_ref().unwrap()));
                        Poll::Pending
                    }
                }
            }
        }
    }
}

impl<'a, T> FusedFuture for Pop<'a, T> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
