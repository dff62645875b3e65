//! Passthrough channel between a producer pushing protocol messages and a
//! single async consumer.
//!
//! The [`PassthroughSource`] never blocks: elements are queued (unbounded)
//! until the [`PassthroughStream`] consumes them. Backpressure is not applied
//! here but by the transport, which reads the queue depth reported by
//! [`PassthroughSource::yield_element`].
//!
//! Once the channel is terminated (cleanly or with an error), further yields
//! are dropped and the consumer observes the terminal outcome after all
//! elements queued before it, and again on every subsequent read.

use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use futures::Stream;
use parking_lot::Mutex;

/// Create a new passthrough channel.
pub fn passthrough<T, E>() -> (PassthroughSource<T, E>, PassthroughStream<T, E>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            waiter: None,
            terminal: Terminal::Open,
        }),
    });
    (
        PassthroughSource {
            shared: shared.clone(),
        },
        PassthroughStream {
            shared,
            stream_done: false,
        },
    )
}

/// Result of offering an element (or terminal outcome) to a [`PassthroughSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YieldResult {
    /// The element was accepted.
    ///
    /// `queue_depth` is the number of elements waiting for the consumer,
    /// `0` if the element was handed over to a waiting consumer directly.
    Accepted {
        /// Number of elements buffered after this yield.
        queue_depth: usize,
    },
    /// The channel was already terminated, the element was dropped.
    Dropped,
}

impl YieldResult {
    /// Returns `true` if the element was accepted.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
}

struct State<T, E> {
    queue: VecDeque<T>,
    // only ever set while the queue is empty
    waiter: Option<Waker>,
    terminal: Terminal<E>,
}

enum Terminal<E> {
    Open,
    Finished,
    Failed(E),
}

impl<T, E> Shared<T, E> {
    fn terminate(&self, terminal: Terminal<E>) -> YieldResult {
        let waiter = {
            let mut state = self.state.lock();
            if !matches!(state.terminal, Terminal::Open) {
                return YieldResult::Dropped;
            }
            state.terminal = terminal;
            state.waiter.take()
        };
        if let Some(waker) = waiter {
            waker.wake();
        }
        YieldResult::Accepted { queue_depth: 0 }
    }
}

/// Producer half of a [passthrough](passthrough) channel.
///
/// Cheap to clone: all clones feed the same channel.
pub struct PassthroughSource<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> PassthroughSource<T, E> {
    /// Offer an element to the consumer.
    ///
    /// Never blocks. Elements are observed in the order of the (serialized)
    /// calls to this method.
    pub fn yield_element(&self, element: T) -> YieldResult {
        let (waiter, result) = {
            let mut state = self.shared.state.lock();
            if !matches!(state.terminal, Terminal::Open) {
                return YieldResult::Dropped;
            }
            state.queue.push_back(element);
            match state.waiter.take() {
                Some(waker) => (Some(waker), YieldResult::Accepted { queue_depth: 0 }),
                None => (
                    None,
                    YieldResult::Accepted {
                        queue_depth: state.queue.len(),
                    },
                ),
            }
        };
        if let Some(waker) = waiter {
            waker.wake();
        }
        result
    }

    /// Terminate the channel cleanly.
    pub fn finish(&self) -> YieldResult {
        self.shared.terminate(Terminal::Finished)
    }

    /// Terminate the channel with an error.
    pub fn finish_with_error(&self, error: E) -> YieldResult {
        self.shared.terminate(Terminal::Failed(error))
    }

    /// Returns `true` once the channel was terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        !matches!(self.shared.state.lock().terminal, Terminal::Open)
    }
}

impl<T, E> Clone for PassthroughSource<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> fmt::Debug for PassthroughSource<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthroughSource")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Consumer half of a [passthrough](passthrough) channel.
pub struct PassthroughStream<T, E> {
    shared: Arc<Shared<T, E>>,
    stream_done: bool,
}

impl<T, E: Clone> PassthroughStream<T, E> {
    /// Wait for the next element.
    ///
    /// Resolves to `Ok(None)` once the channel finished cleanly and all
    /// elements were consumed, or to the error the channel was finished with.
    /// Both terminal outcomes are replayed on every subsequent call.
    ///
    /// Dropping the returned future before it resolved deregisters
    /// the consumer and leaves the channel usable.
    pub fn next_element(&mut self) -> NextElement<'_, T, E> {
        NextElement { stream: self }
    }

    /// Poll for the next element, see [`PassthroughStream::next_element`].
    pub fn poll_next_element(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, E>> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if let Some(element) = state.queue.pop_front() {
            return Poll::Ready(Ok(Some(element)));
        }
        match &state.terminal {
            Terminal::Open => {
                match &mut state.waiter {
                    Some(waker) if waker.will_wake(cx.waker()) => (),
                    waiter => *waiter = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            Terminal::Finished => Poll::Ready(Ok(None)),
            Terminal::Failed(err) => Poll::Ready(Err(err.clone())),
        }
    }
}

impl<T, E: Clone> PassthroughStream<T, E> {
    /// The error the channel failed with, if it did.
    pub(crate) fn failure(&self) -> Option<E> {
        match &self.shared.state.lock().terminal {
            Terminal::Failed(err) => Some(err.clone()),
            Terminal::Open | Terminal::Finished => None,
        }
    }
}

impl<T, E> PassthroughStream<T, E> {
    fn deregister(&self) {
        self.shared.state.lock().waiter = None;
    }
}

impl<T, E> fmt::Debug for PassthroughStream<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PassthroughStream")
            .field("queued", &state.queue.len())
            .field("terminated", &!matches!(state.terminal, Terminal::Open))
            .finish()
    }
}

/// Stream of the channel elements, ending after the first error (if any).
impl<T, E: Clone> Stream for PassthroughStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.stream_done {
            return Poll::Ready(None);
        }
        match this.poll_next_element(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Some(element))) => Poll::Ready(Some(Ok(element))),
            Poll::Ready(Ok(None)) => {
                this.stream_done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Err(err)) => {
                this.stream_done = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

/// Future returned by [`PassthroughStream::next_element`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct NextElement<'a, T, E> {
    stream: &'a mut PassthroughStream<T, E>,
}

impl<T, E: Clone> Future for NextElement<'_, T, E> {
    type Output = Result<Option<T>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().stream.poll_next_element(cx)
    }
}

impl<T, E> Drop for NextElement<'_, T, E> {
    fn drop(&mut self) {
        self.stream.deregister();
    }
}

impl<T, E> fmt::Debug for NextElement<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextElement").finish()
    }
}
