//! Bounded async writer with watermark based backpressure.
//!
//! An [`AsyncWriter`] sits between producers (e.g. a handler sending response
//! messages) and a [`WriterDelegate`] (the sink, e.g. the call driver).
//! While the sink is writable elements are handed over right away, otherwise
//! they are buffered. Once the buffer reaches the high watermark writers are
//! suspended until the sink caught up to the low watermark, and a write
//! beyond the hard ceiling fails immediately.
//!
//! Delegate callbacks are invoked while the writer's state is locked so they
//! are observed in order. A delegate must therefore not call back into the
//! same writer synchronously.

use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;

use crate::error::WriteError;

/// Sink of an [`AsyncWriter`].
pub trait WriterDelegate<T, E>: Send + Sync {
    /// Elements accepted by the writer, in write order.
    ///
    /// Buffered elements are flushed as one batch once the sink becomes writable.
    fn did_yield(&self, elements: Vec<T>);

    /// The writer terminated, called exactly once.
    ///
    /// `None` for a clean finish, after all accepted elements were yielded.
    fn did_terminate(&self, reason: Option<E>);
}

/// Configuration of an [`AsyncWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    high_watermark: usize,
    low_watermark: usize,
    max_pending_writes: usize,
}

impl WriterConfig {
    /// Default amount of buffered elements at which writers are suspended.
    pub const DEFAULT_HIGH_WATERMARK: usize = 8;
    /// Default amount of buffered elements at which suspended writers resume.
    pub const DEFAULT_LOW_WATERMARK: usize = 4;
    /// Default maximum amount of buffered elements.
    pub const DEFAULT_MAX_PENDING_WRITES: usize = 16;

    /// Create a new [`WriterConfig`] with default watermarks.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            high_watermark: Self::DEFAULT_HIGH_WATERMARK,
            low_watermark: Self::DEFAULT_LOW_WATERMARK,
            max_pending_writes: Self::DEFAULT_MAX_PENDING_WRITES,
        }
    }

    /// Amount of buffered elements at which writers are suspended.
    #[must_use]
    pub const fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    /// Set the amount of buffered elements at which writers are suspended.
    #[must_use]
    pub const fn with_high_watermark(mut self, n: usize) -> Self {
        self.high_watermark = n;
        self
    }

    /// Set the amount of buffered elements at which writers are suspended.
    pub const fn set_high_watermark(&mut self, n: usize) -> &mut Self {
        self.high_watermark = n;
        self
    }

    /// Amount of buffered elements at which suspended writers resume.
    #[must_use]
    pub const fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    /// Set the amount of buffered elements at which suspended writers resume.
    #[must_use]
    pub const fn with_low_watermark(mut self, n: usize) -> Self {
        self.low_watermark = n;
        self
    }

    /// Set the amount of buffered elements at which suspended writers resume.
    pub const fn set_low_watermark(&mut self, n: usize) -> &mut Self {
        self.low_watermark = n;
        self
    }

    /// Maximum amount of buffered elements.
    #[must_use]
    pub const fn max_pending_writes(&self) -> usize {
        self.max_pending_writes
    }

    /// Set the maximum amount of buffered elements.
    #[must_use]
    pub const fn with_max_pending_writes(mut self, n: usize) -> Self {
        self.max_pending_writes = n;
        self
    }

    /// Set the maximum amount of buffered elements.
    pub const fn set_max_pending_writes(&mut self, n: usize) -> &mut Self {
        self.max_pending_writes = n;
        self
    }

    /// Clamp the config so that `low <= high <= max`, with `max >= 1`.
    #[must_use]
    pub fn normalized(self) -> Self {
        let max_pending_writes = self.max_pending_writes.max(1);
        let high_watermark = self.high_watermark.clamp(1, max_pending_writes);
        let low_watermark = self.low_watermark.min(high_watermark);
        Self {
            high_watermark,
            low_watermark,
            max_pending_writes,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded writer feeding a [`WriterDelegate`].
///
/// Cheap to clone: all clones share the same buffer and delegate.
pub struct AsyncWriter<T, E> {
    shared: Arc<Shared<T, E>>,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    delegate: Box<dyn WriterDelegate<T, E> + 'static>,
    config: WriterConfig,
}

struct State<T, E> {
    // only non-empty while not writable
    pending: VecDeque<T>,
    writable: bool,
    completion: Completion<E>,
    write_waiters: Vec<Waker>,
    drain_waiters: Vec<Waker>,
}

enum Completion<E> {
    Active,
    Finishing(Option<E>),
    Finished,
    Cancelled,
}

impl<E> Completion<E> {
    fn is_terminated(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

impl<T, E> AsyncWriter<T, E> {
    /// Create a new writer, initially writable.
    pub fn new<D>(delegate: D, config: WriterConfig) -> Self
    where
        D: WriterDelegate<T, E> + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    writable: true,
                    completion: Completion::Active,
                    write_waiters: Vec::new(),
                    drain_waiters: Vec::new(),
                }),
                delegate: Box::new(delegate),
                config: config.normalized(),
            }),
        }
    }

    /// The (normalized) config of this writer.
    #[must_use]
    pub fn config(&self) -> WriterConfig {
        self.shared.config
    }

    /// Write a single element.
    ///
    /// Resolves once the element is accepted: handed to the delegate, or
    /// buffered while the buffer is below the high watermark. At or above it
    /// the write suspends until the buffer drained to the low watermark.
    pub async fn write(&self, element: T) -> Result<(), WriteError> {
        if self.admit(element)? {
            std::future::poll_fn(|cx| self.poll_capacity(cx)).await
        } else {
            Ok(())
        }
    }

    /// Returns `true` if the writer has to wait for the low watermark.
    fn admit(&self, element: T) -> Result<bool, WriteError> {
        let mut state = self.shared.state.lock();
        if !matches!(state.completion, Completion::Active) {
            return Err(WriteError::AlreadyFinished);
        }
        if state.writable {
            self.shared.delegate.did_yield(vec![element]);
            return Ok(false);
        }
        if state.pending.len() >= self.shared.config.max_pending_writes {
            tracing::trace!(
                pending = state.pending.len(),
                "writer rejected element: too many pending writes"
            );
            return Err(WriteError::TooManyPendingWrites);
        }
        state.pending.push_back(element);
        Ok(state.pending.len() >= self.shared.config.high_watermark)
    }

    fn poll_capacity(&self, cx: &mut Context<'_>) -> Poll<Result<(), WriteError>> {
        let mut state = self.shared.state.lock();
        if matches!(state.completion, Completion::Cancelled) {
            return Poll::Ready(Err(WriteError::Cancelled));
        }
        if state.pending.len() <= self.shared.config.low_watermark {
            return Poll::Ready(Ok(()));
        }
        if !state.write_waiters.iter().any(|w| w.will_wake(cx.waker())) {
            state.write_waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }

    /// Wait until every accepted element was handed to the delegate,
    /// or the writer terminated.
    pub async fn drained(&self) {
        std::future::poll_fn(|cx| {
            let mut state = self.shared.state.lock();
            if state.pending.is_empty() || state.completion.is_terminated() {
                return Poll::Ready(());
            }
            if !state.drain_waiters.iter().any(|w| w.will_wake(cx.waker())) {
                state.drain_waiters.push(cx.waker().clone());
            }
            Poll::Pending
        })
        .await;
    }

    /// Update the writability of the delegate.
    ///
    /// Becoming writable flushes all buffered elements as a single batch,
    /// and completes a pending [`finish`](Self::finish).
    pub fn set_writable(&self, writable: bool) {
        let wakers = {
            let mut state = self.shared.state.lock();
            state.writable = writable;
            if !writable {
                return;
            }
            self.flush(&mut state)
        };
        wake_all(wakers);
    }

    fn flush(&self, state: &mut State<T, E>) -> Vec<Waker> {
        let mut wakers = Vec::new();
        if !state.pending.is_empty() {
            let batch: Vec<T> = state.pending.drain(..).collect();
            tracing::trace!(batch = batch.len(), "writer flushed buffered elements");
            self.shared.delegate.did_yield(batch);
            wakers.append(&mut state.write_waiters);
            wakers.append(&mut state.drain_waiters);
        }
        if matches!(state.completion, Completion::Finishing(_))
            && let Completion::Finishing(reason) =
                std::mem::replace(&mut state.completion, Completion::Finished)
        {
            self.shared.delegate.did_terminate(reason);
        }
        wakers
    }

    /// Finish the writer.
    ///
    /// Elements accepted before are still delivered, after which the delegate
    /// is terminated without a reason. Idempotent.
    pub fn finish(&self) {
        self.terminate_gracefully(None);
    }

    /// Finish the writer with an error.
    ///
    /// Like [`finish`](Self::finish), the error is handed to the delegate
    /// once all accepted elements are delivered.
    pub fn finish_with_error(&self, error: E) {
        self.terminate_gracefully(Some(error));
    }

    fn terminate_gracefully(&self, reason: Option<E>) {
        let wakers = {
            let mut state = self.shared.state.lock();
            if !matches!(state.completion, Completion::Active) {
                return;
            }
            if state.pending.is_empty() {
                state.completion = Completion::Finished;
                self.shared.delegate.did_terminate(reason);
                std::mem::take(&mut state.drain_waiters)
            } else {
                tracing::trace!(
                    pending = state.pending.len(),
                    "writer finishing once buffered elements are flushed"
                );
                state.completion = Completion::Finishing(reason);
                Vec::new()
            }
        };
        wake_all(wakers);
    }

    /// Cancel the writer.
    ///
    /// Buffered elements are discarded, suspended writers fail with
    /// [`WriteError::Cancelled`] and the delegate is terminated with the
    /// given reason, unless the writer already terminated.
    pub fn cancel(&self, reason: E) {
        let wakers = {
            let mut state = self.shared.state.lock();
            if state.completion.is_terminated() {
                return;
            }
            state.completion = Completion::Cancelled;
            if !state.pending.is_empty() {
                tracing::debug!(
                    discarded = state.pending.len(),
                    "writer cancelled: discard buffered elements"
                );
                state.pending.clear();
            }
            self.shared.delegate.did_terminate(Some(reason));
            let mut wakers = std::mem::take(&mut state.write_waiters);
            wakers.append(&mut state.drain_waiters);
            wakers
        };
        wake_all(wakers);
    }

    /// Returns `true` once the writer no longer accepts elements.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self.shared.state.lock().completion, Completion::Active)
    }

    /// Amount of buffered elements.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl<T, E> AsyncWriter<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Cancel the writer from a task on the current runtime,
    /// or inline if there is no runtime.
    pub fn cancel_asynchronously(&self, reason: E) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let writer = self.clone();
                drop(handle.spawn(async move { writer.cancel(reason) }));
            }
            Err(_) => self.cancel(reason),
        }
    }
}

fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

impl<T, E> Clone for AsyncWriter<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> fmt::Debug for AsyncWriter<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("AsyncWriter")
            .field("config", &self.shared.config)
            .field("pending", &state.pending.len())
            .field("writable", &state.writable)
            .field(
                "active",
                &matches!(state.completion, Completion::Active),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Yield(Vec<u32>),
        Terminate(Option<&'static str>),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.0.lock().clone()
        }
    }

    impl WriterDelegate<u32, &'static str> for Recorder {
        fn did_yield(&self, elements: Vec<u32>) {
            self.0.lock().push(Event::Yield(elements));
        }

        fn did_terminate(&self, reason: Option<&'static str>) {
            self.0.lock().push(Event::Terminate(reason));
        }
    }

    fn writer(config: WriterConfig) -> (AsyncWriter<u32, &'static str>, Recorder) {
        let recorder = Recorder::default();
        (AsyncWriter::new(recorder.clone(), config), recorder)
    }

    #[test]
    fn config_is_normalized() {
        let config = WriterConfig::new()
            .with_high_watermark(32)
            .with_low_watermark(64)
            .with_max_pending_writes(16)
            .normalized();
        assert_eq!(config.max_pending_writes(), 16);
        assert_eq!(config.high_watermark(), 16);
        assert_eq!(config.low_watermark(), 16);

        let config = WriterConfig::new().with_max_pending_writes(0).normalized();
        assert_eq!(config.max_pending_writes(), 1);
        assert_eq!(config.high_watermark(), 1);

        let defaults = WriterConfig::default();
        assert_eq!(defaults.high_watermark(), 8);
        assert_eq!(defaults.low_watermark(), 4);
        assert_eq!(defaults.max_pending_writes(), 16);
    }

    #[test]
    fn writable_delivers_immediately_in_order() {
        let (writer, recorder) = writer(WriterConfig::default());
        for i in 0..3 {
            let mut write = task::spawn(writer.write(i));
            assert_ready_eq!(write.poll(), Ok(()));
        }
        assert_eq!(
            recorder.events(),
            vec![Event::Yield(vec![0]), Event::Yield(vec![1]), Event::Yield(vec![2])]
        );
    }

    #[test]
    fn paused_writer_coalesces_flush() {
        let (writer, recorder) = writer(WriterConfig::default());
        writer.set_writable(false);
        for i in 0..3 {
            let mut write = task::spawn(writer.write(i));
            assert_ready_eq!(write.poll(), Ok(()));
        }
        assert!(recorder.events().is_empty());
        assert_eq!(writer.pending_len(), 3);

        writer.set_writable(true);
        assert_eq!(recorder.events(), vec![Event::Yield(vec![0, 1, 2])]);
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn backpressure_suspends_and_rejects() {
        let config = WriterConfig::new()
            .with_high_watermark(2)
            .with_low_watermark(1)
            .with_max_pending_writes(4);
        let (writer, recorder) = writer(config);
        writer.set_writable(false);

        let mut w1 = task::spawn(writer.write(1));
        assert_ready_eq!(w1.poll(), Ok(()));

        let mut w2 = task::spawn(writer.write(2));
        let mut w3 = task::spawn(writer.write(3));
        let mut w4 = task::spawn(writer.write(4));
        assert_pending!(w2.poll());
        assert_pending!(w3.poll());
        assert_pending!(w4.poll());

        let mut w5 = task::spawn(writer.write(5));
        assert_ready_eq!(w5.poll(), Err(WriteError::TooManyPendingWrites));

        writer.set_writable(true);
        assert!(w2.is_woken());
        assert!(w3.is_woken());
        assert!(w4.is_woken());
        assert_ready_eq!(w2.poll(), Ok(()));
        assert_ready_eq!(w3.poll(), Ok(()));
        assert_ready_eq!(w4.poll(), Ok(()));

        assert_eq!(recorder.events(), vec![Event::Yield(vec![1, 2, 3, 4])]);
    }

    #[test]
    fn suspended_writer_resumes_at_low_watermark() {
        let config = WriterConfig::new()
            .with_high_watermark(2)
            .with_low_watermark(1)
            .with_max_pending_writes(4);
        let (writer, recorder) = writer(config);
        writer.set_writable(false);

        let mut w1 = task::spawn(writer.write(1));
        assert_ready_eq!(w1.poll(), Ok(()));
        let mut w2 = task::spawn(writer.write(2));
        assert_pending!(w2.poll());

        // refilled above the low watermark before the woken writer ran
        writer.set_writable(true);
        writer.set_writable(false);
        assert!(w2.is_woken());
        let mut w3 = task::spawn(writer.write(3));
        assert_ready_eq!(w3.poll(), Ok(()));
        let mut w4 = task::spawn(writer.write(4));
        assert_pending!(w4.poll());
        assert_pending!(w2.poll());

        writer.set_writable(true);
        assert_ready_eq!(w2.poll(), Ok(()));
        assert_ready_eq!(w4.poll(), Ok(()));
        assert_eq!(
            recorder.events(),
            vec![Event::Yield(vec![1, 2]), Event::Yield(vec![3, 4])]
        );
    }

    #[test]
    fn default_ceiling_is_sixteen() {
        let (writer, _recorder) = writer(WriterConfig::default());
        writer.set_writable(false);

        let mut writes: Vec<_> = (0..16).map(|i| task::spawn(writer.write(i))).collect();
        for (i, write) in writes.iter_mut().enumerate() {
            let poll = write.poll();
            if i < 7 {
                assert_eq!(assert_ready!(poll), Ok(()));
            } else {
                assert!(poll.is_pending());
            }
        }
        assert_eq!(writer.pending_len(), 16);

        let mut overflow = task::spawn(writer.write(16));
        assert_ready_eq!(overflow.poll(), Err(WriteError::TooManyPendingWrites));
    }

    #[test]
    fn finish_is_idempotent_and_waits_for_flush() {
        let (writer, recorder) = writer(WriterConfig::default());
        writer.set_writable(false);
        let mut write = task::spawn(writer.write(1));
        assert_ready_eq!(write.poll(), Ok(()));

        writer.finish();
        writer.finish();
        assert!(writer.is_finished());
        assert!(recorder.events().is_empty());

        let mut late = task::spawn(writer.write(2));
        assert_ready_eq!(late.poll(), Err(WriteError::AlreadyFinished));

        writer.set_writable(true);
        writer.finish();
        assert_eq!(
            recorder.events(),
            vec![Event::Yield(vec![1]), Event::Terminate(None)]
        );
    }

    #[test]
    fn finish_with_error_delivers_pending_first() {
        let (writer, recorder) = writer(WriterConfig::default());
        writer.set_writable(false);
        let mut write = task::spawn(writer.write(1));
        assert_ready_eq!(write.poll(), Ok(()));

        writer.finish_with_error("handler failed");
        writer.set_writable(true);
        assert_eq!(
            recorder.events(),
            vec![
                Event::Yield(vec![1]),
                Event::Terminate(Some("handler failed"))
            ]
        );
    }

    #[test]
    fn cancel_discards_and_wakes_suspended_writers() {
        let config = WriterConfig::new()
            .with_high_watermark(1)
            .with_low_watermark(0)
            .with_max_pending_writes(2);
        let (writer, recorder) = writer(config);
        writer.set_writable(false);

        let mut suspended = task::spawn(writer.write(1));
        assert_pending!(suspended.poll());

        writer.cancel("reset");
        writer.cancel("again");
        writer.finish();
        assert!(suspended.is_woken());
        assert_ready_eq!(suspended.poll(), Err(WriteError::Cancelled));

        writer.set_writable(true);
        assert_eq!(recorder.events(), vec![Event::Terminate(Some("reset"))]);
    }

    #[test]
    fn cancel_after_finish_is_noop() {
        let (writer, recorder) = writer(WriterConfig::default());
        writer.finish();
        writer.cancel("too late");
        assert_eq!(recorder.events(), vec![Event::Terminate(None)]);
    }

    #[test]
    fn cancel_while_finishing_terminates_once() {
        let (writer, recorder) = writer(WriterConfig::default());
        writer.set_writable(false);
        let mut write = task::spawn(writer.write(1));
        assert_ready_eq!(write.poll(), Ok(()));

        writer.finish();
        writer.cancel("reset");
        writer.set_writable(true);
        assert_eq!(recorder.events(), vec![Event::Terminate(Some("reset"))]);
    }

    #[test]
    fn drained_resolves_after_flush() {
        let (writer, _recorder) = writer(WriterConfig::default());
        {
            let mut drained = task::spawn(writer.drained());
            assert_ready!(drained.poll());
        }

        writer.set_writable(false);
        let mut write = task::spawn(writer.write(1));
        assert_ready_eq!(write.poll(), Ok(()));

        let mut drained = task::spawn(writer.drained());
        assert_pending!(drained.poll());
        writer.set_writable(true);
        assert!(drained.is_woken());
        assert_ready!(drained.poll());
    }

    #[tokio::test]
    async fn cancel_asynchronously_on_runtime() {
        let (writer, recorder) = writer(WriterConfig::default());
        writer.cancel_asynchronously("async");
        tokio::task::yield_now().await;
        for _ in 0..10 {
            if !recorder.events().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(recorder.events(), vec![Event::Terminate(Some("async"))]);
        assert!(writer.is_finished());
    }

    #[test]
    fn cancel_asynchronously_without_runtime_is_inline() {
        let (writer, recorder) = writer(WriterConfig::default());
        writer.cancel_asynchronously("inline");
        assert_eq!(recorder.events(), vec![Event::Terminate(Some("inline"))]);
    }
}
