use parking_lot::Mutex;
use std::pin::pin;
use tokio::sync::Notify;

/// A value resolved at most once, awaitable by any number of tasks.
///
/// The first completion wins, later completions are ignored.
pub(crate) struct Promise<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

enum Slot<T> {
    Pending,
    Ready(T),
    Taken,
}

impl<T> Promise<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            notify: Notify::new(),
        }
    }

    /// Resolve the promise, returns `false` if it was already resolved.
    pub(crate) fn complete(&self, value: T) -> bool {
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Pending) {
                return false;
            }
            *slot = Slot::Ready(value);
        }
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_completed(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    /// Wait for the promise to resolve and take its value.
    ///
    /// Returns `None` if the value was already taken.
    pub(crate) async fn take(&self) -> Option<T> {
        self.wait_with(|slot| match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(value) => Some(Some(value)),
            Slot::Taken => Some(None),
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
        })
        .await
    }

    async fn wait_with<R>(&self, mut f: impl FnMut(&mut Slot<T>) -> Option<R>) -> R {
        loop {
            let mut notified = pin!(self.notify.notified());
            // register before checking, so a completion in between is not lost
            notified.as_mut().enable();

            if let Some(value) = f(&mut self.slot.lock()) {
                return value;
            }

            notified.await;
        }
    }
}

impl<T: Clone> Promise<T> {
    /// Wait for the promise to resolve and return a copy of its value.
    ///
    /// Returns `None` if the value was taken using [`Promise::take`].
    pub(crate) async fn wait(&self) -> Option<T> {
        self.wait_with(|slot| match slot {
            Slot::Ready(value) => Some(Some(value.clone())),
            Slot::Taken => Some(None),
            Slot::Pending => None,
        })
        .await
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("completed", &self.is_completed())
            .finish()
    }
}
