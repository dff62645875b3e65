use tokio_graceful::ShutdownGuard;

/// Spawns the tasks of server calls: the call driver and its handler.
///
/// By default tasks go straight to `tokio`. A graceful executor ties every
/// call task to a [`ShutdownGuard`], so that a graceful shutdown waits for
/// in-flight calls to send their end.
#[derive(Default, Debug, Clone)]
pub struct Executor {
    shutdown: Option<ShutdownGuard>,
}

impl Executor {
    /// Create an [`Executor`] spawning call tasks on the current `tokio` runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self { shutdown: None }
    }

    /// Create an [`Executor`] whose call tasks delay the shutdown `guard` belongs to.
    #[must_use]
    pub fn graceful(guard: ShutdownGuard) -> Self {
        Self {
            shutdown: Some(guard),
        }
    }

    /// Spawn a call task.
    pub fn spawn_task<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future<Output: Send + 'static> + Send + 'static,
    {
        match &self.shutdown {
            Some(guard) => guard.spawn_task(future),
            None => tokio::spawn(future),
        }
    }

    /// The shutdown guard of a [graceful](Self::graceful) executor.
    #[must_use]
    pub fn guard(&self) -> Option<&ShutdownGuard> {
        self.shutdown.as_ref()
    }
}
