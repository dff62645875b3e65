use std::{fmt, sync::Arc};

use smol_str::SmolStr;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{MetadataMap, Status, error::ProtocolViolation};

/// Mutation of the call requested by a handler through its context.
pub(crate) enum ContextCommand {
    SetResponseHeaders(MetadataMap, oneshot::Sender<Result<(), Status>>),
    SetResponseTrailers(MetadataMap, oneshot::Sender<Result<(), Status>>),
    SetCompressionEnabled(bool, oneshot::Sender<Result<(), Status>>),
    /// Cancel the call as the client broke the protocol of the rpc.
    Abort(ProtocolViolation),
}

/// Per call context given to a [`ServerHandler`].
///
/// Cheap to clone. Mutations are applied by the call itself,
/// the setters resolve once they were (or could not be) applied.
///
/// [`ServerHandler`]: super::ServerHandler
#[derive(Clone)]
pub struct ServerCallContext {
    request_metadata: Arc<MetadataMap>,
    path: SmolStr,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    commands: mpsc::UnboundedSender<ContextCommand>,
}

impl ServerCallContext {
    pub(crate) fn new(
        request_metadata: Arc<MetadataMap>,
        path: SmolStr,
        deadline: Option<Instant>,
        cancellation: CancellationToken,
        commands: mpsc::UnboundedSender<ContextCommand>,
    ) -> Self {
        Self {
            request_metadata,
            path,
            deadline,
            cancellation,
            commands,
        }
    }

    /// The metadata sent by the client to start the call.
    #[must_use]
    pub fn request_metadata(&self) -> &MetadataMap {
        &self.request_metadata
    }

    /// The path of the rpc, e.g. `/greeter.Greeter/SayHello`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The instant at which the call is cancelled
    /// with [`Code::DeadlineExceeded`](crate::Code::DeadlineExceeded), if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once the call was cancelled or completed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the call was cancelled or completed.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Replace the headers sent ahead of the first response message.
    ///
    /// Fails with [`Code::FailedPrecondition`](crate::Code::FailedPrecondition)
    /// once the headers were sent.
    pub async fn set_response_headers(&self, headers: MetadataMap) -> Result<(), Status> {
        self.request(|reply| ContextCommand::SetResponseHeaders(headers, reply))
            .await
    }

    /// Replace the trailers sent with the end of the call.
    pub async fn set_response_trailers(&self, trailers: MetadataMap) -> Result<(), Status> {
        self.request(|reply| ContextCommand::SetResponseTrailers(trailers, reply))
            .await
    }

    /// Change the default compression of response messages.
    pub async fn set_compression_enabled(&self, enabled: bool) -> Result<(), Status> {
        self.request(|reply| ContextCommand::SetCompressionEnabled(enabled, reply))
            .await
    }

    /// Cancel the call with a protocol violation, as if the call itself detected it.
    ///
    /// Resolves once the call was cancelled, returning the violation.
    pub(crate) async fn abort(&self, violation: ProtocolViolation) -> ProtocolViolation {
        if self
            .commands
            .send(ContextCommand::Abort(violation.clone()))
            .is_ok()
        {
            self.cancelled().await;
        }
        violation
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), Status>>) -> ContextCommand,
    ) -> Result<(), Status> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(command(tx)).is_err() {
            return Err(call_completed());
        }
        rx.await.unwrap_or_else(|err| {
            tracing::trace!("context command dropped: {err}");
            Err(call_completed())
        })
    }
}

fn call_completed() -> Status {
    Status::failed_precondition("call already completed")
}

impl fmt::Debug for ServerCallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCallContext")
            .field("request_metadata", &self.request_metadata)
            .field("path", &self.path)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    fn context() -> (ServerCallContext, mpsc::UnboundedReceiver<ContextCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = ServerCallContext::new(
            Arc::new(MetadataMap::new()),
            SmolStr::new_static("/test.Service/Method"),
            None,
            CancellationToken::new(),
            tx,
        );
        (ctx, rx)
    }

    #[tokio::test]
    async fn setters_are_answered_by_the_call() {
        let (ctx, mut rx) = context();
        assert_eq!(ctx.path(), "/test.Service/Method");

        let answer = tokio::spawn(async move {
            match rx.recv().await {
                Some(ContextCommand::SetCompressionEnabled(true, reply)) => {
                    reply.send(Ok(())).unwrap();
                }
                _ => panic!("unexpected command"),
            }
        });

        ctx.set_compression_enabled(true).await.unwrap();
        answer.await.unwrap();
    }

    #[tokio::test]
    async fn abort_waits_for_the_call_to_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let ctx = ServerCallContext::new(
            Arc::new(MetadataMap::new()),
            SmolStr::new_static("/test.Service/Method"),
            None,
            token.clone(),
            tx,
        );

        let call = tokio::spawn(async move {
            match rx.recv().await {
                Some(ContextCommand::Abort(violation)) => {
                    token.cancel();
                    violation
                }
                _ => panic!("unexpected command"),
            }
        });

        let violation = ctx.abort(ProtocolViolation::new("two requests")).await;
        assert!(ctx.is_cancelled());
        assert_eq!(call.await.unwrap(), violation);
    }

    #[tokio::test]
    async fn setters_fail_once_call_is_gone() {
        let (ctx, rx) = context();
        drop(rx);
        let status = ctx
            .set_response_trailers(MetadataMap::new())
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }
}
