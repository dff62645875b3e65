//! Typed message streams handed to handlers and client callers.
//!
//! [`Streaming`] is the inbound side (requests on the server, responses on the
//! client) and [`StreamWriter`] the outbound side, built on top of the
//! [passthrough channel](crate::channel) and the [bounded writer](crate::writer)
//! respectively.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{
    Status,
    channel::PassthroughStream,
    compression::CompressionOverride,
    error::BoxError,
    writer::AsyncWriter,
};

/// Inbound messages of a call.
///
/// Once the governing call is cancelled the next read fails, even if messages
/// are still buffered: with the status the call failed with, or else a
/// [`Code::Cancelled`](crate::Code::Cancelled) status.
pub struct Streaming<T> {
    inner: PassthroughStream<T, Status>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

/// Requests received by a server handler.
pub type RequestStream<T> = Streaming<T>;

/// Responses received by a client call.
pub type ResponseStream<T> = Streaming<T>;

impl<T> Streaming<T> {
    pub(crate) fn new(inner: PassthroughStream<T, Status>, cancellation: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancellation.cancelled_owned()),
            done: false,
        }
    }

    /// Fetch the next message.
    ///
    /// Resolves to `Ok(None)` once the peer closed its side of the stream.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        std::future::poll_fn(|cx| self.poll_message(cx)).await
    }

    fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<T>, Status>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            // the status the call ended with, rather than a generic cancellation
            let status = self
                .inner
                .failure()
                .unwrap_or_else(|| Status::cancelled("call was cancelled"));
            return Poll::Ready(Err(status));
        }
        self.inner.poll_next_element(cx)
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.poll_message(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Some(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Ok(None)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Err(status)) => {
                this.done = true;
                Poll::Ready(Some(Err(status)))
            }
        }
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("inner", &self.inner)
            .field("done", &self.done)
            .finish()
    }
}

/// A message queued on a [`StreamWriter`], not yet encoded.
pub(crate) struct OutboundMessage<T> {
    pub(crate) message: T,
    pub(crate) compression: CompressionOverride,
}

/// Outbound messages of a call.
///
/// Cheap to clone. Every message is written with `flush = true`,
/// its compress flag is resolved by the call it belongs to.
pub struct StreamWriter<T> {
    writer: AsyncWriter<OutboundMessage<T>, BoxError>,
}

/// Responses sent by a server handler.
pub type ResponseStreamWriter<T> = StreamWriter<T>;

/// Requests sent by a client call.
pub type RequestStreamWriter<T> = StreamWriter<T>;

impl<T> StreamWriter<T> {
    pub(crate) fn new(writer: AsyncWriter<OutboundMessage<T>, BoxError>) -> Self {
        Self { writer }
    }

    /// Send a message using the default compression of the call.
    pub async fn send(&self, message: T) -> Result<(), Status> {
        self.send_with(message, CompressionOverride::Inherit).await
    }

    /// Send a message, overriding the default compression of the call.
    pub async fn send_with(
        &self,
        message: T,
        compression: CompressionOverride,
    ) -> Result<(), Status> {
        self.writer
            .write(OutboundMessage {
                message,
                compression,
            })
            .await
            .map_err(Status::from)
    }

    /// Wait until all sent messages were handed over to the call.
    pub async fn drained(&self) {
        self.writer.drained().await;
    }

    /// Signal that no more messages will be sent.
    ///
    /// Messages already sent are still delivered. Sending after finishing fails.
    pub fn finish(&self) {
        self.writer.finish();
    }

    /// Returns `true` once the writer no longer accepts messages.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.writer.is_finished()
    }
}

impl<T> Clone for StreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
        }
    }
}

impl<T> fmt::Debug for StreamWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("finished", &self.writer.is_finished())
            .finish()
    }
}
