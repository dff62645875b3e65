use std::fmt;

use crate::{
    Status,
    error::{BoxError, ProtocolViolation},
    stream::{RequestStream, ResponseStreamWriter},
};

use super::ServerCallContext;

/// A user handler, invoked exactly once per call.
///
/// The call ends once the returned future resolves: cleanly after every
/// message written to `responses` was sent, or with the status the
/// [`ErrorDelegate`] maps the error to.
///
/// Use [`unary`], [`client_streaming`], [`server_streaming`] or
/// [`bidirectional_streaming`] to create one from a function.
///
/// [`ErrorDelegate`]: crate::error::ErrorDelegate
pub trait ServerHandler<Req, Resp>: Send + Sync + 'static {
    /// Handle a single call.
    fn call(
        &self,
        requests: RequestStream<Req>,
        responses: ResponseStreamWriter<Resp>,
        ctx: ServerCallContext,
    ) -> impl Future<Output = Result<(), BoxError>> + Send + '_;
}

/// Read the single request of a unary or server streaming call.
async fn single_request<Req>(requests: &mut RequestStream<Req>) -> Result<Req, RequestError> {
    let Some(request) = requests.message().await? else {
        return Err(ProtocolViolation::new("missing request message").into());
    };
    if requests.message().await?.is_some() {
        return Err(ProtocolViolation::new("more than one request message").into());
    }
    Ok(request)
}

enum RequestError {
    Status(Status),
    Violation(ProtocolViolation),
}

impl From<Status> for RequestError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

impl From<ProtocolViolation> for RequestError {
    fn from(violation: ProtocolViolation) -> Self {
        Self::Violation(violation)
    }
}

/// Like [`single_request`], a violation cancels the call
/// instead of failing the handler.
async fn expect_single_request<Req>(
    requests: &mut RequestStream<Req>,
    ctx: &ServerCallContext,
) -> Result<Req, BoxError> {
    match single_request(requests).await {
        Ok(request) => Ok(request),
        Err(RequestError::Status(status)) => Err(status.into()),
        Err(RequestError::Violation(violation)) => Err(ctx.abort(violation).await.into()),
    }
}

macro_rules! handler_fn {
    ($(#[$m:meta])* $name:ident, $ctor:ident) => {
        $(#[$m])*
        #[derive(Clone)]
        pub struct $name<F> {
            f: F,
        }

        impl<F> fmt::Debug for $name<F> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }

        #[doc = concat!("Create a [`", stringify!($name), "`] handler from the given function.")]
        pub fn $ctor<F>(f: F) -> $name<F> {
            $name { f }
        }
    };
}

handler_fn! {
    /// Handler receiving one request and replying with one response.
    Unary, unary
}

handler_fn! {
    /// Handler receiving a stream of requests and replying with one response.
    ClientStreaming, client_streaming
}

handler_fn! {
    /// Handler receiving one request and replying with a stream of responses.
    ServerStreaming, server_streaming
}

handler_fn! {
    /// Handler receiving and replying with a stream of messages.
    BidirectionalStreaming, bidirectional_streaming
}

impl<Req, Resp, F, Fut, E> ServerHandler<Req, Resp> for Unary<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Req, ServerCallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn call(
        &self,
        mut requests: RequestStream<Req>,
        responses: ResponseStreamWriter<Resp>,
        ctx: ServerCallContext,
    ) -> Result<(), BoxError> {
        let request = expect_single_request(&mut requests, &ctx).await?;
        let response = (self.f)(request, ctx).await.map_err(Into::<BoxError>::into)?;
        responses.send(response).await?;
        Ok(())
    }
}

impl<Req, Resp, F, Fut, E> ServerHandler<Req, Resp> for ClientStreaming<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(RequestStream<Req>, ServerCallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn call(
        &self,
        requests: RequestStream<Req>,
        responses: ResponseStreamWriter<Resp>,
        ctx: ServerCallContext,
    ) -> Result<(), BoxError> {
        let response = (self.f)(requests, ctx).await.map_err(Into::<BoxError>::into)?;
        responses.send(response).await?;
        Ok(())
    }
}

impl<Req, Resp, F, Fut, E> ServerHandler<Req, Resp> for ServerStreaming<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Req, ResponseStreamWriter<Resp>, ServerCallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn call(
        &self,
        mut requests: RequestStream<Req>,
        responses: ResponseStreamWriter<Resp>,
        ctx: ServerCallContext,
    ) -> Result<(), BoxError> {
        let request = expect_single_request(&mut requests, &ctx).await?;
        (self.f)(request, responses, ctx).await.map_err(Into::into)
    }
}

impl<Req, Resp, F, Fut, E> ServerHandler<Req, Resp> for BidirectionalStreaming<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(RequestStream<Req>, ResponseStreamWriter<Resp>, ServerCallContext) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn call(
        &self,
        requests: RequestStream<Req>,
        responses: ResponseStreamWriter<Resp>,
        ctx: ServerCallContext,
    ) -> Result<(), BoxError> {
        (self.f)(requests, responses, ctx).await.map_err(Into::into)
    }
}
