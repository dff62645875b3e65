//! Client side of a call.
//!
//! A [`Client`] starts calls of the four rpc shapes on top of a [`Channel`].
//! Starting a call invokes it: the stream is opened, the request metadata
//! sent and, for calls with a single request, the request sent and the
//! request side closed. The returned handle exposes the metadata, the
//! response(s) and the final status of the call as futures.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use smol_str::SmolStr;
use tracing::Instrument;

use crate::{
    MessageMetadata, RequestPart, Status,
    channel::passthrough,
    codec::Codec,
    compression::CompressionOverride,
    error::{BoxError, ConnectError, DeadlineExceeded},
    promise::Promise,
    stream::{OutboundMessage, StreamWriter, Streaming},
    timeout::{GRPC_TIMEOUT_HEADER, encode_grpc_timeout},
    writer::AsyncWriter,
};

mod call;
mod config;
mod handle;

#[doc(inline)]
pub use self::{
    call::ResponseRouter,
    config::{CallOptions, ClientConfig},
    handle::{BidirectionalStreamingCall, Call, ClientStreamingCall, ServerStreamingCall, UnaryCall},
};

use self::call::{CallInner, RequestSink, Responses};

/// Opens the transport streams of client calls.
pub trait Channel: Send + Sync + 'static {
    /// Open a stream for the rpc at `path`.
    ///
    /// Response parts of the stream are handed to `router`.
    fn open_stream(&self, path: &str, router: ResponseRouter)
    -> Result<Box<dyn ClientStream>, BoxError>;
}

impl<C: Channel> Channel for Arc<C> {
    fn open_stream(
        &self,
        path: &str,
        router: ResponseRouter,
    ) -> Result<Box<dyn ClientStream>, BoxError> {
        (**self).open_stream(path, router)
    }
}

/// The transport stream of a single client call, exclusively owned by the call.
///
/// Implementations must not call back into the [`ResponseRouter`] of the
/// call from within these methods.
pub trait ClientStream: Send + 'static {
    /// Write a request part.
    fn send(&mut self, part: RequestPart<Bytes>, metadata: MessageMetadata);

    /// Abort the stream, no parts are sent afterwards.
    fn cancel(&mut self);
}

/// Starts client calls on a [`Channel`].
pub struct Client<Ch> {
    channel: Arc<Ch>,
    config: ClientConfig,
}

impl<Ch> Clone for Client<Ch> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            config: self.config.clone(),
        }
    }
}

impl<Ch: fmt::Debug> fmt::Debug for Client<Ch> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("channel", &self.channel)
            .field("config", &self.config)
            .finish()
    }
}

impl<Ch: Channel> Client<Ch> {
    /// Create a new [`Client`] using the default config.
    pub fn new(channel: Ch) -> Self {
        Self::with_config(channel, ClientConfig::default())
    }

    /// Create a new [`Client`] using the given config.
    pub fn with_config(channel: Ch, config: ClientConfig) -> Self {
        Self {
            channel: Arc::new(channel),
            config,
        }
    }

    /// The config used for every call.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Mutable access to the config used for every call started afterwards.
    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// Start a call with a single request and a single response.
    pub fn unary<C: Codec>(
        &self,
        path: &str,
        codec: C,
        request: C::Encode,
        options: CallOptions,
    ) -> UnaryCall<C::Decode> {
        let response = Arc::new(Promise::new());
        let inner = self.start(path, codec, &options, Responses::Single(response.clone()));
        send_single_request(&inner, request);
        UnaryCall::new(Call::new(inner), response)
    }

    /// Start a call with a stream of requests and a single response.
    pub fn client_streaming<C: Codec>(
        &self,
        path: &str,
        codec: C,
        options: CallOptions,
    ) -> ClientStreamingCall<C::Encode, C::Decode> {
        let response = Arc::new(Promise::new());
        let inner = self.start(path, codec, &options, Responses::Single(response.clone()));
        let requests = self.request_writer(&inner);
        ClientStreamingCall::new(Call::new(inner), requests, response)
    }

    /// Start a call with a single request and a stream of responses.
    pub fn server_streaming<C: Codec>(
        &self,
        path: &str,
        codec: C,
        request: C::Encode,
        options: CallOptions,
    ) -> ServerStreamingCall<C::Decode> {
        let (source, stream) = passthrough();
        let inner = self.start(path, codec, &options, Responses::Stream(source));
        let responses = Streaming::new(stream, inner.cancellation.clone());
        send_single_request(&inner, request);
        ServerStreamingCall::new(Call::new(inner), responses)
    }

    /// Start a call with a stream of requests and a stream of responses.
    pub fn bidirectional_streaming<C: Codec>(
        &self,
        path: &str,
        codec: C,
        options: CallOptions,
    ) -> BidirectionalStreamingCall<C::Encode, C::Decode> {
        let (source, stream) = passthrough();
        let inner = self.start(path, codec, &options, Responses::Stream(source));
        let responses = Streaming::new(stream, inner.cancellation.clone());
        let requests = self.request_writer(&inner);
        BidirectionalStreamingCall::new(Call::new(inner), requests, responses)
    }

    fn request_writer<C: Codec>(&self, inner: &Arc<CallInner<C>>) -> StreamWriter<C::Encode> {
        let writer = AsyncWriter::new(RequestSink::new(inner), self.config.writer());
        inner.set_request_writer(writer.clone());
        StreamWriter::new(writer)
    }

    /// Open the stream, arm the deadline and send the request metadata.
    fn start<C: Codec>(
        &self,
        path: &str,
        codec: C,
        options: &CallOptions,
        responses: Responses<C::Decode>,
    ) -> Arc<CallInner<C>> {
        let path = SmolStr::new(path);
        let span = tracing::debug_span!("grpc.client.call", path = %path);
        let inner = Arc::new(CallInner::new(
            span.clone(),
            codec,
            self.config.interceptors().clone(),
            self.config.compression_enabled(),
            options.compression(),
            responses,
        ));

        let stream = {
            let _enter = span.enter();
            tracing::debug!("client call started");
            self.channel.open_stream(&path, inner.router())
        };
        match stream {
            Ok(stream) => inner.set_stream(stream),
            Err(err) => {
                inner.terminate_now(Status::from_error(ConnectError(err).into()));
                return inner;
            }
        }

        let mut metadata = options.metadata().clone();
        if let Some(timeout) = options.timeout().or(self.config.timeout()) {
            match encode_grpc_timeout(timeout) {
                Ok(value) => {
                    metadata.insert(GRPC_TIMEOUT_HEADER, value);
                }
                Err(err) => tracing::debug!("failed to encode grpc-timeout: {err}"),
            }
            arm_deadline(&inner, timeout);
        }
        inner.send_metadata(metadata);
        inner
    }
}

fn send_single_request<C: Codec>(inner: &CallInner<C>, request: C::Encode) {
    inner.send_requests(vec![OutboundMessage {
        message: request,
        compression: CompressionOverride::Inherit,
    }]);
    inner.finish_requests();
}

/// Cancel the call with [`Code::DeadlineExceeded`](crate::Code::DeadlineExceeded)
/// once `timeout` elapsed, unless it completed before.
///
/// Without a runtime the deadline is only enforced by the server.
fn arm_deadline<C: Codec>(inner: &Arc<CallInner<C>>, timeout: std::time::Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::trace!("no runtime available: deadline not enforced locally");
        return;
    };

    let call: std::sync::Weak<CallInner<C>> = Arc::downgrade(inner);
    let done = inner.done.clone();
    let span = inner.span.clone();
    drop(handle.spawn(
        async move {
            tokio::select! {
                () = done.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(call) = call.upgrade() {
                        tracing::debug!("client call deadline expired");
                        call.terminate_now(Status::from_error(DeadlineExceeded::new().into()));
                    }
                }
            }
        }
        .instrument(span),
    ));
}
