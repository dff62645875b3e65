//! Shared state of a client call.
//!
//! A [`CallInner`] aggregates the response parts routed by the transport into
//! promises and the response channel, and feeds the request writer into the
//! transport stream. It is shared by the call handles, while the transport
//! only holds a weak [`ResponseRouter`].

use std::{
    fmt,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    MessageMetadata, MetadataMap, RequestPart, ResponsePart, Status,
    channel::PassthroughSource,
    codec::Codec,
    compression::should_compress,
    error::{BoxError, ProtocolViolation},
    interceptor::{Interceptor, InterceptorPipeline},
    promise::Promise,
    stream::OutboundMessage,
    writer::{AsyncWriter, WriterDelegate},
};

use super::ClientStream;

/// Type erased view on a call, used by the router and the call handles.
pub(crate) trait CallCore: Send + Sync + 'static {
    fn route(&self, part: ResponsePart<Bytes>);
    fn fail(&self, error: BoxError);
    fn set_writable(&self, writable: bool);
    fn cancel(&self);
    fn initial_metadata(&self) -> &Promise<Result<MetadataMap, Status>>;
    fn trailing_metadata(&self) -> &Promise<Result<MetadataMap, Status>>;
    fn status(&self) -> &Promise<Status>;
}

/// Routes the response parts of a call, handed to the transport
/// when the stream of the call is opened.
///
/// The router does not keep the call alive: once every handle of the call
/// was dropped, routed parts are dropped as well.
#[derive(Clone)]
pub struct ResponseRouter {
    call: Weak<dyn CallCore>,
}

impl ResponseRouter {
    /// Route a response part to the call.
    pub fn route(&self, part: ResponsePart<Bytes>) {
        match self.call.upgrade() {
            Some(call) => call.route(part),
            None => tracing::trace!(kind = ?part.kind(), "client call dropped: drop response part"),
        }
    }

    /// Fail the call because of a transport error.
    pub fn fail(&self, error: impl Into<BoxError>) {
        if let Some(call) = self.call.upgrade() {
            call.fail(error.into());
        }
    }

    /// Update whether the transport accepts more request parts.
    pub fn set_writable(&self, writable: bool) {
        if let Some(call) = self.call.upgrade() {
            call.set_writable(writable);
        }
    }
}

impl fmt::Debug for ResponseRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRouter")
            .field("alive", &(self.call.strong_count() > 0))
            .finish()
    }
}

/// Where response messages go.
pub(crate) enum Responses<T> {
    Single(Arc<Promise<Result<T, Status>>>),
    Stream(PassthroughSource<T, Status>),
}

/// How the request writer is stopped when the call terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopWriter {
    /// Cancel it right away.
    Inline,
    /// Cancel it from another task, as the writer is locked by the caller.
    Deferred,
}

pub(crate) struct CallInner<C: Codec> {
    pub(crate) span: tracing::Span,
    codec: Mutex<C>,
    stream: Mutex<Option<Box<dyn ClientStream>>>,
    pipeline: InterceptorPipeline,
    compression_enabled: bool,
    compression_default: bool,
    initial_metadata: Promise<Result<MetadataMap, Status>>,
    trailing_metadata: Promise<Result<MetadataMap, Status>>,
    status: Promise<Status>,
    responses: Responses<C::Decode>,
    request_writer: Mutex<Option<AsyncWriter<OutboundMessage<C::Encode>, BoxError>>>,
    /// Fires when the call is cancelled or fails locally.
    pub(crate) cancellation: CancellationToken,
    /// Fires when the call completed, however it completed.
    pub(crate) done: CancellationToken,
    finished: Mutex<bool>,
}

impl<C: Codec> CallInner<C> {
    pub(crate) fn new(
        span: tracing::Span,
        codec: C,
        pipeline: InterceptorPipeline,
        compression_enabled: bool,
        compression_default: bool,
        responses: Responses<C::Decode>,
    ) -> Self {
        Self {
            span,
            codec: Mutex::new(codec),
            stream: Mutex::new(None),
            pipeline,
            compression_enabled,
            compression_default,
            initial_metadata: Promise::new(),
            trailing_metadata: Promise::new(),
            status: Promise::new(),
            responses,
            request_writer: Mutex::new(None),
            cancellation: CancellationToken::new(),
            done: CancellationToken::new(),
            finished: Mutex::new(false),
        }
    }

    pub(crate) fn router(self: &Arc<Self>) -> ResponseRouter {
        let call: Weak<Self> = Arc::downgrade(self);
        ResponseRouter { call }
    }

    pub(crate) fn set_stream(&self, stream: Box<dyn ClientStream>) {
        *self.stream.lock() = Some(stream);
    }

    pub(crate) fn set_request_writer(&self, writer: AsyncWriter<OutboundMessage<C::Encode>, BoxError>) {
        let finished = self.finished.lock();
        if *finished {
            drop(finished);
            writer.cancel(Status::cancelled("call completed").into());
        } else {
            *self.request_writer.lock() = Some(writer);
        }
    }

    fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    /// Marks the call as finished, returns `false` if it already was.
    fn mark_finished(&self) -> bool {
        let mut finished = self.finished.lock();
        !std::mem::replace(&mut *finished, true)
    }

    /// Send a request part through the interceptors to the transport.
    ///
    /// Returns the interceptor rejection, if any.
    fn send_part(&self, mut part: RequestPart<Bytes>, metadata: MessageMetadata) -> Result<(), Status> {
        self.pipeline.intercept_request(&mut part)?;
        match &mut *self.stream.lock() {
            Some(stream) => stream.send(part, metadata),
            None => tracing::trace!(kind = ?part.kind(), "client stream released: drop request part"),
        }
        Ok(())
    }

    pub(crate) fn send_metadata(&self, metadata: MetadataMap) {
        if let Err(status) = self.send_part(RequestPart::Metadata(metadata), MessageMetadata::default()) {
            tracing::debug!("request metadata rejected by interceptor: {status}");
            self.terminate(status, StopWriter::Inline);
        }
    }

    /// Encode and send request messages, in order.
    pub(crate) fn send_requests(&self, messages: Vec<OutboundMessage<C::Encode>>) {
        self.send_requests_with(messages, StopWriter::Inline);
    }

    fn send_requests_with(&self, messages: Vec<OutboundMessage<C::Encode>>, stop: StopWriter) {
        for OutboundMessage {
            message,
            compression,
        } in messages
        {
            if self.is_finished() {
                tracing::trace!("client call finished: drop request message");
                return;
            }
            let encoded = self.codec.lock().encode(message);
            let result = encoded.and_then(|bytes| {
                let compress =
                    should_compress(self.compression_enabled, compression, self.compression_default);
                self.send_part(RequestPart::Message(bytes), MessageMetadata::flushed(compress))
            });
            if let Err(status) = result {
                tracing::debug!("failed to send request message: {status}");
                self.terminate(status, stop);
                return;
            }
        }
    }

    fn send_end(&self, stop: StopWriter) {
        if self.is_finished() {
            return;
        }
        if let Err(status) = self.send_part(RequestPart::End, MessageMetadata::default()) {
            tracing::debug!("end of requests rejected by interceptor: {status}");
            self.terminate(status, stop);
        }
    }

    /// Close the request side of the call once every written request was sent.
    pub(crate) fn finish_requests(&self) {
        let writer = self.request_writer.lock().clone();
        match writer {
            Some(writer) => writer.finish(),
            None => self.send_end(StopWriter::Inline),
        }
    }

    fn on_message(&self, bytes: Bytes) {
        if !self.initial_metadata.is_completed() {
            self.violation("response message received before metadata");
            return;
        }

        let decoded = self.codec.lock().decode(bytes);
        let message = match decoded {
            Ok(message) => message,
            Err(status) => {
                tracing::debug!("failed to decode response message: {status}");
                self.terminate(status, StopWriter::Inline);
                return;
            }
        };

        match &self.responses {
            Responses::Single(response) => {
                if !response.complete(Ok(message)) {
                    self.violation("more than one response message for a single response call");
                }
            }
            Responses::Stream(source) => {
                let result = source.yield_element(message);
                tracing::trace!(accepted = result.is_accepted(), "response message yielded");
            }
        }
    }

    fn violation(&self, reason: &'static str) {
        tracing::debug!(reason, "protocol violation by server");
        let status = Status::from_error(ProtocolViolation::new(reason).into());
        self.terminate(status, StopWriter::Inline);
    }

    /// Complete the call with the end sent by the server.
    fn complete(&self, status: Status, trailers: MetadataMap) {
        if !self.mark_finished() {
            return;
        }
        let _enter = self.span.enter();
        tracing::debug!(code = ?status.code(), "client call ended");

        let stream = self.stream.lock().take();
        drop(stream);
        self.initial_metadata.complete(if status.is_ok() {
            Ok(MetadataMap::new())
        } else {
            Err(status.clone())
        });
        self.trailing_metadata.complete(Ok(trailers));
        match &self.responses {
            Responses::Single(response) => {
                response.complete(Err(if status.is_ok() {
                    Status::internal("Missing response message.")
                } else {
                    status.clone()
                }));
            }
            Responses::Stream(source) => {
                if status.is_ok() {
                    source.finish();
                } else {
                    source.finish_with_error(status.clone());
                }
            }
        }
        self.stop_request_writer(StopWriter::Inline);
        self.done.cancel();
        self.status.complete(status);
    }

    /// Terminate the call locally: cancellation, deadline or failure.
    fn terminate(&self, status: Status, stop: StopWriter) {
        if !self.mark_finished() {
            return;
        }
        let _enter = self.span.enter();
        tracing::debug!(code = ?status.code(), "client call terminated: {status}");

        let stream = self.stream.lock().take();
        if let Some(mut stream) = stream {
            stream.cancel();
        }
        self.initial_metadata.complete(Err(status.clone()));
        self.trailing_metadata.complete(Err(status.clone()));
        match &self.responses {
            Responses::Single(response) => {
                response.complete(Err(status.clone()));
            }
            Responses::Stream(source) => {
                source.finish_with_error(status.clone());
            }
        }
        self.cancellation.cancel();
        self.stop_request_writer(stop);
        self.done.cancel();
        self.status.complete(status);
    }

    pub(crate) fn terminate_now(&self, status: Status) {
        self.terminate(status, StopWriter::Inline);
    }

    fn stop_request_writer(&self, stop: StopWriter) {
        let Some(writer) = self.request_writer.lock().take() else {
            return;
        };
        let reason: BoxError = Status::cancelled("call completed").into();
        match stop {
            StopWriter::Inline => writer.cancel(reason),
            StopWriter::Deferred if tokio::runtime::Handle::try_current().is_ok() => {
                writer.cancel_asynchronously(reason);
            }
            // cancelling inline would deadlock on the writer lock held by the caller,
            // later writes are dropped as the call is finished
            StopWriter::Deferred => tracing::trace!("no runtime to cancel the request writer"),
        }
    }
}

impl<C: Codec> CallCore for CallInner<C> {
    fn route(&self, mut part: ResponsePart<Bytes>) {
        if self.is_finished() {
            tracing::trace!(kind = ?part.kind(), "client call finished: drop response part");
            return;
        }
        if let Err(status) = self.pipeline.intercept_response(&mut part) {
            tracing::debug!("response part rejected by interceptor: {status}");
            self.terminate(status, StopWriter::Inline);
            return;
        }

        match part {
            ResponsePart::Metadata(metadata) => {
                if !self.initial_metadata.complete(Ok(metadata)) {
                    self.violation("response metadata received twice");
                }
            }
            ResponsePart::Message(bytes, _) => self.on_message(bytes),
            ResponsePart::End(status, trailers) => self.complete(status, trailers),
        }
    }

    fn fail(&self, error: BoxError) {
        self.terminate(Status::from_error(error), StopWriter::Inline);
    }

    fn set_writable(&self, writable: bool) {
        let writer = self.request_writer.lock().clone();
        if let Some(writer) = writer {
            writer.set_writable(writable);
        }
    }

    fn cancel(&self) {
        self.terminate(Status::cancelled("call was cancelled by the client"), StopWriter::Inline);
    }

    fn initial_metadata(&self) -> &Promise<Result<MetadataMap, Status>> {
        &self.initial_metadata
    }

    fn trailing_metadata(&self) -> &Promise<Result<MetadataMap, Status>> {
        &self.trailing_metadata
    }

    fn status(&self) -> &Promise<Status> {
        &self.status
    }
}

/// Feeds the request writer of a call into its stream.
pub(crate) struct RequestSink<C: Codec> {
    call: Weak<CallInner<C>>,
}

impl<C: Codec> RequestSink<C> {
    pub(crate) fn new(call: &Arc<CallInner<C>>) -> Self {
        Self {
            call: Arc::downgrade(call),
        }
    }
}

impl<C: Codec> WriterDelegate<OutboundMessage<C::Encode>, BoxError> for RequestSink<C> {
    fn did_yield(&self, elements: Vec<OutboundMessage<C::Encode>>) {
        if let Some(call) = self.call.upgrade() {
            // the writer is locked while yielding
            call.send_requests_with(elements, StopWriter::Deferred);
        }
    }

    fn did_terminate(&self, reason: Option<BoxError>) {
        match (reason, self.call.upgrade()) {
            (None, Some(call)) => call.send_end(StopWriter::Deferred),
            (Some(reason), _) => tracing::trace!("request writer cancelled: {reason}"),
            (None, None) => {}
        }
    }
}
