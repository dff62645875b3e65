//! The driver of a single server call.
//!
//! One task owns the [`CallState`], the transport, the interceptor pipeline
//! and the resources of the running handler. Everything else talks to it
//! through channels: the [`ServerCallHandle`] for inbound parts, the response
//! writer for outbound messages and the [`ServerCallContext`] for mutations.

use std::{pin::Pin, sync::Arc};

use bytes::Bytes;
use smol_str::SmolStr;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, Sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    MessageMetadata, MetadataMap, PartKind, RequestPart, ResponsePart, Status,
    channel::{PassthroughSource, passthrough},
    codec::Codec,
    compression::should_compress,
    error::{BoxError, DeadlineExceeded, ErrorDelegate},
    interceptor::{Interceptor, InterceptorPipeline},
    rt::Executor,
    stream::{OutboundMessage, StreamWriter, Streaming},
    timeout::effective_timeout,
    writer::{AsyncWriter, WriterDelegate},
};

use super::{
    ServerConfig, ServerHandler, ServerTransport,
    context::{ContextCommand, ServerCallContext},
    state::{CallState, Decision, InboundState, OutboundState},
};

/// Inbound events submitted by the [`ServerCallHandle`].
pub(crate) enum Inbound {
    Part(RequestPart<Bytes>),
    Error(BoxError),
    Finish,
    Writable(bool),
}

/// Handle used by a transport to feed a server call.
///
/// Cheap to clone. Dropping all handles before the request stream ended
/// cancels the call, as [`ServerCallHandle::finish`] does.
#[derive(Debug, Clone)]
pub struct ServerCallHandle {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl ServerCallHandle {
    fn submit(&self, inbound: Inbound) {
        if self.tx.send(inbound).is_err() {
            tracing::trace!("server call completed: drop inbound event");
        }
    }

    /// Submit the request metadata, starting the handler.
    pub fn receive_metadata(&self, metadata: MetadataMap) {
        self.submit(Inbound::Part(RequestPart::Metadata(metadata)));
    }

    /// Submit a serialized request message.
    pub fn receive_message(&self, message: Bytes) {
        self.submit(Inbound::Part(RequestPart::Message(message)));
    }

    /// Signal that the client closed the request stream.
    pub fn receive_end(&self) {
        self.submit(Inbound::Part(RequestPart::End));
    }

    /// Submit a request part.
    pub fn receive_part(&self, part: RequestPart<Bytes>) {
        self.submit(Inbound::Part(part));
    }

    /// Cancel the call because of a transport error.
    pub fn receive_error(&self, error: impl Into<BoxError>) {
        self.submit(Inbound::Error(error.into()));
    }

    /// Cancel the call because the transport went away.
    pub fn finish(&self) {
        self.submit(Inbound::Finish);
    }

    /// Update whether the transport accepts more response parts.
    pub fn set_writable(&self, writable: bool) {
        self.submit(Inbound::Writable(writable));
    }

    /// Returns `true` once the call completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the call completed and released its transport.
    pub async fn completed(&self) {
        self.tx.closed().await;
    }
}

/// Events raised by the running handler and its response writer.
enum HandlerEvent<T> {
    Yielded(Vec<OutboundMessage<T>>),
    Drained(Option<BoxError>),
    Returned(Option<BoxError>),
}

struct ResponseSink<T> {
    tx: mpsc::UnboundedSender<HandlerEvent<T>>,
}

impl<T: Send + 'static> WriterDelegate<OutboundMessage<T>, BoxError> for ResponseSink<T> {
    fn did_yield(&self, elements: Vec<OutboundMessage<T>>) {
        if self.tx.send(HandlerEvent::Yielded(elements)).is_err() {
            tracing::trace!("server call completed: drop response messages");
        }
    }

    fn did_terminate(&self, reason: Option<BoxError>) {
        if self.tx.send(HandlerEvent::Drained(reason)).is_err() {
            tracing::trace!("server call completed: ignore writer termination");
        }
    }
}

/// Reports how the handler returned, finishing its response writer.
///
/// A handler task dropped before it returned, e.g. because it panicked,
/// fails the call.
struct ReturnReport<T: Send + 'static> {
    tx: mpsc::UnboundedSender<HandlerEvent<T>>,
    writer: AsyncWriter<OutboundMessage<T>, BoxError>,
    reported: bool,
}

impl<T: Send + 'static> ReturnReport<T> {
    fn report(&mut self, outcome: Option<BoxError>) {
        self.reported = true;
        self.writer.finish();
        if self.tx.send(HandlerEvent::Returned(outcome)).is_err() {
            tracing::trace!("server call completed: ignore handler outcome");
        }
    }
}

impl<T: Send + 'static> Drop for ReturnReport<T> {
    fn drop(&mut self) {
        if !self.reported {
            self.report(Some("server handler ended without returning".into()));
        }
    }
}

/// Resources of a running handler.
struct Active<Req, Resp> {
    requests: PassthroughSource<Req, Status>,
    writer: AsyncWriter<OutboundMessage<Resp>, BoxError>,
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

/// Finishes the request source once the handler task ends, however it ends.
struct FinishOnDrop<T>(PassthroughSource<T, Status>);

impl<T> Drop for FinishOnDrop<T> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

enum Step<T> {
    Inbound(Option<Inbound>),
    Handler(HandlerEvent<T>),
    Context(ContextCommand),
    DeadlineExpired,
}

pub(crate) struct ServerCall<C: Codec, H, T> {
    path: SmolStr,
    span: tracing::Span,
    state: CallState,
    codec: C,
    handler: Arc<H>,
    transport: Option<T>,
    pipeline: Option<InterceptorPipeline>,
    error_delegate: Arc<dyn ErrorDelegate>,
    config: ServerConfig,
    executor: Executor,

    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    inbound_closed: bool,
    handler_tx: mpsc::UnboundedSender<HandlerEvent<C::Encode>>,
    handler_rx: mpsc::UnboundedReceiver<HandlerEvent<C::Encode>>,
    context_tx: mpsc::UnboundedSender<ContextCommand>,
    context_rx: mpsc::UnboundedReceiver<ContextCommand>,

    active: Option<Active<C::Decode, C::Encode>>,
    responses_drained: bool,
    handler_outcome: Option<Option<BoxError>>,
    response_headers: MetadataMap,
    response_trailers: MetadataMap,
    compression_default: bool,
    writable: bool,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<C, H, T> ServerCall<C, H, T>
where
    C: Codec,
    H: ServerHandler<C::Decode, C::Encode>,
    T: ServerTransport,
{
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn new(
        path: SmolStr,
        span: tracing::Span,
        codec: C,
        handler: Arc<H>,
        transport: T,
        pipeline: InterceptorPipeline,
        error_delegate: Arc<dyn ErrorDelegate>,
        config: ServerConfig,
        executor: Executor,
    ) -> (Self, ServerCallHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (handler_tx, handler_rx) = mpsc::unbounded_channel();
        let (context_tx, context_rx) = mpsc::unbounded_channel();
        let call = Self {
            path,
            span,
            state: CallState::new(),
            codec,
            handler,
            transport: Some(transport),
            pipeline: Some(pipeline),
            error_delegate,
            config,
            executor,
            inbound_rx,
            inbound_closed: false,
            handler_tx,
            handler_rx,
            context_tx,
            context_rx,
            active: None,
            responses_drained: false,
            handler_outcome: None,
            response_headers: MetadataMap::new(),
            response_trailers: MetadataMap::new(),
            compression_default: true,
            writable: true,
            deadline: None,
        };
        (call, ServerCallHandle { tx: inbound_tx })
    }

    /// Drive the call until its end was sent.
    pub(crate) async fn run(mut self) {
        tracing::trace!("server call started");
        while !self.state.is_completed() {
            // responses and context mutations are applied in the order the handler issued them
            let step = tokio::select! {
                biased;
                Some(event) = self.handler_rx.recv() => Step::Handler(event),
                Some(command) = self.context_rx.recv() => Step::Context(command),
                inbound = self.inbound_rx.recv(), if !self.inbound_closed => Step::Inbound(inbound),
                () = expire(&mut self.deadline) => Step::DeadlineExpired,
            };

            match step {
                Step::Inbound(Some(inbound)) => self.on_inbound(inbound),
                Step::Inbound(None) => {
                    tracing::trace!("all server call handles dropped");
                    self.inbound_closed = true;
                    if self.state.inbound() != InboundState::Closed {
                        self.cancel(Status::cancelled("all call handles were dropped").into());
                    }
                }
                Step::Handler(HandlerEvent::Yielded(messages)) => self.on_responses(messages),
                Step::Handler(HandlerEvent::Drained(reason)) => {
                    if let Some(reason) = reason {
                        tracing::trace!("response writer terminated: {reason}");
                    }
                    self.responses_drained = true;
                    self.end_once_handler_done();
                }
                Step::Handler(HandlerEvent::Returned(outcome)) => {
                    self.handler_outcome = Some(outcome);
                    self.end_once_handler_done();
                }
                Step::Context(command) => self.on_context_command(command),
                Step::DeadlineExpired => {
                    tracing::debug!("server call deadline expired");
                    self.cancel(DeadlineExceeded::new().into());
                }
            }
        }

        if let Some(active) = self.active.take() {
            active.cancellation.cancel();
        }
        tracing::trace!("server call completed");
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Part(part) => self.on_request_part(part),
            Inbound::Error(error) => {
                tracing::debug!("server call transport failed: {error}");
                self.cancel(error);
            }
            Inbound::Finish => {
                tracing::debug!("server call finished by transport");
                self.cancel(Status::cancelled("call was finished by the transport").into());
            }
            Inbound::Writable(writable) => {
                self.writable = writable;
                if let Some(active) = &self.active {
                    active.writer.set_writable(writable);
                }
            }
        }
    }

    fn on_request_part(&mut self, mut part: RequestPart<Bytes>) {
        if let Some(pipeline) = &self.pipeline
            && let Err(status) = pipeline.intercept_request(&mut part)
        {
            tracing::debug!("request part rejected by interceptor: {status}");
            self.cancel(status.into());
            return;
        }

        match self.state.on_receive(part.kind()) {
            Decision::Forward => {}
            Decision::Drop => {
                tracing::trace!(kind = ?part.kind(), "drop request part");
                return;
            }
            Decision::Cancel(violation) => {
                tracing::debug!("{violation}");
                self.cancel(violation.into());
                return;
            }
        }

        match part {
            RequestPart::Metadata(metadata) => self.start_handler(metadata),
            RequestPart::Message(bytes) => match self.codec.decode(bytes) {
                Ok(message) => {
                    if let Some(active) = &self.active {
                        let result = active.requests.yield_element(message);
                        tracing::trace!(accepted = result.is_accepted(), "request message yielded");
                    }
                }
                Err(status) => {
                    tracing::debug!("failed to decode request message: {status}");
                    self.cancel(status.into());
                }
            },
            RequestPart::End => {
                if let Some(active) = &self.active {
                    active.requests.finish();
                }
            }
        }
    }

    fn start_handler(&mut self, metadata: MetadataMap) {
        let deadline = effective_timeout(&metadata, self.config.timeout()).map(|timeout| {
            let deadline = Instant::now() + timeout;
            self.deadline = Some(Box::pin(tokio::time::sleep_until(deadline)));
            deadline
        });

        let cancellation = CancellationToken::new();
        let (requests, stream) = passthrough();
        let writer = AsyncWriter::new(
            ResponseSink {
                tx: self.handler_tx.clone(),
            },
            self.config.writer(),
        );
        if !self.writable {
            writer.set_writable(false);
        }

        let ctx = ServerCallContext::new(
            Arc::new(metadata),
            self.path.clone(),
            deadline,
            cancellation.clone(),
            self.context_tx.clone(),
        );

        let handler = self.handler.clone();
        let request_stream = Streaming::new(stream, cancellation.clone());
        let responses = StreamWriter::new(writer.clone());
        let finish_requests = FinishOnDrop(requests.clone());
        let mut report = ReturnReport {
            tx: self.handler_tx.clone(),
            writer: writer.clone(),
            reported: false,
        };

        self.state.on_handler_started();
        let task = self.executor.spawn_task(
            async move {
                let _finish_requests = finish_requests;
                match handler.call(request_stream, responses, ctx).await {
                    Ok(()) => {
                        tracing::trace!("server handler returned");
                        report.report(None);
                    }
                    Err(error) => {
                        tracing::debug!("server handler failed: {error}");
                        report.report(Some(error));
                    }
                }
            }
            .instrument(self.span.clone()),
        );

        self.active = Some(Active {
            requests,
            writer,
            cancellation,
            task,
        });
    }

    fn on_responses(&mut self, messages: Vec<OutboundMessage<C::Encode>>) {
        for OutboundMessage {
            message,
            compression,
        } in messages
        {
            if self.state.is_completed() {
                tracing::trace!("server call completed: drop response message");
                return;
            }

            if self.state.outbound() == OutboundState::HeadersPending
                && self.state.on_send(PartKind::Metadata) == Decision::Forward
            {
                let headers = std::mem::take(&mut self.response_headers);
                if !self.send_part(ResponsePart::Metadata(headers)) {
                    return;
                }
            }

            let bytes = match self.codec.encode(message) {
                Ok(bytes) => bytes,
                Err(status) => {
                    tracing::debug!("failed to encode response message: {status}");
                    self.cancel(status.into());
                    return;
                }
            };

            match self.state.on_send(PartKind::Message) {
                Decision::Forward => {
                    let compress = should_compress(
                        self.config.compression_enabled(),
                        compression,
                        self.compression_default,
                    );
                    if !self.send_part(ResponsePart::Message(
                        bytes,
                        MessageMetadata::flushed(compress),
                    )) {
                        return;
                    }
                }
                Decision::Drop => tracing::trace!("drop response message"),
                Decision::Cancel(violation) => {
                    self.cancel(violation.into());
                    return;
                }
            }
        }
    }

    /// Send the end of call once the handler returned and its responses were sent.
    fn end_once_handler_done(&mut self) {
        if !self.responses_drained {
            return;
        }
        let Some(outcome) = self.handler_outcome.take() else {
            return;
        };
        let (status, trailers) = match outcome {
            None => (Status::ok(""), MetadataMap::new()),
            Some(error) => {
                let (status, trailers) = self.error_delegate.map_handler_error(error);
                (remap_ok_status(status, "handler"), trailers)
            }
        };
        self.send_end(status, trailers);
    }

    fn on_context_command(&mut self, command: ContextCommand) {
        let completed = self.state.is_completed();
        let (reply, result) = match command {
            ContextCommand::Abort(violation) => {
                tracing::debug!("server handler aborted the call: {violation}");
                self.cancel(violation.into());
                return;
            }
            ContextCommand::SetResponseHeaders(headers, reply) => {
                let result = if completed {
                    Err(Status::failed_precondition("call already completed"))
                } else if self.state.outbound() != OutboundState::HeadersPending {
                    Err(Status::failed_precondition("response headers already sent"))
                } else {
                    self.response_headers = headers;
                    Ok(())
                };
                (reply, result)
            }
            ContextCommand::SetResponseTrailers(trailers, reply) => {
                let result = if completed {
                    Err(Status::failed_precondition("call already completed"))
                } else {
                    self.response_trailers = trailers;
                    Ok(())
                };
                (reply, result)
            }
            ContextCommand::SetCompressionEnabled(enabled, reply) => {
                let result = if completed {
                    Err(Status::failed_precondition("call already completed"))
                } else {
                    self.compression_default = enabled;
                    Ok(())
                };
                (reply, result)
            }
        };
        if reply.send(result).is_err() {
            tracing::trace!("handler no longer waits for context reply");
        }
    }

    /// Cancel the call, sending an end for the given error unless one was sent.
    fn cancel(&mut self, error: BoxError) {
        if self.state.is_completed() && self.state.outbound() == OutboundState::Ended {
            return;
        }

        let outcome = self.state.on_cancel();
        if let Some(active) = self.active.take() {
            active.cancellation.cancel();
            active
                .requests
                .finish_with_error(Status::cancelled("call was cancelled"));
            active
                .writer
                .cancel(Status::cancelled("call was cancelled").into());
            active.task.abort();
        }

        if outcome.send_end {
            let (status, trailers) = self.error_delegate.map_library_error(error);
            self.send_end(remap_ok_status(status, "call"), trailers);
        } else {
            self.release();
        }
    }

    fn send_end(&mut self, status: Status, trailers: MetadataMap) {
        let trailers_only = self.state.outbound() == OutboundState::HeadersPending;
        if self.state.on_send(PartKind::End) != Decision::Forward {
            tracing::trace!("end already sent: drop {status}");
            return;
        }

        let mut metadata = std::mem::take(&mut self.response_trailers);
        metadata.merge(trailers);
        if trailers_only {
            let mut headers = std::mem::take(&mut self.response_headers);
            headers.merge(metadata);
            metadata = headers;
        }

        tracing::debug!(code = ?status.code(), trailers_only, "server call ended");
        let mut part = ResponsePart::End(status, metadata);
        if let Some(pipeline) = &self.pipeline
            && let Err(rejection) = pipeline.intercept_response(&mut part)
        {
            tracing::debug!("end of call replaced by interceptor: {rejection}");
            part = ResponsePart::End(rejection, MetadataMap::new());
        }
        if let Some(transport) = &mut self.transport {
            transport.send(part);
        }
        self.release();
    }

    /// Send a metadata or message part, returns `false` if the call got cancelled.
    fn send_part(&mut self, mut part: ResponsePart<Bytes>) -> bool {
        if let Some(pipeline) = &self.pipeline
            && let Err(rejection) = pipeline.intercept_response(&mut part)
        {
            tracing::debug!(kind = ?part.kind(), "response part rejected by interceptor: {rejection}");
            self.cancel(rejection.into());
            return false;
        }
        match &mut self.transport {
            Some(transport) => {
                transport.send(part);
                true
            }
            None => false,
        }
    }

    fn release(&mut self) {
        self.transport = None;
        self.pipeline = None;
        self.deadline = None;
    }
}

fn remap_ok_status(status: Status, origin: &str) -> Status {
    if status.is_ok() {
        tracing::warn!("{origin} error mapped to an ok status: remap to unknown");
        Status::unknown(format!(
            "{origin} failed with an error mapped to an ok status: {}",
            status.message()
        ))
    } else {
        status
    }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
