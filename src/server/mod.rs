//! Server side of a call.
//!
//! A [`Server`] starts one call per incoming stream using
//! [`Server::start_call`]. The transport feeds request parts through the
//! returned [`ServerCallHandle`] and receives the response parts through its
//! [`ServerTransport`]. The call guarantees:
//!
//! - the handler is invoked at most once, on the first valid request metadata;
//! - response headers are sent before the first message, or together with the
//!   trailers when no message was sent;
//! - exactly one [`ResponsePart::End`] is sent, after which the transport is
//!   released and late parts are dropped.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    ResponsePart,
    codec::Codec,
    error::{DefaultErrorDelegate, ErrorDelegate},
    interceptor::{Interceptor, InterceptorPipeline},
    rt::Executor,
};

mod call;
mod config;
mod context;
mod handler;

pub mod state;

#[doc(inline)]
pub use self::{
    call::ServerCallHandle,
    config::ServerConfig,
    context::ServerCallContext,
    handler::{
        BidirectionalStreaming, ClientStreaming, ServerHandler, ServerStreaming, Unary,
        bidirectional_streaming, client_streaming, server_streaming, unary,
    },
};

/// Sink of the response parts of a single server call.
///
/// Implemented by the transport. Parts arrive in the order they have to be
/// written, the last one being the single [`ResponsePart::End`].
pub trait ServerTransport: Send + 'static {
    /// Write a response part.
    fn send(&mut self, part: ResponsePart<Bytes>);
}

impl ServerTransport for mpsc::UnboundedSender<ResponsePart<Bytes>> {
    fn send(&mut self, part: ResponsePart<Bytes>) {
        if mpsc::UnboundedSender::send(self, part).is_err() {
            tracing::trace!("server transport receiver dropped: drop response part");
        }
    }
}

/// Starts server calls sharing the same configuration,
/// interceptors and error policy.
#[derive(Clone)]
pub struct Server {
    config: ServerConfig,
    interceptors: InterceptorPipeline,
    error_delegate: Arc<dyn ErrorDelegate>,
    executor: Executor,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Create a new [`Server`] using the default config.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            interceptors: InterceptorPipeline::new(),
            error_delegate: Arc::new(DefaultErrorDelegate::new()),
            executor: Executor::new(),
        }
    }

    /// The config used for every call.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Set the config used for every call.
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the config used for every call.
    pub fn set_config(&mut self, config: ServerConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Append an interceptor to the pipeline of every call.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push_interceptor(interceptor);
        self
    }

    /// Append an interceptor to the pipeline of every call.
    pub fn set_interceptor(&mut self, interceptor: impl Interceptor) -> &mut Self {
        self.interceptors.push_interceptor(interceptor);
        self
    }

    /// Set the policy mapping errors to the status sent to the client.
    #[must_use]
    pub fn with_error_delegate(mut self, delegate: impl ErrorDelegate) -> Self {
        self.error_delegate = Arc::new(delegate);
        self
    }

    /// Set the policy mapping errors to the status sent to the client.
    pub fn set_error_delegate(&mut self, delegate: impl ErrorDelegate) -> &mut Self {
        self.error_delegate = Arc::new(delegate);
        self
    }

    /// Set the executor spawning the call and handler tasks.
    #[must_use]
    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    /// Set the executor spawning the call and handler tasks.
    pub fn set_executor(&mut self, executor: Executor) -> &mut Self {
        self.executor = executor;
        self
    }

    /// Start a call for the rpc at `path`.
    ///
    /// Spawns the task driving the call, which must happen within a tokio runtime.
    /// The handler is started once request metadata arrives on the returned handle.
    pub fn start_call<C, H, T>(
        &self,
        path: impl Into<SmolStr>,
        codec: C,
        handler: Arc<H>,
        transport: T,
    ) -> ServerCallHandle
    where
        C: Codec,
        H: ServerHandler<C::Decode, C::Encode>,
        T: ServerTransport,
    {
        let path = path.into();
        let span = tracing::debug_span!("grpc.server.call", path = %path);
        let (call, handle) = call::ServerCall::new(
            path,
            span.clone(),
            codec,
            handler,
            transport,
            self.interceptors.clone(),
            self.error_delegate.clone(),
            self.config.clone(),
            self.executor.clone(),
        );
        drop(self.executor.spawn_task(call.run().instrument(span)));
        handle
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("interceptors", &self.interceptors)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}
