use std::{fmt, ops::Deref, sync::Arc};

use crate::{
    MetadataMap, Status,
    promise::Promise,
    stream::{RequestStreamWriter, ResponseStream},
};

use super::call::CallCore;

/// The part of a client call shared by all rpc shapes.
///
/// Cheap to clone, all clones refer to the same call.
#[derive(Clone)]
pub struct Call {
    core: Arc<dyn CallCore>,
}

impl Call {
    pub(crate) fn new(core: Arc<dyn CallCore>) -> Self {
        Self { core }
    }

    /// The metadata sent by the server ahead of its first message.
    ///
    /// Resolves to an empty map when the server only sent trailers.
    pub async fn initial_metadata(&self) -> Result<MetadataMap, Status> {
        self.core
            .initial_metadata()
            .wait()
            .await
            .unwrap_or_else(|| Err(Status::internal("initial metadata was taken")))
    }

    /// The metadata sent by the server with the end of the call.
    pub async fn trailing_metadata(&self) -> Result<MetadataMap, Status> {
        self.core
            .trailing_metadata()
            .wait()
            .await
            .unwrap_or_else(|| Err(Status::internal("trailing metadata was taken")))
    }

    /// The final status of the call.
    ///
    /// Never fails: failures, cancellation included, are reported as a
    /// non-ok [`Status`].
    pub async fn status(&self) -> Status {
        self.core
            .status()
            .wait()
            .await
            .unwrap_or_else(|| Status::internal("status was taken"))
    }

    /// Returns `true` once the final status is known.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.core.status().is_completed()
    }

    /// Cancel the call.
    ///
    /// Idempotent, and a no-op once the call completed.
    pub fn cancel(&self) {
        self.core.cancel();
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("completed", &self.is_completed())
            .finish()
    }
}

async fn take_response<Resp>(response: &Promise<Result<Resp, Status>>) -> Result<Resp, Status> {
    response
        .take()
        .await
        .unwrap_or_else(|| Err(Status::failed_precondition("response was already taken")))
}

fn take_responses<Resp>(
    responses: &mut Option<ResponseStream<Resp>>,
) -> Result<ResponseStream<Resp>, Status> {
    responses
        .take()
        .ok_or_else(|| Status::failed_precondition("responses were already taken"))
}

macro_rules! impl_deref_call {
    ($name:ident<$($param:ident),+>) => {
        impl<$($param),+> Deref for $name<$($param),+> {
            type Target = Call;

            fn deref(&self) -> &Call {
                &self.call
            }
        }

        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("call", &self.call)
                    .finish_non_exhaustive()
            }
        }
    };
}

/// A call with a single request and a single response.
pub struct UnaryCall<Resp> {
    call: Call,
    response: Arc<Promise<Result<Resp, Status>>>,
}

impl<Resp> UnaryCall<Resp> {
    pub(crate) fn new(call: Call, response: Arc<Promise<Result<Resp, Status>>>) -> Self {
        Self { call, response }
    }

    /// The response of the server.
    ///
    /// Fails with [`Code::FailedPrecondition`](crate::Code::FailedPrecondition)
    /// when called a second time.
    pub async fn response(&self) -> Result<Resp, Status> {
        take_response(&self.response).await
    }
}

impl_deref_call!(UnaryCall<Resp>);

/// A call with a stream of requests and a single response.
pub struct ClientStreamingCall<Req, Resp> {
    call: Call,
    requests: RequestStreamWriter<Req>,
    response: Arc<Promise<Result<Resp, Status>>>,
}

impl<Req, Resp> ClientStreamingCall<Req, Resp> {
    pub(crate) fn new(
        call: Call,
        requests: RequestStreamWriter<Req>,
        response: Arc<Promise<Result<Resp, Status>>>,
    ) -> Self {
        Self {
            call,
            requests,
            response,
        }
    }

    /// The writer of the request stream.
    ///
    /// [`finish`](RequestStreamWriter::finish) it once all requests are sent.
    #[must_use]
    pub fn request_writer(&self) -> RequestStreamWriter<Req> {
        self.requests.clone()
    }

    /// The response of the server.
    pub async fn response(&self) -> Result<Resp, Status> {
        take_response(&self.response).await
    }
}

impl_deref_call!(ClientStreamingCall<Req, Resp>);

/// A call with a single request and a stream of responses.
pub struct ServerStreamingCall<Resp> {
    call: Call,
    responses: Option<ResponseStream<Resp>>,
}

impl<Resp> ServerStreamingCall<Resp> {
    pub(crate) fn new(call: Call, responses: ResponseStream<Resp>) -> Self {
        Self {
            call,
            responses: Some(responses),
        }
    }

    /// Take the stream of responses.
    pub fn responses(&mut self) -> Result<ResponseStream<Resp>, Status> {
        take_responses(&mut self.responses)
    }
}

impl_deref_call!(ServerStreamingCall<Resp>);

/// A call with a stream of requests and a stream of responses.
pub struct BidirectionalStreamingCall<Req, Resp> {
    call: Call,
    requests: RequestStreamWriter<Req>,
    responses: Option<ResponseStream<Resp>>,
}

impl<Req, Resp> BidirectionalStreamingCall<Req, Resp> {
    pub(crate) fn new(
        call: Call,
        requests: RequestStreamWriter<Req>,
        responses: ResponseStream<Resp>,
    ) -> Self {
        Self {
            call,
            requests,
            responses: Some(responses),
        }
    }

    /// The writer of the request stream.
    #[must_use]
    pub fn request_writer(&self) -> RequestStreamWriter<Req> {
        self.requests.clone()
    }

    /// Take the stream of responses.
    pub fn responses(&mut self) -> Result<ResponseStream<Resp>, Status> {
        take_responses(&mut self.responses)
    }
}

impl_deref_call!(BidirectionalStreamingCall<Req, Resp>);
