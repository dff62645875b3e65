//! In-memory transport connecting a [`Client`] to a [`Server`],
//! recording every part crossing it.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rama_grpc_call::{
    BoxError, MessageMetadata, PartKind, RequestPart, ResponsePart,
    client::{Channel, Client, ClientConfig, ClientStream, ResponseRouter},
    codec::JsonCodec,
    server::{Server, ServerCallHandle, ServerHandler, ServerTransport},
};

pub(crate) type Codec = JsonCodec<String, String>;

#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    requests: Arc<Mutex<Vec<(RequestPart<Bytes>, MessageMetadata)>>>,
    responses: Arc<Mutex<Vec<ResponsePart<Bytes>>>>,
}

impl Recorder {
    pub(crate) fn requests(&self) -> Vec<(RequestPart<Bytes>, MessageMetadata)> {
        self.requests.lock().clone()
    }

    pub(crate) fn responses(&self) -> Vec<ResponsePart<Bytes>> {
        self.responses.lock().clone()
    }

    pub(crate) fn response_kinds(&self) -> Vec<PartKind> {
        self.responses.lock().iter().map(ResponsePart::kind).collect()
    }
}

struct RecordingTransport {
    router: ResponseRouter,
    recorder: Recorder,
}

impl ServerTransport for RecordingTransport {
    fn send(&mut self, part: ResponsePart<Bytes>) {
        self.recorder.responses.lock().push(part.clone());
        self.router.route(part);
    }
}

struct InMemoryStream {
    handle: ServerCallHandle,
    recorder: Recorder,
}

impl ClientStream for InMemoryStream {
    fn send(&mut self, part: RequestPart<Bytes>, metadata: MessageMetadata) {
        self.recorder.requests.lock().push((part.clone(), metadata));
        self.handle.receive_part(part);
    }

    fn cancel(&mut self) {
        self.handle.finish();
    }
}

type StartCall = dyn Fn(&str, RecordingTransport) -> ServerCallHandle + Send + Sync;

pub(crate) struct InMemoryChannel {
    start: Arc<StartCall>,
    recorder: Recorder,
}

impl Channel for InMemoryChannel {
    fn open_stream(
        &self,
        path: &str,
        router: ResponseRouter,
    ) -> Result<Box<dyn ClientStream>, BoxError> {
        let handle = (self.start)(
            path,
            RecordingTransport {
                router,
                recorder: self.recorder.clone(),
            },
        );
        Ok(Box::new(InMemoryStream {
            handle,
            recorder: self.recorder.clone(),
        }))
    }
}

/// Connect a client to a server serving `handler` for every path.
pub(crate) fn connect<H>(
    server: Server,
    config: ClientConfig,
    handler: H,
) -> (Client<InMemoryChannel>, Recorder)
where
    H: ServerHandler<String, String>,
{
    let handler = Arc::new(handler);
    let recorder = Recorder::default();
    let start = move |path: &str, transport: RecordingTransport| {
        server.start_call(path, Codec::new(), handler.clone(), transport)
    };
    let channel = InMemoryChannel {
        start: Arc::new(start),
        recorder: recorder.clone(),
    };
    (Client::with_config(channel, config), recorder)
}

/// A channel which fails to open any stream.
pub(crate) struct UnreachableChannel;

impl Channel for UnreachableChannel {
    fn open_stream(
        &self,
        _path: &str,
        _router: ResponseRouter,
    ) -> Result<Box<dyn ClientStream>, BoxError> {
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused").into())
    }
}

/// A channel whose streams go nowhere, keeping the router of the last
/// opened stream so tests can answer the call themselves.
#[derive(Clone, Default)]
pub(crate) struct ManualChannel {
    router: Arc<Mutex<Option<ResponseRouter>>>,
}

impl ManualChannel {
    pub(crate) fn router(&self) -> ResponseRouter {
        self.router.lock().clone().expect("no stream was opened")
    }
}

impl Channel for ManualChannel {
    fn open_stream(
        &self,
        _path: &str,
        router: ResponseRouter,
    ) -> Result<Box<dyn ClientStream>, BoxError> {
        *self.router.lock() = Some(router);
        Ok(Box::new(SilentStream))
    }
}

struct SilentStream;

impl ClientStream for SilentStream {
    fn send(&mut self, _part: RequestPart<Bytes>, _metadata: MessageMetadata) {}

    fn cancel(&mut self) {}
}
