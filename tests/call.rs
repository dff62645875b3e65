use std::time::Duration;

use futures::StreamExt;
use rama_grpc_call::{
    Code, MetadataMap, PartKind, RequestPart, ResponsePart, Status,
    client::{CallOptions, Client, ClientConfig},
    compression::CompressionOverride,
    interceptor::request_fn,
    server::{
        Server, ServerConfig, ServerCallContext, bidirectional_streaming, client_streaming,
        server_streaming, unary,
    },
    stream::{RequestStream, ResponseStreamWriter},
    writer::WriterConfig,
};
use tokio::sync::mpsc;

mod utils;

use utils::{Codec, connect};

fn greeter() -> impl rama_grpc_call::server::ServerHandler<String, String> {
    unary(|name: String, _ctx: ServerCallContext| async move {
        Ok::<_, Status>(format!("hello, {name}"))
    })
}

fn metadata(key: &str, value: &str) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    metadata.insert_ascii(key, value).unwrap();
    metadata
}

#[tokio::test]
async fn unary_round_trip() {
    let (client, recorder) = connect(Server::new(), ClientConfig::new(), greeter());

    let call = client.unary(
        "/greeter.Greeter/SayHello",
        Codec::new(),
        "rama".to_owned(),
        CallOptions::new(),
    );

    assert_eq!(call.response().await.unwrap(), "hello, rama");
    assert!(call.status().await.is_ok());
    assert!(call.initial_metadata().await.unwrap().is_empty());
    assert!(call.trailing_metadata().await.unwrap().is_empty());

    assert_eq!(
        recorder.response_kinds(),
        [PartKind::Metadata, PartKind::Message, PartKind::End]
    );
    let requests: Vec<_> = recorder
        .requests()
        .into_iter()
        .map(|(part, _)| part.kind())
        .collect();
    assert_eq!(
        requests,
        [PartKind::Metadata, PartKind::Message, PartKind::End]
    );
}

#[tokio::test]
async fn response_can_only_be_taken_once() {
    let (client, _) = connect(Server::new(), ClientConfig::new(), greeter());
    let call = client.unary("/greeter.Greeter/SayHello", Codec::new(), "a".to_owned(), CallOptions::new());

    call.response().await.unwrap();
    let status = call.response().await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn server_streaming_round_trip() {
    let handler = server_streaming(
        |prefix: String, responses: ResponseStreamWriter<String>, _ctx: ServerCallContext| async move {
            for i in 0..3 {
                responses.send(format!("{prefix}-{i}")).await?;
            }
            Ok::<_, Status>(())
        },
    );
    let (client, recorder) = connect(Server::new(), ClientConfig::new(), handler);

    let mut call = client.server_streaming("/count.Counter/Count", Codec::new(), "n".to_owned(), CallOptions::new());
    let responses: Vec<String> = call
        .responses()
        .unwrap()
        .map(|message| message.unwrap())
        .collect()
        .await;

    assert_eq!(responses, ["n-0", "n-1", "n-2"]);
    assert!(call.status().await.is_ok());
    assert_eq!(
        call.responses().unwrap_err().code(),
        Code::FailedPrecondition
    );
    assert_eq!(
        recorder
            .response_kinds()
            .into_iter()
            .filter(|kind| *kind == PartKind::End)
            .count(),
        1
    );
}

#[tokio::test]
async fn client_streaming_round_trip() {
    let handler = client_streaming(
        |mut requests: RequestStream<String>, _ctx: ServerCallContext| async move {
            let mut all = Vec::new();
            while let Some(message) = requests.message().await? {
                all.push(message);
            }
            Ok::<_, Status>(all.join(","))
        },
    );
    let (client, _) = connect(Server::new(), ClientConfig::new(), handler);

    let call = client.client_streaming("/join.Joiner/Join", Codec::new(), CallOptions::new());
    let writer = call.request_writer();
    for message in ["a", "b", "c"] {
        writer.send(message.to_owned()).await.unwrap();
    }
    writer.finish();

    assert_eq!(call.response().await.unwrap(), "a,b,c");
    assert!(call.status().await.is_ok());
    assert_eq!(
        writer.send("d".to_owned()).await.unwrap_err().code(),
        Code::FailedPrecondition
    );
}

#[tokio::test]
async fn bidirectional_streaming_echo() {
    let handler = bidirectional_streaming(
        |mut requests: RequestStream<String>,
         responses: ResponseStreamWriter<String>,
         _ctx: ServerCallContext| async move {
            while let Some(message) = requests.message().await? {
                responses.send(message.to_uppercase()).await?;
            }
            Ok::<_, Status>(())
        },
    );
    let (client, _) = connect(Server::new(), ClientConfig::new(), handler);

    let mut call = client.bidirectional_streaming("/echo.Echo/Echo", Codec::new(), CallOptions::new());
    let writer = call.request_writer();
    let mut responses = call.responses().unwrap();

    writer.send("a".to_owned()).await.unwrap();
    assert_eq!(responses.message().await.unwrap().as_deref(), Some("A"));
    writer.send("b".to_owned()).await.unwrap();
    assert_eq!(responses.message().await.unwrap().as_deref(), Some("B"));
    writer.finish();

    assert_eq!(responses.message().await.unwrap(), None);
    assert!(call.status().await.is_ok());
}

#[tokio::test]
async fn handler_error_ends_the_call_trailers_only() {
    let handler = unary(|_: String, ctx: ServerCallContext| async move {
        ctx.set_response_headers(metadata("x-served-by", "rama")).await?;
        Err::<String, _>(Status::not_found("no such greeting"))
    });
    let (client, recorder) = connect(Server::new(), ClientConfig::new(), handler);

    let call = client.unary("/greeter.Greeter/SayHello", Codec::new(), "a".to_owned(), CallOptions::new());

    let status = call.status().await;
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "no such greeting");
    assert_eq!(call.response().await.unwrap_err().code(), Code::NotFound);
    assert_eq!(call.initial_metadata().await.unwrap_err().code(), Code::NotFound);

    let trailers = call.trailing_metadata().await.unwrap();
    assert_eq!(trailers.get_str("x-served-by"), Some("rama"));
    assert_eq!(recorder.response_kinds(), [PartKind::End]);
}

#[tokio::test]
async fn headers_and_trailers_set_by_handler() {
    let handler = unary(|name: String, ctx: ServerCallContext| async move {
        ctx.set_response_headers(metadata("x-header", "1")).await?;
        ctx.set_response_trailers(metadata("x-trailer", "2")).await?;
        Ok::<_, Status>(name)
    });
    let (client, _) = connect(Server::new(), ClientConfig::new(), handler);

    let call = client.unary("/echo.Echo/Unary", Codec::new(), "a".to_owned(), CallOptions::new());

    assert_eq!(call.response().await.unwrap(), "a");
    let headers = call.initial_metadata().await.unwrap();
    assert_eq!(headers.get_str("x-header"), Some("1"));
    let trailers = call.trailing_metadata().await.unwrap();
    assert_eq!(trailers.get_str("x-trailer"), Some("2"));
    assert!(!trailers.contains_key("x-header"));
}

#[tokio::test]
async fn headers_cannot_be_set_after_first_message() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = server_streaming(
        move |_: String, responses: ResponseStreamWriter<String>, ctx: ServerCallContext| {
            let tx = tx.clone();
            async move {
                responses.send("first".to_owned()).await?;
                responses.drained().await;
                let result = ctx.set_response_headers(MetadataMap::new()).await;
                tx.send(result).unwrap();
                Ok::<_, Status>(())
            }
        },
    );
    let (client, _) = connect(Server::new(), ClientConfig::new(), handler);

    let call = client.server_streaming("/s.S/M", Codec::new(), "a".to_owned(), CallOptions::new());
    assert!(call.status().await.is_ok());

    let status = rx.recv().await.unwrap().unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn handler_error_with_ok_status_is_remapped() {
    let handler = unary(|_: String, _ctx: ServerCallContext| async move {
        Err::<String, _>(Status::ok("all good, or not"))
    });
    let (client, _) = connect(Server::new(), ClientConfig::new(), handler);

    let call = client.unary("/greeter.Greeter/SayHello", Codec::new(), "a".to_owned(), CallOptions::new());
    assert_eq!(call.status().await.code(), Code::Unknown);
}

#[tokio::test]
async fn unary_handler_rejects_multiple_requests() {
    let (client, recorder) = connect(Server::new(), ClientConfig::new(), greeter());

    let call = client.bidirectional_streaming("/greeter.Greeter/SayHello", Codec::new(), CallOptions::new());
    let writer = call.request_writer();
    writer.send("a".to_owned()).await.unwrap();
    writer.send("b".to_owned()).await.unwrap();
    writer.finish();

    let status = call.status().await;
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(recorder.response_kinds(), [PartKind::End]);
}

#[tokio::test]
async fn unary_handler_rejects_missing_request() {
    let (client, _) = connect(Server::new(), ClientConfig::new(), greeter());

    let call = client.client_streaming("/greeter.Greeter/SayHello", Codec::new(), CallOptions::new());
    call.request_writer().finish();

    assert_eq!(call.status().await.code(), Code::Internal);
    assert_eq!(call.response().await.unwrap_err().code(), Code::Internal);
}

#[tokio::test]
async fn interceptor_rejection_ends_the_call() {
    let server = Server::new().with_interceptor(request_fn(|part: &mut RequestPart<_>| match part {
        RequestPart::Metadata(metadata) if !metadata.contains_key("authorization") => {
            Err(Status::unauthenticated("missing credentials"))
        }
        _ => Ok(()),
    }));
    let (client, recorder) = connect(server, ClientConfig::new(), greeter());

    let call = client.unary("/greeter.Greeter/SayHello", Codec::new(), "a".to_owned(), CallOptions::new());
    assert_eq!(call.status().await.code(), Code::Unauthenticated);
    assert_eq!(recorder.response_kinds(), [PartKind::End]);

    let options = CallOptions::new().with_metadata(metadata("authorization", "Bearer secret"));
    let call = client.unary("/greeter.Greeter/SayHello", Codec::new(), "b".to_owned(), options);
    assert_eq!(call.response().await.unwrap(), "hello, b");
}

#[tokio::test]
async fn client_interceptor_rejection_terminates_locally() {
    let config = ClientConfig::new().with_interceptor(request_fn(|part: &mut RequestPart<_>| {
        match part {
            RequestPart::Message(_) => Err(Status::invalid_argument("no messages allowed")),
            _ => Ok(()),
        }
    }));
    let (client, _) = connect(Server::new(), config, greeter());

    let call = client.unary("/greeter.Greeter/SayHello", Codec::new(), "a".to_owned(), CallOptions::new());
    assert_eq!(call.status().await.code(), Code::InvalidArgument);
    assert_eq!(call.response().await.unwrap_err().code(), Code::InvalidArgument);
}

#[tokio::test(start_paused = true)]
async fn deadline_exceeded() {
    let handler = unary(|_: String, ctx: ServerCallContext| async move {
        ctx.cancelled().await;
        Ok::<_, Status>("too late".to_owned())
    });
    let (client, recorder) = connect(Server::new(), ClientConfig::new(), handler);

    let options = CallOptions::new().with_timeout(Duration::from_millis(50));
    let call = client.unary("/slow.Slow/Wait", Codec::new(), "a".to_owned(), options);

    assert_eq!(call.status().await.code(), Code::DeadlineExceeded);
    assert_eq!(call.response().await.unwrap_err().code(), Code::DeadlineExceeded);

    let requests = recorder.requests();
    let (RequestPart::Metadata(sent), _) = &requests[0] else {
        panic!("call must start with metadata");
    };
    assert!(sent.contains_key("grpc-timeout"));
}

#[tokio::test]
async fn cancellation_releases_both_sides() {
    struct NotifyOnDrop(mpsc::UnboundedSender<()>);

    impl Drop for NotifyOnDrop {
        fn drop(&mut self) {
            self.0.send(()).unwrap();
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = bidirectional_streaming(
        move |mut requests: RequestStream<String>,
              responses: ResponseStreamWriter<String>,
              _ctx: ServerCallContext| {
            let guard = NotifyOnDrop(tx.clone());
            async move {
                let _guard = guard;
                while let Some(message) = requests.message().await? {
                    responses.send(message).await?;
                }
                Ok::<_, Status>(())
            }
        },
    );
    let (client, recorder) = connect(Server::new(), ClientConfig::new(), handler);

    let mut call = client.bidirectional_streaming("/echo.Echo/Echo", Codec::new(), CallOptions::new());
    let writer = call.request_writer();
    let mut responses = call.responses().unwrap();

    writer.send("ping".to_owned()).await.unwrap();
    assert_eq!(responses.message().await.unwrap().as_deref(), Some("ping"));

    call.cancel();
    call.cancel();

    assert_eq!(call.status().await.code(), Code::Cancelled);
    assert_eq!(responses.message().await.unwrap_err().code(), Code::Cancelled);
    assert_eq!(
        writer.send("pong".to_owned()).await.unwrap_err().code(),
        Code::FailedPrecondition
    );

    rx.recv().await.unwrap();
    let ends: Vec<_> = recorder
        .responses()
        .into_iter()
        .filter_map(|part| match part {
            ResponsePart::End(status, _) => Some(status.code()),
            _ => None,
        })
        .collect();
    assert_eq!(ends, [Code::Cancelled]);
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    let client = Client::new(utils::UnreachableChannel);

    let call = client.unary("/greeter.Greeter/SayHello", Codec::new(), "a".to_owned(), CallOptions::new());
    assert_eq!(call.status().await.code(), Code::Unavailable);
    assert_eq!(call.initial_metadata().await.unwrap_err().code(), Code::Unavailable);
    assert_eq!(call.response().await.unwrap_err().code(), Code::Unavailable);
}

#[tokio::test]
async fn end_of_call_stops_a_suspended_request_writer() {
    let channel = utils::ManualChannel::default();
    let config = ClientConfig::new().with_writer(
        WriterConfig::new()
            .with_high_watermark(2)
            .with_low_watermark(1)
            .with_max_pending_writes(4),
    );
    let client = Client::with_config(channel.clone(), config);
    let call = client.client_streaming("/test.Service/Method", Codec::new(), CallOptions::new());
    let router = channel.router();

    router.set_writable(false);
    let requests = call.request_writer();
    requests.send("a".to_owned()).await.unwrap();
    let suspended = tokio::spawn(async move { requests.send("b".to_owned()).await });
    tokio::task::yield_now().await;
    assert!(!suspended.is_finished());

    router.route(ResponsePart::End(Status::ok(""), MetadataMap::new()));

    let status = tokio::time::timeout(Duration::from_secs(1), suspended)
        .await
        .expect("the suspended send should resolve once the call ended")
        .unwrap()
        .unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
}

#[tokio::test]
async fn compression_flags() {
    let handler = server_streaming(
        |_: String, responses: ResponseStreamWriter<String>, ctx: ServerCallContext| async move {
            responses.send("a".to_owned()).await?;
            responses
                .send_with("b".to_owned(), CompressionOverride::Disable)
                .await?;
            ctx.set_compression_enabled(false).await?;
            responses.send("c".to_owned()).await?;
            responses
                .send_with("d".to_owned(), CompressionOverride::Enable)
                .await?;
            Ok::<_, Status>(())
        },
    );
    let server = Server::new().with_config(ServerConfig::new().with_compression_enabled(true));
    let (client, recorder) = connect(server, ClientConfig::new(), handler);

    let call = client.server_streaming("/z.Z/Zip", Codec::new(), "a".to_owned(), CallOptions::new());
    assert!(call.status().await.is_ok());

    let response_flags: Vec<_> = recorder
        .responses()
        .into_iter()
        .filter_map(|part| match part {
            ResponsePart::Message(_, metadata) => {
                assert!(metadata.flush);
                Some(metadata.compress)
            }
            _ => None,
        })
        .collect();
    assert_eq!(response_flags, [true, false, false, true]);

    // compression is disabled for the client as a whole
    let request_flags: Vec<_> = recorder
        .requests()
        .into_iter()
        .filter_map(|(part, metadata)| match part {
            RequestPart::Message(_) => Some(metadata.compress),
            _ => None,
        })
        .collect();
    assert_eq!(request_flags, [false]);
}

mod assertions {
    use super::*;
    use rama_grpc_call::{
        client::{Call, UnaryCall},
        server::ServerCallHandle,
        stream::{ResponseStream, StreamWriter},
    };
    use static_assertions::assert_impl_all;

    assert_impl_all!(Call: Send, Sync, Clone);
    assert_impl_all!(UnaryCall<String>: Send, Sync);
    assert_impl_all!(ServerCallHandle: Send, Sync, Clone);
    assert_impl_all!(ServerCallContext: Send, Sync, Clone);
    assert_impl_all!(StreamWriter<String>: Send, Sync, Clone);
    assert_impl_all!(ResponseStream<String>: Send);
    assert_impl_all!(Server: Send, Sync);
    assert_impl_all!(Status: Send, Sync);
}
