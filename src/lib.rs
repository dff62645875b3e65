//! gRPC call lifecycle for rama.
//!
//! This crate bridges one bidirectional stream of protocol parts per call
//! (metadata, messages and a single end) to typed request/response exchanges:
//!
//! - the [`channel`] module provides the passthrough channel which turns parts
//!   pushed by a transport into an async sequence consumed by a handler;
//! - the [`writer`] module provides a bounded writer with watermark based
//!   backpressure, used for every outbound message stream;
//! - the [`server`] module drives a user handler exactly once per call,
//!   owning the transport exclusively and guaranteeing exactly one terminal
//!   [`ResponsePart::End`];
//! - the [`client`] module starts calls of all four rpc shapes on top of a
//!   [`client::Channel`] and exposes their metadata, messages and final
//!   [`Status`] as futures.
//!
//! Wire framing, tls and connection management are out of scope:
//! transports plug in via [`server::ServerTransport`] and [`client::Channel`].
//!
//! # Example
//!
//! ```no_run
//! use rama_grpc_call::{
//!     Status,
//!     codec::JsonCodec,
//!     server::{Server, ServerCallContext, unary},
//! };
//! use std::sync::Arc;
//!
//! # async fn run(transport: tokio::sync::mpsc::UnboundedSender<rama_grpc_call::ResponsePart<bytes::Bytes>>) {
//! let handler = Arc::new(unary(|name: String, _ctx: ServerCallContext| async move {
//!     Ok::<_, Status>(format!("hello, {name}"))
//! }));
//!
//! let call = Server::new().start_call(
//!     "/greeter.Greeter/SayHello",
//!     JsonCodec::<String, String>::default(),
//!     handler,
//!     transport,
//! );
//! call.receive_metadata(Default::default());
//! call.receive_message(bytes::Bytes::from_static(b"\"rama\""));
//! call.receive_end();
//! # }
//! ```

#![doc(
    html_favicon_url = "https://raw.githubusercontent.com/plabayo/rama/main/docs/img/old_logo.png"
)]
#![doc(html_logo_url = "https://raw.githubusercontent.com/plabayo/rama/main/docs/img/old_logo.png")]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
mod macros;

pub mod channel;
pub mod client;
pub mod codec;
pub mod compression;
pub mod error;
pub mod interceptor;
pub mod metadata;
pub mod parts;
pub mod rt;
pub mod server;
pub mod stream;
#[cfg(feature = "telemetry")]
#[cfg_attr(docsrs, doc(cfg(feature = "telemetry")))]
pub mod telemetry;
pub mod timeout;
pub mod writer;

mod promise;
mod status;

#[doc(inline)]
pub use crate::{
    error::BoxError,
    metadata::MetadataMap,
    parts::{MessageMetadata, PartKind, RequestPart, ResponsePart},
    status::{Code, Status},
};
