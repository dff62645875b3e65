//! The protocol parts exchanged over the stream of a single call.

use crate::{MetadataMap, Status};

/// A part sent by the client: the request metadata, followed by
/// zero or more messages, followed by the end of the request stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPart<M> {
    /// Request metadata (headers), exactly once at the start.
    Metadata(MetadataMap),
    /// A single request message.
    Message(M),
    /// End of the request stream.
    End,
}

impl<M> RequestPart<M> {
    /// The [`PartKind`] of this part.
    pub fn kind(&self) -> PartKind {
        match self {
            Self::Metadata(_) => PartKind::Metadata,
            Self::Message(_) => PartKind::Message,
            Self::End => PartKind::End,
        }
    }
}

/// A part sent by the server: optional response headers, followed by
/// zero or more messages, followed by exactly one end carrying the final
/// status and trailers.
#[derive(Debug, Clone)]
pub enum ResponsePart<M> {
    /// Response metadata (headers).
    Metadata(MetadataMap),
    /// A single response message together with how it should be written.
    Message(M, MessageMetadata),
    /// The final status and trailing metadata of the call.
    End(Status, MetadataMap),
}

impl<M> ResponsePart<M> {
    /// The [`PartKind`] of this part.
    pub fn kind(&self) -> PartKind {
        match self {
            Self::Metadata(_) => PartKind::Metadata,
            Self::Message(..) => PartKind::Message,
            Self::End(..) => PartKind::End,
        }
    }
}

/// Kind of a [`RequestPart`] or [`ResponsePart`], used by the call state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartKind {
    /// Metadata (headers).
    Metadata,
    /// A message.
    Message,
    /// The end of the stream.
    End,
}

/// Write instructions accompanying an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageMetadata {
    /// Compress the message, if the transport negotiated an encoding.
    pub compress: bool,
    /// Flush the transport after writing the message.
    pub flush: bool,
}

impl MessageMetadata {
    /// Metadata for a message which is flushed right away.
    #[must_use]
    pub const fn flushed(compress: bool) -> Self {
        Self {
            compress,
            flush: true,
        }
    }
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self::flushed(false)
    }
}
