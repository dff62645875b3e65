//! Error types shared by the client and server call machinery.
//!
//! Like the rest of rama these are plain types implementing
//! [`std::error::Error`], erased into a [`BoxError`] where the concrete type
//! does not matter. Use [`Status::from_error`] to turn any of them
//! into the [`Status`] reported to the peer.

use std::fmt;

use smol_str::SmolStr;

use crate::{metadata::MetadataMap, status::Status};

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A part was received or sent in an order the gRPC protocol does not allow,
/// e.g. a message before the request metadata or a second unary request.
///
/// Protocol violations are fatal for the call and map to [`Code::Internal`].
///
/// [`Code::Internal`]: crate::Code::Internal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    reason: SmolStr,
}

impl ProtocolViolation {
    /// Create a new [`ProtocolViolation`] for the given reason.
    pub fn new(reason: impl Into<SmolStr>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason of this violation.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol violation: {}", self.reason)
    }
}

impl std::error::Error for ProtocolViolation {}

/// Error returned by [`AsyncWriter::write`](crate::writer::AsyncWriter::write)
/// and the stream writers built on top of it.
///
/// These errors are reported to the caller only, they never terminate the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteError {
    /// The writer was finished (or cancelled) before the write was attempted.
    AlreadyFinished,
    /// The writer already buffers its maximum amount of pending writes.
    TooManyPendingWrites,
    /// The writer was cancelled while the write was waiting for capacity.
    Cancelled,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyFinished => f.write_str("writer already finished"),
            Self::TooManyPendingWrites => f.write_str("too many pending writes"),
            Self::Cancelled => f.write_str("writer cancelled"),
        }
    }
}

impl std::error::Error for WriteError {}

static_str_error! {
    #[doc = "deadline exceeded before the call completed"]
    pub struct DeadlineExceeded;
}

/// Wrapper type to indicate that an error occurs while opening a stream,
/// so that the appropriate gRPC Status can be inferred.
#[derive(Debug)]
pub struct ConnectError(pub BoxError);

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Policy turning errors into the [`Status`] and trailers sent to the peer.
///
/// The server call consults the delegate whenever it has to synthesize the
/// end of a call from an error: [`map_library_error`] for failures raised by
/// the call machinery itself (protocol violations, codec errors, transport
/// errors, deadlines, interceptor rejections) and [`map_handler_error`] for
/// errors returned by the user handler.
///
/// [`map_library_error`]: ErrorDelegate::map_library_error
/// [`map_handler_error`]: ErrorDelegate::map_handler_error
pub trait ErrorDelegate: Send + Sync + 'static {
    /// Map an error raised by the call machinery.
    fn map_library_error(&self, error: BoxError) -> (Status, MetadataMap) {
        (Status::from_error(error), MetadataMap::new())
    }

    /// Map an error returned by a handler.
    fn map_handler_error(&self, error: BoxError) -> (Status, MetadataMap) {
        (Status::from_error(error), MetadataMap::new())
    }
}

/// [`ErrorDelegate`] which maps every error using [`Status::from_error`]
/// and adds no trailers.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct DefaultErrorDelegate;

impl DefaultErrorDelegate {
    /// Create a new [`DefaultErrorDelegate`].
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ErrorDelegate for DefaultErrorDelegate {}
