//! Message (de)serialization boundary.
//!
//! The call machinery only moves opaque [`Bytes`] between the transport and
//! a [`Codec`]; how messages are encoded is up to the codec injected per call.

use std::{fmt, marker::PhantomData};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::Status;

/// Encodes outbound messages and decodes inbound messages of a single call.
///
/// A server call encodes responses and decodes requests, a client call
/// encodes requests and decodes responses. Failures are reported as a
/// [`Status`] and are fatal for the call.
pub trait Codec: Send + 'static {
    /// The type that is encoded.
    type Encode: Send + 'static;

    /// The type that is decoded.
    type Decode: Send + 'static;

    /// Encode a message into its serialized form.
    fn encode(&mut self, item: Self::Encode) -> Result<Bytes, Status>;

    /// Decode a message from its serialized form.
    fn decode(&mut self, buf: Bytes) -> Result<Self::Decode, Status>;
}

/// A [`Codec`] using [`serde_json`].
pub struct JsonCodec<E, D> {
    _marker: PhantomData<fn(E) -> D>,
}

impl<E, D> JsonCodec<E, D> {
    /// Create a new [`JsonCodec`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E, D> Default for JsonCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, D> Clone for JsonCodec<E, D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E, D> fmt::Debug for JsonCodec<E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").finish()
    }
}

impl<E, D> Codec for JsonCodec<E, D>
where
    E: Serialize + Send + 'static,
    D: DeserializeOwned + Send + 'static,
{
    type Encode = E;
    type Decode = D;

    fn encode(&mut self, item: Self::Encode) -> Result<Bytes, Status> {
        serde_json::to_vec(&item)
            .map(Bytes::from)
            .map_err(|err| Status::internal(format!("failed to encode json message: {err}")))
    }

    fn decode(&mut self, buf: Bytes) -> Result<Self::Decode, Status> {
        serde_json::from_slice(&buf)
            .map_err(|err| Status::internal(format!("failed to decode json message: {err}")))
    }
}

/// A [`Codec`] passing raw [`Bytes`] through unchanged.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct BytesCodec;

impl BytesCodec {
    /// Create a new [`BytesCodec`].
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;

    fn encode(&mut self, item: Self::Encode) -> Result<Bytes, Status> {
        Ok(item)
    }

    fn decode(&mut self, buf: Bytes) -> Result<Self::Decode, Status> {
        Ok(buf)
    }
}
