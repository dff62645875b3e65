//! Custom metadata exchanged at the start and end of a call.

use std::fmt;

use http::header::{
    self, AsHeaderName, GetAll, HeaderMap, HeaderName, HeaderValue, IntoHeaderName,
    InvalidHeaderName, InvalidHeaderValue,
};

/// The metadata of a call: request headers, response headers or trailers.
///
/// Backed by an [`http::HeaderMap`], keys are case-insensitive
/// and a key can hold multiple values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MetadataMap {
    headers: HeaderMap,
}

impl MetadataMap {
    /// Headers reserved by the gRPC protocol (and its http transport),
    /// stripped by [`MetadataMap::into_sanitized_headers`].
    pub const GRPC_RESERVED_HEADERS: [HeaderName; 7] = [
        header::TE,
        header::USER_AGENT,
        header::CONTENT_TYPE,
        HeaderName::from_static("grpc-message"),
        HeaderName::from_static("grpc-message-type"),
        HeaderName::from_static("grpc-status"),
        HeaderName::from_static("grpc-status-details-bin"),
    ];

    /// Create an empty `MetadataMap`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty `MetadataMap` with room for at least `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            headers: HeaderMap::with_capacity(capacity),
        }
    }

    /// Wrap an existing [`HeaderMap`].
    #[must_use]
    pub fn from_headers(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// Consume the map, returning the inner [`HeaderMap`].
    #[must_use]
    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }

    /// Consume the map, returning the inner [`HeaderMap`]
    /// without any of the [reserved headers](Self::GRPC_RESERVED_HEADERS).
    #[must_use]
    pub fn into_sanitized_headers(mut self) -> HeaderMap {
        for name in &Self::GRPC_RESERVED_HEADERS {
            self.headers.remove(name);
        }
        self.headers
    }

    /// Number of values stored in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Returns `true` if the map contains no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Returns the first value associated with the key.
    pub fn get<K: AsHeaderName>(&self, key: K) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    /// Returns the first value associated with the key as a str,
    /// if it is valid visible ascii.
    pub fn get_str<K: AsHeaderName>(&self, key: K) -> Option<&str> {
        self.headers.get(key).and_then(|value| value.to_str().ok())
    }

    /// Returns all values associated with the key.
    pub fn get_all<K: AsHeaderName>(&self, key: K) -> GetAll<'_, HeaderValue> {
        self.headers.get_all(key)
    }

    /// Returns `true` if the map contains a value for the key.
    pub fn contains_key<K: AsHeaderName>(&self, key: K) -> bool {
        self.headers.contains_key(key)
    }

    /// Insert the value, replacing all previous values of the key.
    pub fn insert<K: IntoHeaderName>(&mut self, key: K, value: HeaderValue) -> Option<HeaderValue> {
        self.headers.insert(key, value)
    }

    /// Append the value, keeping previous values of the key.
    pub fn append<K: IntoHeaderName>(&mut self, key: K, value: HeaderValue) -> bool {
        self.headers.append(key, value)
    }

    /// Parse and insert an ascii key-value pair.
    pub fn insert_ascii(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<Option<HeaderValue>, InvalidMetadata> {
        let key = HeaderName::from_bytes(key.as_bytes()).map_err(InvalidMetadata::Key)?;
        let value = HeaderValue::from_str(value).map_err(InvalidMetadata::Value)?;
        Ok(self.headers.insert(key, value))
    }

    /// Remove the key, returning its first value.
    pub fn remove<K: AsHeaderName>(&mut self, key: K) -> Option<HeaderValue> {
        self.headers.remove(key)
    }

    /// Iterate over all key-value pairs.
    pub fn iter(&self) -> header::Iter<'_, HeaderValue> {
        self.headers.iter()
    }

    /// Append all values of `other` to this map.
    pub fn merge(&mut self, other: Self) {
        for (key, value) in other.headers.iter() {
            self.headers.append(key.clone(), value.clone());
        }
    }
}

impl AsRef<HeaderMap> for MetadataMap {
    fn as_ref(&self) -> &HeaderMap {
        &self.headers
    }
}

impl AsMut<HeaderMap> for MetadataMap {
    fn as_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

impl From<HeaderMap> for MetadataMap {
    fn from(headers: HeaderMap) -> Self {
        Self { headers }
    }
}

impl fmt::Debug for MetadataMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.headers.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a MetadataMap {
    type Item = (&'a HeaderName, &'a HeaderValue);
    type IntoIter = header::Iter<'a, HeaderValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}

/// Error returned by [`MetadataMap::insert_ascii`].
#[derive(Debug)]
pub enum InvalidMetadata {
    /// The key is not a valid header name.
    Key(InvalidHeaderName),
    /// The value is not a valid header value.
    Value(InvalidHeaderValue),
}

impl fmt::Display for InvalidMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(err) => write!(f, "invalid metadata key: {err}"),
            Self::Value(err) => write!(f, "invalid metadata value: {err}"),
        }
    }
}

impl std::error::Error for InvalidMetadata {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Key(err) => Some(err),
            Self::Value(err) => Some(err),
        }
    }
}
