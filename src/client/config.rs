use std::time::Duration;

use crate::{
    MetadataMap,
    interceptor::{Interceptor, InterceptorPipeline},
    writer::WriterConfig,
};

/// Configuration shared by all calls started by a [`Client`].
///
/// [`Client`]: super::Client
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    compression_enabled: bool,
    timeout: Option<Duration>,
    interceptors: InterceptorPipeline,
    writer: WriterConfig,
}

impl ClientConfig {
    /// Create a new [`ClientConfig`] with compression disabled,
    /// no default timeout and no interceptors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether request messages may be compressed at all.
    #[must_use]
    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    /// Enable or disable compression of request messages.
    #[must_use]
    pub fn with_compression_enabled(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Enable or disable compression of request messages.
    pub fn set_compression_enabled(&mut self, enabled: bool) -> &mut Self {
        self.compression_enabled = enabled;
        self
    }

    /// The timeout used for calls which do not set one.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the timeout used for calls which do not set one.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the timeout used for calls which do not set one.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// The interceptors applied to every call.
    #[must_use]
    pub fn interceptors(&self) -> &InterceptorPipeline {
        &self.interceptors
    }

    /// Append an interceptor applied to every call.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push_interceptor(interceptor);
        self
    }

    /// Append an interceptor applied to every call.
    pub fn set_interceptor(&mut self, interceptor: impl Interceptor) -> &mut Self {
        self.interceptors.push_interceptor(interceptor);
        self
    }

    /// The config of the writer backing each request stream.
    #[must_use]
    pub fn writer(&self) -> WriterConfig {
        self.writer
    }

    /// Set the config of the writer backing each request stream.
    #[must_use]
    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    /// Set the config of the writer backing each request stream.
    pub fn set_writer(&mut self, writer: WriterConfig) -> &mut Self {
        self.writer = writer;
        self
    }
}

/// Options of a single client call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    metadata: MetadataMap,
    timeout: Option<Duration>,
    compression: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl CallOptions {
    /// Create new [`CallOptions`]: no custom metadata, no timeout
    /// and messages compressed by default (if the client enables compression).
    #[must_use]
    pub fn new() -> Self {
        Self {
            metadata: MetadataMap::new(),
            timeout: None,
            compression: true,
        }
    }

    /// The custom metadata sent to start the call.
    #[must_use]
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Mutable access to the custom metadata sent to start the call.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    /// Set the custom metadata sent to start the call.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the custom metadata sent to start the call.
    pub fn set_metadata(&mut self, metadata: MetadataMap) -> &mut Self {
        self.metadata = metadata;
        self
    }

    /// The timeout of the call, overriding the default of the client.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the timeout of the call, overriding the default of the client.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the timeout of the call, overriding the default of the client.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether request messages are compressed unless overridden per message.
    #[must_use]
    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Set whether request messages are compressed unless overridden per message.
    #[must_use]
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compression = compress;
        self
    }

    /// Set whether request messages are compressed unless overridden per message.
    pub fn set_compression(&mut self, compress: bool) -> &mut Self {
        self.compression = compress;
        self
    }
}
