use std::time::Duration;

use crate::writer::WriterConfig;

/// Configuration shared by all calls started by a [`Server`].
///
/// [`Server`]: super::Server
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    compression_enabled: bool,
    timeout: Option<Duration>,
    writer: WriterConfig,
}

impl ServerConfig {
    /// Create a new [`ServerConfig`] with compression disabled and no timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether response messages may be compressed at all.
    #[must_use]
    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    /// Enable or disable compression of response messages.
    #[must_use]
    pub fn with_compression_enabled(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Enable or disable compression of response messages.
    pub fn set_compression_enabled(&mut self, enabled: bool) -> &mut Self {
        self.compression_enabled = enabled;
        self
    }

    /// The server side timeout of a call, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set a timeout applied to every call.
    ///
    /// When the client sends a `grpc-timeout` as well, the shorter one is used.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a timeout applied to every call.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// The config of the writer backing each response stream.
    #[must_use]
    pub fn writer(&self) -> WriterConfig {
        self.writer
    }

    /// Set the config of the writer backing each response stream.
    #[must_use]
    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    /// Set the config of the writer backing each response stream.
    pub fn set_writer(&mut self, writer: WriterConfig) -> &mut Self {
        self.writer = writer;
        self
    }
}
