//! Server and client configuration.
//!
//! Both roles take an explicit configuration value at construction, so
//! sessions with different limits can live side by side in one process.

use std::time::Duration;

use crate::codec::bdat::DEFAULT_CHUNK_SIZE;
use crate::codec::line::DEFAULT_MAX_LINE_LENGTH;
use crate::pipeline::DEFAULT_MAX_DEPTH;

/// Default maximum message size (32 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: u64 = 32 * 1024 * 1024;

/// Default command read/write timeout (RFC 5321 section 4.5.3.2).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default timeout for a whole DATA body.
pub const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default timeout for the final reply after a body.
pub const DEFAULT_SUBMISSION_TIMEOUT: Duration = Duration::from_secs(12 * 60);

/// Server session configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name used in the greeting and EHLO reply.
    pub hostname: String,
    /// Maximum command line length, CRLF excluded.
    pub max_line_length: usize,
    /// Maximum message size, advertised as `SIZE`.
    pub max_message_bytes: u64,
    /// Maximum size of a single BDAT chunk.
    pub max_chunk_bytes: Option<u64>,
    /// Maximum recipients per transaction.
    pub max_recipients: usize,
    /// Overlong lines tolerated before the session is closed.
    pub max_line_errors: usize,
    /// Deadline for reading one command line.
    pub read_timeout: Duration,
    /// Deadline for writing queued replies.
    pub write_timeout: Duration,
    /// Deadline for a whole DATA body or BDAT chunk.
    pub data_timeout: Duration,
    /// Advertise PIPELINING.
    pub pipelining: bool,
    /// Advertise and accept CHUNKING.
    pub chunking: bool,
    /// Advertise and accept BINARYMIME (requires chunking).
    pub binarymime: bool,
    /// Advertise and accept SMTPUTF8.
    pub smtputf8: bool,
    /// Advertise STARTTLS on plain connections.
    pub starttls: bool,
    /// Offer AUTH on plain connections.
    pub allow_insecure_auth: bool,
    /// Advertise and accept REQUIRETLS. Only offered over TLS.
    pub requiretls: bool,
    /// Refuse mail commands with `530` until the connection is encrypted.
    pub enforce_tls: bool,
    /// Refuse mail commands with `530` until the client authenticates.
    pub enforce_auth: bool,
    /// Let MAIL inside a transaction restart it instead of failing with 503.
    pub implicit_reset_on_mail: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_chunk_bytes: None,
            max_recipients: 100,
            max_line_errors: 3,
            read_timeout: DEFAULT_COMMAND_TIMEOUT,
            write_timeout: DEFAULT_COMMAND_TIMEOUT,
            data_timeout: DEFAULT_DATA_TIMEOUT,
            pipelining: true,
            chunking: true,
            binarymime: true,
            smtputf8: true,
            starttls: false,
            allow_insecure_auth: false,
            requiretls: false,
            enforce_tls: false,
            enforce_auth: false,
            implicit_reset_on_mail: false,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(hostname: impl Into<String>) -> ServerConfigBuilder {
        ServerConfigBuilder::new(hostname)
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Creates a builder with defaults and the given hostname.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            config: ServerConfig {
                hostname: hostname.into(),
                ..ServerConfig::default()
            },
        }
    }

    /// Sets the maximum command line length.
    #[must_use]
    pub const fn max_line_length(mut self, max: usize) -> Self {
        self.config.max_line_length = max;
        self
    }

    /// Sets the maximum message size.
    #[must_use]
    pub const fn max_message_bytes(mut self, max: u64) -> Self {
        self.config.max_message_bytes = max;
        self
    }

    /// Caps single BDAT chunks.
    #[must_use]
    pub const fn max_chunk_bytes(mut self, max: u64) -> Self {
        self.config.max_chunk_bytes = Some(max);
        self
    }

    /// Sets the recipient limit.
    #[must_use]
    pub const fn max_recipients(mut self, max: usize) -> Self {
        self.config.max_recipients = max;
        self
    }

    /// Sets how many overlong lines are tolerated.
    #[must_use]
    pub const fn max_line_errors(mut self, max: usize) -> Self {
        self.config.max_line_errors = max;
        self
    }

    /// Sets the command read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Sets the reply write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Sets the body timeout.
    #[must_use]
    pub const fn data_timeout(mut self, timeout: Duration) -> Self {
        self.config.data_timeout = timeout;
        self
    }

    /// Enables or disables PIPELINING.
    #[must_use]
    pub const fn pipelining(mut self, enabled: bool) -> Self {
        self.config.pipelining = enabled;
        self
    }

    /// Enables or disables CHUNKING.
    #[must_use]
    pub const fn chunking(mut self, enabled: bool) -> Self {
        self.config.chunking = enabled;
        self
    }

    /// Enables or disables BINARYMIME.
    #[must_use]
    pub const fn binarymime(mut self, enabled: bool) -> Self {
        self.config.binarymime = enabled;
        self
    }

    /// Enables or disables SMTPUTF8.
    #[must_use]
    pub const fn smtputf8(mut self, enabled: bool) -> Self {
        self.config.smtputf8 = enabled;
        self
    }

    /// Enables or disables STARTTLS.
    #[must_use]
    pub const fn starttls(mut self, enabled: bool) -> Self {
        self.config.starttls = enabled;
        self
    }

    /// Allows AUTH before TLS.
    #[must_use]
    pub const fn allow_insecure_auth(mut self, allow: bool) -> Self {
        self.config.allow_insecure_auth = allow;
        self
    }

    /// Enables or disables REQUIRETLS.
    #[must_use]
    pub const fn requiretls(mut self, enabled: bool) -> Self {
        self.config.requiretls = enabled;
        self
    }

    /// Requires TLS before any mail transaction.
    #[must_use]
    pub const fn enforce_tls(mut self, enforce: bool) -> Self {
        self.config.enforce_tls = enforce;
        self
    }

    /// Requires AUTH before any mail transaction.
    #[must_use]
    pub const fn enforce_auth(mut self, enforce: bool) -> Self {
        self.config.enforce_auth = enforce;
        self
    }

    /// Lets a nested MAIL restart the transaction.
    #[must_use]
    pub const fn implicit_reset_on_mail(mut self, enabled: bool) -> Self {
        self.config.implicit_reset_on_mail = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name sent with EHLO/HELO.
    pub local_name: String,
    /// Deadline for each command reply.
    pub command_timeout: Duration,
    /// Deadline for the final reply after a body.
    pub submission_timeout: Duration,
    /// Maximum reply line length.
    pub max_line_length: usize,
    /// BDAT chunk size.
    pub chunk_size: usize,
    /// Use BDAT when the server offers CHUNKING.
    pub prefer_chunking: bool,
    /// Pipeline commands when the server offers PIPELINING.
    pub pipelining: bool,
    /// Send BDAT chunks without waiting for each chunk's reply.
    pub pipeline_bdat: bool,
    /// Maximum commands per pipelined run.
    pub max_pipeline_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_name: "localhost".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            submission_timeout: DEFAULT_SUBMISSION_TIMEOUT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            prefer_chunking: true,
            pipelining: true,
            pipeline_bdat: false,
            max_pipeline_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(local_name: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(local_name)
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Creates a builder with defaults and the given EHLO name.
    #[must_use]
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                local_name: local_name.into(),
                ..ClientConfig::default()
            },
        }
    }

    /// Sets the command timeout.
    #[must_use]
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Sets the final-reply timeout.
    #[must_use]
    pub const fn submission_timeout(mut self, timeout: Duration) -> Self {
        self.config.submission_timeout = timeout;
        self
    }

    /// Sets the maximum reply line length.
    #[must_use]
    pub const fn max_line_length(mut self, max: usize) -> Self {
        self.config.max_line_length = max;
        self
    }

    /// Sets the BDAT chunk size.
    #[must_use]
    pub const fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Chooses BDAT over DATA when both are available.
    #[must_use]
    pub const fn prefer_chunking(mut self, prefer: bool) -> Self {
        self.config.prefer_chunking = prefer;
        self
    }

    /// Enables or disables pipelining.
    #[must_use]
    pub const fn pipelining(mut self, enabled: bool) -> Self {
        self.config.pipelining = enabled;
        self
    }

    /// Enables or disables pipelined BDAT chunks.
    #[must_use]
    pub const fn pipeline_bdat(mut self, enabled: bool) -> Self {
        self.config.pipeline_bdat = enabled;
        self
    }

    /// Sets the maximum run length.
    #[must_use]
    pub const fn max_pipeline_depth(mut self, depth: usize) -> Self {
        self.config.max_pipeline_depth = depth;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.max_line_length, 2000);
        assert_eq!(config.max_message_bytes, 32 * 1024 * 1024);
        assert_eq!(config.max_chunk_bytes, None);
        assert_eq!(config.max_recipients, 100);
        assert_eq!(config.max_line_errors, 3);
        assert!(config.pipelining && config.chunking && config.binarymime && config.smtputf8);
        assert!(!config.starttls);
        assert!(!config.allow_insecure_auth);
        assert!(!config.implicit_reset_on_mail);
        assert!(!config.requiretls && !config.enforce_tls && !config.enforce_auth);
    }

    #[test]
    fn test_server_builder() {
        let config = ServerConfig::builder("mx.example.org")
            .max_message_bytes(1024)
            .max_chunk_bytes(256)
            .chunking(false)
            .read_timeout(Duration::from_secs(1))
            .enforce_tls(true)
            .build();
        assert_eq!(config.hostname, "mx.example.org");
        assert_eq!(config.max_message_bytes, 1024);
        assert_eq!(config.max_chunk_bytes, Some(256));
        assert!(!config.chunking);
        assert!(config.enforce_tls && !config.enforce_auth);
        assert_eq!(config.read_timeout, Duration::from_secs(1));
        assert_eq!(config.write_timeout, DEFAULT_COMMAND_TIMEOUT);
    }

    #[test]
    fn test_client_defaults_and_builder() {
        let config = ClientConfig::default();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert!(config.prefer_chunking && config.pipelining);
        assert!(!config.pipeline_bdat);
        assert_eq!(config.submission_timeout, Duration::from_secs(720));

        let config = ClientConfig::builder("client.example.com")
            .chunk_size(16)
            .pipeline_bdat(true)
            .build();
        assert_eq!(config.local_name, "client.example.com");
        assert_eq!(config.chunk_size, 16);
        assert!(config.pipeline_bdat);
    }
}
