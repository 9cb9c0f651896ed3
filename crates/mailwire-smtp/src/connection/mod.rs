//! SMTP connections: transport, line framing and the client.

mod client;
mod framed;
mod stream;

pub use client::{ChunkWriter, Client, DataWriter, Delivery};
pub use framed::FramedStream;
pub use stream::{SmtpStream, connect, connect_tls, create_tls_connector};

use crate::types::{AuthMechanism, Extension};
use std::collections::HashSet;

/// Server capabilities from EHLO response.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Server hostname from greeting.
    pub hostname: String,
    /// Supported extensions.
    pub extensions: HashSet<Extension>,
}

impl ServerInfo {
    /// Checks if the server advertised an extension, ignoring parameters.
    #[must_use]
    pub fn supports(&self, ext: &Extension) -> bool {
        self.extensions.iter().any(|known| known.same_keyword(ext))
    }

    /// Checks if STARTTLS is supported.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.supports(&Extension::StartTls)
    }

    /// Returns the maximum message size, if advertised.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::Size(size) => *size,
            _ => None,
        })
    }

    /// Returns supported authentication mechanisms.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        self.extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Auth(mechanisms) => Some(mechanisms.clone()),
                _ => None,
            })
            .unwrap_or_default()
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

    fn info(lines: &[&str]) -> ServerInfo {
        ServerInfo {
            hostname: "mx.example.org".into(),
            extensions: lines.iter().map(|line| Extension::parse(line)).collect(),
        }
    }

    #[test]
    fn test_supports_ignores_parameters() {
        let info = info(&["SIZE 1000", "AUTH PLAIN", "PIPELINING"]);
        assert!(info.supports(&Extension::Size(None)));
        assert!(info.supports(&Extension::Auth(Vec::new())));
        assert!(info.supports(&Extension::Pipelining));
        assert!(!info.supports_starttls());
    }

    #[test]
    fn test_max_message_size() {
        assert_eq!(info(&["SIZE 1000"]).max_message_size(), Some(1000));
        assert_eq!(info(&["SIZE"]).max_message_size(), None);
        assert_eq!(info(&[]).max_message_size(), None);
    }

    #[test]
    fn test_auth_mechanisms() {
        let info = info(&["AUTH PLAIN LOGIN"]);
        assert_eq!(
            info.auth_mechanisms(),
            vec![AuthMechanism::Plain, AuthMechanism::Login]
        );
    }
}
