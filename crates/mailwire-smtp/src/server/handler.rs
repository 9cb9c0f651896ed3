//! Message handler for SMTP server sessions.
//!
//! The session runs the protocol; the handler decides. It is consulted for
//! each sender and recipient, reads every message body as it arrives, and
//! drives AUTH exchanges. Rejections are returned as the [`Reply`] to send.
//!
//! # Example
//!
//! ```ignore
//! use mailwire_smtp::server::{Body, Envelope, MessageHandler};
//! use mailwire_smtp::types::Reply;
//!
//! struct Spool;
//!
//! impl MessageHandler for Spool {
//!     async fn data(&mut self, envelope: &Envelope, body: &mut Body<'_>) -> Result<Option<String>, Reply> {
//!         let mut file = tokio::fs::File::create(spool_path(envelope)).await.map_err(local_error)?;
//!         tokio::io::copy(body, &mut file).await.map_err(local_error)?;
//!         Ok(Some(queue_id(envelope)))
//!     }
//! }
//! ```

use std::future::Future;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use super::body::Body;
use super::state::TransferMode;
use crate::command::MailParams;
use crate::types::{Address, AuthMechanism, EnhancedCode, Reply, ReplyCode};

/// Sender, recipients and parameters of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Name given with HELO/EHLO.
    pub client_name: Option<String>,
    /// Reverse path, possibly null.
    pub from: Address,
    /// MAIL FROM parameters.
    pub params: MailParams,
    /// Accepted recipients, in command order, duplicates kept.
    pub recipients: Vec<Address>,
    /// How the body arrived, once known.
    pub mode: Option<TransferMode>,
    /// Whether the session was running over TLS.
    pub tls: bool,
    /// Whether the client authenticated.
    pub authenticated: bool,
}

impl Envelope {
    /// Creates an envelope with no recipients.
    #[must_use]
    pub fn new(from: Address, params: MailParams) -> Self {
        Self {
            client_name: None,
            from,
            params,
            recipients: Vec::new(),
            mode: None,
            tls: false,
            authenticated: false,
        }
    }
}

/// One step of a SASL exchange, as decided by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send a `334` challenge with these (raw, unencoded) bytes.
    Challenge(Vec<u8>),
    /// Credentials accepted.
    Accepted,
    /// Credentials rejected with this reply.
    Rejected(Reply),
}

/// Application callbacks for a server session.
///
/// Every method has a permissive default, so a handler only overrides what
/// it cares about. Calls for one session happen in protocol order on the
/// session's task.
pub trait MessageHandler: Send {
    /// Called for MAIL FROM, before the transaction opens.
    fn mail(&mut self, from: &Address, params: &MailParams) -> Result<(), Reply> {
        let _ = (from, params);
        Ok(())
    }

    /// Called for each RCPT TO. A rejection affects only this recipient.
    fn rcpt(&mut self, envelope: &Envelope, to: &Address) -> Result<(), Reply> {
        let _ = (envelope, to);
        Ok(())
    }

    /// Called when a body starts, with the decoded bytes readable from
    /// `body`.
    ///
    /// Returns an optional queue identifier for the `250` reply. The reply
    /// is only sent once the whole body is in. A body that failed to arrive
    /// intact overrides whatever is returned here.
    fn data(
        &mut self,
        envelope: &Envelope,
        body: &mut Body<'_>,
    ) -> impl Future<Output = Result<Option<String>, Reply>> + Send {
        let _ = (envelope, body);
        async { Ok(None) }
    }

    /// Called for VRFY. `None` gives the standard `252` non-answer.
    fn verify(&mut self, address: &str) -> Option<Reply> {
        let _ = address;
        None
    }

    /// Called whenever a transaction is abandoned (RSET, HELO/EHLO, errors).
    fn reset(&mut self) {}

    /// Mechanisms to advertise. Empty disables AUTH.
    fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        Vec::new()
    }

    /// Advances a SASL exchange.
    ///
    /// `response` is `None` when AUTH carried no initial response, else the
    /// decoded client data (empty for `=`).
    fn auth(&mut self, mechanism: AuthMechanism, response: Option<&[u8]>) -> AuthStep {
        let _ = (mechanism, response);
        AuthStep::Rejected(Reply::with_status(
            ReplyCode::AUTH_FAILED,
            EnhancedCode::new(5, 7, 8),
            "Authentication credentials invalid",
        ))
    }
}

/// A handler that accepts everything and discards messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl MessageHandler for NoopHandler {}

/// A handler that accepts everything and logs each message using tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn mail(&mut self, from: &Address, params: &MailParams) -> Result<(), Reply> {
        tracing::debug!(%from, ?params, "MAIL");
        Ok(())
    }

    fn rcpt(&mut self, _envelope: &Envelope, to: &Address) -> Result<(), Reply> {
        tracing::debug!(%to, "RCPT");
        Ok(())
    }

    async fn data(
        &mut self,
        envelope: &Envelope,
        body: &mut Body<'_>,
    ) -> Result<Option<String>, Reply> {
        let bytes = tokio::io::copy(body, &mut tokio::io::sink())
            .await
            .map_err(|err| local_error(&err))?;
        tracing::info!(
            from = %envelope.from,
            recipients = envelope.recipients.len(),
            bytes,
            mode = ?envelope.mode,
            "message received"
        );
        Ok(None)
    }

    fn reset(&mut self) {
        tracing::trace!("transaction reset");
    }
}

/// A completed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The transaction envelope.
    pub envelope: Envelope,
    /// The decoded body.
    pub body: Bytes,
}

/// A handler that collects messages for later processing.
///
/// Useful for testing. Messages are numbered in arrival order and the
/// number is used as the queue identifier.
#[derive(Debug, Default, Clone)]
pub struct CollectingHandler {
    /// Collected messages.
    pub messages: Vec<Message>,
    /// Number of resets seen.
    pub resets: usize,
}

impl CollectingHandler {
    /// Creates a new collecting handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes all collected messages, leaving the handler empty.
    pub fn take(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }
}

impl MessageHandler for CollectingHandler {
    async fn data(
        &mut self,
        envelope: &Envelope,
        body: &mut Body<'_>,
    ) -> Result<Option<String>, Reply> {
        let mut collected = Vec::new();
        body.read_to_end(&mut collected)
            .await
            .map_err(|err| local_error(&err))?;
        self.messages.push(Message {
            envelope: envelope.clone(),
            body: Bytes::from(collected),
        });
        Ok(Some(self.messages.len().to_string()))
    }

    fn reset(&mut self) {
        self.resets += 1;
    }
}

/// The `451` a handler answers with when reading the body failed.
///
/// The session replaces it with the proper reply for the failure, so this
/// only surfaces for errors raised by the handler itself.
#[must_use]
pub fn local_error(err: &std::io::Error) -> Reply {
    tracing::debug!(error = %err, "message body read failed");
    Reply::with_status(
        ReplyCode::LOCAL_ERROR,
        EnhancedCode::new(4, 3, 0),
        "Requested action aborted: local error in processing",
    )
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

    fn envelope() -> Envelope {
        let mut envelope = Envelope::new(Address::new("a@x").unwrap(), MailParams::default());
        envelope.recipients.push(Address::new("b@y").unwrap());
        envelope
    }

    #[tokio::test]
    async fn test_defaults_accept_everything() {
        let mut handler = NoopHandler;
        let envelope = envelope();
        assert!(handler.mail(&envelope.from, &envelope.params).is_ok());
        assert!(handler.rcpt(&envelope, &envelope.recipients[0]).is_ok());
        let mut body = Body::from_bytes(Bytes::from_static(b"x"));
        assert_eq!(handler.data(&envelope, &mut body).await, Ok(None));
        assert!(handler.verify("someone").is_none());
        assert!(handler.auth_mechanisms().is_empty());
    }

    #[test]
    fn test_default_auth_rejects() {
        let mut handler = NoopHandler;
        match handler.auth(AuthMechanism::Plain, Some(b"\0user\0pass")) {
            AuthStep::Rejected(reply) => {
                assert_eq!(reply.code, ReplyCode::AUTH_FAILED);
                assert_eq!(reply.status, Some(EnhancedCode::new(5, 7, 8)));
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_collecting_handler() {
        let mut handler = CollectingHandler::new();
        let envelope = envelope();
        let mut body = Body::from_bytes(Bytes::from_static(b"hello"));
        let id = handler.data(&envelope, &mut body).await.unwrap();
        assert_eq!(id.as_deref(), Some("1"));
        handler.reset();
        assert_eq!(handler.resets, 1);

        let messages = handler.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, Bytes::from_static(b"hello"));
        assert!(handler.messages.is_empty());
    }

    #[tokio::test]
    async fn test_logging_handler_reads_whole_body() {
        let mut handler = LoggingHandler;
        let envelope = envelope();
        let mut body = Body::from_bytes(Bytes::from_static(b"twelve bytes"));
        assert_eq!(handler.data(&envelope, &mut body).await, Ok(None));
        assert_eq!(body.bytes_read(), 12);
    }
}
