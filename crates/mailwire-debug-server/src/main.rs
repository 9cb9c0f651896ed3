//! `mailwire-debug-server` - a local SMTP sink.
//!
//! Accepts every message on the given address (default `127.0.0.1:1025`)
//! and logs its envelope and headers. Nothing is stored or relayed.
//!
//! ```bash
//! RUST_LOG=mailwire_smtp=debug cargo run -p mailwire-debug-server -- 127.0.0.1:2525
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use mailwire_smtp::server::{Body, Envelope, MessageHandler, Outcome, Session, local_error};
use mailwire_smtp::{Reply, ServerConfig};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LISTEN: &str = "127.0.0.1:1025";

/// Logs each message and numbers it per connection.
#[derive(Debug, Default)]
struct DebugHandler {
    peer: String,
    received: usize,
}

impl MessageHandler for DebugHandler {
    async fn data(
        &mut self,
        envelope: &Envelope,
        body: &mut Body<'_>,
    ) -> Result<Option<String>, Reply> {
        self.received += 1;
        let id = format!("{}-{}", self.peer, self.received);

        let mut reader = BufReader::new(body);
        let headers = headers(&mut reader).await.map_err(|err| local_error(&err))?;
        tokio::io::copy_buf(&mut reader, &mut tokio::io::sink())
            .await
            .map_err(|err| local_error(&err))?;

        info!(
            %id,
            from = %envelope.from,
            to = ?envelope.recipients.iter().map(ToString::to_string).collect::<Vec<_>>(),
            bytes = reader.get_ref().bytes_read(),
            mode = ?envelope.mode,
            "message received"
        );
        for line in headers {
            info!(%id, "  {line}");
        }
        Ok(Some(id))
    }
}

/// Header lines of a message, up to the first empty line.
async fn headers<R>(reader: &mut R) -> std::io::Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(headers);
        }
        let text = line.strip_suffix(b"\n").unwrap_or(&line);
        let text = text.strip_suffix(b"\r").unwrap_or(text);
        if text.is_empty() {
            return Ok(headers);
        }
        headers.push(String::from_utf8_lossy(text).into_owned());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailwire_debug_server=info,mailwire_smtp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let listen = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    let config = Arc::new(ServerConfig::builder("mailwire.debug").build());
    info!(%listen, "accepting mail");

    loop {
        let (socket, peer) = listener.accept().await.context("accepting connection")?;
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let handler = DebugHandler {
                peer: peer.to_string(),
                received: 0,
            };
            match Session::new(socket, handler, config).serve().await {
                Ok(Outcome::Closed(handler)) => {
                    info!(%peer, messages = handler.received, "connection closed");
                }
                Ok(Outcome::StartTls(_)) => warn!(%peer, "STARTTLS requested but not offered"),
                Err(err) => warn!(%peer, error = %err, "connection failed"),
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mailwire_smtp::Address;
    use mailwire_smtp::command::MailParams;

    #[tokio::test]
    async fn test_headers_stop_at_blank_line() {
        let mut input = &b"Subject: hi\r\nFrom: a@x\r\n\r\nbody line\r\n"[..];
        let lines = headers(&mut input).await.unwrap();
        assert_eq!(lines, vec!["Subject: hi", "From: a@x"]);
        assert_eq!(input, b"body line\r\n");
    }

    #[tokio::test]
    async fn test_handler_numbers_messages_per_peer() {
        let mut handler = DebugHandler {
            peer: "127.0.0.1:4000".to_string(),
            received: 0,
        };
        let envelope = Envelope::new(Address::new("a@x").unwrap(), MailParams::default());
        for expected in ["127.0.0.1:4000-1", "127.0.0.1:4000-2"] {
            let mut body = Body::from_bytes(Bytes::from_static(b"Subject: hi\r\n\r\nbody\r\n"));
            let id = handler.data(&envelope, &mut body).await.unwrap();
            assert_eq!(id.as_deref(), Some(expected));
            assert_eq!(body.bytes_read(), 21);
        }
    }
}
