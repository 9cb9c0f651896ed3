//! Integration tests for server sessions and the client.
//!
//! Server tests feed a scripted client conversation through a mock stream
//! and inspect what the session wrote back. The end-to-end tests run the
//! client against a session over an in-memory pipe.

use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::oneshot;

use mailwire_smtp::server::{
    AuthStep, Body, CollectingHandler, Envelope, MessageHandler, Outcome, Session, TransferMode,
    local_error,
};
use mailwire_smtp::{
    Address, AuthMechanism, Client, ClientConfig, EnhancedCode, Error, Reply, ReplyCode,
    ServerConfig,
};

/// Mock stream that replays a client script and records what is written.
struct MockStream {
    /// Bytes the client sends (in order).
    script: Cursor<Vec<u8>>,
    /// Everything the session wrote.
    sent: Arc<Mutex<Vec<u8>>>,
    /// Number of write calls.
    writes: Arc<AtomicUsize>,
}

impl MockStream {
    fn new(script: &[u8]) -> Self {
        Self {
            script: Cursor::new(script.to_vec()),
            sent: Arc::new(Mutex::new(Vec::new())),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn output(&self) -> Output {
        Output {
            sent: Arc::clone(&self.sent),
            writes: Arc::clone(&self.writes),
        }
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let data = self.script.get_ref();
        let pos = usize::try_from(self.script.position()).unwrap();

        if pos >= data.len() {
            return Poll::Ready(Ok(()));
        }

        let remaining = &data[pos..];
        let to_read = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..to_read]);
        self.script.set_position((pos + to_read) as u64);

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.sent.lock().unwrap().extend_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Handle on what a session wrote, usable after the stream moved.
struct Output {
    sent: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
}

impl Output {
    fn text(&self) -> String {
        String::from_utf8(self.sent.lock().unwrap().clone()).unwrap()
    }

    /// Codes of complete replies, in order.
    fn codes(&self) -> Vec<u16> {
        self.finals().iter().map(|(code, _)| *code).collect()
    }

    /// Last line of each reply with its code.
    fn finals(&self) -> Vec<(u16, String)> {
        self.text()
            .split("\r\n")
            .filter(|line| line.len() == 3 || line.as_bytes().get(3) == Some(&b' '))
            .map(|line| (line[..3].parse().unwrap(), line.to_string()))
            .collect()
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

fn config() -> ServerConfig {
    ServerConfig::builder("mx.test").build()
}

async fn serve<H: MessageHandler>(
    config: ServerConfig,
    handler: H,
    script: &[u8],
) -> (mailwire_smtp::Result<Outcome<MockStream, H>>, Output) {
    let stream = MockStream::new(script);
    let output = stream.output();
    let result = Session::new(stream, handler, Arc::new(config)).serve().await;
    (result, output)
}

fn closed<S, H>(result: mailwire_smtp::Result<Outcome<S, H>>) -> H {
    match result.unwrap() {
        Outcome::Closed(handler) => handler,
        Outcome::StartTls(_) => panic!("unexpected STARTTLS hand-off"),
    }
}

#[tokio::test]
async fn test_minimal_data_transaction() {
    let script = b"EHLO client.test\r\n\
        MAIL FROM:<a@x>\r\n\
        RCPT TO:<b@y>\r\n\
        DATA\r\n\
        Subject: hi\r\n\r\n..line\r\n.\r\n\
        QUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    let handler = closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 354, 250, 221]);
    let text = output.text();
    assert!(text.starts_with("220 mx.test ESMTP Service Ready\r\n"));
    assert!(text.contains("250-mx.test Hello client.test\r\n"));
    assert!(text.contains("250 2.1.0 Originator <a@x> ok\r\n"));
    assert!(text.contains("250 2.0.0 OK: queued as 1\r\n"));

    assert_eq!(handler.messages.len(), 1);
    let message = &handler.messages[0];
    assert_eq!(message.body, Bytes::from_static(b"Subject: hi\r\n\r\n.line\r\n"));
    assert_eq!(message.envelope.recipients, vec![Address::new("b@y").unwrap()]);
    assert_eq!(message.envelope.mode, Some(TransferMode::DotStuffed));
    assert_eq!(message.envelope.client_name.as_deref(), Some("client.test"));
}

#[tokio::test]
async fn test_pipelined_commands_answered_in_one_write() {
    let script = b"EHLO client.test\r\n\
        MAIL FROM:<a@x>\r\n\
        RCPT TO:<b@y>\r\n\
        RCPT TO:<c@z>\r\n\
        DATA\r\n\
        body\r\n.\r\n\
        QUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 250, 354, 250, 221]);
    // Greeting, everything up to the 354, then the final reply with QUIT.
    assert_eq!(output.writes(), 3);
}

#[tokio::test]
async fn test_ehlo_advertises_extensions() {
    let (result, output) = serve(config(), CollectingHandler::new(), b"EHLO c\r\nQUIT\r\n").await;
    closed(result);

    let text = output.text();
    for keyword in ["PIPELINING", "CHUNKING", "BINARYMIME", "8BITMIME", "SMTPUTF8"] {
        assert!(text.contains(&format!("250-{keyword}\r\n")), "{keyword} missing");
    }
    assert!(text.contains("250 SIZE 33554432\r\n"));
    assert!(!text.contains("STARTTLS"));
    assert!(!text.contains("AUTH"));
}

#[tokio::test]
async fn test_chunked_transaction() {
    let script = b"EHLO c\r\n\
        MAIL FROM:<a@x> BODY=BINARYMIME\r\n\
        RCPT TO:<b@y>\r\n\
        BDAT 5\r\nhello\
        BDAT 0 LAST\r\n\
        QUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    let handler = closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 250, 250, 221]);
    assert!(output.text().contains("250 2.0.0 5 octets received\r\n"));
    assert_eq!(handler.messages.len(), 1);
    assert_eq!(handler.messages[0].body, Bytes::from_static(b"hello"));
    assert_eq!(handler.messages[0].envelope.mode, Some(TransferMode::Chunked));
}

#[tokio::test]
async fn test_empty_chunked_body() {
    let script = b"EHLO c\r\nMAIL FROM:<>\r\nRCPT TO:<b@y>\r\nBDAT 0 LAST\r\nQUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    let handler = closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 250, 221]);
    assert_eq!(handler.messages.len(), 1);
    assert!(handler.messages[0].body.is_empty());
    assert!(handler.messages[0].envelope.from.is_null());
}

#[tokio::test]
async fn test_data_refused_during_bdat() {
    let script = b"EHLO c\r\n\
        MAIL FROM:<a@x>\r\n\
        RCPT TO:<b@y>\r\n\
        BDAT 3\r\nabc\
        DATA\r\n\
        BDAT 0 LAST\r\n\
        QUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    let handler = closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 250, 503, 250, 221]);
    assert_eq!(handler.messages[0].body, Bytes::from_static(b"abc"));
}

#[tokio::test]
async fn test_bdat_without_chunking_is_drained() {
    let script = b"HELO c\r\n\
        MAIL FROM:<a@x>\r\n\
        RCPT TO:<b@y>\r\n\
        BDAT 3\r\nabc\
        NOOP\r\n\
        QUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    let handler = closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 503, 250, 221]);
    assert!(output.text().contains("CHUNKING not negotiated"));
    assert!(handler.messages.is_empty());
}

#[tokio::test]
async fn test_binarymime_requires_bdat() {
    let script = b"EHLO c\r\n\
        MAIL FROM:<a@x> BODY=BINARYMIME\r\n\
        RCPT TO:<b@y>\r\n\
        DATA\r\n\
        QUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 503, 221]);
}

#[tokio::test]
async fn test_rcpt_before_mail() {
    let script = b"EHLO c\r\nRCPT TO:<b@y>\r\nQUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 503, 221]);
    assert!(output.text().contains("503 5.5.1 Need MAIL command\r\n"));
}

#[tokio::test]
async fn test_mail_before_helo() {
    let (result, output) =
        serve(config(), CollectingHandler::new(), b"MAIL FROM:<a@x>\r\nQUIT\r\n").await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 503, 221]);
}

#[tokio::test]
async fn test_unknown_command() {
    let (result, output) =
        serve(config(), CollectingHandler::new(), b"EHLO c\r\nFROB\r\nQUIT\r\n").await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 500, 221]);
}

#[tokio::test]
async fn test_body_too_large_keeps_session() {
    let config = ServerConfig::builder("mx.test").max_message_bytes(8).build();
    let script = b"EHLO c\r\n\
        MAIL FROM:<a@x>\r\n\
        RCPT TO:<b@y>\r\n\
        DATA\r\n\
        0123456789abcdef\r\n.\r\n\
        NOOP\r\n\
        QUIT\r\n";
    let (result, output) = serve(config, CollectingHandler::new(), script).await;
    let handler = closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 354, 552, 250, 221]);
    assert!(handler.messages.is_empty());
    assert!(handler.resets >= 1);
}

#[tokio::test]
async fn test_declared_size_over_limit() {
    let config = ServerConfig::builder("mx.test").max_message_bytes(8).build();
    let script = b"EHLO c\r\nMAIL FROM:<a@x> SIZE=100\r\nQUIT\r\n";
    let (result, output) = serve(config, CollectingHandler::new(), script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 552, 221]);
}

#[tokio::test]
async fn test_oversized_chunk_is_drained() {
    let config = ServerConfig::builder("mx.test").max_message_bytes(4).build();
    let script = b"EHLO c\r\n\
        MAIL FROM:<a@x>\r\n\
        RCPT TO:<b@y>\r\n\
        BDAT 6 LAST\r\nabcdef\
        NOOP\r\n\
        QUIT\r\n";
    let (result, output) = serve(config, CollectingHandler::new(), script).await;
    let handler = closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 552, 250, 221]);
    assert!(handler.messages.is_empty());
}

#[tokio::test]
async fn test_oversized_line_keeps_session() {
    let config = ServerConfig::builder("mx.test").max_line_length(64).build();
    let mut script = b"EHLO c\r\nNOOP ".to_vec();
    script.extend_from_slice(&[b'x'; 200]);
    script.extend_from_slice(b"\r\nNOOP\r\nQUIT\r\n");
    let (result, output) = serve(config, CollectingHandler::new(), &script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 500, 250, 221]);
    assert!(output.text().contains("500 5.5.2 Line too long\r\n"));
}

#[tokio::test]
async fn test_repeated_oversized_lines_close_session() {
    let config = ServerConfig::builder("mx.test")
        .max_line_length(16)
        .max_line_errors(2)
        .build();
    let long = [b'x'; 40];
    let mut script = Vec::new();
    for _ in 0..2 {
        script.extend_from_slice(&long);
        script.extend_from_slice(b"\r\n");
    }
    script.extend_from_slice(b"NOOP\r\n");
    let (result, output) = serve(config, CollectingHandler::new(), &script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 500, 421]);
}

#[tokio::test]
async fn test_malformed_bdat_closes_session() {
    let script = b"EHLO c\r\nMAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nBDAT ten\r\nNOOP\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;

    assert!(matches!(result, Err(Error::InvalidChunkHeader(_))));
    assert_eq!(output.codes(), vec![220, 250, 250, 250, 501]);
}

#[tokio::test]
async fn test_truncated_body_is_fatal() {
    let script = b"EHLO c\r\nMAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\nno terminator\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;

    assert!(matches!(result, Err(Error::IncompleteBody)));
    assert_eq!(output.codes(), vec![220, 250, 250, 250, 354]);
}

#[tokio::test]
async fn test_idle_client_times_out() {
    let config = ServerConfig::builder("mx.test")
        .read_timeout(Duration::from_millis(50))
        .build();
    let (mut client_end, server_end) = tokio::io::duplex(4096);
    let result = Session::new(server_end, CollectingHandler::new(), Arc::new(config))
        .serve()
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));

    let mut output = String::new();
    client_end.read_to_string(&mut output).await.unwrap();
    assert_eq!(
        output,
        "220 mx.test ESMTP Service Ready\r\n421 4.4.2 mx.test Error: timeout exceeded\r\n"
    );
}

#[tokio::test]
async fn test_rset_clears_transaction() {
    let script = b"EHLO c\r\n\
        MAIL FROM:<a@x>\r\n\
        RSET\r\n\
        RCPT TO:<b@y>\r\n\
        QUIT\r\n";
    let (result, output) = serve(config(), CollectingHandler::new(), script).await;
    let handler = closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 503, 221]);
    assert_eq!(handler.resets, 1);
}

#[tokio::test]
async fn test_starttls_hand_off_and_resume() {
    let config = ServerConfig::builder("mx.test").starttls(true).build();
    let script = b"EHLO c\r\nSTARTTLS\r\nMAIL FROM:<a@x>\r\n";
    let (result, output) = serve(config, CollectingHandler::new(), script).await;

    let Outcome::StartTls(upgrade) = result.unwrap() else {
        panic!("expected STARTTLS hand-off");
    };
    assert_eq!(output.codes(), vec![220, 250, 220]);
    assert!(output.text().contains("250-STARTTLS\r\n"));
    assert!(output.text().contains("220 2.0.0 Ready to start TLS\r\n"));

    let encrypted = MockStream::new(b"EHLO c\r\nQUIT\r\n");
    let after = encrypted.output();
    let session = upgrade
        .resume(move |_plain| async move { Ok::<_, io::Error>(encrypted) })
        .await
        .unwrap();
    closed(session.serve().await);

    // No second greeting, and STARTTLS is not offered again.
    assert_eq!(after.codes(), vec![250, 221]);
    assert!(!after.text().contains("STARTTLS"));
}

#[tokio::test]
async fn test_starttls_not_offered() {
    let (result, output) =
        serve(config(), CollectingHandler::new(), b"EHLO c\r\nSTARTTLS\r\nQUIT\r\n").await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 502, 221]);
}

/// Accepts `user`/`pass` over PLAIN, always asking for a challenge.
struct PlainAuth;

impl MessageHandler for PlainAuth {
    fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        vec![AuthMechanism::Plain]
    }

    fn auth(&mut self, _mechanism: AuthMechanism, response: Option<&[u8]>) -> AuthStep {
        match response {
            None => AuthStep::Challenge(Vec::new()),
            Some(credentials) if credentials == b"\0user\0pass" => AuthStep::Accepted,
            Some(_) => AuthStep::Rejected(Reply::with_status(
                ReplyCode::AUTH_FAILED,
                EnhancedCode::new(5, 7, 8),
                "Authentication credentials invalid",
            )),
        }
    }
}

#[tokio::test]
async fn test_auth_exchange() {
    let config = ServerConfig::builder("mx.test")
        .allow_insecure_auth(true)
        .build();
    let script = b"EHLO c\r\n\
        AUTH PLAIN\r\n\
        AHVzZXIAcGFzcw==\r\n\
        AUTH PLAIN\r\n\
        QUIT\r\n";
    let (result, output) = serve(config, PlainAuth, script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 334, 235, 503, 221]);
    assert!(output.text().contains("250-AUTH PLAIN\r\n"));
}

#[tokio::test]
async fn test_auth_cancelled_and_rejected() {
    let config = ServerConfig::builder("mx.test")
        .allow_insecure_auth(true)
        .build();
    let script = b"EHLO c\r\n\
        AUTH PLAIN\r\n\
        *\r\n\
        AUTH PLAIN AHVzZXIAd3Jvbmc=\r\n\
        QUIT\r\n";
    let (result, output) = serve(config, PlainAuth, script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 334, 501, 535, 221]);
}

#[tokio::test]
async fn test_auth_requires_tls() {
    let script = b"EHLO c\r\nAUTH PLAIN AHVzZXIAcGFzcw==\r\nQUIT\r\n";
    let (result, output) = serve(config(), PlainAuth, script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 538, 221]);
    assert!(!output.text().contains("AUTH PLAIN"));
}

/// Reports the first five body bytes as soon as they arrive.
struct FirstBytes {
    seen: Option<oneshot::Sender<Vec<u8>>>,
    total: usize,
}

impl MessageHandler for FirstBytes {
    async fn data(
        &mut self,
        _envelope: &Envelope,
        body: &mut Body<'_>,
    ) -> Result<Option<String>, Reply> {
        let mut first = [0u8; 5];
        body.read_exact(&mut first)
            .await
            .map_err(|err| local_error(&err))?;
        if let Some(seen) = self.seen.take() {
            let _ = seen.send(first.to_vec());
        }
        let mut rest = Vec::new();
        body.read_to_end(&mut rest)
            .await
            .map_err(|err| local_error(&err))?;
        self.total = first.len() + rest.len();
        Ok(Some("streamed".to_string()))
    }
}

#[tokio::test]
async fn test_handler_reads_body_before_terminator() {
    let (mut client, server) = tokio::io::duplex(4096);
    let (seen, first) = oneshot::channel();
    let handler = FirstBytes {
        seen: Some(seen),
        total: 0,
    };
    let session = tokio::spawn(Session::new(server, handler, Arc::new(config())).serve());

    client
        .write_all(b"EHLO c\r\nMAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\nfirst")
        .await
        .unwrap();
    assert_eq!(first.await.unwrap(), b"first");
    client
        .write_all(b" line\r\nsecond\r\n.\r\nQUIT\r\n")
        .await
        .unwrap();

    let handler = closed(session.await.unwrap());
    assert_eq!(handler.total, 20);
    let mut output = String::new();
    client.read_to_string(&mut output).await.unwrap();
    assert!(output.contains("354 Start mail input"));
    assert!(output.contains("250 2.0.0 OK: queued as streamed\r\n"));
}

/// Refuses every message without looking at it.
struct RefuseUnread;

impl MessageHandler for RefuseUnread {
    async fn data(
        &mut self,
        _envelope: &Envelope,
        _body: &mut Body<'_>,
    ) -> Result<Option<String>, Reply> {
        Err(Reply::with_status(
            ReplyCode::TRANSACTION_FAILED,
            EnhancedCode::new(5, 7, 1),
            "Delivery not authorized",
        ))
    }
}

#[tokio::test]
async fn test_unread_body_is_drained_after_rejection() {
    let script = b"EHLO c\r\n\
        MAIL FROM:<a@x>\r\n\
        RCPT TO:<b@y>\r\n\
        DATA\r\n\
        line one\r\nline two\r\n.\r\n\
        NOOP\r\n\
        QUIT\r\n";
    let (result, output) = serve(config(), RefuseUnread, script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 354, 554, 250, 221]);
    assert!(output.text().contains("554 5.7.1 Delivery not authorized\r\n"));
}

#[tokio::test]
async fn test_oversized_body_overrides_handler_verdict() {
    let config = ServerConfig::builder("mx.test").max_message_bytes(4).build();
    let script = b"EHLO c\r\n\
        MAIL FROM:<a@x>\r\n\
        RCPT TO:<b@y>\r\n\
        DATA\r\n\
        0123456789\r\n.\r\n\
        QUIT\r\n";
    let (result, output) = serve(config, RefuseUnread, script).await;
    closed(result);

    assert_eq!(output.codes(), vec![220, 250, 250, 250, 354, 552, 221]);
}

async fn round_trip(client_config: ClientConfig, body: &'static [u8]) -> (CollectingHandler, Reply) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let server = Session::new(server_end, CollectingHandler::new(), Arc::new(config())).serve();

    let client = async move {
        let mut client = Client::from_stream(client_end, client_config).await?;
        client.ehlo().await?;
        let delivery = client
            .send_mail(
                Address::new("a@x")?,
                &[Address::new("b@y")?, Address::new("c@z")?],
                body,
            )
            .await?;
        client.quit().await?;
        Ok::<_, Error>(delivery)
    };

    let (server, delivery) = tokio::join!(server, client);
    let delivery = delivery.unwrap();
    assert_eq!(delivery.accepted.len(), 2);
    assert!(delivery.rejected.is_empty());
    (closed(server), delivery.reply)
}

#[tokio::test]
async fn test_client_and_server_over_data() {
    let config = ClientConfig::builder("client.test")
        .prefer_chunking(false)
        .build();
    let body = b"Subject: t\r\n\r\n.dot\r\nlast\r\n";
    let (handler, reply) = round_trip(config, body).await;

    assert_eq!(reply.code, ReplyCode::OK);
    assert_eq!(handler.messages.len(), 1);
    assert_eq!(handler.messages[0].body, Bytes::from_static(body));
    assert_eq!(handler.messages[0].envelope.mode, Some(TransferMode::DotStuffed));
    assert_eq!(handler.messages[0].envelope.params.size, Some(body.len() as u64));
}

#[tokio::test]
async fn test_client_and_server_over_bdat() {
    let config = ClientConfig::builder("client.test").chunk_size(8).build();
    let body = b"Subject: t\r\n\r\n.dot\r\nno final newline";
    let (handler, reply) = round_trip(config, body).await;

    assert_eq!(reply.code, ReplyCode::OK);
    assert_eq!(handler.messages.len(), 1);
    assert_eq!(handler.messages[0].body, Bytes::from_static(body));
    assert_eq!(handler.messages[0].envelope.mode, Some(TransferMode::Chunked));
}

#[tokio::test]
async fn test_client_and_server_pipelined_bdat() {
    let config = ClientConfig::builder("client.test")
        .chunk_size(4)
        .pipeline_bdat(true)
        .build();
    let body = b"0123456789abcdef";
    let (handler, reply) = round_trip(config, body).await;

    assert_eq!(reply.code, ReplyCode::OK);
    assert_eq!(handler.messages[0].body, Bytes::from_static(body));
}
