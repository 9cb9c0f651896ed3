//! Framed I/O for the SMTP protocol.
//!
//! SMTP commands and replies are CRLF-terminated lines; message bodies
//! follow either as a dot-stuffed stream or as counted BDAT chunks. This
//! module owns the read buffer shared by all three, and batches outgoing
//! lines so that pipelined commands or replies leave in one write.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Sleep;

use crate::codec::bdat::{BdatReader, ChunkHeader};
use crate::codec::dot::DotReader;
use crate::codec::line::{DEFAULT_MAX_LINE_LENGTH, read_line};
use crate::error::{Error, Result};
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::Reply;

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Upper bound on the number of lines in one reply.
const MAX_REPLY_LINES: usize = 512;

/// Framed connection for SMTP.
///
/// Reads go through one [`BufReader`], so bytes a peer pipelined behind a
/// command stay available to whichever decoder runs next. Writes are queued
/// in `write_buffer` until [`flush`](Self::flush).
#[derive(Debug)]
pub struct FramedStream<S> {
    reader: BufReader<S>,
    write_buffer: BytesMut,
    line: Vec<u8>,
    max_line_length: usize,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    /// Armed while a direct write is blocked on the transport.
    write_stall: Option<Pin<Box<Sleep>>>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new framed stream without deadlines.
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            write_buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            line: Vec::new(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            read_timeout: None,
            write_timeout: None,
            write_stall: None,
        }
    }

    /// Sets the maximum accepted line length.
    #[must_use]
    pub const fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Sets the read and write deadlines.
    #[must_use]
    pub const fn with_timeouts(mut self, read: Option<Duration>, write: Option<Duration>) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Replaces the read deadline.
    pub const fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Returns the write deadline.
    #[must_use]
    pub const fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Returns the maximum accepted line length.
    #[must_use]
    pub const fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    /// Reads one line, without its terminator.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; command parsing
    /// decides what to make of it.
    pub async fn read_line(&mut self) -> Result<String> {
        deadline(
            self.read_timeout,
            read_line(&mut self.reader, self.max_line_length, &mut self.line),
        )
        .await?;
        Ok(String::from_utf8_lossy(&self.line).into_owned())
    }

    /// Reads a complete, possibly multi-line, reply.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                continue;
            }
            let last = is_last_reply_line(&line);
            lines.push(line);
            if last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(Error::Protocol("Reply has too many lines".into()));
            }
        }

        let reply = parse_reply(&lines)?;
        tracing::trace!(code = %reply.code, "reply received");
        Ok(reply)
    }

    /// Reads a dot-stuffed body through its terminator, appending the
    /// unstuffed bytes to `out`. Returns the number of body bytes.
    ///
    /// `timeout` bounds the whole body rather than each read.
    pub async fn read_dot_body(
        &mut self,
        out: &mut BytesMut,
        limit: Option<u64>,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        let mut body = DotReader::new(&mut self.reader);
        deadline(timeout, body.read_to_end(out, limit)).await
    }

    /// Reads one BDAT chunk payload into `out`.
    pub async fn read_chunk(
        &mut self,
        chunks: &mut BdatReader,
        header: ChunkHeader,
        out: &mut BytesMut,
        timeout: Option<Duration>,
    ) -> Result<()> {
        deadline(timeout, chunks.read_chunk(&mut self.reader, header, out)).await
    }

    /// Consumes and drops one BDAT chunk payload.
    pub async fn discard_chunk(
        &mut self,
        header: ChunkHeader,
        timeout: Option<Duration>,
    ) -> Result<()> {
        deadline(timeout, BdatReader::discard(&mut self.reader, header)).await
    }

    /// Returns true if the peer has sent bytes not consumed yet.
    #[must_use]
    pub fn has_buffered_input(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Number of bytes read ahead and not consumed yet.
    #[must_use]
    pub fn buffered_input_len(&self) -> usize {
        self.reader.buffer().len()
    }

    /// Queues raw bytes for the next flush.
    pub fn queue(&mut self, data: &[u8]) {
        self.write_buffer.extend_from_slice(data);
    }

    /// Queues a formatted reply for the next flush.
    pub fn queue_reply(&mut self, reply: &Reply) {
        reply.encode(&mut self.write_buffer);
    }

    /// Returns true if output is waiting for a flush.
    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Writes all queued output and flushes the transport.
    pub async fn flush(&mut self) -> Result<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let stream = self.reader.get_mut();
        let pending = &self.write_buffer;
        deadline(self.write_timeout, async {
            stream.write_all(pending).await?;
            stream.flush().await?;
            Ok(())
        })
        .await?;
        self.write_buffer.clear();
        Ok(())
    }

    /// Queues `data` and flushes everything.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.queue(data);
        self.flush().await
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    /// Gets a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    /// The buffered read side, for decoders that outlive one call.
    pub(crate) const fn buffered_reader(&mut self) -> &mut BufReader<S> {
        &mut self.reader
    }

    /// Consumes the framed stream and returns the inner stream.
    ///
    /// Read-ahead bytes are dropped. That is what a STARTTLS upgrade needs:
    /// nothing sent in the clear may be processed after the handshake.
    pub fn into_inner(self) -> S {
        if self.has_buffered_input() {
            tracing::warn!(
                bytes = self.buffered_input_len(),
                "discarding input buffered before TLS upgrade"
            );
        }
        self.reader.into_inner()
    }
}

impl<S> FramedStream<S> {
    /// Passes `poll` through, failing it with `TimedOut` once the transport
    /// has refused to make progress for the whole write deadline.
    fn watch_stall<T>(
        &mut self,
        cx: &mut Context<'_>,
        poll: Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if poll.is_ready() {
            self.write_stall = None;
            return poll;
        }
        let Some(limit) = self.write_timeout else {
            return Poll::Pending;
        };
        let stall = self
            .write_stall
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
        match stall.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.write_stall = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("write stalled for {limit:?}"),
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Body writers ([`DotWriter`](crate::codec::DotWriter),
/// [`BdatWriter`](crate::codec::BdatWriter)) write straight to the
/// transport. Queued lines must be flushed before one is attached.
///
/// The write deadline bounds each stall: a write or flush that makes no
/// progress for that long fails with [`io::ErrorKind::TimedOut`].
impl<S> AsyncWrite for FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(this.reader.get_mut()).poll_write(cx, buf);
        this.watch_stall(cx, poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(this.reader.get_mut()).poll_flush(cx);
        this.watch_stall(cx, poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(self.get_mut().reader.get_mut()).poll_shutdown(cx)
    }
}

/// Reports a body write that hit the write deadline as [`Error::Timeout`].
pub(crate) fn stalled_write(err: Error, limit: Option<Duration>) -> Error {
    match (err, limit) {
        (Error::Io(err), Some(limit)) if err.kind() == io::ErrorKind::TimedOut => {
            Error::Timeout(limit)
        }
        (err, _) => err,
    }
}

/// Runs `fut` under an optional deadline.
async fn deadline<T>(limit: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => fut.await,
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
    use crate::types::{EnhancedCode, ReplyCode};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn read_multiline_reply() {
        let mock = Builder::new()
            .read(b"250-mx.example.org\r\n250-PIPELINING\r\n")
            .read(b"250 CHUNKING\r\n")
            .build();
        let mut framed = FramedStream::new(mock);
        let reply = framed.read_reply().await.unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.message, vec!["mx.example.org", "PIPELINING", "CHUNKING"]);
    }

    #[tokio::test]
    async fn pipelined_replies_stay_buffered() {
        let mock = Builder::new()
            .read(b"250 2.1.0 ok\r\n250 2.1.5 ok\r\n354 go\r\n")
            .build();
        let mut framed = FramedStream::new(mock);
        framed.read_reply().await.unwrap();
        assert!(framed.has_buffered_input());
        let second = framed.read_reply().await.unwrap();
        assert_eq!(second.status, Some(EnhancedCode::new(2, 1, 5)));
        let third = framed.read_reply().await.unwrap();
        assert!(third.is_intermediate());
        assert!(!framed.has_buffered_input());
    }

    #[tokio::test]
    async fn queued_output_leaves_in_one_write() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\n")
            .build();
        let mut framed = FramedStream::new(mock);
        framed.queue(b"MAIL FROM:<a@x>\r\n");
        framed.queue(b"RCPT TO:<b@y>\r\n");
        assert!(framed.has_pending_output());
        framed.flush().await.unwrap();
        assert!(!framed.has_pending_output());
    }

    #[tokio::test]
    async fn body_and_next_command_share_the_buffer() {
        let mock = Builder::new()
            .read(b"Hi\r\n..dot\r\n.\r\nQUIT\r\n")
            .build();
        let mut framed = FramedStream::new(mock);
        let mut body = BytesMut::new();
        let n = framed.read_dot_body(&mut body, None, None).await.unwrap();
        assert_eq!(&body[..], b"Hi\r\n.dot\r\n");
        assert_eq!(n, 10);
        assert_eq!(framed.read_line().await.unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn chunk_then_command() {
        let mock = Builder::new().read(b"abcdeNOOP\r\n").build();
        let mut framed = FramedStream::new(mock);
        let mut chunks = BdatReader::default();
        let mut body = BytesMut::new();
        framed
            .read_chunk(&mut chunks, ChunkHeader::new(5, true), &mut body, None)
            .await
            .unwrap();
        assert_eq!(&body[..], b"abcde");
        assert_eq!(framed.read_line().await.unwrap(), "NOOP");
    }

    #[tokio::test]
    async fn read_times_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut framed =
            FramedStream::new(client).with_timeouts(Some(Duration::from_millis(20)), None);
        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn direct_write_fails_when_peer_stops_reading() {
        let (client, _server) = tokio::io::duplex(64);
        let limit = Duration::from_millis(30);
        let mut framed = FramedStream::new(client).with_timeouts(None, Some(limit));
        let err = framed.write_all(&[b'x'; 4096]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(matches!(
            stalled_write(Error::Io(err), framed.write_timeout()),
            Error::Timeout(d) if d == limit
        ));
    }

    #[tokio::test]
    async fn direct_write_completes_while_peer_reads() {
        use tokio::io::AsyncReadExt;

        let (client, mut server) = tokio::io::duplex(64);
        let mut framed =
            FramedStream::new(client).with_timeouts(None, Some(Duration::from_secs(5)));
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received.len()
        });
        framed.write_all(&[b'x'; 4096]).await.unwrap();
        framed.shutdown().await.unwrap();
        drop(framed);
        assert_eq!(reader.await.unwrap(), 4096);
    }

    #[tokio::test]
    async fn overlong_line_respects_configured_limit() {
        let mock = Builder::new().read(b"0123456789\r\nok\r\n").build();
        let mut framed = FramedStream::new(mock).with_max_line_length(4);
        assert!(matches!(
            framed.read_line().await,
            Err(Error::LineTooLong(4))
        ));
        assert_eq!(framed.read_line().await.unwrap(), "ok");
    }
}
