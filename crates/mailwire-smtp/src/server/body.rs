//! Message body as seen by a [`MessageHandler`](super::MessageHandler).
//!
//! A DATA body is decoded straight off the connection while the handler
//! reads it, so nothing forces the whole message into memory. A BDAT body
//! has already been assembled from its chunks by the time the `LAST` chunk
//! arrives and is served from memory.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep, sleep_until, timeout_at};

use crate::codec::dot::DotReader;
use crate::error::{Error, Result};

type Transport<'a> = dyn AsyncBufRead + Unpin + Send + 'a;

enum Source<'a> {
    DotStuffed(DotReader<'a, Transport<'a>>),
    Chunked(Bytes),
}

/// Decoded message body.
///
/// Implements [`AsyncRead`]; end of stream is the end of the message. A read
/// that fails on the size cap or the body deadline is final: the session
/// turns it into its reply whatever the handler returns. Whatever the
/// handler leaves unread is consumed by the session afterwards.
pub struct Body<'a> {
    source: Source<'a>,
    limit: Option<u64>,
    read: u64,
    deadline: Option<(Duration, Instant)>,
    sleep: Option<Pin<Box<Sleep>>>,
    failure: Option<Error>,
}

impl<'a> Body<'a> {
    /// A body held in memory.
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            source: Source::Chunked(bytes),
            limit: None,
            read: 0,
            deadline: None,
            sleep: None,
            failure: None,
        }
    }

    /// A dot-stuffed body read from `reader`, which must sit right after the
    /// `354` reply.
    pub(crate) fn dot_stuffed(
        reader: &'a mut Transport<'a>,
        limit: Option<u64>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            source: Source::DotStuffed(DotReader::new(reader)),
            limit,
            read: 0,
            deadline: timeout.map(|timeout| (timeout, Instant::now() + timeout)),
            sleep: None,
            failure: None,
        }
    }

    /// Decoded bytes handed out so far.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Consumes what the handler left unread and returns the body size.
    ///
    /// # Errors
    ///
    /// - [`Error::BodyTooLarge`] once the whole body was drained
    /// - [`Error::Timeout`] or [`Error::IncompleteBody`] and transport errors,
    ///   after which the stream is not positioned at a command
    pub(crate) async fn finish(self) -> Result<u64> {
        let Self {
            source,
            limit,
            mut read,
            deadline,
            failure,
            ..
        } = self;
        if let Some(err) = failure.filter(|err| !matches!(err, Error::BodyTooLarge(_))) {
            return Err(err);
        }

        match source {
            Source::DotStuffed(mut reader) => {
                read += match deadline {
                    Some((timeout, at)) => timeout_at(at, reader.drain())
                        .await
                        .map_err(|_| Error::Timeout(timeout))??,
                    None => reader.drain().await?,
                };
            }
            Source::Chunked(rest) => read += rest.len() as u64,
        }

        match limit {
            Some(limit) if read > limit => Err(Error::BodyTooLarge(limit)),
            _ => Ok(read),
        }
    }

    fn fail(&mut self, err: Error) -> io::Error {
        let failure = io_error(&err);
        self.failure = Some(err);
        failure
    }

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some((timeout, at)) = self.deadline else {
            return Poll::Pending;
        };
        let sleep = self.sleep.get_or_insert_with(|| Box::pin(sleep_until(at)));
        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(self.fail(Error::Timeout(timeout)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRead for Body<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = &this.failure {
            return Poll::Ready(Err(io_error(err)));
        }

        let before = buf.filled().len();
        let polled = match &mut this.source {
            Source::DotStuffed(reader) => Pin::new(reader).poll_read(cx, buf),
            Source::Chunked(bytes) => {
                let n = bytes.len().min(buf.remaining());
                buf.put_slice(&bytes[..n]);
                bytes.advance(n);
                Poll::Ready(Ok(()))
            }
        };

        match polled {
            Poll::Pending => this.poll_deadline(cx),
            Poll::Ready(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Poll::Ready(Err(this.fail(Error::IncompleteBody)))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(this.fail(Error::Io(err)))),
            Poll::Ready(Ok(())) => {
                this.read += (buf.filled().len() - before) as u64;
                match this.limit {
                    Some(limit) if this.read > limit => {
                        buf.set_filled(before);
                        Poll::Ready(Err(this.fail(Error::BodyTooLarge(limit))))
                    }
                    _ => Poll::Ready(Ok(())),
                }
            }
        }
    }
}

impl fmt::Debug for Body<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            Source::DotStuffed(_) => "dot-stuffed",
            Source::Chunked(_) => "chunked",
        };
        f.debug_struct("Body")
            .field("source", &source)
            .field("limit", &self.limit)
            .field("read", &self.read)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

fn io_error(err: &Error) -> io::Error {
    let kind = match err {
        Error::Timeout(_) => io::ErrorKind::TimedOut,
        Error::IncompleteBody => io::ErrorKind::UnexpectedEof,
        Error::Io(err) => err.kind(),
        _ => io::ErrorKind::InvalidData,
    };
    io::Error::new(kind, err.to_string())
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
    use tokio::io::{AsyncReadExt, BufReader, duplex};

    #[tokio::test]
    async fn streams_decoded_body_and_leaves_next_command() {
        let mut input = BufReader::with_capacity(4, &b"Subject: x\r\n\r\n..dot\r\n.\r\nQUIT\r\n"[..]);
        let mut body = Body::dot_stuffed(&mut input, Some(64), None);
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"Subject: x\r\n\r\n.dot\r\n");
        assert_eq!(body.finish().await.unwrap(), 20);

        let mut rest = String::new();
        input.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "QUIT\r\n");
    }

    #[tokio::test]
    async fn unread_remainder_is_drained_by_finish() {
        let mut input = BufReader::new(&b"abcdef\r\n.\r\nNOOP\r\n"[..]);
        let mut body = Body::dot_stuffed(&mut input, None, None);
        let mut head = [0u8; 2];
        body.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"ab");
        assert_eq!(body.finish().await.unwrap(), 8);

        let mut rest = String::new();
        input.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NOOP\r\n");
    }

    #[tokio::test]
    async fn over_limit_fails_reads_and_finish() {
        let mut input = BufReader::new(&b"0123456789\r\n.\r\nRSET\r\n"[..]);
        let mut body = Body::dot_stuffed(&mut input, Some(4), None);
        let mut out = Vec::new();
        let err = body.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(body.read(&mut [0u8; 8]).await.is_err());
        assert!(matches!(body.finish().await, Err(Error::BodyTooLarge(4))));

        let mut rest = String::new();
        input.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "RSET\r\n");
    }

    #[tokio::test]
    async fn unread_oversized_body_is_still_refused() {
        let mut input = BufReader::new(&b"0123456789\r\n.\r\n"[..]);
        let body = Body::dot_stuffed(&mut input, Some(4), None);
        assert!(matches!(body.finish().await, Err(Error::BodyTooLarge(4))));
    }

    #[tokio::test]
    async fn truncated_body_is_incomplete() {
        let mut input = BufReader::new(&b"half\r\n"[..]);
        let mut body = Body::dot_stuffed(&mut input, None, None);
        let mut out = Vec::new();
        let err = body.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(matches!(body.finish().await, Err(Error::IncompleteBody)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_client_hits_body_deadline() {
        let (_client, server) = duplex(64);
        let mut input = BufReader::new(server);
        let mut body = Body::dot_stuffed(&mut input, None, Some(Duration::from_secs(30)));
        let mut out = Vec::new();
        let err = body.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(matches!(body.finish().await, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn in_memory_body() {
        let mut body = Body::from_bytes(Bytes::from_static(b"hello"));
        let mut first = [0u8; 3];
        body.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"hel");
        assert_eq!(body.bytes_read(), 3);
        assert_eq!(body.finish().await.unwrap(), 5);
    }
}
