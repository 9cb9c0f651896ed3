//! Dot-stuffed DATA body codec (RFC 5321 §4.5.2).
//!
//! Both directions scan for LF with `memchr` and only look at the bytes
//! around line boundaries, so a body without leading dots costs a memory
//! scan plus a copy.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BufMut, BytesMut};
use memchr::memchr;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf,
};

use crate::error::{Error, Result};

/// The body terminator, a line holding a single dot.
pub const TERMINATOR: &[u8] = b".\r\n";

/// Encoded bytes are handed to the transport once this much is buffered.
const FLUSH_THRESHOLD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// At the first byte of a line.
    LineStart,
    /// Saw a leading dot.
    Dot,
    /// Saw `.` CR at the start of a line.
    DotCr,
    /// Inside a line; `cr` records whether the last byte was CR.
    Data { cr: bool },
    /// Consumed the terminator.
    Done,
}

/// Incremental decoder for a dot-stuffed body.
///
/// Feed it consecutive slices of the raw stream with [`DotDecoder::decode`];
/// slice boundaries may fall anywhere, including inside a CRLF or the
/// terminator.
#[derive(Debug, Clone)]
pub struct DotDecoder {
    state: DecodeState,
}

impl Default for DotDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DotDecoder {
    /// Creates a decoder positioned at the start of the body.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: DecodeState::LineStart,
        }
    }

    /// Returns true once the terminator has been consumed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Decodes as much of `input` as belongs to the body.
    ///
    /// Unstuffed bytes are appended to `out` when it is `Some` and dropped
    /// otherwise. Returns `(consumed, produced)`. `consumed` is short of
    /// `input.len()` only when the terminator ends inside `input`; the rest
    /// belongs to whatever follows the body.
    pub fn decode(&mut self, input: &[u8], mut out: Option<&mut BytesMut>) -> (usize, usize) {
        let mut rest = input;
        let mut produced = 0;

        let mut emit = |bytes: &[u8], out: &mut Option<&mut BytesMut>| {
            if let Some(out) = out.as_deref_mut() {
                out.extend_from_slice(bytes);
            }
            produced += bytes.len();
        };

        while let Some(&first) = rest.first() {
            match self.state {
                DecodeState::Done => break,
                DecodeState::LineStart => {
                    if first == b'.' {
                        rest = &rest[1..];
                        self.state = DecodeState::Dot;
                    } else {
                        self.state = DecodeState::Data { cr: false };
                    }
                }
                DecodeState::Dot => {
                    if first == b'\r' {
                        rest = &rest[1..];
                        self.state = DecodeState::DotCr;
                    } else {
                        // Stuffed dot: drop it, keep the rest of the line.
                        self.state = DecodeState::Data { cr: false };
                    }
                }
                DecodeState::DotCr => {
                    if first == b'\n' {
                        rest = &rest[1..];
                        self.state = DecodeState::Done;
                    } else {
                        emit(b"\r", &mut out);
                        self.state = DecodeState::Data { cr: true };
                    }
                }
                DecodeState::Data { cr } => match memchr(b'\n', rest) {
                    Some(pos) => {
                        let line_end = if pos == 0 { cr } else { rest[pos - 1] == b'\r' };
                        emit(&rest[..=pos], &mut out);
                        rest = &rest[pos + 1..];
                        self.state = if line_end {
                            DecodeState::LineStart
                        } else {
                            DecodeState::Data { cr: false }
                        };
                    }
                    None => {
                        emit(rest, &mut out);
                        self.state = DecodeState::Data {
                            cr: rest.last() == Some(&b'\r'),
                        };
                        rest = &[];
                    }
                },
            }
        }

        (input.len() - rest.len(), produced)
    }
}

/// Reads a dot-stuffed body from a buffered stream.
///
/// Starts right after the `354` reply and stops exactly after the
/// terminator, leaving any pipelined bytes that follow in `reader`.
///
/// Also usable as an [`AsyncRead`] yielding the unstuffed body. A stream
/// that ends before the terminator fails with [`io::ErrorKind::UnexpectedEof`]
/// wrapping [`Error::IncompleteBody`].
#[derive(Debug)]
pub struct DotReader<'a, R: ?Sized> {
    reader: &'a mut R,
    decoder: DotDecoder,
    /// Decoded bytes that did not fit the caller's buffer.
    spill: BytesMut,
}

impl<'a, R> DotReader<'a, R>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    /// Wraps a buffered reader positioned at the start of a body.
    pub fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            decoder: DotDecoder::new(),
            spill: BytesMut::new(),
        }
    }

    /// Returns true once the terminator has been consumed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.decoder.is_done()
    }

    /// Appends the next run of decoded bytes to `out`.
    ///
    /// Returns the number of bytes appended; zero means the body is complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompleteBody`] if the stream ends before the
    /// terminator.
    pub async fn read_into(&mut self, out: &mut BytesMut) -> Result<usize> {
        let spilled = self.take_spill(Some(out));
        if spilled > 0 {
            return Ok(spilled);
        }
        loop {
            if self.decoder.is_done() {
                return Ok(0);
            }
            let produced = self.step(Some(out)).await?;
            if produced > 0 {
                return Ok(produced);
            }
        }
    }

    /// Reads the whole body into `out`.
    ///
    /// With a `limit`, decoding continues past it up to the terminator but
    /// the excess is dropped, and [`Error::BodyTooLarge`] is returned with
    /// `out` cleared. Either way the stream ends up positioned after the
    /// terminator.
    ///
    /// # Errors
    ///
    /// [`Error::IncompleteBody`] or [`Error::BodyTooLarge`] as described.
    pub async fn read_to_end(&mut self, out: &mut BytesMut, limit: Option<u64>) -> Result<u64> {
        let mut total = self.take_spill(Some(out)) as u64;
        let mut overflow = false;

        while !self.decoder.is_done() {
            let sink = if overflow { None } else { Some(&mut *out) };
            total += self.step(sink).await? as u64;

            if !overflow && limit.is_some_and(|limit| total > limit) {
                overflow = true;
                out.clear();
            }
        }

        match limit {
            Some(limit) if overflow => Err(Error::BodyTooLarge(limit)),
            _ => Ok(total),
        }
    }

    /// Consumes the rest of the body without keeping it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompleteBody`] if the stream ends first.
    pub async fn drain(&mut self) -> Result<u64> {
        let mut total = self.take_spill(None) as u64;
        while !self.decoder.is_done() {
            total += self.step(None).await? as u64;
        }
        Ok(total)
    }

    async fn step(&mut self, out: Option<&mut BytesMut>) -> Result<usize> {
        let buf = self.reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::IncompleteBody);
        }
        let (consumed, produced) = self.decoder.decode(buf, out);
        self.reader.consume(consumed);
        Ok(produced)
    }

    fn take_spill(&mut self, out: Option<&mut BytesMut>) -> usize {
        let len = self.spill.len();
        if let Some(out) = out {
            out.extend_from_slice(&self.spill);
        }
        self.spill.clear();
        len
    }
}

impl<R> AsyncRead for DotReader<'_, R>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.spill.is_empty() || buf.remaining() == 0 || this.decoder.is_done() {
                let n = this.spill.len().min(buf.remaining());
                buf.put_slice(&this.spill[..n]);
                this.spill.advance(n);
                return Poll::Ready(Ok(()));
            }

            let input = ready!(Pin::new(&mut *this.reader).poll_fill_buf(cx))?;
            if input.is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    Error::IncompleteBody,
                )));
            }
            // A deferred CR can make the output one byte longer than the input.
            let take = input.len().min(buf.remaining());
            let (consumed, _) = this.decoder.decode(&input[..take], Some(&mut this.spill));
            Pin::new(&mut *this.reader).consume(consumed);
        }
    }
}

/// Incremental dot-stuffing encoder.
///
/// Doubles every dot that starts a line. Bytes are otherwise passed through
/// untouched: bare CR and bare LF are not line boundaries and are not
/// rewritten.
#[derive(Debug, Clone)]
pub struct DotEncoder {
    line_start: bool,
    cr: bool,
}

impl Default for DotEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DotEncoder {
    /// Creates an encoder positioned at the start of the body.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            line_start: true,
            cr: false,
        }
    }

    /// Stuffs `data` into `out`.
    pub fn encode(&mut self, data: &[u8], out: &mut BytesMut) {
        let mut rest = data;
        while let Some(&first) = rest.first() {
            if self.line_start && first == b'.' {
                out.put_u8(b'.');
            }
            if let Some(pos) = memchr(b'\n', rest) {
                let line_end = if pos == 0 { self.cr } else { rest[pos - 1] == b'\r' };
                out.extend_from_slice(&rest[..=pos]);
                rest = &rest[pos + 1..];
                self.line_start = line_end;
                self.cr = false;
            } else {
                out.extend_from_slice(rest);
                self.line_start = false;
                self.cr = rest.last() == Some(&b'\r');
                rest = &[];
            }
        }
    }

    /// Writes the end of the body: a CRLF if the last line is unterminated,
    /// then the terminator.
    pub fn finish(&mut self, out: &mut BytesMut) {
        if !self.line_start {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(TERMINATOR);
        self.line_start = true;
        self.cr = false;
    }
}

/// Writes a dot-stuffed body to a transport.
///
/// Encoded output is coalesced in one buffer and written in large pieces.
#[derive(Debug)]
pub struct DotWriter<W> {
    writer: W,
    encoder: DotEncoder,
    buf: BytesMut,
}

impl<W> DotWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wraps a transport positioned right after a `354` reply.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            encoder: DotEncoder::new(),
            buf: BytesMut::with_capacity(FLUSH_THRESHOLD + 1024),
        }
    }

    /// Stuffs and buffers `data`, writing through once enough is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport write fails.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.encoder.encode(data, &mut self.buf);
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.writer.write_all(&self.buf).await?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Streams the whole of `reader` into the body.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the source or writing the transport fails.
    pub async fn write_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = vec![0u8; FLUSH_THRESHOLD];
        let mut total = 0;
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write(&chunk[..n]).await?;
            total += n as u64;
        }
    }

    /// Terminates the body, flushes the transport and hands it back.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport write fails.
    pub async fn finish(mut self) -> Result<W> {
        self.encoder.finish(&mut self.buf);
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(self.writer)
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
    use proptest::prelude::*;
    use tokio::io::BufReader;

    fn encode(body: &[u8]) -> Vec<u8> {
        let mut encoder = DotEncoder::new();
        let mut out = BytesMut::new();
        encoder.encode(body, &mut out);
        encoder.finish(&mut out);
        out.to_vec()
    }

    /// Decodes `wire` fed in slices of `step` bytes.
    fn decode(wire: &[u8], step: usize) -> (Vec<u8>, usize) {
        let mut decoder = DotDecoder::new();
        let mut out = BytesMut::new();
        let mut consumed = 0;
        for piece in wire.chunks(step.max(1)) {
            let (c, _) = decoder.decode(piece, Some(&mut out));
            consumed += c;
            if decoder.is_done() {
                break;
            }
        }
        assert!(decoder.is_done(), "terminator not found");
        (out.to_vec(), consumed)
    }

    fn canonicalize(body: &[u8]) -> Vec<u8> {
        let mut body = body.to_vec();
        if !body.is_empty() && !body.ends_with(b"\r\n") {
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    mod decoder_tests {
        use super::*;

        #[test]
        fn minimal_message() {
            let (body, consumed) = decode(b"Subject: hi\r\n\r\nhello\r\n.\r\nQUIT\r\n", 64);
            assert_eq!(body, b"Subject: hi\r\n\r\nhello\r\n");
            assert_eq!(consumed, 25);
        }

        #[test]
        fn unstuffs_leading_dots() {
            let (body, _) = decode(b"..hidden\r\n...\r\n.\r\n", 64);
            assert_eq!(body, b".hidden\r\n..\r\n");
        }

        #[test]
        fn empty_body() {
            let (body, consumed) = decode(b".\r\n", 64);
            assert!(body.is_empty());
            assert_eq!(consumed, 3);
        }

        #[test]
        fn bare_lf_dot_is_not_a_terminator() {
            let wire = b"This is a message with an SMTP smuggling dot:\r\n.\nFinal dot comes after.\r\n.\r\n";
            let (body, _) = decode(wire, 64);
            assert_eq!(
                body,
                b"This is a message with an SMTP smuggling dot:\r\n\nFinal dot comes after.\r\n"
            );
        }

        #[test]
        fn lf_dot_crlf_is_not_a_terminator() {
            let wire = b"dot:\n.\r\nFinal.\r\n.\r\n";
            let (body, _) = decode(wire, 64);
            assert_eq!(body, b"dot:\n.\r\nFinal.\r\n");
        }

        #[test]
        fn dot_cr_without_lf_keeps_cr() {
            let (body, _) = decode(b".\rx\r\n.\r\n", 64);
            assert_eq!(body, b"\rx\r\n");
        }

        #[test]
        fn byte_at_a_time_matches_bulk() {
            let wire = b"a\r\n..b\r\n\r\n.c\r\n.\r\n";
            assert_eq!(decode(wire, 1), decode(wire, 1024));
        }

        #[test]
        fn discard_mode_counts_without_copying() {
            let mut decoder = DotDecoder::new();
            let (consumed, produced) = decoder.decode(b"abc\r\n.\r\n", None);
            assert_eq!((consumed, produced), (8, 5));
            assert!(decoder.is_done());
        }
    }

    mod reader_tests {
        use super::*;

        #[tokio::test]
        async fn stops_at_terminator() {
            let mut reader = BufReader::with_capacity(3, &b"one\r\n..two\r\n.\r\nNOOP\r\n"[..]);
            let mut body = BytesMut::new();
            let n = DotReader::new(&mut reader)
                .read_to_end(&mut body, None)
                .await
                .unwrap();
            assert_eq!(&body[..], b"one\r\n.two\r\n");
            assert_eq!(n, 11);

            let mut rest = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
                .await
                .unwrap();
            assert_eq!(rest, b"NOOP\r\n");
        }

        #[tokio::test]
        async fn eof_is_incomplete_body() {
            let mut reader = BufReader::new(&b"half a message\r\n"[..]);
            let mut body = BytesMut::new();
            let err = DotReader::new(&mut reader)
                .read_to_end(&mut body, None)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::IncompleteBody));
        }

        #[tokio::test]
        async fn over_limit_drains_to_terminator() {
            let mut reader = BufReader::new(&b"0123456789\r\n.\r\nQUIT\r\n"[..]);
            let mut body = BytesMut::new();
            let err = DotReader::new(&mut reader)
                .read_to_end(&mut body, Some(4))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::BodyTooLarge(4)));
            assert!(body.is_empty());

            let mut line = Vec::new();
            crate::codec::line::read_line(&mut reader, 100, &mut line)
                .await
                .unwrap();
            assert_eq!(line, b"QUIT");
        }

        #[tokio::test]
        async fn async_read_unstuffs_through_small_buffers() {
            let wire = b"..a\r\n.\rb\r\n.\r\nMAIL";
            let mut input = BufReader::with_capacity(3, &wire[..]);
            let mut body = DotReader::new(&mut input);
            let mut out = Vec::new();
            let mut piece = [0u8; 1];
            loop {
                let n = body.read(&mut piece).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&piece[..n]);
            }
            assert_eq!(out, b".a\r\n\rb\r\n");
            assert!(body.is_done());
            let mut rest = String::new();
            input.read_to_string(&mut rest).await.unwrap();
            assert_eq!(rest, "MAIL");
        }

        #[tokio::test]
        async fn async_read_reports_truncated_body() {
            let mut input = BufReader::new(&b"partial\r\n"[..]);
            let mut body = DotReader::new(&mut input);
            let mut out = Vec::new();
            let err = AsyncReadExt::read_to_end(&mut body, &mut out)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
            assert_eq!(out, b"partial\r\n");
        }

        #[tokio::test]
        async fn read_into_returns_zero_when_done() {
            let mut reader = BufReader::new(&b".x\r\n.\r\n"[..]);
            let mut dot = DotReader::new(&mut reader);
            let mut body = BytesMut::new();
            while dot.read_into(&mut body).await.unwrap() > 0 {}
            assert!(dot.is_done());
            assert_eq!(&body[..], b"x\r\n");
        }
    }

    mod encoder_tests {
        use super::*;

        #[test]
        fn stuffs_line_leading_dots() {
            assert_eq!(encode(b".a\r\nb.\r\n.\r\n"), b"..a\r\nb.\r\n..\r\n.\r\n");
        }

        #[test]
        fn appends_missing_crlf() {
            assert_eq!(encode(b"no newline"), b"no newline\r\n.\r\n");
            assert_eq!(encode(b"cr only\r"), b"cr only\r\r\n.\r\n");
        }

        #[test]
        fn empty_body_is_just_terminator() {
            assert_eq!(encode(b""), b".\r\n");
        }

        #[test]
        fn bare_lf_does_not_start_a_line() {
            assert_eq!(encode(b"a\n.b\r\n"), b"a\n.b\r\n.\r\n");
        }

        #[test]
        fn split_writes_match_single_write() {
            let body = b"x\r\n.y\r\n.";
            let mut encoder = DotEncoder::new();
            let mut out = BytesMut::new();
            for byte in body {
                encoder.encode(std::slice::from_ref(byte), &mut out);
            }
            encoder.finish(&mut out);
            assert_eq!(out.to_vec(), encode(body));
        }

        #[tokio::test]
        async fn writer_streams_from_reader() {
            let mut source = &b".leading\r\nbody"[..];
            let mut writer = DotWriter::new(Vec::new());
            let n = writer.write_from(&mut source).await.unwrap();
            assert_eq!(n, 14);
            let wire = writer.finish().await.unwrap();
            assert_eq!(wire, b"..leading\r\nbody\r\n.\r\n");
        }
    }

    proptest! {
        #[test]
        fn round_trip(body in proptest::collection::vec(
            prop_oneof![Just(b'.'), Just(b'\r'), Just(b'\n'), any::<u8>()], 0..256),
            step in 1usize..16,
        ) {
            let wire = encode(&body);
            let (decoded, consumed) = decode(&wire, step);
            prop_assert_eq!(decoded, canonicalize(&body));
            prop_assert_eq!(consumed, wire.len());
        }

        #[test]
        fn terminator_only_at_end(body in proptest::collection::vec(
            prop_oneof![Just(b'.'), Just(b'\r'), Just(b'\n'), Just(b'a')], 0..128),
        ) {
            let wire = encode(&body);
            prop_assert!(wire.ends_with(TERMINATOR));
            let inner = &wire[..wire.len() - TERMINATOR.len()];
            prop_assert!(!inner.starts_with(TERMINATOR));
            let windows = inner.windows(5).filter(|w| *w == b"\r\n.\r\n").count();
            prop_assert_eq!(windows, 0);
        }
    }
}
