//! BDAT chunk codec (RFC 3030 CHUNKING).
//!
//! A chunk is a `BDAT <size> [LAST]` line followed by exactly `size` raw
//! bytes. No escaping, no terminator scan: the cost is the copy.

use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::line::copy_span;
use crate::error::{Error, Result};

/// Default chunk size for outgoing bodies.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Parsed `BDAT` command arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Number of payload bytes following the command line.
    pub size: u64,
    /// Whether this chunk ends the message.
    pub last: bool,
}

impl ChunkHeader {
    /// Creates a header.
    #[must_use]
    pub const fn new(size: u64, last: bool) -> Self {
        Self { size, last }
    }

    /// Parses the arguments of a BDAT command: `<size> [LAST]`.
    ///
    /// The size is plain decimal digits. `LAST` is case-insensitive. A zero
    /// size without `LAST` is accepted; it simply adds nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChunkHeader`] for a missing, malformed or
    /// overflowing size, an unknown second argument, or extra arguments.
    pub fn parse(args: &str) -> Result<Self> {
        let mut parts = args.split_ascii_whitespace();
        let size = parts
            .next()
            .ok_or_else(|| Error::InvalidChunkHeader("Missing chunk size argument".into()))?;
        let last = match parts.next() {
            None => false,
            Some(arg) if arg.eq_ignore_ascii_case("LAST") => true,
            Some(arg) => {
                return Err(Error::InvalidChunkHeader(format!(
                    "Unknown BDAT argument: {arg}"
                )));
            }
        };
        if parts.next().is_some() {
            return Err(Error::InvalidChunkHeader("Too many arguments".into()));
        }

        if !size.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidChunkHeader(format!(
                "Malformed size argument: {size}"
            )));
        }
        let size = size
            .parse()
            .map_err(|_| Error::InvalidChunkHeader(format!("Malformed size argument: {size}")))?;

        Ok(Self { size, last })
    }

    /// Appends the command line, CRLF included.
    pub fn encode(&self, out: &mut BytesMut) {
        out.extend_from_slice(self.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

impl fmt::Display for ChunkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BDAT {}", self.size)?;
        if self.last {
            f.write_str(" LAST")?;
        }
        Ok(())
    }
}

/// Size caps applied while receiving chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Largest single chunk accepted.
    pub max_chunk: Option<u64>,
    /// Largest accumulated message accepted.
    pub max_message: Option<u64>,
}

/// Receiving side of one chunked message.
///
/// Accumulates chunk payloads for a single transaction and enforces the
/// size caps. Every rejection happens after the declared bytes have been
/// consumed, so the caller can answer and go on reading commands.
#[derive(Debug, Clone, Default)]
pub struct BdatReader {
    limits: ChunkLimits,
    received: u64,
    chunks: u32,
    sealed: bool,
}

impl BdatReader {
    /// Creates a reader for a new message.
    #[must_use]
    pub const fn new(limits: ChunkLimits) -> Self {
        Self {
            limits,
            received: 0,
            chunks: 0,
            sealed: false,
        }
    }

    /// Total payload bytes accepted so far.
    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }

    /// Number of chunks accepted so far.
    #[must_use]
    pub const fn chunks(&self) -> u32 {
        self.chunks
    }

    /// Returns true once a `LAST` chunk has been accepted.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Reads the payload announced by `header`, appending it to `out`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the message was already sealed
    /// - [`Error::ChunkTooLarge`] / [`Error::MessageTooLarge`] over a cap
    /// - [`Error::IncompleteChunk`] if the stream ends early (fatal)
    ///
    /// All but the last leave the stream positioned after the payload.
    pub async fn read_chunk<R>(
        &mut self,
        reader: &mut R,
        header: ChunkHeader,
        out: &mut BytesMut,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        if self.sealed {
            Self::discard(reader, header).await?;
            return Err(Error::InvalidState("BDAT after LAST chunk".into()));
        }
        if let Some(limit) = self.limits.max_chunk.filter(|&limit| header.size > limit) {
            Self::discard(reader, header).await?;
            return Err(Error::ChunkTooLarge {
                size: header.size,
                limit,
            });
        }
        let total = self.received.saturating_add(header.size);
        if let Some(limit) = self.limits.max_message.filter(|&limit| total > limit) {
            Self::discard(reader, header).await?;
            return Err(Error::MessageTooLarge(limit));
        }

        copy_span(reader, header.size, Some(out)).await?;
        self.received = total;
        self.chunks += 1;
        self.sealed = header.last;
        Ok(())
    }

    /// Consumes and drops the payload announced by `header`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompleteChunk`] if the stream ends early.
    pub async fn discard<R>(reader: &mut R, header: ChunkHeader) -> Result<()>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        copy_span(reader, header.size, None).await
    }
}

/// Result of one [`BdatWriter`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes taken from the caller's input.
    pub consumed: usize,
    /// Whether a complete chunk went out during this step.
    pub chunk_sent: bool,
}

/// Splits an outgoing body into BDAT chunks.
///
/// Each step sends at most one chunk, so the caller can collect that
/// chunk's reply before the next one when BDAT is not pipelined. Input that
/// already spans a full chunk is written straight through without copying.
///
/// Without a size hint the final chunk is only known at [`finish`], which
/// sends whatever is pending as `BDAT <n> LAST` (possibly `BDAT 0 LAST`).
/// With a hint, the chunk that completes the body carries `LAST` itself.
///
/// [`finish`]: BdatWriter::finish
#[derive(Debug)]
pub struct BdatWriter<W> {
    writer: W,
    chunk_size: usize,
    pending: BytesMut,
    size_hint: Option<u64>,
    sent: u64,
    chunks: u32,
    sealed: bool,
}

impl<W> BdatWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Creates a writer emitting chunks of at most `chunk_size` bytes.
    pub fn new(writer: W, chunk_size: usize) -> Self {
        Self {
            writer,
            chunk_size: chunk_size.max(1),
            pending: BytesMut::new(),
            size_hint: None,
            sent: 0,
            chunks: 0,
            sealed: false,
        }
    }

    /// Declares the exact body length up front.
    #[must_use]
    pub const fn with_size_hint(mut self, total: u64) -> Self {
        self.size_hint = Some(total);
        self
    }

    /// Number of chunks written so far.
    #[must_use]
    pub const fn chunks_sent(&self) -> u32 {
        self.chunks
    }

    /// Payload bytes written so far.
    #[must_use]
    pub const fn bytes_sent(&self) -> u64 {
        self.sent
    }

    /// Returns true once the `LAST` chunk is out.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns the underlying transport.
    pub const fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Takes bytes from `data` until one chunk has been sent or `data` is
    /// exhausted.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] after `LAST`, or beyond the size hint
    /// - transport errors
    pub async fn write(&mut self, data: &[u8]) -> Result<Progress> {
        self.check_room(data.len())?;

        if self.pending.is_empty() && data.len() >= self.chunk_size {
            let chunk = &data[..self.chunk_size];
            let last = self.completes_body(chunk.len());
            self.send(chunk, last).await?;
            return Ok(Progress {
                consumed: chunk.len(),
                chunk_sent: true,
            });
        }

        let take = (self.chunk_size - self.pending.len()).min(data.len());
        self.pending.extend_from_slice(&data[..take]);
        let chunk_sent = self.send_pending_if_full().await?;
        Ok(Progress {
            consumed: take,
            chunk_sent,
        })
    }

    /// Reads from `reader` straight into the chunk buffer until one chunk
    /// has been sent or the source is exhausted.
    ///
    /// `consumed == 0` without a chunk sent means end of input. With a size
    /// hint, no more than the declared total is taken from `reader`; once the
    /// writer is sealed any remaining source bytes are left unread.
    ///
    /// # Errors
    ///
    /// Same as [`BdatWriter::write`], plus source read errors.
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> Result<Progress>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.check_room(0)?;
        let mut room = self.chunk_size - self.pending.len();
        if let Some(hint) = self.size_hint {
            let left = hint - self.sent - self.pending.len() as u64;
            room = room.min(usize::try_from(left).unwrap_or(usize::MAX));
        }
        self.pending.reserve(room);
        let consumed = (&mut *reader)
            .take(room as u64)
            .read_buf(&mut self.pending)
            .await?;
        let chunk_sent = self.send_pending_if_full().await?;
        Ok(Progress {
            consumed,
            chunk_sent,
        })
    }

    /// Sends the final chunk and flushes, handing the transport back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if a size hint was given and the body
    /// came up short, or a transport error.
    pub async fn finish(mut self) -> Result<W> {
        self.seal().await?;
        self.writer.flush().await?;
        Ok(self.writer)
    }

    /// Sends the `LAST` chunk unless it already went out.
    ///
    /// # Errors
    ///
    /// Same as [`BdatWriter::finish`].
    pub async fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        let total = self.sent + self.pending.len() as u64;
        if let Some(hint) = self.size_hint.filter(|&hint| hint != total) {
            return Err(Error::InvalidState(format!(
                "body of {total} bytes does not match declared size {hint}"
            )));
        }
        let chunk = std::mem::take(&mut self.pending);
        self.send(&chunk, true).await
    }

    fn check_room(&self, incoming: usize) -> Result<()> {
        if self.sealed {
            return Err(Error::InvalidState("BDAT body already sealed".into()));
        }
        let total = self.sent + self.pending.len() as u64 + incoming as u64;
        match self.size_hint {
            Some(hint) if total > hint => Err(Error::InvalidState(format!(
                "body exceeds declared size of {hint} bytes"
            ))),
            _ => Ok(()),
        }
    }

    fn completes_body(&self, len: usize) -> bool {
        self.size_hint == Some(self.sent + len as u64)
    }

    async fn send_pending_if_full(&mut self) -> Result<bool> {
        let full = self.pending.len() == self.chunk_size;
        if full || (!self.pending.is_empty() && self.completes_body(self.pending.len())) {
            let mut chunk = std::mem::take(&mut self.pending);
            let last = self.completes_body(chunk.len());
            self.send(&chunk, last).await?;
            chunk.clear();
            self.pending = chunk;
            return Ok(true);
        }
        Ok(false)
    }

    async fn send(&mut self, chunk: &[u8], last: bool) -> Result<()> {
        let mut header = BytesMut::with_capacity(32);
        ChunkHeader::new(chunk.len() as u64, last).encode(&mut header);
        self.writer.write_all(&header).await?;
        if !chunk.is_empty() {
            self.writer.write_all(chunk).await?;
        }
        self.writer.flush().await?;

        self.sent += chunk.len() as u64;
        self.chunks += 1;
        self.sealed = last;
        tracing::trace!(size = chunk.len(), last, "BDAT chunk written");
        Ok(())
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

    /// Splits writer output back into `(header, payload)` frames.
    fn frames(mut wire: &[u8]) -> Vec<(ChunkHeader, Vec<u8>)> {
        let mut out = Vec::new();
        while !wire.is_empty() {
            let eol = wire.windows(2).position(|w| w == b"\r\n").unwrap();
            let line = std::str::from_utf8(&wire[..eol]).unwrap();
            let header = ChunkHeader::parse(line.strip_prefix("BDAT ").unwrap()).unwrap();
            let start = eol + 2;
            let end = start + usize::try_from(header.size).unwrap();
            out.push((header, wire[start..end].to_vec()));
            wire = &wire[end..];
        }
        out
    }

    async fn write_body(body: &[u8], chunk_size: usize, hint: bool) -> Vec<u8> {
        let mut writer = BdatWriter::new(Vec::new(), chunk_size);
        if hint {
            writer = writer.with_size_hint(body.len() as u64);
        }
        let mut rest = body;
        while !rest.is_empty() {
            let progress = writer.write(rest).await.unwrap();
            rest = &rest[progress.consumed..];
        }
        writer.finish().await.unwrap()
    }

    mod header_tests {
        use super::*;

        #[test]
        fn parse_forms() {
            assert_eq!(ChunkHeader::parse("5").unwrap(), ChunkHeader::new(5, false));
            assert_eq!(ChunkHeader::parse("0 LAST").unwrap(), ChunkHeader::new(0, true));
            assert_eq!(ChunkHeader::parse("12 last").unwrap(), ChunkHeader::new(12, true));
            assert_eq!(ChunkHeader::parse("0").unwrap(), ChunkHeader::new(0, false));
        }

        #[test]
        fn parse_errors() {
            for bad in ["", "LAST", "-1", "+5", "1e3", "5 FIRST", "5 LAST extra", "99999999999999999999"] {
                assert!(
                    matches!(ChunkHeader::parse(bad), Err(Error::InvalidChunkHeader(_))),
                    "accepted {bad:?}"
                );
            }
        }

        #[test]
        fn encode() {
            let mut out = BytesMut::new();
            ChunkHeader::new(1024, false).encode(&mut out);
            ChunkHeader::new(0, true).encode(&mut out);
            assert_eq!(&out[..], b"BDAT 1024\r\nBDAT 0 LAST\r\n");
        }
    }

    mod reader_tests {
        use super::*;

        #[tokio::test]
        async fn accumulates_and_seals() {
            let mut input = BufReader::new(&b"helloworld"[..]);
            let mut reader = BdatReader::default();
            let mut body = BytesMut::new();
            reader
                .read_chunk(&mut input, ChunkHeader::new(5, false), &mut body)
                .await
                .unwrap();
            reader
                .read_chunk(&mut input, ChunkHeader::new(0, false), &mut body)
                .await
                .unwrap();
            assert!(!reader.is_sealed());
            reader
                .read_chunk(&mut input, ChunkHeader::new(5, true), &mut body)
                .await
                .unwrap();
            assert!(reader.is_sealed());
            assert_eq!(&body[..], b"helloworld");
            assert_eq!(reader.received(), 10);
            assert_eq!(reader.chunks(), 3);
        }

        #[tokio::test]
        async fn oversized_chunk_is_drained() {
            let mut input = BufReader::new(&b"0123456789NOOP\r\n"[..]);
            let mut reader = BdatReader::new(ChunkLimits {
                max_chunk: Some(4),
                max_message: None,
            });
            let mut body = BytesMut::new();
            let err = reader
                .read_chunk(&mut input, ChunkHeader::new(10, false), &mut body)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::ChunkTooLarge { size: 10, limit: 4 }));
            assert!(body.is_empty());

            let mut line = Vec::new();
            crate::codec::line::read_line(&mut input, 100, &mut line)
                .await
                .unwrap();
            assert_eq!(line, b"NOOP");
        }

        #[tokio::test]
        async fn message_cap_counts_all_chunks() {
            let mut input = BufReader::new(&b"abcdef"[..]);
            let mut reader = BdatReader::new(ChunkLimits {
                max_chunk: None,
                max_message: Some(5),
            });
            let mut body = BytesMut::new();
            reader
                .read_chunk(&mut input, ChunkHeader::new(3, false), &mut body)
                .await
                .unwrap();
            let err = reader
                .read_chunk(&mut input, ChunkHeader::new(3, true), &mut body)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::MessageTooLarge(5)));
            assert_eq!(reader.received(), 3);
        }

        #[tokio::test]
        async fn short_stream_is_incomplete_chunk() {
            let mut input = BufReader::new(&b"abc"[..]);
            let mut body = BytesMut::new();
            let err = BdatReader::default()
                .read_chunk(&mut input, ChunkHeader::new(8, true), &mut body)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::IncompleteChunk { missing: 5 }));
            assert!(err.is_fatal());
        }

        #[tokio::test]
        async fn chunk_after_last_is_drained_and_refused() {
            let mut input = BufReader::new(&b"abXY"[..]);
            let mut reader = BdatReader::default();
            let mut body = BytesMut::new();
            reader
                .read_chunk(&mut input, ChunkHeader::new(2, true), &mut body)
                .await
                .unwrap();
            let err = reader
                .read_chunk(&mut input, ChunkHeader::new(2, true), &mut body)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidState(_)));
            assert_eq!(&body[..], b"ab");
        }
    }

    mod writer_tests {
        use super::*;

        #[tokio::test]
        async fn exact_multiple_ends_with_empty_last() {
            let wire = write_body(b"abcdef", 3, false).await;
            assert_eq!(wire, b"BDAT 3\r\nabcBDAT 3\r\ndefBDAT 0 LAST\r\n");
        }

        #[tokio::test]
        async fn size_hint_marks_last_data_chunk() {
            let wire = write_body(b"abcdef", 3, true).await;
            assert_eq!(wire, b"BDAT 3\r\nabcBDAT 3 LAST\r\ndef");
        }

        #[tokio::test]
        async fn remainder_goes_out_with_last() {
            let wire = write_body(b"abcdefg", 3, false).await;
            assert_eq!(wire, b"BDAT 3\r\nabcBDAT 3\r\ndefBDAT 1 LAST\r\ng");
        }

        #[tokio::test]
        async fn empty_body() {
            assert_eq!(write_body(b"", 8, false).await, b"BDAT 0 LAST\r\n");
            assert_eq!(write_body(b"", 8, true).await, b"BDAT 0 LAST\r\n");
        }

        #[tokio::test]
        async fn one_chunk_per_step() {
            let mut writer = BdatWriter::new(Vec::new(), 2);
            let progress = writer.write(b"abcde").await.unwrap();
            assert_eq!(
                progress,
                Progress {
                    consumed: 2,
                    chunk_sent: true
                }
            );
            assert_eq!(writer.chunks_sent(), 1);
        }

        #[tokio::test]
        async fn size_hint_is_enforced() {
            let mut writer = BdatWriter::new(Vec::new(), 16).with_size_hint(3);
            assert!(matches!(
                writer.write(b"abcd").await,
                Err(Error::InvalidState(_))
            ));
            writer.write(b"ab").await.unwrap();
            assert!(matches!(writer.finish().await, Err(Error::InvalidState(_))));
        }

        #[tokio::test]
        async fn fill_from_reads_source_in_chunks() {
            let mut source = &b"0123456789"[..];
            let mut writer = BdatWriter::new(Vec::new(), 4);
            let mut sent = 0;
            loop {
                let progress = writer.fill_from(&mut source).await.unwrap();
                if progress.chunk_sent {
                    sent += 1;
                }
                if progress.consumed == 0 && !progress.chunk_sent {
                    break;
                }
            }
            assert_eq!(sent, 2);
            let wire = writer.finish().await.unwrap();
            let payload: Vec<u8> = frames(&wire).into_iter().flat_map(|(_, p)| p).collect();
            assert_eq!(payload, b"0123456789");
        }

        #[tokio::test]
        async fn fill_from_stops_at_size_hint() {
            let mut source = &b"0123456789"[..];
            let mut writer = BdatWriter::new(Vec::new(), 4).with_size_hint(5);
            while !writer.is_sealed() {
                let progress = writer.fill_from(&mut source).await.unwrap();
                assert!(progress.consumed > 0 || progress.chunk_sent);
            }
            assert_eq!(source, b"56789");
            let wire = writer.finish().await.unwrap();
            let frames = frames(&wire);
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0].0, ChunkHeader::new(4, false));
            assert_eq!(frames[1].0, ChunkHeader::new(1, true));
            assert_eq!(frames[1].1, b"4");
        }
    }

    proptest! {
        #[test]
        fn round_trip(
            body in proptest::collection::vec(any::<u8>(), 0..300),
            chunk_size in 1usize..64,
            hint in any::<bool>(),
        ) {
            let wire = tokio_test::block_on(write_body(&body, chunk_size, hint));
            let frames = frames(&wire);

            let lasts = frames.iter().filter(|(h, _)| h.last).count();
            prop_assert_eq!(lasts, 1);
            prop_assert!(frames.last().unwrap().0.last);
            prop_assert!(frames.iter().all(|(h, _)| h.size <= chunk_size as u64));

            let payload: Vec<u8> = frames.into_iter().flat_map(|(_, p)| p).collect();
            prop_assert_eq!(payload, body);
        }
    }
}
