//! Line scanner for command and reply lines.
//!
//! Reads are lenient: CRLF and a bare LF both end a line. Writers in this
//! crate always emit CRLF.

use bytes::BytesMut;
use memchr::memchr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Error, Result};

/// Default maximum line length, terminator excluded.
///
/// Twice the RFC 5321 minimum, which real-world clients routinely exceed.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 2000;

/// Reads one line into `line`, stripping its terminator.
///
/// A line longer than `max_len` is consumed through its LF and discarded,
/// then reported as [`Error::LineTooLong`]. The reader is left at the start
/// of the next line, so the caller may keep going.
///
/// # Errors
///
/// - [`Error::LineTooLong`] as described above
/// - [`Error::ConnectionClosed`] if the stream ends, even mid-line
/// - [`Error::Io`] on transport failure
pub async fn read_line<R>(reader: &mut R, max_len: usize, line: &mut Vec<u8>) -> Result<()>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    line.clear();
    let mut overflow = false;

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::ConnectionClosed);
        }

        if let Some(pos) = memchr(b'\n', buf) {
            if !overflow {
                line.extend_from_slice(&buf[..pos]);
            }
            reader.consume(pos + 1);
            break;
        }

        let len = buf.len();
        if !overflow {
            line.extend_from_slice(buf);
        }
        reader.consume(len);

        // One extra byte for a CR that may precede the LF.
        if !overflow && line.len() > max_len + 1 {
            overflow = true;
            line.clear();
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if overflow || line.len() > max_len {
        line.clear();
        return Err(Error::LineTooLong(max_len));
    }
    Ok(())
}

/// Moves exactly `count` raw bytes from `reader` into `out`, or drops them
/// when `out` is `None`.
///
/// # Errors
///
/// Returns [`Error::IncompleteChunk`] with the number of bytes still owed if
/// the stream ends first.
pub async fn copy_span<R>(reader: &mut R, count: u64, mut out: Option<&mut BytesMut>) -> Result<()>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut remaining = count;
    while remaining > 0 {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::IncompleteChunk { missing: remaining });
        }
        let take = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        if let Some(out) = out.as_deref_mut() {
            out.extend_from_slice(&buf[..take]);
        }
        reader.consume(take);
        remaining -= take as u64;
    }
    Ok(())
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
    use tokio::io::BufReader;

    async fn lines(input: &[u8], max_len: usize) -> Vec<Result<Vec<u8>>> {
        let mut reader = BufReader::with_capacity(4, input);
        let mut out = Vec::new();
        loop {
            let mut line = Vec::new();
            match read_line(&mut reader, max_len, &mut line).await {
                Err(Error::ConnectionClosed) => return out,
                Err(e) => out.push(Err(e)),
                Ok(()) => out.push(Ok(line)),
            }
        }
    }

    #[tokio::test]
    async fn crlf_and_bare_lf() {
        let got = lines(b"EHLO a\r\nNOOP\nQUIT\r\n", 100).await;
        let got: Vec<_> = got.into_iter().map(Result::unwrap).collect();
        assert_eq!(got, vec![b"EHLO a".to_vec(), b"NOOP".to_vec(), b"QUIT".to_vec()]);
    }

    #[tokio::test]
    async fn exact_limit_is_accepted() {
        let got = lines(b"12345\r\n", 5).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].as_ref().unwrap(), b"12345");
    }

    #[tokio::test]
    async fn long_line_is_discarded_and_stream_stays_usable() {
        let mut input = b"MAIL FROM:<a@x> ".to_vec();
        input.extend(std::iter::repeat_n(b'A', 100));
        input.extend_from_slice(b"\r\nNOOP\r\n");

        let got = lines(&input, 20).await;
        assert_eq!(got.len(), 2);
        assert!(matches!(got[0], Err(Error::LineTooLong(20))));
        assert_eq!(got[1].as_ref().unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn eof_mid_line_is_connection_closed() {
        let mut reader = BufReader::new(&b"QUI"[..]);
        let mut line = Vec::new();
        let err = read_line(&mut reader, 100, &mut line).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn copy_span_leaves_following_bytes() {
        let mut reader = BufReader::with_capacity(3, &b"helloBDAT 0 LAST\r\n"[..]);
        let mut out = BytesMut::new();
        copy_span(&mut reader, 5, Some(&mut out)).await.unwrap();
        assert_eq!(&out[..], b"hello");

        let mut line = Vec::new();
        read_line(&mut reader, 100, &mut line).await.unwrap();
        assert_eq!(line, b"BDAT 0 LAST");
    }

    #[tokio::test]
    async fn copy_span_reports_missing_bytes() {
        let mut reader = BufReader::new(&b"abc"[..]);
        let err = copy_span(&mut reader, 10, None).await.unwrap_err();
        assert!(matches!(err, Error::IncompleteChunk { missing: 7 }));
    }
}
