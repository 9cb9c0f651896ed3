//! SMTP reply parser.

use crate::error::{Error, Result};
use crate::types::{EnhancedCode, Reply, ReplyCode};

/// One physical line of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLine<'a> {
    /// Three-digit reply code.
    pub code: ReplyCode,
    /// True when the separator was a space (or absent), ending the reply.
    pub last: bool,
    /// Text after the separator.
    pub text: &'a str,
}

/// Parses a single reply line of the form `<code>[SP|-]<text>`.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the code is not three digits or the
/// separator is neither a space nor `-`.
pub fn parse_reply_line(line: &str) -> Result<ReplyLine<'_>> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(Error::Protocol(format!("Malformed reply line: {line:?}")));
    }
    let code = ReplyCode::new(
        bytes[..3]
            .iter()
            .fold(0, |acc, b| acc * 10 + u16::from(b - b'0')),
    );

    match bytes.get(3) {
        None => Ok(ReplyLine {
            code,
            last: true,
            text: "",
        }),
        Some(b' ') => Ok(ReplyLine {
            code,
            last: true,
            text: &line[4..],
        }),
        Some(b'-') => Ok(ReplyLine {
            code,
            last: false,
            text: &line[4..],
        }),
        Some(_) => Err(Error::Protocol(format!("Invalid reply separator: {line:?}"))),
    }
}

/// Parses an SMTP reply from response lines.
///
/// SMTP replies can be single-line or multi-line:
/// - Single: `250 OK\r\n`
/// - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
///
/// An enhanced status code leading the first line is lifted into
/// [`Reply::status`] and stripped from every line that repeats it.
///
/// # Errors
///
/// Returns an error if the reply is malformed or its lines disagree on
/// the reply code.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let Some(first) = lines.first() else {
        return Err(Error::Protocol("Empty reply".into()));
    };
    let code = parse_reply_line(first)?.code;

    let mut message = Vec::with_capacity(lines.len());
    for line in lines {
        let parsed = parse_reply_line(line)?;
        if parsed.code != code {
            return Err(Error::Protocol(format!(
                "Reply code changed mid-reply: {code} then {}",
                parsed.code
            )));
        }
        message.push(parsed.text.to_string());
    }

    let status = message
        .first()
        .and_then(|text| text.split(' ').next())
        .and_then(EnhancedCode::parse)
        .filter(|status| u16::from(status.class) == code.as_u16() / 100);

    if let Some(status) = status {
        let prefix = status.to_string();
        for text in &mut message {
            if let Some(rest) = text.strip_prefix(prefix.as_str()) {
                *text = rest.trim_start().to_string();
            }
        }
    }

    Ok(Reply {
        code,
        status,
        message,
    })
}

/// Checks if a line is the last line of a multi-line reply.
///
/// Multi-line replies use `-` separator for continuation and ` ` (or
/// nothing at all) for the last line.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    line.len() == 3 || (line.len() >= 4 && line.as_bytes()[3] == b' ')
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

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn ehlo_reply_keeps_keywords() {
        let reply = parse_reply(&lines(&[
            "250-mx.example.org Hello client",
            "250-PIPELINING",
            "250 CHUNKING",
        ]))
        .unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.status, None);
        assert_eq!(
            reply.message,
            vec!["mx.example.org Hello client", "PIPELINING", "CHUNKING"]
        );
    }

    #[test]
    fn enhanced_status_is_lifted() {
        let reply = parse_reply(&lines(&["550 5.1.1 No such user"])).unwrap();
        assert_eq!(reply.status, Some(EnhancedCode::new(5, 1, 1)));
        assert_eq!(reply.message, vec!["No such user"]);
    }

    #[test]
    fn enhanced_status_must_match_class() {
        let reply = parse_reply(&lines(&["250 5.1.1 odd"])).unwrap();
        assert_eq!(reply.status, None);
        assert_eq!(reply.message, vec!["5.1.1 odd"]);
    }

    #[test]
    fn bare_code_line() {
        let reply = parse_reply(&lines(&["354"])).unwrap();
        assert!(reply.is_intermediate());
        assert_eq!(reply.message, vec![""]);
    }

    #[test]
    fn last_line_detection() {
        assert!(is_last_reply_line("250 OK"));
        assert!(is_last_reply_line("250"));
        assert!(!is_last_reply_line("250-PIPELINING"));
        assert!(!is_last_reply_line("25"));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_reply(&[]).is_err());
        assert!(parse_reply(&lines(&["25"])).is_err());
        assert!(parse_reply(&lines(&["ABC OK"])).is_err());
        assert!(parse_reply(&lines(&["250_OK"])).is_err());
        assert!(parse_reply(&lines(&["250-one", "251 two"])).is_err());
    }
}
