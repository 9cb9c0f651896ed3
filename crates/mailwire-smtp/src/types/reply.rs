//! SMTP reply types.

use std::fmt;

use bytes::{BufMut, BytesMut};

/// SMTP reply, as read by a client or written by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Enhanced status code (RFC 3463), written after the reply code.
    pub status: Option<EnhancedCode>,
    /// Reply message lines.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply without an enhanced status code.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec is not const-compatible
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self {
            code,
            status: None,
            message,
        }
    }

    /// Creates a single-line reply carrying an enhanced status code.
    ///
    /// Embedded newlines split the text into several reply lines.
    #[must_use]
    pub fn with_status(code: ReplyCode, status: EnhancedCode, text: impl AsRef<str>) -> Self {
        Self {
            code,
            status: Some(status),
            message: text.as_ref().lines().map(str::to_string).collect(),
        }
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code.is_intermediate()
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient_error(&self) -> bool {
        self.code.is_transient()
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code.is_permanent()
    }

    /// Returns the full message as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }

    /// Appends the wire form of this reply to `buf`.
    ///
    /// Every line but the last uses the `code-` continuation form. When an
    /// enhanced status code is set it prefixes the text of every line.
    pub fn encode(&self, buf: &mut BytesMut) {
        let empty = [String::new()];
        let lines: &[String] = if self.message.is_empty() {
            &empty
        } else {
            &self.message
        };

        for (i, line) in lines.iter().enumerate() {
            let separator = if i + 1 == lines.len() { b' ' } else { b'-' };
            buf.put_slice(self.code.to_string().as_bytes());
            buf.put_u8(separator);
            if let Some(status) = self.status {
                buf.put_slice(status.to_string().as_bytes());
                if !line.is_empty() {
                    buf.put_u8(b' ');
                }
            }
            buf.put_slice(line.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(status) = self.status {
            write!(f, " {status}")?;
        }
        if !self.message.is_empty() {
            write!(f, " {}", self.message.join(" / "))?;
        }
        Ok(())
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Common reply codes
impl ReplyCode {
    /// 214 Help message
    pub const HELP: Self = Self(214);
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTH_SUCCEEDED: Self = Self(235);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 251 User not local; will forward
    pub const FORWARD: Self = Self(251);
    /// 252 Cannot verify user, but will accept message
    pub const CANNOT_VERIFY: Self = Self(252);
    /// 334 Continue with authentication
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 421 Service not available, closing transmission channel
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 450 Mailbox unavailable (busy)
    pub const MAILBOX_BUSY: Self = Self(450);
    /// 451 Local error in processing
    pub const LOCAL_ERROR: Self = Self(451);
    /// 452 Insufficient system storage
    pub const INSUFFICIENT_STORAGE: Self = Self(452);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 504 Command parameter not implemented
    pub const PARAMETER_NOT_IMPLEMENTED: Self = Self(504);
    /// 530 Authentication required, or STARTTLS first
    pub const ACCESS_DENIED: Self = Self(530);
    /// 535 Authentication credentials invalid
    pub const AUTH_FAILED: Self = Self(535);
    /// 538 Encryption required for requested authentication mechanism
    pub const ENCRYPTION_REQUIRED: Self = Self(538);
    /// 550 Mailbox unavailable (not found, access denied)
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
    /// 552 Exceeded storage allocation
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// 554 Transaction failed
    pub const TRANSACTION_FAILED: Self = Self(554);
    /// 555 MAIL FROM/RCPT TO parameters not recognized
    pub const PARAMETERS_NOT_RECOGNIZED: Self = Self(555);
}

/// Enhanced mail system status code (RFC 3463), e.g. `2.1.5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnhancedCode {
    /// Class: 2 success, 4 persistent transient failure, 5 permanent failure.
    pub class: u8,
    /// Subject.
    pub subject: u16,
    /// Detail.
    pub detail: u16,
}

impl EnhancedCode {
    /// Creates an enhanced status code.
    #[must_use]
    pub const fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    /// `x.0.0` for the class of the given reply code.
    #[must_use]
    pub const fn generic(code: ReplyCode) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let class = (code.as_u16() / 100) as u8;
        Self::new(class, 0, 0)
    }

    /// Parses the `class.subject.detail` form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        matches!(class, 2 | 4 | 5).then_some(Self::new(class, subject, detail))
    }
}

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
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

    fn wire(reply: &Reply) -> String {
        let mut buf = BytesMut::new();
        reply.encode(&mut buf);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    mod reply_code_tests {
        use super::*;

        #[test]
        fn classes() {
            assert!(ReplyCode::OK.is_success());
            assert!(ReplyCode::CANNOT_VERIFY.is_success());
            assert!(ReplyCode::START_DATA.is_intermediate());
            assert!(ReplyCode::AUTH_CONTINUE.is_intermediate());
            assert!(ReplyCode::INSUFFICIENT_STORAGE.is_transient());
            assert!(ReplyCode::PARAMETERS_NOT_RECOGNIZED.is_permanent());
            assert!(!ReplyCode::BAD_SEQUENCE.is_transient());
        }

        #[test]
        fn display() {
            assert_eq!(ReplyCode::HELP.to_string(), "214");
            assert_eq!(ReplyCode::new(599).as_u16(), 599);
        }
    }

    mod enhanced_code_tests {
        use super::*;

        #[test]
        fn parse_valid() {
            assert_eq!(EnhancedCode::parse("2.1.5"), Some(EnhancedCode::new(2, 1, 5)));
            assert_eq!(
                EnhancedCode::parse("5.7.108"),
                Some(EnhancedCode::new(5, 7, 108))
            );
        }

        #[test]
        fn parse_rejects_bad_class() {
            assert_eq!(EnhancedCode::parse("3.0.0"), None);
            assert_eq!(EnhancedCode::parse("2.0"), None);
            assert_eq!(EnhancedCode::parse("OK"), None);
        }

        #[test]
        fn generic_follows_reply_class() {
            assert_eq!(
                EnhancedCode::generic(ReplyCode::EXCEEDED_STORAGE),
                EnhancedCode::new(5, 0, 0)
            );
            assert_eq!(EnhancedCode::generic(ReplyCode::OK).to_string(), "2.0.0");
        }
    }

    mod encode_tests {
        use super::*;

        #[test]
        fn single_line_with_status() {
            let reply = Reply::with_status(ReplyCode::OK, EnhancedCode::new(2, 1, 0), "Sender ok");
            assert_eq!(wire(&reply), "250 2.1.0 Sender ok\r\n");
        }

        #[test]
        fn multi_line_uses_continuation() {
            let reply = Reply::new(
                ReplyCode::OK,
                vec!["mx.example.org Hello".into(), "PIPELINING".into(), "CHUNKING".into()],
            );
            assert_eq!(
                wire(&reply),
                "250-mx.example.org Hello\r\n250-PIPELINING\r\n250 CHUNKING\r\n"
            );
        }

        #[test]
        fn status_repeated_on_every_line() {
            let reply = Reply::with_status(ReplyCode::HELP, EnhancedCode::new(2, 0, 0), "one\ntwo");
            assert_eq!(wire(&reply), "214-2.0.0 one\r\n214 2.0.0 two\r\n");
        }

        #[test]
        fn empty_message() {
            assert_eq!(wire(&Reply::new(ReplyCode::START_DATA, vec![])), "354 \r\n");
        }

        #[test]
        fn display_is_single_line() {
            let reply = Reply::with_status(
                ReplyCode::MAILBOX_UNAVAILABLE,
                EnhancedCode::new(5, 1, 1),
                "no such user",
            );
            assert_eq!(reply.to_string(), "550 5.1.1 no such user");
        }
    }
}
