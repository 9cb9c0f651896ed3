//! SMTP commands.
//!
//! [`Command`] is shared by both roles: the client serializes it onto the
//! wire and the server session parses incoming lines back into it.

use std::fmt;

use crate::codec::bdat::ChunkHeader;
use crate::error::{Error, Result};
use crate::pipeline::PipelineSafety;
use crate::types::{Address, AuthMechanism, ReplyCode};

/// MAIL FROM `BODY=` parameter (RFC 6152, RFC 3030).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    /// `7BIT`
    SevenBit,
    /// `8BITMIME`
    EightBitMime,
    /// `BINARYMIME`, only transferable with BDAT
    BinaryMime,
}

impl BodyType {
    /// Returns the parameter value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
            Self::BinaryMime => "BINARYMIME",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "7BIT" => Some(Self::SevenBit),
            "8BITMIME" => Some(Self::EightBitMime),
            "BINARYMIME" => Some(Self::BinaryMime),
            _ => None,
        }
    }
}

/// ESMTP parameters of MAIL FROM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParams {
    /// Declared message size (`SIZE=`).
    pub size: Option<u64>,
    /// Body type (`BODY=`).
    pub body: Option<BodyType>,
    /// Internationalized addresses in use (`SMTPUTF8`).
    pub smtputf8: bool,
    /// TLS required on every hop (`REQUIRETLS`, RFC 8689).
    pub require_tls: bool,
}

impl MailParams {
    fn parse(input: &str) -> Result<Self> {
        let mut params = Self::default();
        for token in input.split_ascii_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };
            match (key.to_ascii_uppercase().as_str(), value) {
                ("SIZE", Some(value)) => {
                    params.size = Some(parse_decimal(value).ok_or_else(|| {
                        Error::Syntax(format!("Malformed SIZE parameter: {value}"))
                    })?);
                }
                ("BODY", Some(value)) => {
                    params.body = Some(BodyType::parse(value).ok_or_else(|| {
                        Error::Syntax(format!("Unknown BODY type: {value}"))
                    })?);
                }
                ("SMTPUTF8", None) => params.smtputf8 = true,
                ("REQUIRETLS", None) => params.require_tls = true,
                _ => return Err(Error::NotSupported(format!("MAIL parameter {key}"))),
            }
        }
        Ok(params)
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        if let Some(size) = self.size {
            buf.extend_from_slice(format!(" SIZE={size}").as_bytes());
        }
        if let Some(body) = self.body {
            buf.extend_from_slice(b" BODY=");
            buf.extend_from_slice(body.as_str().as_bytes());
        }
        if self.smtputf8 {
            buf.extend_from_slice(b" SMTPUTF8");
        }
        if self.require_tls {
            buf.extend_from_slice(b" REQUIRETLS");
        }
    }
}

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client hostname
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Authentication mechanism
        mechanism: AuthMechanism,
        /// Initial response, base64 (`=` for an empty one)
        initial_response: Option<String>,
    },
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Reverse path, possibly null
        from: Address,
        /// ESMTP parameters
        params: MailParams,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        to: Address,
    },
    /// DATA - Begin dot-stuffed message data
    Data,
    /// BDAT - One chunk of message data, payload follows the line
    Bdat(ChunkHeader),
    /// RSET - Reset transaction
    Rset,
    /// VRFY - Verify address
    Vrfy {
        /// Address to verify
        address: String,
    },
    /// HELP - Ask for help
    Help {
        /// Optional topic
        topic: Option<String>,
    },
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
}

impl Command {
    /// Parses a command line (without its CRLF) as received by a server.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownCommand`] for an unrecognized verb
    /// - [`Error::Syntax`] for malformed arguments
    /// - [`Error::NotSupported`] for unknown ESMTP parameters or SASL mechanisms
    /// - [`Error::InvalidChunkHeader`] for a malformed BDAT line
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Ok(Self::Helo {
                hostname: first_word(arg, "HELO")?,
            }),
            "EHLO" => Ok(Self::Ehlo {
                hostname: first_word(arg, "EHLO")?,
            }),
            "MAIL" => {
                let path = strip_keyword(arg, "FROM:")?;
                let (path, rest) = split_path(path)?;
                let from = if path.is_empty() {
                    Address::null()
                } else {
                    Address::new(path).map_err(|e| Error::Syntax(e.to_string()))?
                };
                Ok(Self::MailFrom {
                    from,
                    params: MailParams::parse(rest)?,
                })
            }
            "RCPT" => {
                let path = strip_keyword(arg, "TO:")?;
                let (path, rest) = split_path(path)?;
                if let Some(param) = rest.split_ascii_whitespace().next() {
                    return Err(Error::NotSupported(format!("RCPT parameter {param}")));
                }
                let to = Address::new(path).map_err(|e| Error::Syntax(e.to_string()))?;
                Ok(Self::RcptTo { to })
            }
            "DATA" => no_argument(arg, Self::Data),
            "BDAT" => ChunkHeader::parse(arg).map(Self::Bdat),
            "RSET" => no_argument(arg, Self::Rset),
            "QUIT" => no_argument(arg, Self::Quit),
            "STARTTLS" => no_argument(arg, Self::StartTls),
            "NOOP" => Ok(Self::Noop),
            "VRFY" => {
                if arg.is_empty() {
                    return Err(Error::Syntax("VRFY requires an argument".into()));
                }
                Ok(Self::Vrfy {
                    address: arg.to_string(),
                })
            }
            "HELP" => Ok(Self::Help {
                topic: (!arg.is_empty()).then(|| arg.to_string()),
            }),
            "AUTH" => {
                let mut parts = arg.split_ascii_whitespace();
                let name = parts
                    .next()
                    .ok_or_else(|| Error::Syntax("AUTH requires a mechanism".into()))?;
                let initial_response = parts.next().map(str::to_string);
                if parts.next().is_some() {
                    return Err(Error::Syntax("Too many AUTH arguments".into()));
                }
                let mechanism = AuthMechanism::parse(name)
                    .ok_or_else(|| Error::NotSupported(format!("AUTH {name}")))?;
                Ok(Self::Auth {
                    mechanism,
                    initial_response,
                })
            }
            _ => Err(Error::UnknownCommand(verb.to_string())),
        }
    }

    /// Serializes the command to bytes, CRLF included.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            Self::Helo { hostname } => {
                buf.extend_from_slice(b"HELO ");
                buf.extend_from_slice(hostname.as_bytes());
            }
            Self::Ehlo { hostname } => {
                buf.extend_from_slice(b"EHLO ");
                buf.extend_from_slice(hostname.as_bytes());
            }
            Self::StartTls => buf.extend_from_slice(b"STARTTLS"),
            Self::Auth {
                mechanism,
                initial_response,
            } => {
                buf.extend_from_slice(b"AUTH ");
                buf.extend_from_slice(mechanism.as_str().as_bytes());
                if let Some(resp) = initial_response {
                    buf.push(b' ');
                    buf.extend_from_slice(resp.as_bytes());
                }
            }
            Self::MailFrom { from, params } => {
                buf.extend_from_slice(b"MAIL FROM:");
                buf.extend_from_slice(from.to_string().as_bytes());
                params.serialize(&mut buf);
            }
            Self::RcptTo { to } => {
                buf.extend_from_slice(b"RCPT TO:");
                buf.extend_from_slice(to.to_string().as_bytes());
            }
            Self::Data => buf.extend_from_slice(b"DATA"),
            Self::Bdat(header) => buf.extend_from_slice(header.to_string().as_bytes()),
            Self::Rset => buf.extend_from_slice(b"RSET"),
            Self::Vrfy { address } => {
                buf.extend_from_slice(b"VRFY ");
                buf.extend_from_slice(address.as_bytes());
            }
            Self::Help { topic } => {
                buf.extend_from_slice(b"HELP");
                if let Some(topic) = topic {
                    buf.push(b' ');
                    buf.extend_from_slice(topic.as_bytes());
                }
            }
            Self::Noop => buf.extend_from_slice(b"NOOP"),
            Self::Quit => buf.extend_from_slice(b"QUIT"),
        }

        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Returns the command verb.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::Auth { .. } => "AUTH",
            Self::MailFrom { .. } => "MAIL",
            Self::RcptTo { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Bdat(_) => "BDAT",
            Self::Rset => "RSET",
            Self::Vrfy { .. } => "VRFY",
            Self::Help { .. } => "HELP",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
        }
    }

    /// Returns how the replies to this command are laid out.
    #[must_use]
    pub const fn reply_shape(&self) -> ReplyShape {
        match self {
            Self::Data => ReplyShape::IntermediateThenFinal,
            Self::Auth { .. } => ReplyShape::Negotiated,
            _ => ReplyShape::Final,
        }
    }

    /// Classifies the command for RFC 2920 pipelining.
    #[must_use]
    pub const fn pipeline_safety(&self) -> PipelineSafety {
        match self {
            Self::MailFrom { .. } | Self::RcptTo { .. } | Self::Rset => PipelineSafety::Anywhere,
            Self::Noop | Self::Vrfy { .. } | Self::Help { .. } | Self::Quit => {
                PipelineSafety::EndsGroup
            }
            Self::Data
            | Self::Bdat(_)
            | Self::Auth { .. }
            | Self::StartTls
            | Self::Ehlo { .. }
            | Self::Helo { .. } => PipelineSafety::Alone,
        }
    }
}

impl fmt::Display for Command {
    /// Formats the command for logs, without its CRLF and without AUTH secrets.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth { mechanism, .. } => write!(f, "AUTH {}", mechanism.as_str()),
            _ => {
                let line = self.serialize();
                f.write_str(String::from_utf8_lossy(&line).trim_end())
            }
        }
    }
}

/// The replies a command is owed, tracked as an explicit state.
///
/// A server consults it while answering a command, a client while
/// collecting the answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Exactly one final reply.
    Final,
    /// A 3xx go-ahead, then a final reply once the body has been sent.
    IntermediateThenFinal,
    /// Any number of 334 challenges, then a final reply.
    Negotiated,
}

impl ReplyShape {
    /// Returns what is still owed after a reply with `code`, or `None`
    /// once the command is fully answered.
    #[must_use]
    pub const fn after(self, code: ReplyCode) -> Option<Self> {
        match self {
            Self::Final => None,
            Self::IntermediateThenFinal if code.is_intermediate() => Some(Self::Final),
            Self::Negotiated if code.as_u16() == ReplyCode::AUTH_CONTINUE.as_u16() => {
                Some(Self::Negotiated)
            }
            Self::IntermediateThenFinal | Self::Negotiated => None,
        }
    }
}

fn first_word(arg: &str, verb: &str) -> Result<String> {
    arg.split_ascii_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| Error::Syntax(format!("{verb} requires a domain")))
}

fn no_argument(arg: &str, command: Command) -> Result<Command> {
    if arg.is_empty() {
        Ok(command)
    } else {
        Err(Error::Syntax(format!("{} takes no arguments", command.verb())))
    }
}

fn strip_keyword<'a>(arg: &'a str, keyword: &str) -> Result<&'a str> {
    match arg.get(..keyword.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(keyword) => {
            Ok(arg[keyword.len()..].trim_start())
        }
        _ => Err(Error::Syntax(format!("Expected {keyword}<path>"))),
    }
}

/// Splits `<path> params` at the closing bracket, honoring quoted local
/// parts. A source route (`@a,@b:user@c`) is dropped.
fn split_path(input: &str) -> Result<(&str, &str)> {
    let Some(inner) = input.strip_prefix('<') else {
        return Err(Error::Syntax("Path must be enclosed in <>".into()));
    };

    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in inner.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '>' if !quoted => {
                let path = &inner[..i];
                let path = match path.split_once(':') {
                    Some((route, mailbox)) if route.starts_with('@') => mailbox,
                    _ => path,
                };
                return Ok((path, inner[i + 1..].trim_start()));
            }
            _ => {}
        }
    }

    Err(Error::Syntax("Unterminated path".into()))
}

fn parse_decimal(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
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

    mod parse_tests {
        use super::*;

        #[test]
        fn mail_from_with_params() {
            let cmd = Command::parse("mail from:<a@x> SIZE=1024 BODY=8bitmime").unwrap();
            assert_eq!(
                cmd,
                Command::MailFrom {
                    from: Address::new("a@x").unwrap(),
                    params: MailParams {
                        size: Some(1024),
                        body: Some(BodyType::EightBitMime),
                        smtputf8: false,
                        require_tls: false,
                    },
                }
            );
        }

        #[test]
        fn mail_from_null_path_and_space_after_colon() {
            let cmd = Command::parse("MAIL FROM: <>").unwrap();
            assert!(matches!(cmd, Command::MailFrom { from, .. } if from.is_null()));
        }

        #[test]
        fn mail_from_quoted_local_part() {
            let cmd = Command::parse("MAIL FROM:<\"odd>name\"@x> SMTPUTF8").unwrap();
            let Command::MailFrom { from, params } = cmd else {
                panic!("expected MAIL");
            };
            assert_eq!(from.as_str(), "\"odd>name\"@x");
            assert!(params.smtputf8);
        }

        #[test]
        fn mail_from_requiretls() {
            let cmd = Command::parse("MAIL FROM:<a@x> requiretls").unwrap();
            let Command::MailFrom { params, .. } = cmd else {
                panic!("expected MAIL");
            };
            assert!(params.require_tls);
            assert!(Command::parse("MAIL FROM:<a@x> REQUIRETLS=yes").is_err());
        }

        #[test]
        fn rcpt_strips_source_route() {
            let cmd = Command::parse("RCPT TO:<@relay.example,@hop.example:b@y>").unwrap();
            assert_eq!(
                cmd,
                Command::RcptTo {
                    to: Address::new("b@y").unwrap()
                }
            );
        }

        #[test]
        fn rcpt_rejects_null_and_params() {
            assert!(matches!(Command::parse("RCPT TO:<>"), Err(Error::Syntax(_))));
            assert!(matches!(
                Command::parse("RCPT TO:<b@y> NOTIFY=NEVER"),
                Err(Error::NotSupported(_))
            ));
        }

        #[test]
        fn path_syntax_errors() {
            assert!(matches!(Command::parse("MAIL FROM:a@x"), Err(Error::Syntax(_))));
            assert!(matches!(Command::parse("MAIL FROM:<a@x"), Err(Error::Syntax(_))));
            assert!(matches!(Command::parse("MAIL TO:<a@x>"), Err(Error::Syntax(_))));
            assert!(matches!(Command::parse("MAIL"), Err(Error::Syntax(_))));
        }

        #[test]
        fn mail_parameter_errors() {
            assert!(matches!(
                Command::parse("MAIL FROM:<a@x> SIZE=-1"),
                Err(Error::Syntax(_))
            ));
            assert!(matches!(
                Command::parse("MAIL FROM:<a@x> BODY=9BIT"),
                Err(Error::Syntax(_))
            ));
            assert!(matches!(
                Command::parse("MAIL FROM:<a@x> RET=FULL"),
                Err(Error::NotSupported(_))
            ));
        }

        #[test]
        fn bdat() {
            assert_eq!(
                Command::parse("BDAT 5").unwrap(),
                Command::Bdat(ChunkHeader::new(5, false))
            );
            assert_eq!(
                Command::parse("bdat 0 last").unwrap(),
                Command::Bdat(ChunkHeader::new(0, true))
            );
            assert!(matches!(
                Command::parse("BDAT five"),
                Err(Error::InvalidChunkHeader(_))
            ));
        }

        #[test]
        fn argument_rules() {
            assert_eq!(Command::parse("DATA").unwrap(), Command::Data);
            assert!(matches!(Command::parse("DATA now"), Err(Error::Syntax(_))));
            assert_eq!(Command::parse("NOOP anything").unwrap(), Command::Noop);
            assert!(matches!(Command::parse("EHLO"), Err(Error::Syntax(_))));
            assert!(matches!(Command::parse("VRFY"), Err(Error::Syntax(_))));
            assert_eq!(
                Command::parse("HELP").unwrap(),
                Command::Help { topic: None }
            );
        }

        #[test]
        fn auth() {
            assert_eq!(
                Command::parse("AUTH PLAIN AGZvbwBiYXI=").unwrap(),
                Command::Auth {
                    mechanism: AuthMechanism::Plain,
                    initial_response: Some("AGZvbwBiYXI=".into()),
                }
            );
            assert!(matches!(
                Command::parse("AUTH GSSAPI"),
                Err(Error::NotSupported(_))
            ));
        }

        #[test]
        fn unknown_verbs() {
            assert!(matches!(
                Command::parse("XYZZY"),
                Err(Error::UnknownCommand(verb)) if verb == "XYZZY"
            ));
            assert!(matches!(Command::parse(""), Err(Error::UnknownCommand(_))));
        }
    }

    mod serialize_tests {
        use super::*;

        #[test]
        fn mail_from() {
            let cmd = Command::MailFrom {
                from: Address::new("a@x").unwrap(),
                params: MailParams {
                    size: Some(42),
                    body: Some(BodyType::BinaryMime),
                    smtputf8: true,
                    require_tls: true,
                },
            };
            assert_eq!(
                cmd.serialize(),
                b"MAIL FROM:<a@x> SIZE=42 BODY=BINARYMIME SMTPUTF8 REQUIRETLS\r\n"
            );
        }

        #[test]
        fn null_reverse_path() {
            let cmd = Command::MailFrom {
                from: Address::null(),
                params: MailParams::default(),
            };
            assert_eq!(cmd.serialize(), b"MAIL FROM:<>\r\n");
        }

        #[test]
        fn bdat_header() {
            assert_eq!(
                Command::Bdat(ChunkHeader::new(0, true)).serialize(),
                b"BDAT 0 LAST\r\n"
            );
        }

        #[test]
        fn parse_accepts_serialized_form() {
            let commands = [
                Command::Ehlo {
                    hostname: "client.example".into(),
                },
                Command::RcptTo {
                    to: Address::new("b@y").unwrap(),
                },
                Command::Bdat(ChunkHeader::new(512, false)),
                Command::Quit,
            ];
            for cmd in commands {
                let line = cmd.serialize();
                let text = std::str::from_utf8(&line).unwrap();
                assert_eq!(Command::parse(text).unwrap(), cmd);
            }
        }

        #[test]
        fn display_hides_auth_response() {
            let cmd = Command::Auth {
                mechanism: AuthMechanism::Plain,
                initial_response: Some("c2VjcmV0".into()),
            };
            assert_eq!(cmd.to_string(), "AUTH PLAIN");
            assert_eq!(Command::Noop.to_string(), "NOOP");
        }
    }

    mod shape_tests {
        use super::*;

        #[test]
        fn data_owes_two_replies() {
            let shape = Command::Data.reply_shape();
            assert_eq!(shape.after(ReplyCode::START_DATA), Some(ReplyShape::Final));
            assert_eq!(ReplyShape::Final.after(ReplyCode::OK), None);
            assert_eq!(shape.after(ReplyCode::BAD_SEQUENCE), None);
        }

        #[test]
        fn auth_continues_while_challenged() {
            let shape = ReplyShape::Negotiated;
            assert_eq!(
                shape.after(ReplyCode::AUTH_CONTINUE),
                Some(ReplyShape::Negotiated)
            );
            assert_eq!(shape.after(ReplyCode::AUTH_SUCCEEDED), None);
        }

        #[test]
        fn bdat_owes_one_reply() {
            assert_eq!(
                Command::Bdat(ChunkHeader::new(1, false)).reply_shape(),
                ReplyShape::Final
            );
        }
    }
}
