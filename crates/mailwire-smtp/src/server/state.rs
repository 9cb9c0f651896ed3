//! Session phases and the command legality table.

use bytes::BytesMut;

use super::handler::Envelope;
use crate::codec::bdat::{BdatReader, ChunkLimits};
use crate::command::Command;
use crate::types::{EnhancedCode, Reply, ReplyCode};

/// How the body of a transaction is being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// `DATA` with dot-stuffing.
    DotStuffed,
    /// One or more `BDAT` chunks.
    Chunked,
}

/// Where a session stands.
///
/// ```text
/// Initial ──HELO/EHLO──> Greeted ──MAIL──> Mail ──RCPT──> Rcpt ──DATA/BDAT──> Body
///                         │   ^                                               │
///                         │   └───────────────── body complete ───────────────┘
///                         └──AUTH──> Authenticating ──> Greeted
/// ```
///
/// `Quit` is terminal and reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Greeting sent, no HELO/EHLO yet.
    Initial,
    /// HELO/EHLO accepted, no transaction.
    Greeted,
    /// Inside an AUTH exchange.
    Authenticating,
    /// MAIL accepted, no recipient yet.
    Mail,
    /// At least one recipient accepted.
    Rcpt,
    /// Body transfer started. For BDAT this spans several commands.
    Body(TransferMode),
    /// QUIT received.
    Quit,
}

impl Phase {
    /// Returns true while a mail transaction is open.
    #[must_use]
    pub const fn in_transaction(self) -> bool {
        matches!(self, Self::Mail | Self::Rcpt | Self::Body(_))
    }

    /// Checks whether `command` may be issued in this phase.
    ///
    /// Rejection never changes the phase. Extension gating (CHUNKING,
    /// STARTTLS, AUTH availability) is decided by the session, which knows
    /// what was negotiated.
    ///
    /// # Errors
    ///
    /// Returns the `503` reply to send when the command is out of sequence.
    pub fn permits(self, command: &Command) -> Result<(), Reply> {
        if self == Self::Quit {
            return Err(bad_sequence("Session is closing"));
        }

        match command {
            Command::Rset
            | Command::Noop
            | Command::Quit
            | Command::Help { .. }
            | Command::Vrfy { .. }
            | Command::Helo { .. }
            | Command::Ehlo { .. } => Ok(()),

            Command::StartTls | Command::Auth { .. } => match self {
                Self::Greeted => Ok(()),
                Self::Initial => Err(bad_sequence("Send EHLO first")),
                _ => Err(bad_sequence(
                    "Command not permitted during a mail transaction",
                )),
            },

            Command::MailFrom { .. } => match self {
                Self::Greeted => Ok(()),
                Self::Initial => Err(bad_sequence("Send HELO/EHLO first")),
                _ => Err(bad_sequence("Nested MAIL command")),
            },

            Command::RcptTo { .. } => match self {
                Self::Mail | Self::Rcpt => Ok(()),
                Self::Body(_) => Err(bad_sequence("RCPT not permitted during body transfer")),
                _ => Err(bad_sequence("Need MAIL command")),
            },

            Command::Data => match self {
                Self::Rcpt => Ok(()),
                Self::Mail => Err(bad_sequence("Need RCPT command")),
                Self::Body(TransferMode::Chunked) => {
                    Err(bad_sequence("DATA not permitted during BDAT transfer"))
                }
                _ => Err(bad_sequence("Need MAIL command")),
            },

            Command::Bdat(_) => match self {
                Self::Rcpt | Self::Body(TransferMode::Chunked) => Ok(()),
                Self::Mail => Err(bad_sequence("Need RCPT command")),
                _ => Err(bad_sequence("Need MAIL command")),
            },
        }
    }
}

fn bad_sequence(text: &str) -> Reply {
    Reply::with_status(ReplyCode::BAD_SEQUENCE, EnhancedCode::new(5, 5, 1), text)
}

/// One MAIL..body cycle.
#[derive(Debug)]
pub struct Transaction {
    /// Sender, recipients and parameters.
    pub envelope: Envelope,
    /// BDAT chunk payloads received so far. DATA bodies are streamed to the
    /// handler and never land here.
    pub body: BytesMut,
    /// Chunk accounting once BDAT is in use.
    pub chunks: BdatReader,
}

impl Transaction {
    /// Opens a transaction.
    #[must_use]
    pub fn new(envelope: Envelope, limits: ChunkLimits) -> Self {
        Self {
            envelope,
            body: BytesMut::new(),
            chunks: BdatReader::new(limits),
        }
    }

    /// Returns true once the body is complete.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.chunks.is_sealed()
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
    use crate::codec::bdat::ChunkHeader;
    use crate::command::MailParams;
    use crate::types::Address;

    const ALL: [Phase; 8] = [
        Phase::Initial,
        Phase::Greeted,
        Phase::Authenticating,
        Phase::Mail,
        Phase::Rcpt,
        Phase::Body(TransferMode::Chunked),
        Phase::Body(TransferMode::DotStuffed),
        Phase::Quit,
    ];

    fn rcpt() -> Command {
        Command::RcptTo {
            to: Address::new("b@y").unwrap(),
        }
    }

    #[test]
    fn rcpt_needs_mail_everywhere() {
        for phase in ALL {
            let verdict = phase.permits(&rcpt());
            match phase {
                Phase::Mail | Phase::Rcpt => assert!(verdict.is_ok()),
                _ => assert_eq!(verdict.unwrap_err().code, ReplyCode::BAD_SEQUENCE),
            }
        }
    }

    #[test]
    fn always_legal_commands() {
        for phase in ALL.into_iter().filter(|p| *p != Phase::Quit) {
            for command in [Command::Rset, Command::Noop, Command::Quit, Command::Help { topic: None }] {
                assert!(phase.permits(&command).is_ok(), "{command} in {phase:?}");
            }
        }
    }

    #[test]
    fn data_and_bdat_do_not_mix() {
        let chunked = Phase::Body(TransferMode::Chunked);
        assert!(chunked.permits(&Command::Data).is_err());
        assert!(chunked.permits(&Command::Bdat(ChunkHeader::new(1, true))).is_ok());
        assert!(Phase::Rcpt.permits(&Command::Data).is_ok());
        assert!(Phase::Mail.permits(&Command::Data).is_err());
    }

    #[test]
    fn mail_sequence() {
        let mail = Command::MailFrom {
            from: Address::null(),
            params: MailParams::default(),
        };
        assert!(Phase::Greeted.permits(&mail).is_ok());
        assert!(Phase::Initial.permits(&mail).is_err());
        assert!(Phase::Rcpt.permits(&mail).is_err());
    }

    #[test]
    fn auth_outside_transaction_only() {
        let auth = Command::Auth {
            mechanism: crate::types::AuthMechanism::Plain,
            initial_response: None,
        };
        assert!(Phase::Greeted.permits(&auth).is_ok());
        assert!(Phase::Mail.permits(&auth).is_err());
        assert!(Phase::Initial.permits(&auth).is_err());
    }

    #[test]
    fn transaction_phases() {
        assert!(Phase::Mail.in_transaction());
        assert!(Phase::Body(TransferMode::Chunked).in_transaction());
        assert!(!Phase::Greeted.in_transaction());
    }
}
