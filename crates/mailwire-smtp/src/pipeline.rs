//! Command pipelining (RFC 2920).
//!
// Allow missing_const_for_fn since many can't be const due to VecDeque operations.
#![allow(clippy::missing_const_for_fn)]
//!
//! With PIPELINING a client may put several commands on the wire before
//! reading their replies. SMTP answers strictly in order, so replies are
//! matched to commands by position alone.
//!
//! ## Runs
//!
//! Commands leave in runs. A run is sent in one write and then drained
//! completely before the next run goes out:
//!
//! - `MAIL`, `RCPT` and `RSET` may appear anywhere in a run
//! - `NOOP`, `VRFY`, `HELP` and `QUIT` may end a run
//! - `DATA`, `BDAT`, `AUTH`, `STARTTLS`, `EHLO` and `HELO` form a run of
//!   their own, since their reply decides how the following bytes are
//!   framed or interpreted
//!
//! ## Dependencies
//!
//! Because the queue only builds a run once every earlier reply is in, it
//! knows the outcome of the transaction so far. Queued `RCPT`, `DATA` and
//! `BDAT` are skipped, never sent, after a rejected `MAIL`; `DATA` and
//! `BDAT` are skipped when no recipient was accepted.
//!
//! The queue does no I/O. The client writes what [`Pipeline::next_batch`]
//! returns and feeds every reply it reads to [`Pipeline::complete`].

use std::collections::VecDeque;

use crate::command::{Command, ReplyShape};
use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Default maximum number of commands in one run.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Configuration for command pipelining.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Whether commands may be sent ahead of replies at all.
    pub enabled: bool,

    /// Maximum number of commands in one run.
    pub max_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl PipelineConfig {
    /// Creates a new pipeline configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum run length (at least 1).
    #[must_use]
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    /// Enables or disables pipelining.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Classification of commands for pipelining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineSafety {
    /// May appear anywhere in a run.
    Anywhere,
    /// May be pipelined, but nothing follows it in the same run.
    EndsGroup,
    /// Only sent once every prior reply is in, as a run of one.
    Alone,
}

/// A command in the queue, in flight, or answered.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// The command.
    pub command: Command,
    /// Its pipelining class.
    pub safety: PipelineSafety,
    /// The last reply received for it.
    pub reply: Option<Reply>,
    /// True if the queue dropped it without sending it.
    pub skipped: bool,
    owed: ReplyShape,
}

impl PendingCommand {
    /// Wraps a command for queuing.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            safety: command.pipeline_safety(),
            owed: command.reply_shape(),
            command,
            reply: None,
            skipped: false,
        }
    }

    /// Returns true if the command must be alone in its run.
    #[must_use]
    pub fn is_pipeline_breaking(&self) -> bool {
        self.safety == PipelineSafety::Alone
    }

    /// Returns true if the command was sent and answered with 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reply.as_ref().is_some_and(Reply::is_success)
    }
}

/// Where the queue stands with respect to message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Commands may be sent.
    Ready,
    /// `DATA` got its 354; only body bytes may go out until the body ends.
    AwaitingBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum MailStatus {
    #[default]
    None,
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default)]
struct TransactionStatus {
    mail: MailStatus,
    accepted: usize,
}

/// Command pipeline manager.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    queue: VecDeque<PendingCommand>,
    in_flight: VecDeque<PendingCommand>,
    completed: VecDeque<PendingCommand>,
    state: PipelineState,
    txn: TransactionStatus,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl Pipeline {
    /// Creates a new pipeline with the given configuration.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            completed: VecDeque::new(),
            state: PipelineState::Ready,
            txn: TransactionStatus::default(),
        }
    }

    /// Returns the pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Turns pipelining on or off, e.g. after EHLO.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    /// Returns the body state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Returns the number of commands not sent yet.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Returns the number of commands sent and not fully answered.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if nothing is queued or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    /// Returns true if the current transaction may carry a body: its
    /// `MAIL` was accepted along with at least one recipient.
    #[must_use]
    pub fn body_allowed(&self) -> bool {
        self.txn.mail == MailStatus::Accepted && self.txn.accepted > 0
    }

    /// Returns the number of recipients accepted in the current transaction.
    #[must_use]
    pub fn accepted_recipients(&self) -> usize {
        self.txn.accepted
    }

    /// Adds a command to the queue. Never blocks and never sends.
    pub fn queue(&mut self, command: Command) {
        self.queue.push_back(PendingCommand::new(command));
    }

    /// Takes the next run, serialized and ready for one write.
    ///
    /// Returns `None` while replies are outstanding, while a body is being
    /// written, or when nothing sendable is left. Skipped commands move
    /// straight to the completed list.
    pub fn next_batch(&mut self) -> Option<Vec<u8>> {
        if !self.in_flight.is_empty() || self.state == PipelineState::AwaitingBody {
            return None;
        }

        let mut wire = Vec::new();
        while let Some(next) = self.queue.front() {
            if self.depends_on_failure(&next.command) {
                if let Some(mut skipped) = self.queue.pop_front() {
                    tracing::debug!(command = %skipped.command, "skipping command");
                    skipped.skipped = true;
                    self.completed.push_back(skipped);
                }
                continue;
            }

            let safety = next.safety;
            if !self.in_flight.is_empty()
                && (safety == PipelineSafety::Alone || !self.config.enabled)
            {
                break;
            }

            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            self.note_sent(&pending.command);
            wire.extend_from_slice(&pending.command.serialize());
            self.in_flight.push_back(pending);

            if safety != PipelineSafety::Anywhere
                || !self.config.enabled
                || self.in_flight.len() >= self.config.max_depth
            {
                break;
            }
        }

        if self.in_flight.is_empty() {
            None
        } else {
            tracing::debug!(commands = self.in_flight.len(), "sending run");
            Some(wire)
        }
    }

    /// Matches a reply to the oldest in-flight command.
    ///
    /// Returns true if that command is now fully answered. A 354 to `DATA`
    /// and a 334 to `AUTH` leave it in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if no command is in flight.
    pub fn complete(&mut self, reply: Reply) -> Result<bool> {
        let Some(front) = self.in_flight.front_mut() else {
            tracing::warn!(code = %reply.code, "reply with no command in flight");
            return Err(Error::Protocol(format!(
                "Unsolicited reply: {}",
                reply.code
            )));
        };

        if let Some(owed) = front.owed.after(reply.code) {
            if matches!(front.command, Command::Data) && reply.code == ReplyCode::START_DATA {
                self.state = PipelineState::AwaitingBody;
            }
            front.owed = owed;
            front.reply = Some(reply);
            return Ok(false);
        }

        let Some(mut done) = self.in_flight.pop_front() else {
            return Ok(false);
        };
        done.reply = Some(reply);
        self.record(&done);
        self.completed.push_back(done);
        Ok(true)
    }

    /// Marks the end of a `DATA` body; its final reply is still owed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no body was expected.
    pub fn body_finished(&mut self) -> Result<()> {
        if self.state != PipelineState::AwaitingBody {
            return Err(Error::InvalidState("No message body in progress".into()));
        }
        self.state = PipelineState::Ready;
        Ok(())
    }

    /// Records the outcome of a BDAT chunk sent outside the queue.
    pub fn chunk_answered(&mut self, last: bool, reply: &Reply) {
        if last || !reply.is_success() {
            self.txn = TransactionStatus::default();
        }
    }

    /// Takes every answered or skipped command, in queue order.
    pub fn take_completed(&mut self) -> Vec<PendingCommand> {
        self.completed.drain(..).collect()
    }

    /// Clears all state.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight.clear();
        self.completed.clear();
        self.state = PipelineState::Ready;
        self.txn = TransactionStatus::default();
    }

    fn depends_on_failure(&self, command: &Command) -> bool {
        match command {
            Command::RcptTo { .. } => self.txn.mail == MailStatus::Rejected,
            Command::Data | Command::Bdat(_) => match self.txn.mail {
                MailStatus::Rejected => true,
                MailStatus::Accepted => self.txn.accepted == 0,
                MailStatus::None | MailStatus::Pending => false,
            },
            _ => false,
        }
    }

    fn note_sent(&mut self, command: &Command) {
        match command {
            Command::MailFrom { .. } => {
                self.txn = TransactionStatus {
                    mail: MailStatus::Pending,
                    accepted: 0,
                };
            }
            Command::Rset
            | Command::Ehlo { .. }
            | Command::Helo { .. }
            | Command::StartTls => self.txn = TransactionStatus::default(),
            _ => {}
        }
    }

    fn record(&mut self, done: &PendingCommand) {
        let success = done.is_success();
        match &done.command {
            Command::MailFrom { .. } => {
                self.txn.mail = if success {
                    MailStatus::Accepted
                } else {
                    MailStatus::Rejected
                };
            }
            Command::RcptTo { .. } if success => self.txn.accepted += 1,
            Command::Data => self.txn = TransactionStatus::default(),
            Command::Bdat(header) if header.last || !success => {
                self.txn = TransactionStatus::default();
            }
            _ => {}
        }
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

    fn mail(addr: &str) -> Command {
        Command::MailFrom {
            from: Address::new(addr).unwrap(),
            params: MailParams::default(),
        }
    }

    fn rcpt(addr: &str) -> Command {
        Command::RcptTo {
            to: Address::new(addr).unwrap(),
        }
    }

    fn reply(code: u16) -> Reply {
        Reply::new(ReplyCode::new(code), vec!["ok".into()])
    }

    fn text(batch: Option<Vec<u8>>) -> String {
        String::from_utf8(batch.unwrap()).unwrap()
    }

    #[test]
    fn test_pipeline_config_builder() {
        let config = PipelineConfig::new().max_depth(0).enabled(false);
        assert_eq!(config.max_depth, 1);
        assert!(!config.enabled);
        assert_eq!(PipelineConfig::default().max_depth, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn test_envelope_goes_out_in_one_run() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(mail("a@x"));
        pipeline.queue(rcpt("b@y"));
        pipeline.queue(rcpt("c@y"));
        pipeline.queue(Command::Data);

        assert_eq!(
            text(pipeline.next_batch()),
            "MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nRCPT TO:<c@y>\r\n"
        );
        assert_eq!(pipeline.in_flight_count(), 3);
        assert!(pipeline.next_batch().is_none());

        for _ in 0..3 {
            assert!(pipeline.complete(reply(250)).unwrap());
        }
        assert_eq!(text(pipeline.next_batch()), "DATA\r\n");
    }

    #[test]
    fn test_ends_group_closes_run() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(Command::Rset);
        pipeline.queue(Command::Noop);
        pipeline.queue(mail("a@x"));

        assert_eq!(text(pipeline.next_batch()), "RSET\r\nNOOP\r\n");
        pipeline.complete(reply(250)).unwrap();
        pipeline.complete(reply(250)).unwrap();
        assert_eq!(text(pipeline.next_batch()), "MAIL FROM:<a@x>\r\n");
    }

    #[test]
    fn test_alone_waits_for_prior_replies() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(Command::Ehlo {
            hostname: "client".into(),
        });
        pipeline.queue(mail("a@x"));

        assert_eq!(text(pipeline.next_batch()), "EHLO client\r\n");
        assert!(pipeline.next_batch().is_none());
        pipeline.complete(reply(250)).unwrap();
        assert_eq!(text(pipeline.next_batch()), "MAIL FROM:<a@x>\r\n");
    }

    #[test]
    fn test_disabled_sends_one_at_a_time() {
        let mut pipeline = Pipeline::new(PipelineConfig::new().enabled(false));
        pipeline.queue(mail("a@x"));
        pipeline.queue(rcpt("b@y"));

        assert_eq!(text(pipeline.next_batch()), "MAIL FROM:<a@x>\r\n");
        pipeline.complete(reply(250)).unwrap();
        assert_eq!(text(pipeline.next_batch()), "RCPT TO:<b@y>\r\n");
    }

    #[test]
    fn test_max_depth_splits_runs() {
        let mut pipeline = Pipeline::new(PipelineConfig::new().max_depth(2));
        pipeline.queue(mail("a@x"));
        pipeline.queue(rcpt("b@y"));
        pipeline.queue(rcpt("c@y"));

        pipeline.next_batch().unwrap();
        assert_eq!(pipeline.in_flight_count(), 2);
        assert_eq!(pipeline.queued_count(), 1);
    }

    #[test]
    fn test_failed_mail_skips_dependents() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(mail("a@x"));
        pipeline.queue(Command::Noop);
        pipeline.queue(rcpt("b@y"));
        pipeline.queue(Command::Data);
        pipeline.queue(Command::Bdat(ChunkHeader::new(0, true)));
        pipeline.queue(Command::Quit);

        pipeline.next_batch().unwrap();
        pipeline.complete(reply(550)).unwrap();
        pipeline.complete(reply(250)).unwrap();

        assert_eq!(text(pipeline.next_batch()), "QUIT\r\n");
        pipeline.complete(reply(221)).unwrap();

        let done = pipeline.take_completed();
        let skipped: Vec<_> = done
            .iter()
            .filter(|c| c.skipped)
            .map(|c| c.command.verb())
            .collect();
        assert_eq!(skipped, vec!["RCPT", "DATA", "BDAT"]);
        assert!(done.iter().filter(|c| c.skipped).all(|c| c.reply.is_none()));
        assert!(pipeline.is_idle());
    }

    #[test]
    fn test_failed_rcpt_keeps_later_rcpts() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(mail("a@x"));
        pipeline.queue(rcpt("bad@y"));
        pipeline.queue(rcpt("good@y"));

        pipeline.next_batch().unwrap();
        pipeline.complete(reply(250)).unwrap();
        pipeline.complete(reply(550)).unwrap();
        pipeline.complete(reply(250)).unwrap();
        assert_eq!(pipeline.accepted_recipients(), 1);
        assert!(pipeline.body_allowed());
    }

    #[test]
    fn test_data_without_recipients_is_skipped() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(mail("a@x"));
        pipeline.queue(rcpt("b@y"));
        pipeline.queue(Command::Data);

        pipeline.next_batch().unwrap();
        pipeline.complete(reply(250)).unwrap();
        pipeline.complete(reply(550)).unwrap();
        assert!(pipeline.next_batch().is_none());
        let done = pipeline.take_completed();
        assert!(done.last().unwrap().skipped);
        assert!(!pipeline.body_allowed());
    }

    #[test]
    fn test_data_awaits_body_then_final_reply() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(mail("a@x"));
        pipeline.queue(rcpt("b@y"));
        pipeline.queue(Command::Data);
        pipeline.queue(Command::Quit);

        pipeline.next_batch().unwrap();
        pipeline.complete(reply(250)).unwrap();
        pipeline.complete(reply(250)).unwrap();
        pipeline.next_batch().unwrap();

        assert!(!pipeline.complete(reply(354)).unwrap());
        assert_eq!(pipeline.state(), PipelineState::AwaitingBody);
        assert_eq!(pipeline.in_flight_count(), 1);
        assert!(pipeline.next_batch().is_none());

        pipeline.body_finished().unwrap();
        assert!(pipeline.next_batch().is_none());
        assert!(pipeline.complete(reply(250)).unwrap());
        assert!(!pipeline.body_allowed());
        assert_eq!(text(pipeline.next_batch()), "QUIT\r\n");
    }

    #[test]
    fn test_rejected_data_never_awaits_body() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(Command::Data);
        pipeline.next_batch().unwrap();
        assert!(pipeline.complete(reply(503)).unwrap());
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert!(pipeline.body_finished().is_err());
    }

    #[test]
    fn test_auth_challenge_keeps_command_in_flight() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(Command::Auth {
            mechanism: crate::types::AuthMechanism::Login,
            initial_response: None,
        });
        pipeline.next_batch().unwrap();
        assert!(!pipeline.complete(reply(334)).unwrap());
        assert!(!pipeline.complete(reply(334)).unwrap());
        assert!(pipeline.complete(reply(235)).unwrap());
    }

    #[test]
    fn test_unsolicited_reply_is_an_error() {
        let mut pipeline = Pipeline::default();
        assert!(matches!(
            pipeline.complete(reply(250)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_new_mail_clears_rejection() {
        let mut pipeline = Pipeline::default();
        pipeline.queue(mail("a@x"));
        pipeline.next_batch().unwrap();
        pipeline.complete(reply(550)).unwrap();

        pipeline.queue(mail("other@x"));
        pipeline.queue(rcpt("b@y"));
        assert_eq!(
            text(pipeline.next_batch()),
            "MAIL FROM:<other@x>\r\nRCPT TO:<b@y>\r\n"
        );
    }
}
