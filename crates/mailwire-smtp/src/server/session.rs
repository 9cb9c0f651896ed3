//! One server connection, from greeting to QUIT.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncRead, AsyncWrite};

use super::body::Body;
use super::handler::{AuthStep, Envelope, MessageHandler};
use super::state::{Phase, Transaction, TransferMode};
use crate::codec::bdat::{ChunkHeader, ChunkLimits};
use crate::command::{BodyType, Command, MailParams, ReplyShape};
use crate::config::ServerConfig;
use crate::connection::FramedStream;
use crate::error::{Error, Result};
use crate::types::{Address, AuthMechanism, EnhancedCode, Extension, Reply, ReplyCode};

/// How [`Session::serve`] ended without a fatal error.
#[derive(Debug)]
pub enum Outcome<S, H> {
    /// The session is over. The handler is handed back.
    Closed(H),
    /// The client issued STARTTLS and was told to go ahead.
    StartTls(TlsUpgrade<S, H>),
}

/// A session paused for a TLS handshake.
///
/// Holds the raw stream and the handler. Input the client pipelined behind
/// STARTTLS has already been discarded.
#[derive(Debug)]
pub struct TlsUpgrade<S, H> {
    stream: S,
    handler: H,
    config: Arc<ServerConfig>,
}

impl<S, H> TlsUpgrade<S, H>
where
    H: MessageHandler,
{
    /// Returns the raw stream.
    pub const fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Runs `handshake` over the raw stream and returns a fresh session on
    /// the encrypted one: no greeting, no negotiated extensions, no
    /// transaction.
    ///
    /// ```ignore
    /// let session = upgrade.resume(|tcp| acceptor.accept(tcp)).await?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns the handshake's I/O error.
    pub async fn resume<T, F, Fut>(self, handshake: F) -> Result<Session<T, H>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let stream = handshake(self.stream).await?;
        let mut session = Session::new(stream, self.handler, self.config).with_tls(true);
        session.greet = false;
        Ok(session)
    }
}

enum Flow {
    Continue,
    Close,
    StartTls,
}

/// Server side of one SMTP connection.
///
/// Reads commands, checks them against the current [`Phase`], consults the
/// [`MessageHandler`] and answers. Replies are queued and only flushed once
/// the client has nothing more buffered, so a pipelined group is answered
/// in one write. Replies the client must see before it can go on (354,
/// 334, the STARTTLS 220) are flushed at once.
pub struct Session<S, H> {
    framed: FramedStream<S>,
    handler: H,
    config: Arc<ServerConfig>,
    phase: Phase,
    client_name: Option<String>,
    extended: bool,
    tls: bool,
    authenticated: bool,
    greet: bool,
    transaction: Option<Transaction>,
    owed: Option<ReplyShape>,
    line_errors: usize,
}

impl<S, H: fmt::Debug> fmt::Debug for Session<S, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handler", &self.handler)
            .field("hostname", &self.config.hostname)
            .field("phase", &self.phase)
            .field("client_name", &self.client_name)
            .field("extended", &self.extended)
            .field("tls", &self.tls)
            .field("authenticated", &self.authenticated)
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}

impl<S, H> Session<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: MessageHandler,
{
    /// Creates a session over an accepted connection.
    pub fn new(stream: S, handler: H, config: Arc<ServerConfig>) -> Self {
        let framed = FramedStream::new(stream)
            .with_max_line_length(config.max_line_length)
            .with_timeouts(Some(config.read_timeout), Some(config.write_timeout));
        Self {
            framed,
            handler,
            config,
            phase: Phase::Initial,
            client_name: None,
            extended: false,
            tls: false,
            authenticated: false,
            greet: true,
            transaction: None,
            owed: None,
            line_errors: 0,
        }
    }

    /// Marks the connection as already encrypted (implicit TLS).
    #[must_use]
    pub const fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Returns the current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the handler.
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Runs the session until QUIT, a STARTTLS hand-off or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the session: transport faults,
    /// timeouts (after a best-effort `421`), truncated bodies or chunks,
    /// and malformed BDAT headers (after a `501`).
    pub async fn serve(mut self) -> Result<Outcome<S, H>> {
        tracing::info!(tls = self.tls, "session started");

        if self.greet {
            let greeting = Reply::new(
                ReplyCode::SERVICE_READY,
                vec![format!("{} ESMTP Service Ready", self.config.hostname)],
            );
            self.owed = Some(ReplyShape::Final);
            self.respond(greeting);
            self.framed.flush().await?;
        }

        loop {
            match self.step().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => {
                    self.framed.flush().await?;
                    tracing::info!("session ended");
                    return Ok(Outcome::Closed(self.handler));
                }
                Ok(Flow::StartTls) => {
                    self.framed.flush().await?;
                    tracing::info!("handing connection over for TLS");
                    return Ok(Outcome::StartTls(TlsUpgrade {
                        stream: self.framed.into_inner(),
                        handler: self.handler,
                        config: self.config,
                    }));
                }
                Err(err) => {
                    if matches!(err, Error::Timeout(_)) {
                        self.timed_out().await;
                    }
                    self.reset_transaction();
                    tracing::info!(error = %err, "session aborted");
                    return Err(err);
                }
            }
        }
    }

    async fn step(&mut self) -> Result<Flow> {
        let flow = match self.framed.read_line().await {
            Ok(line) => self.handle_line(&line).await?,
            Err(Error::LineTooLong(max)) => self.line_too_long(max),
            Err(err) => return Err(err),
        };

        if let Some(owed) = self.owed.take() {
            tracing::warn!(?owed, "command left without its final reply");
        }
        if matches!(flow, Flow::Continue) && !self.framed.has_buffered_input() {
            self.framed.flush().await?;
        }
        Ok(flow)
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        self.owed = Some(ReplyShape::Final);
        match Command::parse(line) {
            Ok(command) => {
                tracing::debug!(%command, "command");
                self.owed = Some(command.reply_shape());
                self.dispatch(command).await
            }
            Err(err) => {
                let verb = line.split(' ').next().unwrap_or_default();
                tracing::debug!(verb, error = %err, "rejected command line");
                self.reject_line(verb, err).await
            }
        }
    }

    async fn reject_line(&mut self, verb: &str, err: Error) -> Result<Flow> {
        let reply = match err {
            Error::InvalidChunkHeader(text) => {
                // The payload size is unknown, so the stream cannot be resynchronized.
                self.respond(status_reply(ReplyCode::PARAMETER_ERROR, (5, 5, 4), &text));
                self.framed.flush().await?;
                return Err(Error::InvalidChunkHeader(text));
            }
            Error::UnknownCommand(_) => status_reply(
                ReplyCode::SYNTAX_ERROR,
                (5, 5, 1),
                "Command not recognized",
            ),
            Error::NotSupported(_) if verb.eq_ignore_ascii_case("AUTH") => status_reply(
                ReplyCode::PARAMETER_NOT_IMPLEMENTED,
                (5, 5, 4),
                "Unrecognized authentication type",
            ),
            Error::NotSupported(_) => status_reply(
                ReplyCode::PARAMETERS_NOT_RECOGNIZED,
                (5, 5, 4),
                "Parameters not recognized or not implemented",
            ),
            other => status_reply(ReplyCode::PARAMETER_ERROR, (5, 5, 4), &other.to_string()),
        };
        self.respond(reply);
        Ok(Flow::Continue)
    }

    fn line_too_long(&mut self, max: usize) -> Flow {
        self.line_errors += 1;
        self.owed = Some(ReplyShape::Final);
        tracing::warn!(max, violations = self.line_errors, "command line too long");

        if self.line_errors >= self.config.max_line_errors {
            self.respond(status_reply(
                ReplyCode::SERVICE_UNAVAILABLE,
                (4, 7, 0),
                "Too many protocol errors, closing connection",
            ));
            return Flow::Close;
        }
        self.respond(status_reply(ReplyCode::SYNTAX_ERROR, (5, 5, 2), "Line too long"));
        Flow::Continue
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow> {
        if let Some(reply) = self.policy_refusal(&command) {
            if let Command::Bdat(header) = command {
                let timeout = Some(self.config.data_timeout);
                self.framed.discard_chunk(header, timeout).await?;
            }
            tracing::debug!(code = %reply.code, "command refused by connection policy");
            self.respond(reply);
            return Ok(Flow::Continue);
        }

        if let Command::Bdat(header) = command {
            self.bdat(header).await?;
            return Ok(Flow::Continue);
        }

        if matches!(command, Command::MailFrom { .. })
            && self.phase.in_transaction()
            && self.config.implicit_reset_on_mail
        {
            tracing::warn!("MAIL inside a transaction, resetting it");
            self.reset_transaction();
            self.phase = Phase::Greeted;
        }

        if let Err(reply) = self.phase.permits(&command) {
            self.respond(reply);
            return Ok(Flow::Continue);
        }

        match command {
            Command::Helo { hostname } => self.greeted(hostname, false),
            Command::Ehlo { hostname } => self.greeted(hostname, true),
            Command::StartTls => return Ok(self.starttls()),
            Command::Auth {
                mechanism,
                initial_response,
            } => self.auth(mechanism, initial_response).await?,
            Command::MailFrom { from, params } => self.mail(from, params),
            Command::RcptTo { to } => self.rcpt(to),
            Command::Data => self.data().await?,
            Command::Rset => {
                self.reset_transaction();
                self.phase = if self.client_name.is_some() {
                    Phase::Greeted
                } else {
                    Phase::Initial
                };
                self.respond(status_reply(ReplyCode::OK, (2, 0, 0), "Reset OK"));
            }
            Command::Vrfy { address } => {
                let reply = self.handler.verify(&address).unwrap_or_else(|| {
                    status_reply(
                        ReplyCode::CANNOT_VERIFY,
                        (2, 5, 0),
                        "Cannot VRFY user, but will accept message and attempt delivery",
                    )
                });
                self.respond(reply);
            }
            Command::Help { .. } => self.respond(status_reply(
                ReplyCode::HELP,
                (2, 0, 0),
                "Supported commands: EHLO HELO MAIL RCPT DATA BDAT RSET VRFY NOOP HELP QUIT",
            )),
            Command::Noop => self.respond(status_reply(ReplyCode::OK, (2, 0, 0), "OK")),
            Command::Quit => {
                self.reset_transaction();
                self.phase = Phase::Quit;
                self.respond(status_reply(ReplyCode::CLOSING, (2, 0, 0), "Bye"));
                return Ok(Flow::Close);
            }
            Command::Bdat(_) => {}
        }
        Ok(Flow::Continue)
    }

    /// Refuses everything but the session-management commands while the
    /// configuration demands TLS or AUTH that has not happened yet.
    fn policy_refusal(&self, command: &Command) -> Option<Reply> {
        if self.phase == Phase::Initial {
            return None;
        }
        let exempt = matches!(
            command,
            Command::Helo { .. }
                | Command::Ehlo { .. }
                | Command::Noop
                | Command::Vrfy { .. }
                | Command::Rset
                | Command::Quit
                | Command::StartTls
        );
        if exempt {
            return None;
        }
        if self.config.enforce_tls && !self.tls {
            return Some(status_reply(
                ReplyCode::ACCESS_DENIED,
                (5, 7, 0),
                "Must issue a STARTTLS command first",
            ));
        }
        if self.config.enforce_auth
            && !self.authenticated
            && !matches!(command, Command::Auth { .. })
        {
            return Some(status_reply(
                ReplyCode::ACCESS_DENIED,
                (5, 7, 0),
                "Authentication required",
            ));
        }
        None
    }

    fn greeted(&mut self, client: String, extended: bool) {
        if extended && self.config.enforce_auth && self.handler.auth_mechanisms().is_empty() {
            tracing::warn!("authentication enforced but no mechanism available");
            self.respond(status_reply(
                ReplyCode::LOCAL_ERROR,
                (4, 0, 0),
                "No auth mechanism available but authentication enforced",
            ));
            return;
        }
        self.reset_transaction();
        self.extended = extended;
        self.phase = Phase::Greeted;

        let mut lines = vec![format!("{} Hello {client}", self.config.hostname)];
        if extended {
            lines.extend(self.capabilities().iter().map(ToString::to_string));
        }
        self.client_name = Some(client);
        self.respond(Reply::new(ReplyCode::OK, lines));
    }

    fn capabilities(&self) -> Vec<Extension> {
        let config = &self.config;
        let mut caps = Vec::new();
        if config.pipelining {
            caps.push(Extension::Pipelining);
        }
        caps.push(Extension::EightBitMime);
        caps.push(Extension::EnhancedStatusCodes);
        if config.chunking {
            caps.push(Extension::Chunking);
            if config.binarymime {
                caps.push(Extension::BinaryMime);
            }
        }
        if config.smtputf8 {
            caps.push(Extension::SmtpUtf8);
        }
        if config.requiretls && self.tls {
            caps.push(Extension::RequireTls);
        }
        if config.starttls && !self.tls {
            caps.push(Extension::StartTls);
        }
        let mechanisms = self.handler.auth_mechanisms();
        if !mechanisms.is_empty() && (self.tls || config.allow_insecure_auth) {
            caps.push(Extension::Auth(mechanisms));
        }
        caps.push(Extension::Size(Some(config.max_message_bytes)));
        caps
    }

    /// Returns true if `extension` was advertised in an EHLO reply.
    fn offers(&self, extension: &Extension) -> bool {
        self.extended
            && self
                .capabilities()
                .iter()
                .any(|cap| cap.same_keyword(extension))
    }

    fn starttls(&mut self) -> Flow {
        if !self.offers(&Extension::StartTls) {
            self.respond(status_reply(
                ReplyCode::NOT_IMPLEMENTED,
                (5, 5, 1),
                "STARTTLS not available",
            ));
            return Flow::Continue;
        }
        self.reset_transaction();
        self.respond(status_reply(
            ReplyCode::SERVICE_READY,
            (2, 0, 0),
            "Ready to start TLS",
        ));
        Flow::StartTls
    }

    async fn auth(
        &mut self,
        mechanism: AuthMechanism,
        initial_response: Option<String>,
    ) -> Result<()> {
        if self.authenticated {
            self.respond(status_reply(
                ReplyCode::BAD_SEQUENCE,
                (5, 5, 1),
                "Already authenticated",
            ));
            return Ok(());
        }
        let mechanisms = self.handler.auth_mechanisms();
        if !mechanisms.is_empty() && !self.tls && !self.config.allow_insecure_auth {
            self.respond(status_reply(
                ReplyCode::ENCRYPTION_REQUIRED,
                (5, 7, 11),
                "Encryption required for requested authentication mechanism",
            ));
            return Ok(());
        }
        if !self.extended || !mechanisms.contains(&mechanism) {
            self.respond(status_reply(
                ReplyCode::PARAMETER_NOT_IMPLEMENTED,
                (5, 5, 4),
                "Unrecognized authentication type",
            ));
            return Ok(());
        }

        self.phase = Phase::Authenticating;
        let result = self.auth_exchange(mechanism, initial_response).await;
        self.phase = Phase::Greeted;
        result
    }

    async fn auth_exchange(
        &mut self,
        mechanism: AuthMechanism,
        initial_response: Option<String>,
    ) -> Result<()> {
        let mut response = match initial_response.as_deref() {
            None => None,
            Some("=") => Some(Vec::new()),
            Some(encoded) => match STANDARD.decode(encoded) {
                Ok(decoded) => Some(decoded),
                Err(_) => {
                    self.respond(invalid_base64());
                    return Ok(());
                }
            },
        };

        loop {
            match self.handler.auth(mechanism, response.as_deref()) {
                AuthStep::Challenge(challenge) => {
                    self.respond(Reply::new(
                        ReplyCode::AUTH_CONTINUE,
                        vec![STANDARD.encode(challenge)],
                    ));
                    self.framed.flush().await?;

                    let line = match self.framed.read_line().await {
                        Ok(line) => line,
                        Err(Error::LineTooLong(_)) => {
                            self.respond(status_reply(
                                ReplyCode::SYNTAX_ERROR,
                                (5, 5, 6),
                                "Authentication exchange line is too long",
                            ));
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    };
                    let line = line.trim();
                    if line == "*" {
                        self.respond(status_reply(
                            ReplyCode::PARAMETER_ERROR,
                            (5, 0, 0),
                            "Authentication cancelled",
                        ));
                        return Ok(());
                    }
                    match STANDARD.decode(line) {
                        Ok(decoded) => response = Some(decoded),
                        Err(_) => {
                            self.respond(invalid_base64());
                            return Ok(());
                        }
                    }
                }
                AuthStep::Accepted => {
                    self.authenticated = true;
                    tracing::info!(mechanism = mechanism.as_str(), "client authenticated");
                    self.respond(status_reply(
                        ReplyCode::AUTH_SUCCEEDED,
                        (2, 7, 0),
                        "Authentication successful",
                    ));
                    return Ok(());
                }
                AuthStep::Rejected(reply) => {
                    tracing::info!(mechanism = mechanism.as_str(), "authentication failed");
                    self.respond(reply);
                    return Ok(());
                }
            }
        }
    }

    fn mail(&mut self, from: Address, params: MailParams) {
        if !self.extended && params != MailParams::default() {
            self.respond(status_reply(
                ReplyCode::PARAMETERS_NOT_RECOGNIZED,
                (5, 5, 4),
                "Parameters not recognized or not implemented",
            ));
            return;
        }
        if params.size.is_some_and(|size| size > self.config.max_message_bytes) {
            self.respond(too_large());
            return;
        }
        let unsupported = (params.body == Some(BodyType::BinaryMime)
            && !self.offers(&Extension::BinaryMime))
            || (params.smtputf8 && !self.offers(&Extension::SmtpUtf8));
        if unsupported {
            self.respond(status_reply(
                ReplyCode::PARAMETERS_NOT_RECOGNIZED,
                (5, 5, 4),
                "Parameters not recognized or not implemented",
            ));
            return;
        }
        if params.require_tls && !self.offers(&Extension::RequireTls) {
            self.respond(status_reply(
                ReplyCode::PARAMETER_NOT_IMPLEMENTED,
                (5, 5, 4),
                "REQUIRETLS is not implemented",
            ));
            return;
        }
        if let Err(reply) = self.handler.mail(&from, &params) {
            self.respond(reply);
            return;
        }

        let text = format!("Originator {from} ok");
        let mut envelope = Envelope::new(from, params);
        envelope.client_name.clone_from(&self.client_name);
        envelope.tls = self.tls;
        envelope.authenticated = self.authenticated;
        let limits = ChunkLimits {
            max_chunk: self.config.max_chunk_bytes,
            max_message: Some(self.config.max_message_bytes),
        };
        self.transaction = Some(Transaction::new(envelope, limits));
        self.phase = Phase::Mail;
        self.respond(status_reply(ReplyCode::OK, (2, 1, 0), &text));
    }

    fn rcpt(&mut self, to: Address) {
        let Some(txn) = self.transaction.as_ref() else {
            self.respond(status_reply(
                ReplyCode::BAD_SEQUENCE,
                (5, 5, 1),
                "Need MAIL command",
            ));
            return;
        };
        if txn.envelope.recipients.len() >= self.config.max_recipients {
            self.respond(status_reply(
                ReplyCode::INSUFFICIENT_STORAGE,
                (4, 5, 3),
                "Too many recipients",
            ));
            return;
        }

        match self.handler.rcpt(&txn.envelope, &to) {
            Err(reply) => self.respond(reply),
            Ok(()) => {
                let text = format!("Recipient {to} ok");
                if let Some(txn) = self.transaction.as_mut() {
                    txn.envelope.recipients.push(to);
                }
                self.phase = Phase::Rcpt;
                self.respond(status_reply(ReplyCode::OK, (2, 1, 5), &text));
            }
        }
    }

    async fn data(&mut self) -> Result<()> {
        let Some(mut txn) = self.transaction.take() else {
            self.respond(status_reply(
                ReplyCode::BAD_SEQUENCE,
                (5, 5, 1),
                "Need MAIL command",
            ));
            return Ok(());
        };
        if txn.envelope.params.body == Some(BodyType::BinaryMime) {
            self.transaction = Some(txn);
            self.respond(status_reply(
                ReplyCode::BAD_SEQUENCE,
                (5, 5, 1),
                "BINARYMIME requires BDAT",
            ));
            return Ok(());
        }

        self.respond(Reply::new(
            ReplyCode::START_DATA,
            vec!["Start mail input; end with <CRLF>.<CRLF>".to_string()],
        ));
        self.framed.flush().await?;
        self.phase = Phase::Body(TransferMode::DotStuffed);
        txn.envelope.mode = Some(TransferMode::DotStuffed);

        let envelope = txn.envelope;
        let limit = Some(self.config.max_message_bytes);
        let timeout = Some(self.config.data_timeout);
        let (verdict, received) = {
            let mut body = Body::dot_stuffed(self.framed.buffered_reader(), limit, timeout);
            let verdict = self.handler.data(&envelope, &mut body).await;
            (verdict, body.finish().await)
        };
        self.conclude(&envelope, verdict, received)
    }

    async fn bdat(&mut self, header: ChunkHeader) -> Result<()> {
        let timeout = Some(self.config.data_timeout);

        let refusal = if self.offers(&Extension::Chunking) {
            self.phase.permits(&Command::Bdat(header)).err()
        } else {
            Some(status_reply(
                ReplyCode::BAD_SEQUENCE,
                (5, 5, 1),
                "BDAT not permitted: CHUNKING not negotiated",
            ))
        };
        let txn = match (refusal, self.transaction.take()) {
            (None, Some(txn)) => txn,
            (refusal, txn) => {
                self.transaction = txn;
                self.framed.discard_chunk(header, timeout).await?;
                self.respond(refusal.unwrap_or_else(|| {
                    status_reply(ReplyCode::BAD_SEQUENCE, (5, 5, 1), "Need MAIL command")
                }));
                return Ok(());
            }
        };

        let mut txn = txn;
        txn.envelope.mode = Some(TransferMode::Chunked);
        self.phase = Phase::Body(TransferMode::Chunked);

        match self
            .framed
            .read_chunk(&mut txn.chunks, header, &mut txn.body, timeout)
            .await
        {
            Ok(()) if txn.is_terminal() => return self.deliver(txn).await,
            Ok(()) => {
                self.transaction = Some(txn);
                let text = format!("{} octets received", header.size);
                self.respond(status_reply(ReplyCode::OK, (2, 0, 0), &text));
            }
            Err(err @ (Error::ChunkTooLarge { .. } | Error::MessageTooLarge(_))) => {
                tracing::warn!(error = %err, "BDAT chunk rejected");
                self.abandon();
                self.respond(too_large());
            }
            Err(Error::InvalidState(text)) => {
                self.abandon();
                self.respond(status_reply(ReplyCode::BAD_SEQUENCE, (5, 5, 1), &text));
            }
            Err(err) => {
                self.abandon();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Hands an assembled BDAT body to the handler.
    ///
    /// Chunks are buffered rather than streamed: each one is answered as it
    /// arrives, and the handler's verdict only becomes the reply to `LAST`.
    async fn deliver(&mut self, txn: Transaction) -> Result<()> {
        let Transaction { envelope, body, .. } = txn;
        let mut body = Body::from_bytes(body.freeze());
        let verdict = self.handler.data(&envelope, &mut body).await;
        let received = body.finish().await;
        self.conclude(&envelope, verdict, received)
    }

    /// Sends the reply for a finished body. A body that failed to arrive
    /// intact wins over the handler's verdict.
    fn conclude(
        &mut self,
        envelope: &Envelope,
        verdict: std::result::Result<Option<String>, Reply>,
        received: Result<u64>,
    ) -> Result<()> {
        self.phase = Phase::Greeted;
        let size = match received {
            Ok(size) => size,
            Err(Error::BodyTooLarge(limit)) => {
                tracing::warn!(limit, "message body too large");
                self.abandon();
                self.respond(too_large());
                return Ok(());
            }
            Err(err) => {
                self.abandon();
                return Err(err);
            }
        };

        match verdict {
            Ok(id) => {
                tracing::info!(
                    from = %envelope.from,
                    recipients = envelope.recipients.len(),
                    size,
                    mode = ?envelope.mode,
                    "message accepted"
                );
                let text = id.map_or_else(|| "OK".to_string(), |id| format!("OK: queued as {id}"));
                self.respond(status_reply(ReplyCode::OK, (2, 0, 0), &text));
            }
            Err(reply) => {
                tracing::info!(code = %reply.code, "message rejected by handler");
                self.respond(reply);
            }
        }
        Ok(())
    }

    /// Drops the open transaction, if any, and tells the handler.
    fn reset_transaction(&mut self) {
        if self.transaction.take().is_some() {
            self.handler.reset();
        }
    }

    /// Ends a transaction whose body failed; it was already taken out.
    fn abandon(&mut self) {
        self.handler.reset();
        self.phase = Phase::Greeted;
    }

    fn respond(&mut self, reply: Reply) {
        match self.owed {
            Some(shape) => self.owed = shape.after(reply.code),
            None => tracing::warn!(code = %reply.code, "reply with no command awaiting one"),
        }
        tracing::debug!(%reply, "reply");
        self.framed.queue_reply(&reply);
    }

    async fn timed_out(&mut self) {
        let text = format!("{} Error: timeout exceeded", self.config.hostname);
        self.framed.queue_reply(&status_reply(
            ReplyCode::SERVICE_UNAVAILABLE,
            (4, 4, 2),
            &text,
        ));
        if let Err(err) = self.framed.flush().await {
            tracing::debug!(error = %err, "could not send timeout reply");
        }
    }
}

fn status_reply(code: ReplyCode, (class, subject, detail): (u8, u16, u16), text: &str) -> Reply {
    Reply::with_status(code, EnhancedCode::new(class, subject, detail), text)
}

fn too_large() -> Reply {
    status_reply(
        ReplyCode::EXCEEDED_STORAGE,
        (5, 3, 4),
        "Message size exceeds fixed maximum message size",
    )
}

fn invalid_base64() -> Reply {
    status_reply(ReplyCode::PARAMETER_ERROR, (5, 5, 2), "Invalid base64 data")
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
    use crate::config::ServerConfigBuilder;
    use crate::server::CollectingHandler;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    /// Runs `script` through a session and returns the handler and the raw
    /// reply stream. Scripts must end the session (QUIT or a fatal error).
    async fn run<H: MessageHandler>(
        config: ServerConfig,
        handler: H,
        script: &[u8],
        tls: bool,
    ) -> (Result<H>, String) {
        let (mut client, server) = duplex(64 * 1024);
        client.write_all(script).await.unwrap();
        let result = Session::new(server, handler, Arc::new(config))
            .with_tls(tls)
            .serve()
            .await
            .map(|outcome| match outcome {
                Outcome::Closed(handler) => handler,
                Outcome::StartTls(_) => panic!("unexpected STARTTLS hand-off"),
            });
        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        (result, output)
    }

    /// Final line of each reply.
    fn finals(output: &str) -> Vec<&str> {
        output
            .split("\r\n")
            .filter(|line| line.len() == 3 || line.as_bytes().get(3) == Some(&b' '))
            .collect()
    }

    fn codes(output: &str) -> Vec<u16> {
        finals(output)
            .iter()
            .map(|line| line[..3].parse().unwrap())
            .collect()
    }

    fn config() -> ServerConfigBuilder {
        ServerConfig::builder("mx.test")
    }

    /// Offers PLAIN and accepts `user`/`pass`.
    #[derive(Debug, Default)]
    struct Plain {
        messages: usize,
    }

    impl MessageHandler for Plain {
        async fn data(
            &mut self,
            _envelope: &Envelope,
            _body: &mut Body<'_>,
        ) -> std::result::Result<Option<String>, Reply> {
            self.messages += 1;
            Ok(None)
        }

        fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
            vec![AuthMechanism::Plain]
        }

        fn auth(&mut self, _mechanism: AuthMechanism, response: Option<&[u8]>) -> AuthStep {
            match response {
                Some(b"\0user\0pass") => AuthStep::Accepted,
                _ => AuthStep::Rejected(status_reply(
                    ReplyCode::AUTH_FAILED,
                    (5, 7, 8),
                    "Authentication credentials invalid",
                )),
            }
        }
    }

    #[tokio::test]
    async fn recipient_cap_answers_452() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<b@y>\r\n\
            RCPT TO:<c@y>\r\n\
            RCPT TO:<d@y>\r\n\
            QUIT\r\n";
        let config = config().max_recipients(2).build();
        let (result, output) = run(config, CollectingHandler::new(), script, false).await;
        result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 250, 250, 250, 452, 221]);
        assert!(output.contains("452 4.5.3 Too many recipients\r\n"));
    }

    #[tokio::test]
    async fn nested_mail_is_out_of_sequence() {
        let script = b"EHLO c\r\nMAIL FROM:<a@x>\r\nMAIL FROM:<b@x>\r\nQUIT\r\n";
        let (result, output) = run(config().build(), CollectingHandler::new(), script, false).await;
        result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 250, 503, 221]);
        assert!(output.contains("503 5.5.1 Nested MAIL command\r\n"));
    }

    #[tokio::test]
    async fn nested_mail_restarts_transaction_when_configured() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<r@y>\r\n\
            MAIL FROM:<b@x>\r\n\
            RCPT TO:<s@y>\r\n\
            DATA\r\nbody\r\n.\r\n\
            QUIT\r\n";
        let config = config().implicit_reset_on_mail(true).build();
        let (result, output) = run(config, CollectingHandler::new(), script, false).await;
        let handler = result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 250, 250, 250, 250, 354, 250, 221]);
        assert_eq!(handler.resets, 1);
        let envelope = &handler.messages[0].envelope;
        assert_eq!(envelope.from, Address::new("b@x").unwrap());
        assert_eq!(envelope.recipients, vec![Address::new("s@y").unwrap()]);
    }

    #[tokio::test]
    async fn disabled_extensions_refuse_mail_parameters() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x> SMTPUTF8\r\n\
            MAIL FROM:<a@x> BODY=BINARYMIME\r\n\
            QUIT\r\n";
        let config = config().smtputf8(false).binarymime(false).build();
        let (result, output) = run(config, CollectingHandler::new(), script, false).await;
        result.unwrap();

        assert!(!output.contains("SMTPUTF8"));
        assert!(!output.contains("BINARYMIME"));
        assert_eq!(codes(&output), vec![220, 250, 555, 555, 221]);
    }

    #[tokio::test]
    async fn zero_length_chunk_keeps_transaction_open() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<b@y>\r\n\
            BDAT 3\r\nabc\
            BDAT 0\r\n\
            BDAT 2 LAST\r\nde\
            QUIT\r\n";
        let (result, output) = run(config().build(), CollectingHandler::new(), script, false).await;
        let handler = result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 250, 250, 250, 250, 250, 221]);
        assert!(output.contains("250 2.0.0 0 octets received\r\n"));
        assert_eq!(&handler.messages[0].body[..], b"abcde");
    }

    #[tokio::test]
    async fn chunk_after_refused_chunk_is_drained() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<b@y>\r\n\
            BDAT 8\r\n01234567\
            BDAT 3 LAST\r\nabc\
            NOOP\r\n\
            QUIT\r\n";
        let config = config().max_chunk_bytes(4).build();
        let (result, output) = run(config, CollectingHandler::new(), script, false).await;
        let handler = result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 250, 250, 552, 503, 250, 221]);
        assert!(output.contains("503 5.5.1 Need MAIL command\r\n"));
        assert!(handler.messages.is_empty());
    }

    #[tokio::test]
    async fn vrfy_and_help() {
        let script = b"EHLO c\r\nVRFY someone\r\nHELP\r\nQUIT\r\n";
        let (result, output) = run(config().build(), CollectingHandler::new(), script, false).await;
        result.unwrap();

        let finals = finals(&output);
        assert!(finals[2].starts_with("252 2.5.0 Cannot VRFY user"));
        assert!(finals[3].starts_with("214 2.0.0 Supported commands:"));
    }

    #[tokio::test]
    async fn auth_refused_inside_transaction_and_after_success() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x>\r\n\
            AUTH PLAIN AHVzZXIAcGFzcw==\r\n\
            RSET\r\n\
            AUTH PLAIN AHVzZXIAcGFzcw==\r\n\
            AUTH PLAIN AHVzZXIAcGFzcw==\r\n\
            QUIT\r\n";
        let config = config().allow_insecure_auth(true).build();
        let (result, output) = run(config, Plain::default(), script, false).await;
        result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 250, 503, 250, 235, 503, 221]);
        assert!(output.contains("503 5.5.1 Command not permitted during a mail transaction\r\n"));
        assert!(output.contains("503 5.5.1 Already authenticated\r\n"));
    }

    #[tokio::test]
    async fn enforced_tls_gates_transactions() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x>\r\n\
            NOOP\r\n\
            HELP\r\n\
            BDAT 3 LAST\r\nabc\
            VRFY someone\r\n\
            QUIT\r\n";
        let config = config().enforce_tls(true).build();
        let (result, output) = run(config, CollectingHandler::new(), script, false).await;
        result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 530, 250, 530, 530, 252, 221]);
        assert!(output.contains("530 5.7.0 Must issue a STARTTLS command first\r\n"));
    }

    #[tokio::test]
    async fn enforced_tls_is_satisfied_by_tls() {
        let script = b"EHLO c\r\nMAIL FROM:<a@x>\r\nQUIT\r\n";
        let config = config().enforce_tls(true).build();
        let (result, output) = run(config, CollectingHandler::new(), script, true).await;
        result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 250, 221]);
    }

    #[tokio::test]
    async fn enforced_auth_gates_until_authenticated() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x>\r\n\
            AUTH PLAIN AHVzZXIAd3Jvbmc=\r\n\
            MAIL FROM:<a@x>\r\n\
            AUTH PLAIN AHVzZXIAcGFzcw==\r\n\
            MAIL FROM:<a@x>\r\n\
            RCPT TO:<b@y>\r\n\
            DATA\r\nhi\r\n.\r\n\
            QUIT\r\n";
        let config = config().enforce_auth(true).build();
        let (result, output) = run(config, Plain::default(), script, true).await;
        let handler = result.unwrap();

        assert_eq!(
            codes(&output),
            vec![220, 250, 530, 535, 530, 235, 250, 250, 354, 250, 221]
        );
        assert!(output.contains("530 5.7.0 Authentication required\r\n"));
        assert_eq!(handler.messages, 1);
    }

    #[tokio::test]
    async fn enforced_auth_without_mechanisms_refuses_ehlo() {
        let script = b"EHLO c\r\nQUIT\r\n";
        let config = config().enforce_auth(true).build();
        let (result, output) = run(config, CollectingHandler::new(), script, true).await;
        result.unwrap();

        assert_eq!(codes(&output), vec![220, 451, 221]);
        assert!(output.contains(
            "451 4.0.0 No auth mechanism available but authentication enforced\r\n"
        ));
    }

    #[tokio::test]
    async fn requiretls_only_offered_over_tls() {
        let script = b"EHLO c\r\nMAIL FROM:<a@x> REQUIRETLS\r\nQUIT\r\n";
        let config = config().requiretls(true).build();
        let (result, output) = run(config, CollectingHandler::new(), script, false).await;
        result.unwrap();

        assert!(!output.contains("250-REQUIRETLS"));
        assert_eq!(codes(&output), vec![220, 250, 504, 221]);
        assert!(output.contains("504 5.5.4 REQUIRETLS is not implemented\r\n"));
    }

    #[tokio::test]
    async fn requiretls_accepted_over_tls() {
        let script = b"EHLO c\r\n\
            MAIL FROM:<a@x> REQUIRETLS\r\n\
            RCPT TO:<b@y>\r\n\
            DATA\r\nhi\r\n.\r\n\
            QUIT\r\n";
        let config = config().requiretls(true).build();
        let (result, output) = run(config, CollectingHandler::new(), script, true).await;
        let handler = result.unwrap();

        assert!(output.contains("250-REQUIRETLS\r\n"));
        assert_eq!(codes(&output), vec![220, 250, 250, 250, 354, 250, 221]);
        assert!(handler.messages[0].envelope.params.require_tls);
        assert!(handler.messages[0].envelope.tls);
    }

    #[tokio::test]
    async fn requiretls_not_offered_unless_enabled() {
        let script = b"EHLO c\r\nMAIL FROM:<a@x> REQUIRETLS\r\nQUIT\r\n";
        let (result, output) = run(config().build(), CollectingHandler::new(), script, true).await;
        result.unwrap();

        assert_eq!(codes(&output), vec![220, 250, 504, 221]);
    }

    #[test]
    fn debug_shows_session_state() {
        let (_client, server) = tokio::io::duplex(64);
        let session = Session::new(server, CollectingHandler::new(), Arc::new(config().build()));
        let text = format!("{session:?}");
        assert!(text.starts_with("Session {"));
        assert!(text.contains("hostname: \"mx.test\""));
        assert!(text.contains("phase: Initial"));
        assert!(text.contains("tls: false"));
    }
}
