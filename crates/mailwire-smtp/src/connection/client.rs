//! SMTP client.
//!
//! Commands go through a [`Pipeline`], which decides what may share a
//! write. Message bodies are streamed through [`DataWriter`] (dot-stuffed)
//! or [`ChunkWriter`] (BDAT), which borrow the client until finished.

use std::collections::HashSet;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncRead, AsyncWrite};

use super::framed::{FramedStream, stalled_write};
use super::stream::{self, SmtpStream};
use super::ServerInfo;
use crate::codec::bdat::BdatWriter;
use crate::codec::dot::DotWriter;
use crate::command::{BodyType, Command, MailParams};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::pipeline::{PendingCommand, Pipeline, PipelineConfig, PipelineState};
use crate::types::{Address, AuthMechanism, Extension, Reply, ReplyCode};

/// Result of [`Client::send_mail`].
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Recipients the server accepted.
    pub accepted: Vec<Address>,
    /// Recipients the server refused, with its reply.
    pub rejected: Vec<(Address, Reply)>,
    /// Final reply to the message body.
    pub reply: Reply,
}

/// SMTP client over any byte stream.
#[derive(Debug)]
pub struct Client<S> {
    framed: FramedStream<S>,
    server_info: ServerInfo,
    config: ClientConfig,
    pipeline: Pipeline,
}

impl Client<SmtpStream> {
    /// Dials `hostname:port` over plain TCP and reads the greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the greeting is negative.
    pub async fn connect(hostname: &str, port: u16, config: ClientConfig) -> Result<Self> {
        let stream = stream::connect(hostname, port).await?;
        Self::from_stream(stream, config).await
    }

    /// Upgrades the connection with STARTTLS and repeats EHLO.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS was not advertised or is refused, or if
    /// the handshake or the second EHLO fails.
    pub async fn starttls(mut self, hostname: &str) -> Result<Self> {
        if !self.server_info.supports(&Extension::StartTls) {
            return Err(Error::NotSupported("STARTTLS".into()));
        }
        let reply = self.command(Command::StartTls).await?;
        if !reply.is_success() {
            return Err(Error::from_reply(&reply));
        }

        let Self {
            framed,
            server_info,
            config,
            ..
        } = self;
        let stream = framed.into_inner().upgrade_to_tls(hostname).await?;
        let mut client = Self::with_stream(stream, config, server_info.hostname);
        client.ehlo().await?;
        Ok(client)
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream and reads the server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the greeting fails or it is negative.
    pub async fn from_stream(stream: S, config: ClientConfig) -> Result<Self> {
        let mut client = Self::with_stream(stream, config, String::new());
        let greeting = client.framed.read_reply().await?;
        tracing::debug!(direction = "<<", reply = %greeting, "greeting");
        if !greeting.is_success() {
            return Err(Error::from_reply(&greeting));
        }

        client.server_info.hostname = greeting
            .message
            .first()
            .and_then(|msg| msg.split_whitespace().next())
            .unwrap_or("unknown")
            .to_string();
        Ok(client)
    }

    fn with_stream(stream: S, config: ClientConfig, hostname: String) -> Self {
        let framed = FramedStream::new(stream)
            .with_max_line_length(config.max_line_length)
            .with_timeouts(Some(config.command_timeout), Some(config.command_timeout));
        let pipeline = Pipeline::new(
            PipelineConfig::new()
                .enabled(false)
                .max_depth(config.max_pipeline_depth),
        );
        Self {
            framed,
            server_info: ServerInfo {
                hostname,
                extensions: HashSet::new(),
            },
            config,
            pipeline,
        }
    }

    /// Returns what the server announced.
    #[must_use]
    pub const fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Returns the client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends EHLO and records the server's extensions, falling back to
    /// HELO if EHLO is refused.
    ///
    /// # Errors
    ///
    /// Returns an error if both greetings are refused.
    pub async fn ehlo(&mut self) -> Result<()> {
        let hostname = self.config.local_name.clone();
        let reply = self
            .command(Command::Ehlo {
                hostname: hostname.clone(),
            })
            .await?;

        let mut extensions = HashSet::new();
        if reply.is_success() {
            extensions.extend(reply.message.iter().skip(1).map(|line| Extension::parse(line)));
        } else if reply.is_permanent_error() {
            tracing::debug!(code = %reply.code, "EHLO refused, falling back to HELO");
            let reply = self.command(Command::Helo { hostname }).await?;
            if !reply.is_success() {
                return Err(Error::from_reply(&reply));
            }
        } else {
            return Err(Error::from_reply(&reply));
        }

        self.server_info.extensions = extensions;
        let pipelining =
            self.config.pipelining && self.server_info.supports(&Extension::Pipelining);
        self.pipeline.set_enabled(pipelining);
        tracing::debug!(
            extensions = self.server_info.extensions.len(),
            pipelining,
            "greeted server"
        );
        Ok(())
    }

    /// Authenticates with AUTH PLAIN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if PLAIN was not advertised, or the
    /// server's rejection.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<()> {
        if !self.server_info.auth_mechanisms().contains(&AuthMechanism::Plain) {
            return Err(Error::NotSupported("AUTH PLAIN".into()));
        }

        let credentials = format!("\0{username}\0{password}");
        let reply = self
            .command(Command::Auth {
                mechanism: AuthMechanism::Plain,
                initial_response: Some(STANDARD.encode(credentials.as_bytes())),
            })
            .await?;
        if !reply.is_success() {
            return Err(Error::from_reply(&reply));
        }
        Ok(())
    }

    /// Sends `commands`, pipelining where permitted, and returns each with
    /// its reply. Commands the queue skipped have no reply.
    ///
    /// Every reply owed for what was sent is read before returning, even
    /// when an early command fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for DATA or BDAT (use
    /// [`data`](Self::data) or [`bdat`](Self::bdat)) or while a body is
    /// unfinished; otherwise only transport and protocol errors.
    pub async fn execute(&mut self, commands: Vec<Command>) -> Result<Vec<PendingCommand>> {
        if self.pipeline.state() == PipelineState::AwaitingBody {
            return Err(Error::InvalidState("Message body left unfinished".into()));
        }
        if let Some(body) = commands
            .iter()
            .find(|c| matches!(c, Command::Data | Command::Bdat(_)))
        {
            return Err(Error::InvalidState(format!(
                "{} needs a body writer",
                body.verb()
            )));
        }

        for command in commands {
            self.pipeline.queue(command);
        }
        while let Some(run) = self.pipeline.next_batch() {
            tracing::debug!(
                direction = ">>",
                commands = self.pipeline.in_flight_count(),
                "command run"
            );
            self.framed.send(&run).await?;
            while let Some(challenge) = self.drain().await? {
                // Only AUTH can be left waiting here, and nothing can answer it.
                tracing::debug!(reply = %challenge, "cancelling SASL challenge");
                self.framed.send(b"*\r\n").await?;
            }
        }
        Ok(self.pipeline.take_completed())
    }

    /// Sends a single command and returns its reply.
    async fn command(&mut self, command: Command) -> Result<Reply> {
        self.execute(vec![command])
            .await?
            .pop()
            .and_then(|done| done.reply)
            .ok_or_else(|| Error::Protocol("Command was not answered".into()))
    }

    /// Reads replies until nothing is in flight, or until the oldest
    /// command is left waiting on the client after an intermediate reply.
    async fn drain(&mut self) -> Result<Option<Reply>> {
        while self.pipeline.in_flight_count() > 0 {
            let reply = self.framed.read_reply().await?;
            tracing::debug!(direction = "<<", %reply, "reply");
            let intermediate = reply.is_intermediate();
            if !self.pipeline.complete(reply.clone())? && intermediate {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    /// Sends a complete message.
    ///
    /// MAIL and RCPT go out as one pipelined run where possible. The body
    /// follows with BDAT when the server offers CHUNKING and the
    /// configuration prefers it, otherwise with DATA.
    ///
    /// # Errors
    ///
    /// Fails if MAIL is refused, every recipient is refused, or the body is
    /// refused. Refused recipients alone are reported in [`Delivery`].
    pub async fn send_mail(
        &mut self,
        from: Address,
        recipients: &[Address],
        body: &[u8],
    ) -> Result<Delivery> {
        if recipients.is_empty() {
            return Err(Error::InvalidState("No recipients".into()));
        }
        let size = body.len() as u64;
        if let Some(max) = self
            .server_info
            .max_message_size()
            .filter(|&max| max > 0 && size > max)
        {
            return Err(Error::MessageTooLarge(max));
        }

        let params = self.mail_params(&from, recipients, body);
        let mut commands = vec![Command::MailFrom { from, params }];
        commands.extend(recipients.iter().map(|to| Command::RcptTo { to: to.clone() }));

        let mut done = self.execute(commands).await?.into_iter();
        let mail = done
            .next()
            .and_then(|c| c.reply)
            .ok_or_else(|| Error::Protocol("MAIL was not answered".into()))?;
        if !mail.is_success() {
            return Err(Error::from_reply(&mail));
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for pending in done {
            let Command::RcptTo { to } = pending.command else {
                continue;
            };
            match pending.reply {
                Some(reply) if reply.is_success() => accepted.push(to),
                Some(reply) => rejected.push((to, reply)),
                None => {}
            }
        }
        if accepted.is_empty() {
            self.reset().await?;
            return Err(rejected.first().map_or_else(
                || Error::Protocol("No recipient accepted".into()),
                |(_, reply)| Error::from_reply(reply),
            ));
        }

        let reply = if self.use_chunking() {
            let mut writer = self.bdat(Some(size)).await?;
            writer.write(body).await?;
            writer.finish().await?
        } else {
            let mut writer = self.data().await?;
            writer.write(body).await?;
            writer.finish().await?
        };
        if !reply.is_success() {
            return Err(Error::from_reply(&reply));
        }

        Ok(Delivery {
            accepted,
            rejected,
            reply,
        })
    }

    fn use_chunking(&self) -> bool {
        self.config.prefer_chunking && self.server_info.supports(&Extension::Chunking)
    }

    fn mail_params(&self, from: &Address, recipients: &[Address], body: &[u8]) -> MailParams {
        let info = &self.server_info;
        let mut params = MailParams::default();
        if info.supports(&Extension::Size(None)) {
            params.size = Some(body.len() as u64);
        }
        if !body.is_ascii() && info.supports(&Extension::EightBitMime) {
            params.body = Some(BodyType::EightBitMime);
        }
        let international = !from.as_str().is_ascii()
            || recipients.iter().any(|to| !to.as_str().is_ascii());
        if international && info.supports(&Extension::SmtpUtf8) {
            params.smtputf8 = true;
        }
        params
    }

    /// Sends DATA and returns a writer for the dot-stuffed body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no recipient was accepted, or the
    /// server's refusal of DATA.
    pub async fn data(&mut self) -> Result<DataWriter<'_, S>> {
        if !self.pipeline.is_idle() {
            return Err(Error::InvalidState("Commands still in flight".into()));
        }
        self.pipeline.queue(Command::Data);
        let Some(run) = self.pipeline.next_batch() else {
            self.pipeline.take_completed();
            return Err(Error::InvalidState("No accepted recipients for DATA".into()));
        };
        self.framed.send(&run).await?;

        match self.drain().await? {
            Some(reply) if reply.code == ReplyCode::START_DATA => {}
            _ => {
                let reply = self
                    .pipeline
                    .take_completed()
                    .pop()
                    .and_then(|done| done.reply)
                    .ok_or_else(|| Error::Protocol("DATA was not answered".into()))?;
                return Err(Error::from_reply(&reply));
            }
        }

        Ok(DataWriter {
            body: DotWriter::new(&mut self.framed),
            pipeline: &mut self.pipeline,
            submission_timeout: self.config.submission_timeout,
            command_timeout: self.config.command_timeout,
        })
    }

    /// Returns a writer that sends the body as BDAT chunks.
    ///
    /// With a `size_hint`, the chunk that completes the body carries LAST;
    /// otherwise [`ChunkWriter::finish`] sends a final, possibly empty, one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] without CHUNKING, or
    /// [`Error::InvalidState`] if no recipient was accepted.
    pub async fn bdat(&mut self, size_hint: Option<u64>) -> Result<ChunkWriter<'_, S>> {
        if !self.server_info.supports(&Extension::Chunking) {
            return Err(Error::NotSupported("CHUNKING".into()));
        }
        if !self.pipeline.is_idle() {
            return Err(Error::InvalidState("Commands still in flight".into()));
        }
        if !self.pipeline.body_allowed() {
            return Err(Error::InvalidState("No accepted recipients for BDAT".into()));
        }
        self.framed.flush().await?;

        let mut writer = BdatWriter::new(&mut self.framed, self.config.chunk_size);
        if let Some(total) = size_hint {
            writer = writer.with_size_hint(total);
        }
        Ok(ChunkWriter {
            writer,
            pipeline: &mut self.pipeline,
            pipelined: self.config.pipeline_bdat
                && self.server_info.supports(&Extension::Pipelining),
            owed: 0,
            failure: None,
            last_reply: None,
            submission_timeout: self.config.submission_timeout,
            command_timeout: self.config.command_timeout,
        })
    }

    /// Sends RSET.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal or a transport error.
    pub async fn reset(&mut self) -> Result<()> {
        let reply = self.command(Command::Rset).await?;
        if !reply.is_success() {
            return Err(Error::from_reply(&reply));
        }
        Ok(())
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal or a transport error.
    pub async fn noop(&mut self) -> Result<()> {
        let reply = self.command(Command::Noop).await?;
        if !reply.is_success() {
            return Err(Error::from_reply(&reply));
        }
        Ok(())
    }

    /// Sends QUIT and closes the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not acknowledge.
    pub async fn quit(mut self) -> Result<()> {
        let reply = self.command(Command::Quit).await?;
        if reply.code != ReplyCode::CLOSING {
            return Err(Error::from_reply(&reply));
        }
        Ok(())
    }
}

/// Reads one reply under `timeout`, then restores the command timeout.
async fn read_final<S>(
    framed: &mut FramedStream<S>,
    timeout: Duration,
    restore: Duration,
) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.set_read_timeout(Some(timeout));
    let reply = framed.read_reply().await;
    framed.set_read_timeout(Some(restore));
    let reply = reply?;
    tracing::debug!(direction = "<<", %reply, "final reply");
    Ok(reply)
}

/// Dot-stuffed body of one message, after the server's 354.
pub struct DataWriter<'a, S> {
    body: DotWriter<&'a mut FramedStream<S>>,
    pipeline: &'a mut Pipeline,
    submission_timeout: Duration,
    command_timeout: Duration,
}

impl<S> DataWriter<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Appends body bytes. Line endings are sent as given.
    ///
    /// # Errors
    ///
    /// Returns a transport error, or [`Error::Timeout`] if the server stops
    /// taking bytes for the command timeout.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stall = Some(self.command_timeout);
        self.body
            .write(data)
            .await
            .map_err(|err| stalled_write(err, stall))
    }

    /// Streams `reader` into the body.
    ///
    /// # Errors
    ///
    /// Returns a source or transport error.
    pub async fn write_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let stall = Some(self.command_timeout);
        self.body
            .write_from(reader)
            .await
            .map_err(|err| stalled_write(err, stall))
    }

    /// Terminates the body and returns the server's final reply.
    ///
    /// # Errors
    ///
    /// Returns a transport error. A refusal is returned as a reply.
    pub async fn finish(self) -> Result<Reply> {
        let stall = Some(self.command_timeout);
        let framed = self
            .body
            .finish()
            .await
            .map_err(|err| stalled_write(err, stall))?;
        self.pipeline.body_finished()?;
        let reply = read_final(framed, self.submission_timeout, self.command_timeout).await?;
        self.pipeline.complete(reply.clone())?;
        self.pipeline.take_completed();
        Ok(reply)
    }
}

/// BDAT body of one message.
///
/// Unless BDAT pipelining is configured (and the server pipelines), each
/// chunk's reply is read before the next chunk goes out, and a refused
/// chunk fails the write that sent it.
pub struct ChunkWriter<'a, S> {
    writer: BdatWriter<&'a mut FramedStream<S>>,
    pipeline: &'a mut Pipeline,
    pipelined: bool,
    owed: usize,
    failure: Option<Reply>,
    last_reply: Option<Reply>,
    submission_timeout: Duration,
    command_timeout: Duration,
}

impl<S> ChunkWriter<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Appends body bytes, sending full chunks as they fill.
    ///
    /// # Errors
    ///
    /// Returns a transport error, a size-hint violation, or a refused chunk.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        let stall = Some(self.command_timeout);
        while !data.is_empty() {
            let progress = self
                .writer
                .write(data)
                .await
                .map_err(|err| stalled_write(err, stall))?;
            data = &data[progress.consumed..];
            if progress.chunk_sent {
                self.chunk_sent().await?;
            }
        }
        Ok(())
    }

    /// Streams `reader` into the body, one chunk at a time. With a size hint
    /// it stops once the declared total has gone out.
    ///
    /// # Errors
    ///
    /// Same as [`ChunkWriter::write`], plus source errors.
    pub async fn write_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let stall = Some(self.command_timeout);
        let mut total = 0;
        loop {
            let progress = self
                .writer
                .fill_from(reader)
                .await
                .map_err(|err| stalled_write(err, stall))?;
            total += progress.consumed as u64;
            if progress.chunk_sent {
                self.chunk_sent().await?;
            }
            if self.writer.is_sealed() || (progress.consumed == 0 && !progress.chunk_sent) {
                return Ok(total);
            }
        }
    }

    /// Number of chunks sent so far.
    #[must_use]
    pub const fn chunks_sent(&self) -> u32 {
        self.writer.chunks_sent()
    }

    /// Sends the LAST chunk if still due and returns the final reply.
    ///
    /// With pipelined chunks, the first refusal among them is returned in
    /// place of the final reply.
    ///
    /// # Errors
    ///
    /// Returns a transport error or a size-hint violation.
    pub async fn finish(mut self) -> Result<Reply> {
        if !self.writer.is_sealed() {
            let stall = Some(self.command_timeout);
            self.writer
                .seal()
                .await
                .map_err(|err| stalled_write(err, stall))?;
            self.chunk_sent().await?;
        }
        let reply = self
            .last_reply
            .take()
            .ok_or_else(|| Error::Protocol("BDAT LAST was not answered".into()))?;
        Ok(self.failure.take().unwrap_or(reply))
    }

    async fn chunk_sent(&mut self) -> Result<()> {
        let last = self.writer.is_sealed();
        if self.pipelined && !last {
            self.owed += 1;
            return Ok(());
        }

        let command_timeout = self.command_timeout;
        while self.owed > 0 {
            let framed = self.writer.get_mut();
            let reply = read_final(framed, command_timeout, command_timeout).await?;
            self.owed -= 1;
            if !reply.is_success() && self.failure.is_none() {
                self.failure = Some(reply);
            }
        }

        let timeout = if last {
            self.submission_timeout
        } else {
            command_timeout
        };
        let reply = read_final(self.writer.get_mut(), timeout, command_timeout).await?;
        self.pipeline.chunk_answered(last, &reply);
        if last {
            self.last_reply = Some(reply);
            return Ok(());
        }
        if !reply.is_success() {
            return Err(Error::from_reply(&reply));
        }
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
    use tokio::io::DuplexStream;
    use tokio_test::io::Builder;

    const GREETING: &[u8] = b"220 mx.example.org ESMTP ready\r\n";

    fn config() -> ClientConfig {
        ClientConfig::builder("client.test").build()
    }

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_greeting_sets_hostname() {
        let mock = Builder::new().read(GREETING).build();
        let client = Client::from_stream(mock, config()).await.unwrap();
        assert_eq!(client.server_info().hostname, "mx.example.org");
    }

    #[tokio::test]
    async fn test_negative_greeting() {
        let mock = Builder::new().read(b"554 5.3.2 go away\r\n").build();
        let err = Client::from_stream(mock, config()).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_ehlo_falls_back_to_helo() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"EHLO client.test\r\n")
            .read(b"502 5.5.1 Command not implemented\r\n")
            .write(b"HELO client.test\r\n")
            .read(b"250 mx.example.org\r\n")
            .build();
        let mut client = Client::from_stream(mock, config()).await.unwrap();
        client.ehlo().await.unwrap();
        assert!(client.server_info().extensions.is_empty());
        assert!(!client.pipeline.config().enabled);
    }

    #[tokio::test]
    async fn test_pipelined_envelope_then_data() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"EHLO client.test\r\n")
            .read(b"250-mx.example.org\r\n250-PIPELINING\r\n250-8BITMIME\r\n250 SIZE 1000\r\n")
            .write(b"MAIL FROM:<a@x> SIZE=7\r\nRCPT TO:<b@y>\r\nRCPT TO:<c@z>\r\n")
            .read(b"250 2.1.0 ok\r\n250 2.1.5 ok\r\n550 5.1.1 no such user\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go ahead\r\n")
            .write(b"hello\r\n.\r\n")
            .read(b"250 2.0.0 queued\r\n")
            .build();
        let mut client = Client::from_stream(mock, config()).await.unwrap();
        client.ehlo().await.unwrap();

        let delivery = client
            .send_mail(addr("a@x"), &[addr("b@y"), addr("c@z")], b"hello\r\n")
            .await
            .unwrap();
        assert_eq!(delivery.accepted, vec![addr("b@y")]);
        assert_eq!(delivery.rejected.len(), 1);
        assert_eq!(delivery.rejected[0].1.code, ReplyCode::new(550));
        assert_eq!(delivery.reply.code, ReplyCode::OK);
    }

    /// A server that answered everything up front and then stops reading.
    async fn stalled_server(replies: &[u8]) -> (DuplexStream, DuplexStream) {
        use tokio::io::AsyncWriteExt;

        let (client_io, mut server_io) = tokio::io::duplex(4096);
        server_io.write_all(replies).await.unwrap();
        (client_io, server_io)
    }

    fn envelope() -> Vec<Command> {
        vec![
            Command::MailFrom {
                from: addr("a@x"),
                params: MailParams::default(),
            },
            Command::RcptTo { to: addr("b@y") },
        ]
    }

    #[tokio::test]
    async fn test_data_body_write_times_out() {
        let (client_io, _server_io) = stalled_server(
            b"220 mx.example.org ready\r\n250 mx.example.org\r\n\
              250 2.1.0 ok\r\n250 2.1.5 ok\r\n354 go ahead\r\n",
        )
        .await;
        let config = ClientConfig::builder("client.test")
            .command_timeout(Duration::from_millis(100))
            .build();
        let mut client = Client::from_stream(client_io, config).await.unwrap();
        client.ehlo().await.unwrap();
        client.execute(envelope()).await.unwrap();

        let mut body = client.data().await.unwrap();
        let big = vec![b'a'; 1024 * 1024];
        let outcome = tokio::time::timeout(Duration::from_secs(2), body.write(&big)).await;
        let err = outcome.expect("the write deadline should fire first").unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_bdat_chunk_write_times_out() {
        let (client_io, _server_io) = stalled_server(
            b"220 mx.example.org ready\r\n250-mx.example.org\r\n250 CHUNKING\r\n\
              250 2.1.0 ok\r\n250 2.1.5 ok\r\n",
        )
        .await;
        let config = ClientConfig::builder("client.test")
            .command_timeout(Duration::from_millis(100))
            .chunk_size(64 * 1024)
            .build();
        let mut client = Client::from_stream(client_io, config).await.unwrap();
        client.ehlo().await.unwrap();
        client.execute(envelope()).await.unwrap();

        let mut body = client.bdat(None).await.unwrap();
        let big = vec![b'a'; 256 * 1024];
        let outcome = tokio::time::timeout(Duration::from_secs(2), body.write(&big)).await;
        let err = outcome.expect("the write deadline should fire first").unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_message_over_advertised_size() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"EHLO client.test\r\n")
            .read(b"250-mx.example.org\r\n250 SIZE 4\r\n")
            .build();
        let mut client = Client::from_stream(mock, config()).await.unwrap();
        client.ehlo().await.unwrap();

        let err = client
            .send_mail(addr("a@x"), &[addr("b@y")], b"too long")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge(4)));
    }

    #[tokio::test]
    async fn test_rejected_mail_skips_recipients() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"MAIL FROM:<a@x>\r\n")
            .read(b"550 5.7.1 sender denied\r\n")
            .write(b"NOOP\r\n")
            .read(b"250 2.0.0 OK\r\n")
            .build();
        let mut client = Client::from_stream(mock, config()).await.unwrap();

        let done = client
            .execute(vec![
                Command::MailFrom {
                    from: addr("a@x"),
                    params: MailParams::default(),
                },
                Command::RcptTo { to: addr("b@y") },
                Command::Noop,
            ])
            .await
            .unwrap();
        assert_eq!(done.len(), 3);
        assert_eq!(done[0].reply.as_ref().unwrap().code, ReplyCode::new(550));
        assert!(done[1].skipped);
        assert!(done[1].reply.is_none());
        assert!(done[2].is_success());
    }

    #[tokio::test]
    async fn test_execute_refuses_body_commands() {
        let mock = Builder::new().read(GREETING).build();
        let mut client = Client::from_stream(mock, config()).await.unwrap();
        let err = client.execute(vec![Command::Data]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_bdat_chunks_with_size_hint() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"EHLO client.test\r\n")
            .read(b"250-mx.example.org\r\n250-PIPELINING\r\n250 CHUNKING\r\n")
            .write(b"MAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\n")
            .read(b"250 2.1.0 ok\r\n250 2.1.5 ok\r\n")
            .write(b"BDAT 4\r\nabcd")
            .read(b"250 2.0.0 4 octets received\r\n")
            .write(b"BDAT 2 LAST\r\nef")
            .read(b"250 2.0.0 queued\r\n")
            .build();
        let config = ClientConfig::builder("client.test").chunk_size(4).build();
        let mut client = Client::from_stream(mock, config).await.unwrap();
        client.ehlo().await.unwrap();

        let delivery = client
            .send_mail(addr("a@x"), &[addr("b@y")], b"abcdef")
            .await
            .unwrap();
        assert_eq!(delivery.reply.message_text(), "queued");
    }

    #[tokio::test]
    async fn test_refused_chunk_fails_write() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"EHLO client.test\r\n")
            .read(b"250-mx.example.org\r\n250 CHUNKING\r\n")
            .write(b"MAIL FROM:<a@x>\r\n")
            .read(b"250 2.1.0 ok\r\n")
            .write(b"RCPT TO:<b@y>\r\n")
            .read(b"250 2.1.5 ok\r\n")
            .write(b"BDAT 4\r\nabcd")
            .read(b"552 5.3.4 too big\r\n")
            .build();
        let config = ClientConfig::builder("client.test").chunk_size(4).build();
        let mut client = Client::from_stream(mock, config).await.unwrap();
        client.ehlo().await.unwrap();

        let err = client
            .send_mail(addr("a@x"), &[addr("b@y")], b"abcdef")
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_auth_plain() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"EHLO client.test\r\n")
            .read(b"250-mx.example.org\r\n250 AUTH PLAIN LOGIN\r\n")
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"235 2.7.0 Authentication successful\r\n")
            .build();
        let mut client = Client::from_stream(mock, config()).await.unwrap();
        client.ehlo().await.unwrap();
        client.auth_plain("user", "pass").await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_challenge_is_cancelled() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 VXNlcm5hbWU6\r\n")
            .write(b"*\r\n")
            .read(b"501 5.0.0 Authentication cancelled\r\n")
            .build();
        let mut client = Client::from_stream(mock, config()).await.unwrap();
        let done = client
            .execute(vec![Command::Auth {
                mechanism: AuthMechanism::Login,
                initial_response: None,
            }])
            .await
            .unwrap();
        assert_eq!(done[0].reply.as_ref().unwrap().code, ReplyCode::new(501));
    }

    #[tokio::test]
    async fn test_quit() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"QUIT\r\n")
            .read(b"221 2.0.0 Bye\r\n")
            .build();
        let client = Client::from_stream(mock, config()).await.unwrap();
        client.quit().await.unwrap();
    }
}
