//! # mailwire-smtp
//!
//! The transfer core of an SMTP implementation (RFC 5321): both ends of the
//! wire, without queueing, routing or storage.
//!
//! ## Features
//!
//! - **Server sessions**: a per-connection state machine that enforces
//!   command order, pipelines replies and hands completed messages to a
//!   [`MessageHandler`](server::MessageHandler)
//! - **Body codecs**: streaming dot-stuffing for `DATA` and length-prefixed
//!   chunks for `BDAT` (RFC 3030), both in constant memory
//! - **Pipelined client**: a command queue that batches what RFC 2920
//!   allows and matches replies to commands by position
//! - **TLS**: STARTTLS on both sides, implicit TLS for clients
//! - **Extensions**: PIPELINING, CHUNKING, BINARYMIME, 8BITMIME, SIZE,
//!   SMTPUTF8, ENHANCEDSTATUSCODES, AUTH
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailwire_smtp::{Address, Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> mailwire_smtp::Result<()> {
//!     let config = ClientConfig::builder("client.example.com").build();
//!     let mut client = Client::connect("smtp.example.com", 587, config).await?;
//!     client.ehlo().await?;
//!     let mut client = client.starttls("smtp.example.com").await?;
//!     client.auth_plain("user@example.com", "password").await?;
//!
//!     let from = Address::new("sender@example.com")?;
//!     let to = Address::new("recipient@example.com")?;
//!     let message = b"Subject: Test\r\n\r\nHello, World!\r\n";
//!     client.send_mail(from, &[to], message).await?;
//!
//!     client.quit().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: line scanner, dot-stuffing and BDAT chunk codecs
//! - [`command`]: SMTP commands, parsing and serialization
//! - [`config`]: server and client settings
//! - [`connection`]: transports, line framing and the client
//! - [`parser`]: reply parser
//! - [`pipeline`]: client command queue
//! - [`server`]: server sessions and message handlers
//! - [`types`]: core SMTP types (addresses, extensions, replies)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
mod error;
pub mod parser;
pub mod pipeline;
pub mod server;
pub mod types;

pub use command::{Command, MailParams};
pub use config::{ClientConfig, ServerConfig};
pub use connection::{Client, Delivery, ServerInfo};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineConfig};
pub use server::{MessageHandler, Session};
pub use types::{Address, AuthMechanism, EnhancedCode, Extension, Reply, ReplyCode};
