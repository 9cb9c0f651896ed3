//! SMTP server sessions.
//!
//! A [`Session`] owns one accepted connection and runs it to completion on
//! the caller's task. Shared settings come in as an `Arc<ServerConfig>`;
//! everything else is per connection.
//!
//! ```ignore
//! let config = Arc::new(ServerConfig::builder("mx.example.org").build());
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     let config = Arc::clone(&config);
//!     tokio::spawn(async move {
//!         Session::new(socket, LoggingHandler, config).serve().await
//!     });
//! }
//! ```

mod body;
mod handler;
mod session;
mod state;

pub use body::Body;
pub use handler::{
    AuthStep, CollectingHandler, Envelope, LoggingHandler, Message, MessageHandler, NoopHandler,
    local_error,
};
pub use session::{Outcome, Session, TlsUpgrade};
pub use state::{Phase, Transaction, TransferMode};
