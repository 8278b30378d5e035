//! Typed channel multiplexing over one duplex connection.
//!
//! A [`Connection`] owns a framed byte stream and a read-loop thread. A
//! [`Multiplexer`] attached to it shares that stream among many independent
//! [`Channel`]s, each carrying one [`Payload`] type in order. Channels are
//! opened with a request/accept/decline handshake decided by the peer's
//! [`Handler`] for that payload type, and closed with a single `close` notice
//! from either side.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use chanmux_mux::{connect, AcceptAll, Multiplexer, MuxListener};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // server
//! let listener = MuxListener::bind("/tmp/chanmux.sock")?;
//! let conn = listener.accept()?;
//! let mux = Multiplexer::attach(&conn);
//! mux.add_handler(AcceptAll::<String>::new());
//! conn.start()?;
//!
//! // client
//! let conn = connect("/tmp/chanmux.sock")?;
//! let mux = Multiplexer::attach(&conn);
//! conn.start()?;
//! let channel = mux.establish_new_channel::<String>(Duration::from_secs(4))?;
//! channel.send(&"hello".to_string())?;
//! channel.close()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod connection;
pub mod connector;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod multiplexer;
pub mod payload;
#[cfg(feature = "secure")]
pub mod secure;

pub use channel::{Channel, ChannelState};
pub use connection::{
    CloseReason, Connection, ConnectionConfig, ConnectionState, ReceiveError, Receiver,
};
#[cfg(unix)]
pub use connector::{connect, connect_with, MuxListener};
pub use connector::{connect_tcp, wrap_stream, ConnectOptions};
pub use envelope::Envelope;
#[cfg(feature = "secure")]
pub use error::SecureError;
pub use error::{ConnectionError, MuxError, Result};
pub use handler::{AcceptAll, Handler, Listener, RequestError};
pub use multiplexer::{Multiplexer, MultiplexerConfig, DEFAULT_ESTABLISH_TIMEOUT};
pub use payload::{ChannelId, Payload, Side};
#[cfg(feature = "secure")]
pub use secure::{handshake_client, handshake_server, SecureConfig, SessionCipher};
