//! Duplex byte-stream transports for chanmux.
//!
//! A chanmux connection needs nothing more than a reliable, ordered byte
//! stream that can be cloned into a read half and a write half and shut down
//! from a third handle. This crate provides that over:
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//! - in-process socket pairs (tests and same-process endpoints)
//!
//! This is the lowest layer of chanmux. Everything else builds on top of
//! the [`DuplexStream`] type provided here.

pub mod error;
pub mod stream;
pub mod tcp;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::DuplexStream;
pub use tcp::TcpSocket;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
