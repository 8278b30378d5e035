//! Dialing and accepting connections.
//!
//! These helpers turn a fresh byte stream into an unstarted [`Connection`],
//! running the secure key agreement first when it is configured. Attach a
//! [`Multiplexer`](crate::Multiplexer) and then call `start`.

use std::net::ToSocketAddrs;
use std::path::Path;

use chanmux_frame::{FrameConfig, FrameReader, FrameWriter};
use chanmux_transport::{DuplexStream, TcpSocket};
#[cfg(unix)]
use chanmux_transport::UnixDomainSocket;
use tracing::info;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ConnectionError;
use crate::payload::Side;
#[cfg(feature = "secure")]
use crate::secure::{handshake_client, handshake_server, SecureConfig};

type Result<T> = std::result::Result<T, ConnectionError>;

/// How to set up a connection on a fresh stream.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub connection: ConnectionConfig,
    /// Run the key agreement and encrypt every frame.
    #[cfg(feature = "secure")]
    pub secure: Option<SecureConfig>,
}

impl ConnectOptions {
    #[cfg(feature = "secure")]
    pub fn secure(mut self, config: SecureConfig) -> Self {
        self.secure = Some(config);
        self
    }
}

/// Build an unstarted connection over an established stream.
pub fn wrap_stream(stream: DuplexStream, side: Side, options: &ConnectOptions) -> Result<Connection> {
    #[cfg(feature = "secure")]
    {
        if let Some(secure) = &options.secure {
            let frame_config = FrameConfig {
                max_payload_size: secure.max_handshake_payload,
                read_timeout: Some(secure.timeout),
                write_timeout: Some(secure.timeout),
            };
            let mut reader = FrameReader::with_config_stream(stream.try_clone()?, frame_config.clone())?;
            let mut writer = FrameWriter::with_config_stream(stream, frame_config)?;

            let cipher = match side {
                Side::Client => handshake_client(&mut reader, &mut writer, secure)?,
                Side::Server => handshake_server(&mut reader, &mut writer, secure)?,
            };
            let config = ConnectionConfig {
                transform: cipher,
                ..options.connection.clone()
            };
            return Connection::from_parts(reader, writer, side, config);
        }
    }

    let frame_config = FrameConfig {
        max_payload_size: options.connection.max_payload_size,
        read_timeout: None,
        write_timeout: options.connection.write_timeout,
    };
    let reader = FrameReader::with_config_stream(stream.try_clone()?, frame_config.clone())?;
    let writer = FrameWriter::with_config_stream(stream, frame_config)?;
    Connection::from_parts(reader, writer, side, options.connection.clone())
}

/// Dial a listening Unix socket with default options.
#[cfg(unix)]
pub fn connect(path: impl AsRef<Path>) -> Result<Connection> {
    connect_with(path, &ConnectOptions::default())
}

/// Dial a listening Unix socket.
#[cfg(unix)]
pub fn connect_with(path: impl AsRef<Path>, options: &ConnectOptions) -> Result<Connection> {
    let stream = UnixDomainSocket::connect(path)?;
    wrap_stream(stream, Side::Client, options)
}

/// Dial a TCP listener.
pub fn connect_tcp(
    addr: impl ToSocketAddrs + std::fmt::Debug,
    options: &ConnectOptions,
) -> Result<Connection> {
    let stream = TcpSocket::connect(addr)?;
    wrap_stream(stream, Side::Client, options)
}

/// Accepts connections on a Unix socket.
#[cfg(unix)]
pub struct MuxListener {
    socket: UnixDomainSocket,
    options: ConnectOptions,
}

#[cfg(unix)]
impl MuxListener {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        info!(path = %socket.path().display(), "listening");
        Ok(Self {
            socket,
            options: ConnectOptions::default(),
        })
    }

    /// Override how accepted connections are set up.
    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Accept the next connection (blocking). The connection is not started.
    pub fn accept(&self) -> Result<Connection> {
        let stream = self.socket.accept()?;
        let connection = wrap_stream(stream, Side::Server, &self.options)?;
        info!(connection = %connection.name(), "accepted connection");
        Ok(connection)
    }

    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}
