use std::fmt;
use std::io;

use chanmux_frame::FrameError;
use chanmux_mux::{ConnectionError, MuxError};
use chanmux_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const DECLINED: i32 = 69;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::PathTooLong { .. } => CliError::new(USAGE, format!("{context}: {err}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        FrameError::InvalidMagic => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn connection_error(context: &str, err: ConnectionError) -> CliError {
    match err {
        ConnectionError::Transport(err) => transport_error(context, err),
        ConnectionError::Frame(err) => frame_error(context, err),
        ConnectionError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        ConnectionError::Closed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        ConnectionError::Secure(chanmux_mux::SecureError::Timeout(_)) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        ConnectionError::Secure(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    match err {
        MuxError::Connection(err) => connection_error(context, err),
        MuxError::Declined { .. } => CliError::new(DECLINED, format!("{context}: {err}")),
        MuxError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        MuxError::Disconnected(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        MuxError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        MuxError::IllegalState(_) => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chanmux_mux::ChannelId;

    use super::*;

    #[test]
    fn mux_errors_map_to_exit_codes() {
        let declined = MuxError::Declined {
            id: ChannelId(1),
            reason: Some("busy".into()),
        };
        assert_eq!(mux_error("open", declined).code, DECLINED);
        assert_eq!(
            mux_error("open", MuxError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            mux_error("open", MuxError::Disconnected("gone".into())).code,
            TRANSPORT_ERROR
        );
        assert_eq!(
            mux_error("send", MuxError::Connection(ConnectionError::Closed)).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn missing_socket_is_a_transport_error() {
        let err = TransportError::Connect {
            addr: "/tmp/missing.sock".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        let cli = transport_error("connect failed", err);
        assert_eq!(cli.code, TRANSPORT_ERROR);
        assert!(cli.message.starts_with("connect failed: "));
    }
}
