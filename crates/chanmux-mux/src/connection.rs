//! One duplex link with a dedicated read loop.
//!
//! A [`Connection`] moves through `Created → Running → Closing → Closed`.
//! Inbound frames are read on a single named thread and handed, in
//! registration order, to every [`Receiver`]. Outbound frames are written
//! under one mutex so concurrent senders never interleave.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chanmux_frame::{
    FrameConfig, FrameError, FrameReader, FrameWriter, Identity, Transform, DEFAULT_MAX_PAYLOAD,
};
use chanmux_transport::DuplexStream;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;
use crate::payload::Side;

type Result<T> = std::result::Result<T, ConnectionError>;

/// Error type receivers may return from [`Receiver::on_message`].
pub type ReceiveError = Box<dyn std::error::Error + Send + Sync>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Running,
    Closing,
    Closed,
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close` was called on this side.
    Local,
    /// The peer closed the stream.
    PeerClosed,
    /// The read loop hit an unrecoverable transport error.
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::Failed(err) => write!(f, "transport failure: {err}"),
        }
    }
}

/// Consumer of inbound messages, called on the read-loop thread.
pub trait Receiver: Send + Sync {
    /// One whole inbound message. Errors and panics are logged and the read
    /// loop moves on to the next receiver.
    fn on_message(&self, message: Bytes) -> std::result::Result<(), ReceiveError>;

    /// The connection stopped. Called exactly once per receiver.
    fn on_closed(&self, reason: &CloseReason);
}

/// Connection behavior configuration.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Maximum frame payload size on the wire.
    pub max_payload_size: usize,
    /// Write timeout on the underlying stream. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
    /// Payload transform applied to every frame in both directions.
    pub transform: Arc<dyn Transform>,
    /// Label used in logs and the read-loop thread name.
    pub name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            write_timeout: None,
            transform: Arc::new(Identity),
            name: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("max_payload_size", &self.max_payload_size)
            .field("write_timeout", &self.write_timeout)
            .field("transform", &self.transform.name())
            .field("name", &self.name)
            .finish()
    }
}

/// A duplex link shared by the application and its read loop.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    name: String,
    side: Side,
    writer: Mutex<FrameWriter<DuplexStream>>,
    control: DuplexStream,
    reader: Mutex<Option<FrameReader<DuplexStream>>>,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    receivers: Mutex<Receivers>,
    read_thread: Mutex<Option<JoinHandle<()>>>,
}

struct Lifecycle {
    state: ConnectionState,
    loop_running: bool,
    loop_thread: Option<ThreadId>,
}

struct Receivers {
    list: Vec<Arc<dyn Receiver>>,
    closed: Option<CloseReason>,
}

impl Connection {
    /// Wrap an established stream with default configuration.
    pub fn new(stream: DuplexStream, side: Side) -> Result<Self> {
        Self::with_config(stream, side, ConnectionConfig::default())
    }

    /// Wrap an established stream.
    pub fn with_config(stream: DuplexStream, side: Side, config: ConnectionConfig) -> Result<Self> {
        let frame_config = FrameConfig {
            max_payload_size: config.max_payload_size,
            read_timeout: None,
            write_timeout: config.write_timeout,
        };
        let reader = FrameReader::with_config_stream(stream.try_clone()?, frame_config.clone())?;
        let writer = FrameWriter::with_config_stream(stream, frame_config)?;
        Self::from_parts(reader, writer, side, config)
    }

    /// Build a connection from a reader/writer pair that has already been
    /// used, e.g. for a secure handshake. Read timeouts are cleared and the
    /// configured limits and transform replace whatever the pair had.
    pub fn from_parts(
        mut reader: FrameReader<DuplexStream>,
        mut writer: FrameWriter<DuplexStream>,
        side: Side,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let control = writer.get_ref().try_clone()?;
        reader.set_read_timeout(None)?;
        writer
            .get_ref()
            .set_write_timeout(config.write_timeout)?;
        reader.set_max_payload_size(config.max_payload_size);
        writer.set_max_payload_size(config.max_payload_size);
        reader.set_transform(Arc::clone(&config.transform));
        writer.set_transform(Arc::clone(&config.transform));

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let name = config.name.unwrap_or_else(|| format!("conn-{id}"));

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                name,
                side,
                writer: Mutex::new(writer),
                control,
                reader: Mutex::new(Some(reader)),
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Created,
                    loop_running: false,
                    loop_thread: None,
                }),
                lifecycle_changed: Condvar::new(),
                receivers: Mutex::new(Receivers {
                    list: Vec::new(),
                    closed: None,
                }),
                read_thread: Mutex::new(None),
            }),
        })
    }

    /// Process-unique connection number.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Label used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Which end of the transport this is.
    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.lock().state
    }

    /// Why the connection stopped, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.receivers.lock().closed.clone()
    }

    /// True when called from this connection's read-loop thread.
    pub fn is_read_loop_thread(&self) -> bool {
        self.inner.lifecycle.lock().loop_thread == Some(thread::current().id())
    }

    /// Register a receiver for inbound messages.
    ///
    /// Receivers added after the connection stopped get the closure notice
    /// immediately.
    pub fn add_receiver(&self, receiver: Arc<dyn Receiver>) {
        let mut receivers = self.inner.receivers.lock();
        match receivers.closed.clone() {
            Some(reason) => {
                drop(receivers);
                notify_closed_guarded(receiver.as_ref(), &reason);
            }
            None => receivers.list.push(receiver),
        }
    }

    /// Start the read loop. Valid once, from `Created`.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state != ConnectionState::Created {
            return Err(ConnectionError::IllegalState(format!(
                "cannot start connection in state {:?}",
                lifecycle.state
            )));
        }
        let reader = self.inner.reader.lock().take().ok_or_else(|| {
            ConnectionError::IllegalState("read half already taken".to_string())
        })?;

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("chanmux-read-{}", self.inner.id))
            .spawn(move || read_loop(inner, reader));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                lifecycle.state = ConnectionState::Closed;
                self.inner.lifecycle_changed.notify_all();
                drop(lifecycle);
                let _ = self.inner.control.shutdown();
                self.inner
                    .notify_closed(CloseReason::Failed(format!("spawn failed: {err}")));
                return Err(ConnectionError::Spawn(err));
            }
        };

        lifecycle.state = ConnectionState::Running;
        lifecycle.loop_running = true;
        lifecycle.loop_thread = Some(handle.thread().id());
        *self.inner.read_thread.lock() = Some(handle);
        self.inner.lifecycle_changed.notify_all();

        info!(
            connection = %self.inner.name,
            side = %self.inner.side,
            "connection running"
        );
        Ok(())
    }

    /// Block until the connection is running.
    ///
    /// Returns `Timeout` if it is still `Created` at the deadline and
    /// `Closed` if it stopped instead.
    pub fn wait_for_running(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut lifecycle = self.inner.lifecycle.lock();
        while lifecycle.state == ConnectionState::Created {
            if self
                .inner
                .lifecycle_changed
                .wait_until(&mut lifecycle, deadline)
                .timed_out()
            {
                break;
            }
        }
        match lifecycle.state {
            ConnectionState::Running => Ok(()),
            ConnectionState::Created => Err(ConnectionError::Timeout(timeout)),
            ConnectionState::Closing | ConnectionState::Closed => Err(ConnectionError::Closed),
        }
    }

    /// Write one message. Concurrent calls are serialized.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(ConnectionError::Closed)
            }
            ConnectionState::Created | ConnectionState::Running => {}
        }
        self.inner.writer.lock().send(message)?;
        Ok(())
    }

    /// Stop the read loop and close the transport.
    ///
    /// Waits up to `timeout` for the read loop to exit. The connection is
    /// `Closed` when this returns either way; `Err(Timeout)` reports that the
    /// loop had not finished yet. Safe to call repeatedly, concurrently, and
    /// from a receiver on the read-loop thread (which does not wait).
    pub fn close(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let on_loop_thread = self.is_read_loop_thread();

        let mut lifecycle = self.inner.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Created => {
                lifecycle.state = ConnectionState::Closed;
                self.inner.lifecycle_changed.notify_all();
                drop(lifecycle);
                let _ = self.inner.control.shutdown();
                self.inner.reader.lock().take();
                self.inner.notify_closed(CloseReason::Local);
                info!(connection = %self.inner.name, "connection closed before start");
                return Ok(());
            }
            ConnectionState::Running => {
                lifecycle.state = ConnectionState::Closing;
                self.inner.lifecycle_changed.notify_all();
                debug!(connection = %self.inner.name, "connection closing");
            }
            ConnectionState::Closing => {}
        }
        drop(lifecycle);

        if let Err(err) = self.inner.control.shutdown() {
            debug!(connection = %self.inner.name, error = %err, "transport shutdown failed");
        }

        let mut lifecycle = self.inner.lifecycle.lock();
        if !on_loop_thread {
            while lifecycle.loop_running {
                if self
                    .inner
                    .lifecycle_changed
                    .wait_until(&mut lifecycle, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }
        let loop_exited = !lifecycle.loop_running;
        lifecycle.state = ConnectionState::Closed;
        self.inner.lifecycle_changed.notify_all();
        drop(lifecycle);

        self.inner.notify_closed(CloseReason::Local);

        if loop_exited {
            if let Some(handle) = self.inner.read_thread.lock().take() {
                let _ = handle.join();
            }
        }

        if loop_exited || on_loop_thread {
            info!(connection = %self.inner.name, "connection closed");
            Ok(())
        } else {
            warn!(
                connection = %self.inner.name,
                ?timeout,
                "read loop did not stop before close timeout"
            );
            Err(ConnectionError::Timeout(timeout))
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("side", &self.inner.side)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn is_closing(&self) -> bool {
        matches!(
            self.lifecycle.lock().state,
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    fn dispatch(&self, message: Bytes) {
        let receivers = self.receivers.lock().list.clone();
        for receiver in receivers {
            match catch_unwind(AssertUnwindSafe(|| receiver.on_message(message.clone()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(connection = %self.name, error = %err, "receiver failed to handle message");
                }
                Err(_) => {
                    error!(connection = %self.name, "receiver panicked while handling message");
                }
            }
        }
    }

    /// Deliver the closure notice once and drop the receivers.
    fn notify_closed(&self, reason: CloseReason) {
        let receivers = {
            let mut receivers = self.receivers.lock();
            if receivers.closed.is_some() {
                return;
            }
            receivers.closed = Some(reason.clone());
            std::mem::take(&mut receivers.list)
        };
        for receiver in receivers {
            notify_closed_guarded(receiver.as_ref(), &reason);
        }
    }
}

fn notify_closed_guarded(receiver: &dyn Receiver, reason: &CloseReason) {
    if catch_unwind(AssertUnwindSafe(|| receiver.on_closed(reason))).is_err() {
        error!("receiver panicked in closure notice");
    }
}

fn read_loop(inner: Arc<Inner>, mut reader: FrameReader<DuplexStream>) {
    debug!(connection = %inner.name, "read loop started");

    let reason = loop {
        match reader.read_frame() {
            Ok(frame) => inner.dispatch(frame.payload),
            Err(_) if inner.is_closing() => break CloseReason::Local,
            Err(FrameError::ConnectionClosed) => {
                info!(connection = %inner.name, "peer closed connection");
                break CloseReason::PeerClosed;
            }
            Err(err) => {
                error!(connection = %inner.name, error = %err, "read loop failed; closing connection");
                break CloseReason::Failed(err.to_string());
            }
        }
    };

    {
        let mut lifecycle = inner.lifecycle.lock();
        if lifecycle.state == ConnectionState::Running {
            lifecycle.state = ConnectionState::Closing;
            inner.lifecycle_changed.notify_all();
        }
    }
    let _ = inner.control.shutdown();
    inner.notify_closed(reason);

    let mut lifecycle = inner.lifecycle.lock();
    lifecycle.loop_running = false;
    lifecycle.state = ConnectionState::Closed;
    inner.lifecycle_changed.notify_all();
    debug!(connection = %inner.name, "read loop stopped");
}
