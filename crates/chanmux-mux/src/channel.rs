use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::{MuxError, Result};
use crate::handler::{Handler, Listener};
use crate::multiplexer::MuxShared;
use crate::payload::{ChannelId, Payload};

/// Lifecycle state of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, open handshake not complete.
    Pending,
    Open,
    /// Closed by either side or by connection loss. Terminal.
    Closed,
}

/// One logical, typed, bidirectional message stream.
///
/// Cloning yields another handle to the same channel.
pub struct Channel<T: Payload> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Payload> {
    id: ChannelId,
    mux: Arc<MuxShared>,
    state: Mutex<ChannelState>,
    state_changed: Condvar,
    listeners: Mutex<Vec<Arc<dyn Listener<T>>>>,
    handler: Option<Arc<dyn Handler<Payload = T>>>,
}

impl<T: Payload> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> Channel<T> {
    pub(crate) fn new(
        id: ChannelId,
        mux: Arc<MuxShared>,
        handler: Option<Arc<dyn Handler<Payload = T>>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                mux,
                state: Mutex::new(ChannelState::Pending),
                state_changed: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
                handler,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Send one payload to the peer's end of this channel.
    pub fn send(&self, payload: &T) -> Result<()> {
        match self.state() {
            ChannelState::Open => {}
            state => {
                return Err(MuxError::IllegalState(format!(
                    "cannot send on channel {} in state {state:?}",
                    self.inner.id
                )))
            }
        }
        let envelope = Envelope::Payload {
            id: self.inner.id,
            payload: serde_json::to_value(payload)?,
        };
        self.inner.mux.send_envelope(&envelope)
    }

    /// Register a listener. Payloads are delivered to listeners in
    /// registration order on the connection's read-loop thread.
    pub fn add_listener<L: Listener<T>>(&self, listener: L) {
        self.inner.listeners.lock().push(Arc::new(listener));
    }

    /// Close this channel and tell the peer.
    ///
    /// Only the first call does anything. Local teardown always completes;
    /// an error means the `close` notice could not be sent.
    pub fn close(&self) -> Result<()> {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            if previous == ChannelState::Closed {
                return Ok(());
            }
            *state = ChannelState::Closed;
            previous
        };

        self.inner.mux.forget_channel(self.inner.id);

        let sent = if previous == ChannelState::Open {
            debug!(channel_id = %self.inner.id, "closing channel");
            self.inner.mux.send_envelope(&Envelope::Close { id: self.inner.id })
        } else {
            Ok(())
        };

        if previous == ChannelState::Open {
            self.notify_handler_closed();
        }
        self.inner.listeners.lock().clear();
        self.inner.state_changed.notify_all();
        sent
    }

    /// Block until the channel is closed or `timeout` elapses. Returns true if
    /// the channel is closed.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while *state != ChannelState::Closed {
            if self
                .inner
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        *state == ChannelState::Closed
    }

    fn notify_handler_closed(&self) {
        if let Some(handler) = &self.inner.handler {
            if catch_unwind(AssertUnwindSafe(|| handler.channel_closed(self))).is_err() {
                warn!(
                    channel_id = %self.inner.id,
                    payload_type = T::TAG,
                    "handler panicked in channel_closed"
                );
            }
        }
    }
}

impl<T: Payload> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("payload_type", &T::TAG)
            .field("state", &self.state())
            .finish()
    }
}

/// Type-erased view of a channel held by the multiplexer registry.
pub(crate) trait ErasedChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn payload_type(&self) -> &'static str;

    fn state(&self) -> ChannelState;

    /// `Pending → Open`. No effect in any other state.
    fn mark_open(&self);

    /// `Pending → Open` once `announce` succeeds. The state lock is held
    /// throughout, so a concurrent `close` either sees `Open` and notifies the
    /// peer, or wins first and this returns `Ok(false)` without announcing.
    fn open_with(&self, announce: &dyn Fn() -> Result<()>) -> Result<bool>;

    /// Decode and fan out one inbound payload.
    fn deliver(&self, payload: serde_json::Value);

    /// The peer or the connection closed this channel. Registry cleanup is
    /// the caller's job.
    fn close_from_remote(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Payload> ErasedChannel for Channel<T> {
    fn id(&self) -> ChannelId {
        self.inner.id
    }

    fn payload_type(&self) -> &'static str {
        T::TAG
    }

    fn state(&self) -> ChannelState {
        Channel::state(self)
    }

    fn mark_open(&self) {
        let mut state = self.inner.state.lock();
        if *state == ChannelState::Pending {
            *state = ChannelState::Open;
            self.inner.state_changed.notify_all();
        }
    }

    fn open_with(&self, announce: &dyn Fn() -> Result<()>) -> Result<bool> {
        let mut state = self.inner.state.lock();
        if *state != ChannelState::Pending {
            return Ok(false);
        }
        announce()?;
        *state = ChannelState::Open;
        self.inner.state_changed.notify_all();
        Ok(true)
    }

    fn deliver(&self, payload: serde_json::Value) {
        if !self.is_open() {
            debug!(channel_id = %self.inner.id, "dropping payload for channel that is not open");
            return;
        }

        let payload: T = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    channel_id = %self.inner.id,
                    payload_type = T::TAG,
                    error = %err,
                    "dropping undecodable payload"
                );
                return;
            }
        };

        let listeners = self.inner.listeners.lock().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.received(&payload))).is_err() {
                warn!(
                    channel_id = %self.inner.id,
                    payload_type = T::TAG,
                    "listener panicked"
                );
            }
        }
    }

    fn close_from_remote(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            *state = ChannelState::Closed;
            previous
        };
        match previous {
            ChannelState::Closed => return,
            ChannelState::Open => {
                debug!(channel_id = %self.inner.id, "channel closed remotely");
                self.notify_handler_closed();
            }
            ChannelState::Pending => {}
        }
        self.inner.listeners.lock().clear();
        self.inner.state_changed.notify_all();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
