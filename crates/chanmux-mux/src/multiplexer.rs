//! Channel registry, open handshake and inbound dispatch.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ErasedChannel};
use crate::connection::{CloseReason, Connection, ReceiveError, Receiver};
use crate::envelope::Envelope;
use crate::error::{MuxError, Result};
use crate::handler::{ErasedHandler, Handler, HandlerSlot, RequestError};
use crate::payload::{ChannelId, Payload, Side};

/// Default bound on channel establishment.
pub const DEFAULT_ESTABLISH_TIMEOUT: Duration = Duration::from_millis(4096);

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Timeout used by [`Multiplexer::establish`].
    pub default_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_ESTABLISH_TIMEOUT,
        }
    }
}

/// Shares one [`Connection`] among many typed channels.
///
/// Attach before starting the connection so no inbound envelope is missed.
/// Cloning yields another handle to the same multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

pub(crate) struct MuxShared {
    connection: Connection,
    config: MultiplexerConfig,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

struct Registry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    channels: HashMap<ChannelId, Arc<dyn ErasedChannel>>,
    pending: HashMap<ChannelId, PendingOpen>,
    peer_ids: PeerIds,
    closed: bool,
}

/// Ids the peer has asked for so far: every peer id below `floor`, plus the
/// ones above it that arrived out of order.
struct PeerIds {
    floor: u64,
    above: BTreeSet<u64>,
}

impl PeerIds {
    fn new(peer: Side) -> Self {
        Self {
            floor: peer.first_channel_id(),
            above: BTreeSet::new(),
        }
    }

    /// Record `id`. False if it was seen before.
    fn insert(&mut self, id: ChannelId) -> bool {
        if id.0 < self.floor || !self.above.insert(id.0) {
            return false;
        }
        while self.above.remove(&self.floor) {
            self.floor += 2;
        }
        true
    }
}

struct PendingOpen {
    channel: Arc<dyn ErasedChannel>,
    outcome: SyncSender<OpenOutcome>,
}

enum OpenOutcome {
    Accepted,
    Declined(Option<String>),
    Disconnected(String),
}

impl Registry {
    fn new(side: Side) -> Self {
        Self {
            handlers: HashMap::new(),
            channels: HashMap::new(),
            pending: HashMap::new(),
            peer_ids: PeerIds::new(side.peer()),
            closed: false,
        }
    }

    /// Exact tag first, then the declared supertags in order.
    fn resolve(&self, payload_type: &str, supertypes: &[String]) -> Option<Arc<dyn ErasedHandler>> {
        std::iter::once(payload_type)
            .chain(supertypes.iter().map(String::as_str))
            .find_map(|tag| self.handlers.get(tag).cloned())
    }
}

impl Multiplexer {
    /// Attach a multiplexer with default configuration.
    pub fn attach(connection: &Connection) -> Self {
        Self::attach_with(connection, MultiplexerConfig::default())
    }

    pub fn attach_with(connection: &Connection, config: MultiplexerConfig) -> Self {
        let shared = Arc::new(MuxShared {
            connection: connection.clone(),
            config,
            next_id: AtomicU64::new(connection.side().first_channel_id()),
            registry: Mutex::new(Registry::new(connection.side())),
        });
        connection.add_receiver(Arc::new(MuxReceiver(Arc::clone(&shared))));
        debug!(connection = %connection.name(), side = %connection.side(), "multiplexer attached");
        Self { shared }
    }

    /// The connection this multiplexer runs on.
    pub fn connection(&self) -> &Connection {
        &self.shared.connection
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.shared.config
    }

    /// Register `handler` for open requests of `H::Payload`, replacing any
    /// handler already registered for that tag. Affects future requests only.
    pub fn add_handler<H: Handler>(&self, handler: H) {
        let slot: Arc<dyn ErasedHandler> = Arc::new(HandlerSlot::new(handler));
        let tag = slot.payload_type();
        let replaced = self.shared.registry.lock().handlers.insert(tag, slot).is_some();
        debug!(payload_type = tag, replaced, "handler registered");
    }

    /// The registered channel with this id, if its payload type is `T`.
    pub fn get_channel<T: Payload>(&self, id: ChannelId) -> Option<Channel<T>> {
        let channel = self.shared.registry.lock().channels.get(&id).cloned()?;
        channel
            .into_any()
            .downcast::<Channel<T>>()
            .ok()
            .map(|channel| Channel::clone(&channel))
    }

    pub fn contains_channel(&self, id: ChannelId) -> bool {
        self.shared.registry.lock().channels.contains_key(&id)
    }

    /// Ids of all registered channels, ascending.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.shared.registry.lock().channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Open a channel using the configured default timeout.
    pub fn establish<T: Payload>(&self) -> Result<Channel<T>> {
        self.establish_new_channel(self.shared.config.default_timeout)
    }

    /// Ask the peer to open a channel of payload type `T` and wait for the
    /// answer.
    pub fn establish_new_channel<T: Payload>(&self, timeout: Duration) -> Result<Channel<T>> {
        self.establish_new_channel_with(None, timeout)
    }

    /// Like [`establish_new_channel`](Self::establish_new_channel), passing an
    /// initial payload to the peer's handler.
    pub fn establish_new_channel_with<T: Payload>(
        &self,
        initial: Option<&T>,
        timeout: Duration,
    ) -> Result<Channel<T>> {
        if self.shared.connection.is_read_loop_thread() {
            return Err(MuxError::IllegalState(
                "cannot establish a channel from the read-loop thread".to_string(),
            ));
        }
        let initial = initial.map(serde_json::to_value).transpose()?;

        let (outcome_tx, outcome_rx) = mpsc::sync_channel(1);
        let channel = {
            let mut registry = self.shared.registry.lock();
            if registry.closed {
                return Err(MuxError::Disconnected("connection closed".to_string()));
            }
            let id = self.shared.allocate_id();
            let handler = registry
                .handlers
                .get(T::TAG)
                .and_then(|slot| slot.typed().downcast::<Arc<dyn Handler<Payload = T>>>().ok())
                .map(|handler| *handler);
            let channel = Channel::<T>::new(id, Arc::clone(&self.shared), handler);
            registry.pending.insert(
                id,
                PendingOpen {
                    channel: Arc::new(channel.clone()),
                    outcome: outcome_tx,
                },
            );
            channel
        };
        let id = channel.id();

        debug!(channel_id = %id, payload_type = T::TAG, "requesting channel");
        let request = Envelope::OpenRequest {
            id,
            payload_type: T::TAG.to_string(),
            supertypes: T::SUPERTAGS.iter().map(|tag| tag.to_string()).collect(),
            initial,
        };
        if let Err(err) = self.shared.send_envelope(&request) {
            self.shared.abandon_pending(id);
            return Err(err);
        }

        let outcome = match outcome_rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.shared.abandon_pending(id) {
                    debug!(channel_id = %id, ?timeout, "channel request timed out");
                    return Err(MuxError::Timeout(timeout));
                }
                // Answered right at the deadline; the signal is already queued.
                outcome_rx
                    .recv()
                    .unwrap_or_else(|_| OpenOutcome::Disconnected("request abandoned".to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                OpenOutcome::Disconnected("request abandoned".to_string())
            }
        };

        match outcome {
            OpenOutcome::Accepted => {
                debug!(channel_id = %id, payload_type = T::TAG, "channel established");
                Ok(channel)
            }
            OpenOutcome::Declined(reason) => Err(MuxError::Declined { id, reason }),
            OpenOutcome::Disconnected(reason) => Err(MuxError::Disconnected(reason)),
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("connection", &self.shared.connection)
            .field("channels", &self.channel_ids())
            .finish()
    }
}

impl MuxShared {
    pub(crate) fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.to_bytes()?;
        self.connection.send(&bytes)?;
        Ok(())
    }

    /// Deregister a locally closed channel.
    pub(crate) fn forget_channel(&self, id: ChannelId) {
        self.registry.lock().channels.remove(&id);
    }

    /// Ids only grow, so an allocated id is never handed out twice.
    fn allocate_id(&self) -> ChannelId {
        ChannelId(self.next_id.fetch_add(2, Ordering::Relaxed))
    }

    /// True if this side has already handed out `id`.
    fn allocated(&self, id: ChannelId) -> bool {
        self.connection.side().allocates(id) && id.0 < self.next_id.load(Ordering::Relaxed)
    }

    /// Drop a pending establishment. False if it was already resolved.
    fn abandon_pending(&self, id: ChannelId) -> bool {
        let pending = self.registry.lock().pending.remove(&id);
        match pending {
            Some(pending) => {
                pending.channel.close_from_remote();
                true
            }
            None => false,
        }
    }

    fn decline(&self, id: ChannelId, reason: Option<String>) {
        if let Err(err) = self.send_envelope(&Envelope::Decline { id, reason }) {
            debug!(channel_id = %id, error = %err, "failed to send decline");
        }
    }

    fn on_open_request(
        self: &Arc<Self>,
        id: ChannelId,
        payload_type: String,
        supertypes: Vec<String>,
        initial: Option<serde_json::Value>,
    ) {
        let handler = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return;
            }
            if self.connection.side().allocates(id) {
                drop(registry);
                warn!(channel_id = %id, "declining open request for an id this side allocates");
                self.decline(id, Some(format!("channel id {id} has the wrong parity")));
                return;
            }
            if !registry.peer_ids.insert(id) {
                drop(registry);
                warn!(channel_id = %id, "declining open request for an id already in use");
                self.decline(id, Some(format!("channel id {id} already in use")));
                return;
            }
            registry.resolve(&payload_type, &supertypes)
        };

        let Some(handler) = handler else {
            debug!(channel_id = %id, payload_type = %payload_type, "no handler for payload type");
            self.decline(id, Some(format!("no handler registered for payload type {payload_type}")));
            return;
        };

        let channel = match handler.open(self, id, initial) {
            Ok(channel) => channel,
            Err(err) => {
                if let RequestError::Failed(message) = &err {
                    warn!(channel_id = %id, payload_type = %payload_type, error = %message, "handler failed; declining channel");
                } else {
                    debug!(channel_id = %id, payload_type = %payload_type, "handler declined channel");
                }
                self.decline(id, err.into_reason());
                return;
            }
        };

        // Registration, the accept notice and `Pending → Open` happen under
        // the registry lock, so the channel is never visible while pending.
        let accepted = {
            let mut registry = self.registry.lock();
            if registry.closed {
                drop(registry);
                channel.close_from_remote();
                return;
            }
            registry.channels.insert(id, Arc::clone(&channel));
            let accepted = channel.open_with(&|| self.send_envelope(&Envelope::Accept { id }));
            if !matches!(accepted, Ok(true)) {
                registry.channels.remove(&id);
            }
            accepted
        };

        match accepted {
            Ok(true) => debug!(
                channel_id = %id,
                payload_type = %payload_type,
                handler = channel.payload_type(),
                "channel accepted"
            ),
            Ok(false) => {
                self.decline(id, Some("channel closed before it was accepted".to_string()));
            }
            Err(err) => {
                warn!(channel_id = %id, error = %err, "failed to send accept");
                channel.close_from_remote();
            }
        }
    }

    fn on_accept(&self, id: ChannelId) {
        let mut registry = self.registry.lock();
        if let Some(pending) = registry.pending.remove(&id) {
            registry.channels.insert(id, Arc::clone(&pending.channel));
            pending.channel.mark_open();
            drop(registry);
            let _ = pending.outcome.try_send(OpenOutcome::Accepted);
        } else if registry.channels.contains_key(&id) {
            drop(registry);
            debug!(channel_id = %id, "duplicate accept");
        } else if self.allocated(id) {
            drop(registry);
            debug!(channel_id = %id, "accept for abandoned request; closing channel");
            if let Err(err) = self.send_envelope(&Envelope::Close { id }) {
                debug!(channel_id = %id, error = %err, "failed to close abandoned channel");
            }
        } else {
            drop(registry);
            debug!(channel_id = %id, "accept for unknown channel");
        }
    }

    fn on_decline(&self, id: ChannelId, reason: Option<String>) {
        let pending = self.registry.lock().pending.remove(&id);
        match pending {
            Some(pending) => {
                debug!(channel_id = %id, reason = ?reason, "channel request declined");
                pending.channel.close_from_remote();
                let _ = pending.outcome.try_send(OpenOutcome::Declined(reason));
            }
            None => debug!(channel_id = %id, "decline for unknown request"),
        }
    }

    fn on_payload(&self, id: ChannelId, payload: serde_json::Value) {
        let channel = self.registry.lock().channels.get(&id).cloned();
        match channel {
            Some(channel) => channel.deliver(payload),
            None => debug!(channel_id = %id, "dropping payload for unknown channel"),
        }
    }

    fn on_close(&self, id: ChannelId) {
        let (channel, pending) = {
            let mut registry = self.registry.lock();
            (registry.channels.remove(&id), registry.pending.remove(&id))
        };
        if let Some(pending) = pending {
            // A later accept for this id is answered with `close`.
            debug!(channel_id = %id, "peer closed a channel it had not accepted");
            pending.channel.close_from_remote();
            let _ = pending.outcome.try_send(OpenOutcome::Declined(Some(
                "channel closed by peer before it was accepted".to_string(),
            )));
            return;
        }
        match channel {
            Some(channel) => channel.close_from_remote(),
            None => debug!(channel_id = %id, "close for unknown channel"),
        }
    }

    fn on_connection_closed(&self, reason: &CloseReason) {
        let (pending, channels) = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            let pending = std::mem::take(&mut registry.pending);
            let channels = std::mem::take(&mut registry.channels);
            (pending, channels)
        };

        let (pending_count, channel_count) = (pending.len(), channels.len());
        for (_, open) in pending {
            open.channel.close_from_remote();
            let _ = open.outcome.try_send(OpenOutcome::Disconnected(reason.to_string()));
        }
        for (_, channel) in channels {
            channel.close_from_remote();
        }
        info!(
            connection = %self.connection.name(),
            %reason,
            channels = channel_count,
            pending = pending_count,
            "multiplexer shut down"
        );
    }
}

/// Bridges connection callbacks into the multiplexer.
struct MuxReceiver(Arc<MuxShared>);

impl Receiver for MuxReceiver {
    fn on_message(&self, message: Bytes) -> std::result::Result<(), ReceiveError> {
        let envelope = Envelope::from_bytes(&message)?;
        let shared = &self.0;
        match envelope {
            Envelope::OpenRequest {
                id,
                payload_type,
                supertypes,
                initial,
            } => shared.on_open_request(id, payload_type, supertypes, initial),
            Envelope::Accept { id } => shared.on_accept(id),
            Envelope::Decline { id, reason } => shared.on_decline(id, reason),
            Envelope::Payload { id, payload } => shared.on_payload(id, payload),
            Envelope::Close { id } => shared.on_close(id),
        }
        Ok(())
    }

    fn on_closed(&self, reason: &CloseReason) {
        self.0.on_connection_closed(reason);
    }
}
