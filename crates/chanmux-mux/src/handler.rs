//! Application policy and callbacks.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::channel::{Channel, ErasedChannel};
use crate::multiplexer::MuxShared;
use crate::payload::{ChannelId, Payload};

/// Why a handler refused an open request. Both variants decline on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Deliberate refusal. The reason, if any, is forwarded to the peer.
    #[error("declined: {}", .0.as_deref().unwrap_or("no reason given"))]
    Declined(Option<String>),

    /// The handler could not process the request.
    #[error("request failed: {0}")]
    Failed(String),
}

impl RequestError {
    pub fn declined(reason: impl Into<String>) -> Self {
        RequestError::Declined(Some(reason.into()))
    }

    pub(crate) fn into_reason(self) -> Option<String> {
        match self {
            RequestError::Declined(reason) => reason,
            RequestError::Failed(message) => Some(message),
        }
    }
}

/// Accept/decline policy for channels of one payload type.
///
/// Registered with [`Multiplexer::add_handler`](crate::Multiplexer::add_handler).
/// Both methods run on the connection's read-loop thread, so they must not
/// block on anything that needs another inbound message, such as
/// establishing a new channel on the same multiplexer.
pub trait Handler: Send + Sync + 'static {
    type Payload: Payload;

    /// The peer asked to open `channel`. Return `Ok` to accept it.
    ///
    /// The channel is still pending here: listeners may be attached, but
    /// `send` only succeeds once the accept has gone out.
    fn new_channel_requested(
        &self,
        channel: &Channel<Self::Payload>,
        initial: Option<Self::Payload>,
    ) -> Result<(), RequestError>;

    /// A channel of this payload type has closed, either one this handler
    /// accepted or one this side opened while the handler was registered.
    fn channel_closed(&self, _channel: &Channel<Self::Payload>) {}
}

/// Receives payloads delivered on one channel.
pub trait Listener<P>: Send + Sync + 'static {
    fn received(&self, payload: &P);
}

impl<P, F> Listener<P> for F
where
    F: Fn(&P) + Send + Sync + 'static,
{
    fn received(&self, payload: &P) {
        self(payload)
    }
}

/// Handler that accepts every request and does nothing else.
pub struct AcceptAll<P>(PhantomData<fn() -> P>);

impl<P> AcceptAll<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for AcceptAll<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload> Handler for AcceptAll<P> {
    type Payload = P;

    fn new_channel_requested(&self, _channel: &Channel<P>, _initial: Option<P>) -> Result<(), RequestError> {
        Ok(())
    }
}

/// Type-erased view of a registered handler.
pub(crate) trait ErasedHandler: Send + Sync {
    fn payload_type(&self) -> &'static str;

    /// The handler as a boxed `Arc<dyn Handler<Payload = P>>`, for channels
    /// this side opens.
    fn typed(&self) -> Box<dyn Any + Send + Sync>;

    /// Build the provisional channel, decode the initial payload and consult
    /// the handler. Panics inside the handler become `Failed`.
    fn open(
        &self,
        mux: &Arc<MuxShared>,
        id: ChannelId,
        initial: Option<serde_json::Value>,
    ) -> Result<Arc<dyn ErasedChannel>, RequestError>;
}

pub(crate) struct HandlerSlot<H: Handler> {
    handler: Arc<H>,
}

impl<H: Handler> HandlerSlot<H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H: Handler> ErasedHandler for HandlerSlot<H> {
    fn payload_type(&self) -> &'static str {
        H::Payload::TAG
    }

    fn typed(&self) -> Box<dyn Any + Send + Sync> {
        let handler: Arc<dyn Handler<Payload = H::Payload>> = self.handler.clone();
        Box::new(handler)
    }

    fn open(
        &self,
        mux: &Arc<MuxShared>,
        id: ChannelId,
        initial: Option<serde_json::Value>,
    ) -> Result<Arc<dyn ErasedChannel>, RequestError> {
        let initial = initial
            .map(serde_json::from_value::<H::Payload>)
            .transpose()
            .map_err(|err| RequestError::Failed(format!("undecodable initial payload: {err}")))?;

        let handler: Arc<dyn Handler<Payload = H::Payload>> = self.handler.clone();
        let channel = Channel::new(id, Arc::clone(mux), Some(handler));

        match catch_unwind(AssertUnwindSafe(|| {
            self.handler.new_channel_requested(&channel, initial)
        })) {
            Ok(Ok(())) => Ok(Arc::new(channel)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RequestError::Failed("handler panicked".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_listeners() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |payload: &String| sink.lock().unwrap().push(payload.clone());
        Listener::<String>::received(&listener, &"hello".to_string());
        assert_eq!(seen.lock().unwrap().as_slice(), &["hello".to_string()]);
    }

    #[test]
    fn typed_handle_matches_payload_type() {
        let slot = HandlerSlot::new(AcceptAll::<String>::new());
        assert!(slot
            .typed()
            .downcast::<Arc<dyn Handler<Payload = String>>>()
            .is_ok());
        assert!(slot
            .typed()
            .downcast::<Arc<dyn Handler<Payload = serde_json::Value>>>()
            .is_err());
    }

    #[test]
    fn request_error_reasons() {
        assert_eq!(
            RequestError::declined("busy").into_reason().as_deref(),
            Some("busy")
        );
        assert_eq!(RequestError::Declined(None).into_reason(), None);
        assert_eq!(
            RequestError::Failed("boom".into()).into_reason().as_deref(),
            Some("boom")
        );
        assert_eq!(
            RequestError::Declined(None).to_string(),
            "declined: no reason given"
        );
    }
}
