use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifier of one logical channel, shared by both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the transport this endpoint is.
///
/// The dialing side allocates odd channel ids and the accepting side even
/// ones, so both can open channels at the same time without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub(crate) fn first_channel_id(self) -> u64 {
        match self {
            Side::Client => 1,
            Side::Server => 2,
        }
    }

    pub(crate) fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    /// True if ids like `id` are allocated by this side.
    pub(crate) fn allocates(self, id: ChannelId) -> bool {
        id.0 % 2 == self.first_channel_id() % 2
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Server => f.write_str("server"),
        }
    }
}

/// A message type that can flow over a channel.
///
/// `TAG` names the type on the wire. `SUPERTAGS` lists the tags of the types
/// it specializes, nearest first; a peer without a handler for `TAG` falls
/// back to the first of these it has a handler for.
///
/// ```
/// use chanmux_mux::Payload;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Reading { value: f64 }
///
/// #[derive(Serialize, Deserialize)]
/// struct TemperatureReading { value: f64, unit: String }
///
/// impl Payload for Reading {
///     const TAG: &'static str = "reading";
/// }
///
/// impl Payload for TemperatureReading {
///     const TAG: &'static str = "reading.temperature";
///     const SUPERTAGS: &'static [&'static str] = &["reading"];
/// }
/// ```
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire tag of this payload type.
    const TAG: &'static str;

    /// Tags of the ancestor types, nearest first.
    const SUPERTAGS: &'static [&'static str] = &[];
}

impl Payload for String {
    const TAG: &'static str = "string";
}

impl Payload for serde_json::Value {
    const TAG: &'static str = "json";
}
