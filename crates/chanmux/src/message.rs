use chanmux_mux::Payload;
use serde::{Deserialize, Serialize};

/// Line of text exchanged by `listen` and `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub seq: u64,
    pub text: String,
}

impl Payload for TextMessage {
    const TAG: &'static str = "chanmux.text";
}
