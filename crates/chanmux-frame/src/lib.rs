//! Length-prefixed message framing for chanmux.
//!
//! Every message on the wire is framed with:
//! - A 2-byte magic number ("CM") for stream synchronization
//! - A 4-byte little-endian payload length
//!
//! Payloads pass through a [`Transform`] on the way out and back in, which is
//! where an encrypted session plugs in. Callers always see whole messages.

pub mod codec;
pub mod error;
pub mod reader;
pub mod transform;
pub mod writer;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use transform::{Identity, Transform, TransformError};
pub use writer::FrameWriter;
