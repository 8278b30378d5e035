//! Typed channel multiplexing over one duplex connection.
//!
//! chanmux lets two endpoints share a single byte stream among many
//! independent, typed, ordered channels that are opened on demand and closed
//! cooperatively.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte streams (Unix sockets, TCP, in-process pairs)
//! - [`frame`]: length-prefixed message framing and payload transforms
//! - [`mux`]: connections, the multiplexer and typed channels (behind `mux` feature)

/// Re-export transport types.
pub mod transport {
    pub use chanmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use chanmux_frame::*;
}

/// Re-export multiplexer types (requires `mux` feature).
#[cfg(feature = "mux")]
pub mod mux {
    pub use chanmux_mux::*;
}
