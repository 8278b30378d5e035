//! Byte-level payload transforms.
//!
//! A transform sits between message payloads and the frame codec: the writer
//! calls [`Transform::encode`] before framing and the reader calls
//! [`Transform::decode`] after unframing. It never sees frame headers and has
//! no influence on what the payload means.

use bytes::Bytes;

/// Error raised by a transform, typically an authentication failure.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Reversible payload transform applied to every frame.
pub trait Transform: Send + Sync {
    /// Transform an outbound payload into its wire form.
    fn encode(&self, payload: &[u8]) -> Result<Bytes, TransformError>;

    /// Recover a payload from its wire form.
    fn decode(&self, wire: Bytes) -> Result<Bytes, TransformError>;

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

/// The pass-through transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform for Identity {
    fn encode(&self, payload: &[u8]) -> Result<Bytes, TransformError> {
        Ok(Bytes::copy_from_slice(payload))
    }

    fn decode(&self, wire: Bytes) -> Result<Bytes, TransformError> {
        Ok(wire)
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// XORs every byte and prefixes a marker so tests can see the wire form.
    pub(crate) struct XorTransform(pub u8);

    impl Transform for XorTransform {
        fn encode(&self, payload: &[u8]) -> Result<Bytes, TransformError> {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.push(b'X');
            out.extend(payload.iter().map(|b| b ^ self.0));
            Ok(Bytes::from(out))
        }

        fn decode(&self, wire: Bytes) -> Result<Bytes, TransformError> {
            match wire.split_first() {
                Some((b'X', rest)) => Ok(rest.iter().map(|b| b ^ self.0).collect()),
                _ => Err(TransformError::new("missing xor marker")),
            }
        }

        fn name(&self) -> &'static str {
            "xor"
        }
    }

    #[test]
    fn identity_passes_through() {
        let encoded = Identity.encode(b"abc").unwrap();
        assert_eq!(encoded.as_ref(), b"abc");
        assert_eq!(Identity.decode(encoded).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn xor_rejects_unmarked_input() {
        let err = XorTransform(0x5A)
            .decode(Bytes::from_static(b"plain"))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing xor marker");
    }
}
