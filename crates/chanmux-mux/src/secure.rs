//! Encrypted connections.
//!
//! Before a [`Connection`](crate::Connection) starts, both ends run a short
//! key agreement over the raw frame reader and writer:
//!
//! 1. each side sends `CMK1 ‖ x25519 ephemeral public key`;
//! 2. both derive a key-encryption key with HKDF-SHA256 over the shared
//!    secret, salted with `client_pub ‖ server_pub`;
//! 3. the client picks a random session key and sends it sealed under the
//!    key-encryption key;
//! 4. the server answers with a confirmation sealed under the session key.
//!
//! The result is a [`SessionCipher`] to install as the connection transform.
//! Every frame after that is `nonce(24) ‖ XChaCha20-Poly1305 ciphertext`.
//! There is no peer authentication; this protects against passive observers
//! only.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chanmux_frame::{FrameError, FrameReader, FrameWriter, Transform, TransformError};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::SecureError;

type Result<T> = std::result::Result<T, SecureError>;

const HELLO_MAGIC: &[u8; 4] = b"CMK1";
const HELLO_LEN: usize = HELLO_MAGIC.len() + 32;
const KEK_INFO: &[u8] = b"chanmux key-encryption key v1";
const READY: &[u8] = b"chanmux-ready";
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct SecureConfig {
    /// Bound on the whole handshake.
    pub timeout: Duration,
    /// Largest handshake frame accepted from the peer.
    pub max_handshake_payload: usize,
}

impl Default for SecureConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_handshake_payload: 1024,
        }
    }
}

/// XChaCha20-Poly1305 frame transform keyed by a negotiated session key.
pub struct SessionCipher {
    cipher: XChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| SecureError::Crypto("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, wire: &[u8]) -> Result<Vec<u8>> {
        if wire.len() < NONCE_LEN + TAG_LEN {
            return Err(SecureError::Crypto(format!(
                "sealed message too short: {} bytes",
                wire.len()
            )));
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecureError::Crypto("authentication failed".to_string()))
    }
}

impl Transform for SessionCipher {
    fn encode(&self, payload: &[u8]) -> std::result::Result<Bytes, TransformError> {
        self.seal(payload)
            .map(Bytes::from)
            .map_err(|err| TransformError::new(err.to_string()))
    }

    fn decode(&self, wire: Bytes) -> std::result::Result<Bytes, TransformError> {
        self.open(&wire)
            .map(Bytes::from)
            .map_err(|err| TransformError::new(err.to_string()))
    }

    fn name(&self) -> &'static str {
        "xchacha20poly1305"
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key", &format_args!("<redacted>"))
            .finish()
    }
}

/// Run the dialing side of the key agreement.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &SecureConfig,
) -> Result<Arc<SessionCipher>> {
    let deadline = Instant::now() + config.timeout;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let client_pub = PublicKey::from(&secret);
    writer.send(&hello(&client_pub))?;

    let server_pub = parse_hello(&recv_handshake_payload(reader, deadline, config)?)?;
    let kek = derive_kek(secret, &server_pub, &client_pub, &server_pub)?;

    let mut session_key = [0u8; 32];
    OsRng.fill_bytes(&mut session_key);
    writer.send(&kek.seal(&session_key)?)?;

    let session = SessionCipher::new(&session_key);
    let confirmation = session
        .open(&recv_handshake_payload(reader, deadline, config)?)
        .map_err(|_| SecureError::Protocol("server could not confirm the session key".to_string()))?;
    if confirmation != READY {
        return Err(SecureError::Protocol("unexpected confirmation message".to_string()));
    }

    debug!("secure session established (client)");
    Ok(Arc::new(session))
}

/// Run the accepting side of the key agreement.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &SecureConfig,
) -> Result<Arc<SessionCipher>> {
    let deadline = Instant::now() + config.timeout;

    let client_pub = parse_hello(&recv_handshake_payload(reader, deadline, config)?)?;
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let server_pub = PublicKey::from(&secret);
    writer.send(&hello(&server_pub))?;

    let kek = derive_kek(secret, &client_pub, &client_pub, &server_pub)?;
    let sealed = recv_handshake_payload(reader, deadline, config)?;
    let session_key: [u8; 32] = kek
        .open(&sealed)?
        .try_into()
        .map_err(|_| SecureError::Protocol("session key must be 32 bytes".to_string()))?;

    let session = SessionCipher::new(&session_key);
    writer.send(&session.seal(READY)?)?;

    debug!("secure session established (server)");
    Ok(Arc::new(session))
}

fn hello(public: &PublicKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(HELLO_LEN);
    out.extend_from_slice(HELLO_MAGIC);
    out.extend_from_slice(public.as_bytes());
    out
}

fn parse_hello(payload: &[u8]) -> Result<PublicKey> {
    if payload.len() != HELLO_LEN || !payload.starts_with(HELLO_MAGIC) {
        return Err(SecureError::Protocol(format!(
            "malformed hello ({} bytes)",
            payload.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[HELLO_MAGIC.len()..]);
    Ok(PublicKey::from(key))
}

fn derive_kek(
    secret: EphemeralSecret,
    peer_pub: &PublicKey,
    client_pub: &PublicKey,
    server_pub: &PublicKey,
) -> Result<SessionCipher> {
    let shared = secret.diffie_hellman(peer_pub);
    if !shared.was_contributory() {
        return Err(SecureError::Protocol("peer sent a low-order public key".to_string()));
    }

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(client_pub.as_bytes());
    salt[32..].copy_from_slice(server_pub.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut kek = [0u8; 32];
    hk.expand(KEK_INFO, &mut kek)
        .map_err(|_| SecureError::Crypto("key derivation failed".to_string()))?;
    Ok(SessionCipher::new(&kek))
}

fn recv_handshake_payload<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    config: &SecureConfig,
) -> Result<Vec<u8>> {
    loop {
        if Instant::now() >= deadline {
            return Err(SecureError::Timeout(config.timeout));
        }

        match reader.read_frame() {
            Ok(frame) => {
                if frame.payload.len() > config.max_handshake_payload {
                    return Err(SecureError::Protocol(format!(
                        "handshake payload too large: {} (max {})",
                        frame.payload.len(),
                        config.max_handshake_payload
                    )));
                }
                return Ok(frame.payload.to_vec());
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => return Err(SecureError::Disconnected),
            Err(err) => return Err(SecureError::Frame(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[cfg(unix)]
    fn raw_pair() -> (
        (FrameReader<chanmux_transport::DuplexStream>, FrameWriter<chanmux_transport::DuplexStream>),
        (FrameReader<chanmux_transport::DuplexStream>, FrameWriter<chanmux_transport::DuplexStream>),
    ) {
        let (left, right) = chanmux_transport::DuplexStream::pair().unwrap();
        let split = |stream: chanmux_transport::DuplexStream| {
            (
                FrameReader::new(stream.try_clone().unwrap()),
                FrameWriter::new(stream),
            )
        };
        (split(left), split(right))
    }

    #[test]
    #[cfg(unix)]
    fn both_sides_agree_on_a_session_key() {
        let ((mut cr, mut cw), (mut sr, mut sw)) = raw_pair();
        let config = SecureConfig::default();

        let server = {
            let config = config.clone();
            thread::spawn(move || handshake_server(&mut sr, &mut sw, &config).unwrap())
        };
        let client = handshake_client(&mut cr, &mut cw, &config).unwrap();
        let server = server.join().unwrap();

        let sealed = client.encode(b"over the wire").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"over the wire");
        assert_eq!(&server.decode(sealed).unwrap()[..], b"over the wire");

        let reply = server.encode(b"and back").unwrap();
        assert_eq!(&client.decode(reply).unwrap()[..], b"and back");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = SessionCipher::new(&[7u8; 32]);
        let mut sealed = cipher.encode(b"payload").unwrap().to_vec();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.decode(Bytes::from(sealed)).is_err());

        let other = SessionCipher::new(&[8u8; 32]);
        let sealed = cipher.encode(b"payload").unwrap();
        assert!(other.decode(sealed).is_err());
    }

    #[test]
    fn fresh_nonce_per_frame() {
        let cipher = SessionCipher::new(&[1u8; 32]);
        let a = cipher.encode(b"same").unwrap();
        let b = cipher.encode(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn short_wire_is_rejected() {
        let cipher = SessionCipher::new(&[1u8; 32]);
        assert!(cipher.decode(Bytes::from_static(b"tiny")).is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let rendered = format!("{:?}", SessionCipher::new(&[0xAB; 32]));
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    #[cfg(unix)]
    fn garbage_hello_is_a_protocol_error() {
        let ((_cr, mut cw), (mut sr, mut sw)) = raw_pair();
        cw.send(b"definitely not a hello").unwrap();

        let err = handshake_server(&mut sr, &mut sw, &SecureConfig::default()).unwrap_err();
        assert!(matches!(err, SecureError::Protocol(_)));
    }

    #[test]
    #[cfg(unix)]
    fn peer_hangup_is_disconnected() {
        let ((cr, cw), (mut sr, mut sw)) = raw_pair();
        drop(cr);
        drop(cw);

        let err = handshake_server(&mut sr, &mut sw, &SecureConfig::default()).unwrap_err();
        assert!(matches!(err, SecureError::Disconnected));
    }

    #[test]
    fn silent_peer_times_out() {
        struct AlwaysTimedOut;

        impl Read for AlwaysTimedOut {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                thread::sleep(Duration::from_millis(5));
                Err(std::io::Error::from(ErrorKind::TimedOut))
            }
        }

        let mut reader = FrameReader::new(AlwaysTimedOut);
        let mut writer = FrameWriter::new(std::io::sink());
        let config = SecureConfig {
            timeout: Duration::from_millis(50),
            ..SecureConfig::default()
        };

        let err = handshake_client(&mut reader, &mut writer, &config).unwrap_err();
        assert!(matches!(err, SecureError::Timeout(_)));
    }
}
