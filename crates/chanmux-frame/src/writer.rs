use std::io::{ErrorKind, Write};
use std::sync::Arc;

use bytes::BytesMut;
use chanmux_transport::DuplexStream;

use crate::codec::{encode_frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;
use crate::transform::{Identity, Transform};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// One `send` call writes one whole frame. The writer is not internally
/// synchronized; share it behind a mutex when several threads send.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    transform: Arc<dyn Transform>,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            transform: Arc::new(Identity),
        }
    }

    /// Transform, frame and write one payload (blocking).
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let wire = self.transform.encode(payload)?;
        if wire.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: wire.len(),
                max: self.config.max_payload_size,
            });
        }

        self.buf.clear();
        encode_frame(&wire, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Replace the payload transform for subsequent frames.
    pub fn set_transform(&mut self, transform: Arc<dyn Transform>) {
        self.transform = transform;
    }

    /// Name of the active payload transform.
    pub fn transform_name(&self) -> &'static str {
        self.transform.name()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<DuplexStream> {
    /// Create a frame writer for `DuplexStream` and apply the write timeout from config.
    pub fn with_config_stream(inner: DuplexStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::codec::{decode_frame, HEADER_SIZE};
    use crate::transform::tests::XorTransform;

    fn decode_all(bytes: Vec<u8>) -> Vec<Vec<u8>> {
        let mut wire = BytesMut::from(bytes.as_slice());
        let mut out = Vec::new();
        while let Some(frame) = decode_frame(&mut wire, usize::MAX).unwrap() {
            out.push(frame.payload.to_vec());
        }
        out
    }

    #[test]
    fn write_multiple_frames() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));

        writer.send(b"one").unwrap();
        writer.send(b"two").unwrap();
        writer.send(b"three").unwrap();

        let frames = decode_all(writer.into_inner().into_inner());
        assert_eq!(
            frames,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn payload_too_large_rejected() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer.send(b"oversized").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn size_limit_applies_to_transformed_payload() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);
        writer.set_transform(Arc::new(XorTransform(1)));

        // four plaintext bytes grow to five on the wire
        let err = writer.send(b"four").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 5, max: 4 }));
    }

    #[test]
    fn transform_applied_on_write() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.set_transform(Arc::new(XorTransform(0xFF)));
        assert_eq!(writer.transform_name(), "xor");

        writer.send(b"ab").unwrap();
        let bytes = writer.into_inner().into_inner();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(&bytes[HEADER_SIZE..], &[b'X', b'a' ^ 0xFF, b'b' ^ 0xFF]);
    }

    #[test]
    fn flush_propagates() {
        let flushed = Arc::new(AtomicBool::new(false));
        let mut writer = FrameWriter::new(FlushTrackingWriter {
            flushed: Arc::clone(&flushed),
        });

        writer.send(b"x").unwrap();
        assert!(flushed.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupted_write_retries() {
        let mut writer = FrameWriter::new(InterruptedOnce {
            interrupted: false,
            data: Vec::new(),
        });
        writer.send(b"retry").unwrap();
        assert_eq!(decode_all(writer.into_inner().data), vec![b"retry".to_vec()]);
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(b"x").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    #[cfg(unix)]
    fn broken_pipe_surfaces_as_io() {
        let (left, right) = DuplexStream::pair().unwrap();
        drop(right);
        let mut writer = FrameWriter::with_config_stream(left, FrameConfig::default()).unwrap();

        let err = writer.send(b"nobody-listening").unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct InterruptedOnce {
        interrupted: bool,
        data: Vec<u8>,
    }

    impl Write for InterruptedOnce {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
