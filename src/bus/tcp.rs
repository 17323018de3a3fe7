//! Frame format:
//! ```text
//! [length: 4 bytes LE][frame: N bytes]
//! ```

use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::error::TransportError;

use super::{Publisher, Subscriber};

/// Writes one length-prefixed frame.
pub fn write_frame(writer: &mut impl Write, frame: &[u8], max_frame_bytes: usize) -> Result<(), TransportError> {
    if frame.len() > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            size: frame.len(),
            max: max_frame_bytes,
        });
    }
    let len = u32::try_from(frame.len()).map_err(|_| TransportError::FrameTooLarge {
        size: frame.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame. `Ok(None)` on a clean end of stream.
///
/// An oversized frame is skipped so the stream stays aligned, then reported.
pub fn read_frame(reader: &mut impl Read, max_frame_bytes: usize) -> Result<Option<Vec<u8>>, TransportError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max_frame_bytes {
        let skipped = io::copy(&mut reader.take(len as u64), &mut io::sink())?;
        if skipped < len as u64 {
            return Ok(None);
        }
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame)?;
    Ok(Some(frame))
}

fn connect(addr: &str) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr).map_err(|e| TransportError::ConnectionFailed {
        addr: addr.to_string(),
        message: e.to_string(),
    })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Reads frames fanned out by a publisher at `addr`.
#[derive(Debug)]
pub struct TcpSubscriber {
    reader: BufReader<TcpStream>,
    max_frame_bytes: usize,
}

impl TcpSubscriber {
    /// Connects to the fan-out address.
    pub fn connect(addr: &str, max_frame_bytes: usize) -> Result<Self, TransportError> {
        let stream = connect(addr)?;
        info!(%addr, "subscribed");
        Ok(Self::from_stream(stream, max_frame_bytes))
    }

    #[must_use]
    pub fn from_stream(stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(stream),
            max_frame_bytes,
        }
    }
}

impl Subscriber for TcpSubscriber {
    fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        read_frame(&mut self.reader, self.max_frame_bytes)
    }
}

/// Pushes frames to a collector at `addr`.
#[derive(Debug)]
pub struct TcpPublisher {
    writer: Mutex<BufWriter<TcpStream>>,
    max_frame_bytes: usize,
}

impl TcpPublisher {
    /// Connects to the push address.
    pub fn connect(addr: &str, max_frame_bytes: usize) -> Result<Self, TransportError> {
        let stream = connect(addr)?;
        info!(%addr, "push connected");
        Ok(Self::from_stream(stream, max_frame_bytes))
    }

    #[must_use]
    pub fn from_stream(stream: TcpStream, max_frame_bytes: usize) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(stream)),
            max_frame_bytes,
        }
    }
}

impl Publisher for TcpPublisher {
    fn publish(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *writer, frame, self.max_frame_bytes).map_err(|e| {
            warn!(error = %e, "publish failed");
            e
        })
    }
}
