// CAN bus I/O primitives: interface open, frame construction and the
// big/little-endian field accessors the protocol drivers decode against.

use std::fmt;

use socketcan::{CanDataFrame, EmbeddedFrame, Id, StandardId};
use thiserror::Error;
use tokio_socketcan::CanSocket;

#[derive(Debug, Error)]
pub enum CanError {
    #[error("failed to open CAN interface {iface}: {source}")]
    Open {
        iface: String,
        #[source]
        source: std::io::Error,
    },
    #[error("CAN I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("short CAN frame: expected 8 bytes, got {0}")]
    ShortFrame(usize),
    #[error("CAN id {0:#x} out of 11-bit standard range")]
    InvalidId(u32),
}

/// A fixed 8-byte CAN 2.0A data frame with an 11-bit standard identifier.
///
/// Payloads shorter than 8 bytes are zero-padded on construction; `Frame` is
/// always a full 8-byte record, matching the reference implementation's
/// `struct can_frame` usage (short reads/writes are errors, never partial).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub data: [u8; 8],
}

impl Frame {
    pub fn new(id: u16, data: [u8; 8]) -> Self {
        Frame { id, data }
    }

    pub fn from_slice(id: u16, data: &[u8]) -> Result<Self, CanError> {
        if data.len() > 8 {
            return Err(CanError::ShortFrame(data.len()));
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Ok(Frame { id, data: buf })
    }

    /// 16-bit big-endian read at `offset`.
    pub fn be16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// 16-bit little-endian read at `offset`.
    pub fn le16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// 32-bit big-endian read at `offset`.
    pub fn be32(&self, offset: usize) -> u32 {
        u32::from_be_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// 16-bit big-endian write at `offset`.
    pub fn set_be16(&mut self, offset: usize, v: u16) {
        self.data[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// 16-bit little-endian write at `offset`.
    pub fn set_le16(&mut self, offset: usize, v: u16) {
        self.data[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn to_can_data_frame(self) -> Result<CanDataFrame, CanError> {
        let sid = StandardId::new(self.id).ok_or(CanError::InvalidId(self.id as u32))?;
        CanDataFrame::new(sid, &self.data).ok_or(CanError::ShortFrame(self.data.len()))
    }

    pub fn from_can_data_frame(frame: &CanDataFrame) -> Self {
        let id = match frame.id() {
            Id::Standard(sid) => sid.as_raw(),
            Id::Extended(eid) => (eid.as_raw() & 0x7ff) as u16,
        };
        let raw = frame.data();
        let mut data = [0u8; 8];
        data[..raw.len()].copy_from_slice(raw);
        Frame { id, data }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}#", self.id)?;
        for b in &self.data {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A non-blocking, event-loop-friendly CAN interface handle.
///
/// Wraps `tokio_socketcan::CanSocket`, an async `Stream`/`Sink` over a raw
/// SocketCAN socket, so driver code can `select!` on frame arrival alongside
/// timers and the broker's event loop rather than polling a blocking fd.
pub struct CanIface {
    name: String,
    socket: CanSocket,
}

impl CanIface {
    pub fn open(name: &str) -> Result<Self, CanError> {
        let socket = CanSocket::open(name).map_err(|source| CanError::Open {
            iface: name.to_string(),
            source,
        })?;
        Ok(CanIface {
            name: name.to_string(),
            socket,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_mut(&mut self) -> &mut CanSocket {
        &mut self.socket
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), CanError> {
        use futures_util::sink::SinkExt;
        let data_frame = frame.to_can_data_frame()?;
        self.socket
            .send(socketcan::CanFrame::Data(data_frame))
            .await?;
        Ok(())
    }

    /// Await the next frame. A remote/error frame is skipped (recursing)
    /// rather than surfaced, since the protocol drivers only ever speak in
    /// data frames; the stream ending counts as the "read returns zero or
    /// unrecoverable error" case from §7.3 and is propagated as an error.
    pub async fn recv(&mut self) -> Result<Frame, CanError> {
        use futures_util::stream::StreamExt;
        loop {
            return match self.socket.next().await {
                Some(Ok(socketcan::CanFrame::Data(data_frame))) => {
                    Ok(Frame::from_can_data_frame(&data_frame))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => Err(CanError::Io(e)),
                None => Err(CanError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "CAN socket closed",
                ))),
            };
        }
    }
}

impl fmt::Debug for CanIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanIface").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn be16_le16_roundtrip() {
        let mut f = Frame::new(0x100, [0u8; 8]);
        f.set_be16(0, 0x1234);
        assert_eq!(f.be16(0), 0x1234);
        assert_eq!(f.data[0], 0x12);
        assert_eq!(f.data[1], 0x34);

        f.set_le16(2, 0x1234);
        assert_eq!(f.le16(2), 0x1234);
        assert_eq!(f.data[2], 0x34);
        assert_eq!(f.data[3], 0x12);
    }

    #[test]
    fn be32_reads_four_bytes_big_endian() {
        let f = Frame::new(0x200, [0x01, 0x02, 0x03, 0x04, 0, 0, 0, 0]);
        assert_eq!(f.be32(0), 0x01020304);
    }

    #[test]
    fn from_slice_zero_pads_short_payloads() {
        let f = Frame::from_slice(0x300, &[0xaa, 0xbb]).unwrap();
        assert_eq!(f.data, [0xaa, 0xbb, 0, 0, 0, 0, 0, 0]);
    }
}
