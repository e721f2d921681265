//! Host IPC wire format and endpoint naming.
//!
//! Frame layout:
//!
//! ```text
//! [type: u8][payload length: u24 big-endian][payload...]
//! ```
//!
//! Control payloads are small (JSON session info, big-endian dims); `Output`,
//! `Input` and `Buffer` carry raw bytes. The payload length is capped at
//! 1 MiB to bound allocation on malformed data.
//!
//! The server endpoint is derived from the session id: a Unix domain socket
//! in a per-user runtime directory, or a named pipe on Windows.

use std::io;
use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum frame payload (1 MiB).
pub const MAX_PAYLOAD: u32 = 1024 * 1024;

/// Frame type byte values. `R` marks the request half of a request/ack pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostFrameType {
    /// C→H (R): fetch the current session snapshot.
    InfoRequest = 0x01,
    /// H→C: JSON session info.
    Info = 0x02,
    /// C→H: raw bytes for the PTY.
    Input = 0x03,
    /// H→C: raw bytes from the PTY.
    Output = 0x04,
    /// C→H (R): `[cols: u16 BE][rows: u16 BE]`.
    Resize = 0x05,
    /// H→C: resize applied.
    ResizeAck = 0x06,
    /// C→H (R): fetch the scrollback snapshot.
    GetBuffer = 0x07,
    /// H→C: scrollback snapshot bytes.
    Buffer = 0x08,
    /// C→H (R): UTF-8 name, zero-length clears.
    SetName = 0x09,
    /// H→C: name applied.
    SetNameAck = 0x0A,
    /// C→H (R): terminate the session.
    Close = 0x0B,
    /// H→C: close acknowledged; the host exits after this.
    CloseAck = 0x0C,
    /// H→C: something in the session record changed; re-fetch Info.
    StateChange = 0x0D,
    /// Both directions: heartbeat.
    Ping = 0x10,
    /// Both directions: heartbeat reply.
    Pong = 0x11,
    /// H→C: UTF-8 error message.
    Error = 0x7F,
}

impl HostFrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::InfoRequest),
            0x02 => Some(Self::Info),
            0x03 => Some(Self::Input),
            0x04 => Some(Self::Output),
            0x05 => Some(Self::Resize),
            0x06 => Some(Self::ResizeAck),
            0x07 => Some(Self::GetBuffer),
            0x08 => Some(Self::Buffer),
            0x09 => Some(Self::SetName),
            0x0A => Some(Self::SetNameAck),
            0x0B => Some(Self::Close),
            0x0C => Some(Self::CloseAck),
            0x0D => Some(Self::StateChange),
            0x10 => Some(Self::Ping),
            0x11 => Some(Self::Pong),
            0x7F => Some(Self::Error),
            _ => None,
        }
    }

    /// True for unsolicited host→client event frames, which the read loop
    /// dispatches to listeners rather than treating as a pending response.
    pub fn is_event(self) -> bool {
        matches!(
            self,
            Self::Output | Self::StateChange | Self::Ping | Self::Pong | Self::Error
        )
    }
}

/// One framed IPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFrame {
    pub frame_type: HostFrameType,
    pub payload: Bytes,
}

impl HostFrame {
    pub fn new(frame_type: HostFrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// A frame with an empty payload.
    pub fn empty(frame_type: HostFrameType) -> Self {
        Self::new(frame_type, Bytes::new())
    }

    /// A `Resize` request frame.
    pub fn resize(cols: u16, rows: u16) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u16(cols);
        buf.put_u16(rows);
        Self::new(HostFrameType::Resize, buf.freeze())
    }

    /// Parse a `Resize` payload into `(cols, rows)`.
    pub fn parse_resize(&self) -> io::Result<(u16, u16)> {
        if self.payload.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "resize payload too short",
            ));
        }
        let mut p = self.payload.clone();
        Ok((p.get_u16(), p.get_u16()))
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let len = self.payload.len() as u32;
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u8((len >> 16) as u8);
        buf.put_u8((len >> 8) as u8);
        buf.put_u8(len as u8);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Write one frame to an async stream.
    pub async fn write_to<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        if self.payload.len() as u32 > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload exceeds maximum",
            ));
        }
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }

    /// Read one complete frame from an async stream. Reads the exact header
    /// then the exact payload length; never leaves a partial frame behind.
    pub async fn read_from<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Self> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        let frame_type = HostFrameType::from_u8(header[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown IPC frame type: 0x{:02x}", header[0]),
            )
        })?;
        let len =
            (u32::from(header[1]) << 16) | (u32::from(header[2]) << 8) | u32::from(header[3]);
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("IPC payload too large: {len} bytes"),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        Ok(Self::new(frame_type, Bytes::from(payload)))
    }

    /// Decode from a byte slice (synchronous, for tests).
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame too short",
            ));
        }
        let frame_type = HostFrameType::from_u8(data[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown IPC frame type: 0x{:02x}", data[0]),
            )
        })?;
        let len =
            ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | (data[3] as usize);
        if len as u32 > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "payload too large",
            ));
        }
        if data.len() < 4 + len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            ));
        }
        Ok(Self::new(
            frame_type,
            Bytes::copy_from_slice(&data[4..4 + len]),
        ))
    }
}

/// Per-user runtime directory holding host sockets.
///
/// `$XDG_RUNTIME_DIR/webmux`, falling back to `/tmp/webmux-{user}`.
pub fn runtime_dir() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join("webmux"),
        _ => {
            let user = std::env::var("USER")
                .or_else(|_| std::env::var("LOGNAME"))
                .unwrap_or_else(|_| "unknown".to_string());
            PathBuf::from(format!("/tmp/webmux-{user}"))
        }
    }
}

/// Unix socket path for a session's host endpoint.
pub fn socket_path(runtime_dir: &std::path::Path, session_id: &str) -> PathBuf {
    runtime_dir.join(format!("host-{session_id}.sock"))
}

/// Extract the session id from a host socket file name, if it is one.
pub fn session_id_from_socket(path: &std::path::Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix("host-")?.strip_suffix(".sock")?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Named-pipe endpoint for a session's host on Windows.
#[cfg(windows)]
pub fn pipe_name(session_id: &str, pid: u32) -> String {
    format!(r"\\.\pipe\mthost-{session_id}-{pid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;

    #[test]
    fn frame_type_round_trip() {
        let types = [
            HostFrameType::InfoRequest,
            HostFrameType::Info,
            HostFrameType::Input,
            HostFrameType::Output,
            HostFrameType::Resize,
            HostFrameType::ResizeAck,
            HostFrameType::GetBuffer,
            HostFrameType::Buffer,
            HostFrameType::SetName,
            HostFrameType::SetNameAck,
            HostFrameType::Close,
            HostFrameType::CloseAck,
            HostFrameType::StateChange,
            HostFrameType::Ping,
            HostFrameType::Pong,
            HostFrameType::Error,
        ];
        for ft in types {
            assert_eq!(HostFrameType::from_u8(ft as u8), Some(ft));
        }
        assert!(HostFrameType::from_u8(0x0E).is_none());
        assert!(HostFrameType::from_u8(0x00).is_none());
        assert!(HostFrameType::from_u8(0xFF).is_none());
    }

    #[test]
    fn event_classification() {
        assert!(HostFrameType::Output.is_event());
        assert!(HostFrameType::StateChange.is_event());
        assert!(HostFrameType::Pong.is_event());
        assert!(!HostFrameType::Info.is_event());
        assert!(!HostFrameType::ResizeAck.is_event());
        assert!(!HostFrameType::Buffer.is_event());
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = HostFrame::new(HostFrameType::Output, Bytes::from_static(b"hello pty"));
        let decoded = HostFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn u24_length_layout() {
        let payload = vec![0xAAu8; 0x01_02_03];
        let frame = HostFrame::new(HostFrameType::Buffer, Bytes::from(payload));
        let wire = frame.encode();
        assert_eq!(wire[0], 0x08);
        assert_eq!(&wire[1..4], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn empty_payload_round_trip() {
        let frame = HostFrame::empty(HostFrameType::Ping);
        let decoded = HostFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.frame_type, HostFrameType::Ping);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn resize_payload_is_big_endian() {
        let frame = HostFrame::resize(0x0102, 0x0304);
        assert_eq!(frame.payload.as_ref(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame.parse_resize().unwrap(), (0x0102, 0x0304));
    }

    #[test]
    fn parse_resize_rejects_short_payload() {
        let frame = HostFrame::new(HostFrameType::Resize, Bytes::from_static(&[0, 80]));
        assert!(frame.parse_resize().is_err());
    }

    #[test]
    fn decode_unknown_type() {
        let err = HostFrame::decode(&[0x55, 0, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("unknown IPC frame type"));
    }

    #[test]
    fn decode_incomplete_payload() {
        // Header says 10 bytes but only 3 follow.
        let data = [0x04, 0, 0, 10, 1, 2, 3];
        assert!(HostFrame::decode(&data).is_err());
    }

    #[test]
    fn oversized_length_rejected() {
        // 0xFF_FF_FF = 16 MiB - 1, above the 1 MiB cap.
        let data = [0x04, 0xFF, 0xFF, 0xFF];
        assert!(HostFrame::decode(&data).is_err());
    }

    #[tokio::test]
    async fn async_write_read_round_trip() {
        let frames = vec![
            HostFrame::new(HostFrameType::Input, Bytes::from_static(b"echo hi\n")),
            HostFrame::resize(120, 40),
            HostFrame::empty(HostFrameType::GetBuffer),
            HostFrame::new(HostFrameType::Error, Bytes::from_static(b"boom")),
        ];

        let mut buf = Vec::new();
        for f in &frames {
            f.write_to(&mut buf).await.unwrap();
        }

        let mut cursor = Cursor::new(buf);
        for expected in &frames {
            let got = HostFrame::read_from(&mut cursor).await.unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn async_read_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(HostFrame::read_from(&mut cursor).await.is_err());
    }

    #[test]
    fn socket_path_round_trip() {
        let dir = Path::new("/run/user/1000/webmux");
        let path = socket_path(dir, "Ab3_-9zX");
        assert_eq!(
            path,
            Path::new("/run/user/1000/webmux/host-Ab3_-9zX.sock")
        );
        assert_eq!(
            session_id_from_socket(&path).as_deref(),
            Some("Ab3_-9zX")
        );
    }

    #[test]
    fn session_id_from_unrelated_file() {
        assert!(session_id_from_socket(Path::new("/tmp/foo.txt")).is_none());
        assert!(session_id_from_socket(Path::new("/tmp/host-.sock")).is_none());
    }
}
