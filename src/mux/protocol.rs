//! Viewer-facing mux wire format.
//!
//! Every WebSocket message is one binary frame:
//!
//! ```text
//! [type: u8][session id: 8 ASCII bytes, zero-padded][payload...]
//! ```
//!
//! Data-carrying payloads put terminal dimensions first as little-endian
//! `u16`s so the viewer can size its grid before painting. Compressed output
//! is a complete gzip stream preceded by an advisory uncompressed length.
//!
//! Encoding and decoding are pure, with no I/O, no state.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Total header length: type byte plus session id.
pub const HEADER_LEN: usize = 9;

/// Wire length of a session id.
pub const SESSION_ID_LEN: usize = 8;

/// Frame type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxFrameType {
    /// Server → client: live terminal output.
    Output = 0x01,
    /// Client → server: keystrokes for a session.
    Input = 0x02,
    /// Client → server: viewport resize.
    Resize = 0x03,
    /// Server → client: session created (1) or destroyed (0).
    SessionState = 0x04,
    /// Server → client: clear your terminal for this session, a fresh
    /// snapshot follows.
    Resync = 0x05,
    /// Client → server: request a scrollback snapshot.
    BufferRequest = 0x06,
    /// Server → client: gzip-batched background output.
    CompressedOutput = 0x07,
    /// Client → server: which session the viewer is looking at.
    ActiveSessionHint = 0x08,
    /// Server → client: sent once when the connection is ready.
    Init = 0xFF,
}

impl MuxFrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Output),
            0x02 => Some(Self::Input),
            0x03 => Some(Self::Resize),
            0x04 => Some(Self::SessionState),
            0x05 => Some(Self::Resync),
            0x06 => Some(Self::BufferRequest),
            0x07 => Some(Self::CompressedOutput),
            0x08 => Some(Self::ActiveSessionHint),
            0xFF => Some(Self::Init),
            _ => None,
        }
    }
}

/// Decode failures. Malformed frames are ignored by the receive loop, never
/// fatal to the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxDecodeError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("truncated payload for {0:?}: {1} bytes")]
    TruncatedPayload(MuxFrameType, usize),
    #[error("session id is not ASCII")]
    BadSessionId,
}

/// A decoded mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    Output {
        session_id: String,
        cols: u16,
        rows: u16,
        data: Bytes,
    },
    Input {
        session_id: String,
        data: Bytes,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    SessionState {
        session_id: String,
        created: bool,
    },
    Resync {
        session_id: String,
    },
    BufferRequest {
        session_id: String,
    },
    CompressedOutput {
        session_id: String,
        cols: u16,
        rows: u16,
        uncompressed_len: u32,
        data: Bytes,
    },
    /// `None` means "no active session" (all-zero id on the wire).
    ActiveSessionHint {
        session_id: Option<String>,
    },
    Init,
}

impl MuxFrame {
    pub fn frame_type(&self) -> MuxFrameType {
        match self {
            Self::Output { .. } => MuxFrameType::Output,
            Self::Input { .. } => MuxFrameType::Input,
            Self::Resize { .. } => MuxFrameType::Resize,
            Self::SessionState { .. } => MuxFrameType::SessionState,
            Self::Resync { .. } => MuxFrameType::Resync,
            Self::BufferRequest { .. } => MuxFrameType::BufferRequest,
            Self::CompressedOutput { .. } => MuxFrameType::CompressedOutput,
            Self::ActiveSessionHint { .. } => MuxFrameType::ActiveSessionHint,
            Self::Init => MuxFrameType::Init,
        }
    }

    /// Encode to one wire message.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Output {
                session_id,
                cols,
                rows,
                data,
            } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + 4 + data.len());
                put_header(&mut buf, MuxFrameType::Output, session_id);
                buf.put_u16_le(*cols);
                buf.put_u16_le(*rows);
                buf.put(data.as_ref());
                buf.freeze()
            }
            Self::Input { session_id, data } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
                put_header(&mut buf, MuxFrameType::Input, session_id);
                buf.put(data.as_ref());
                buf.freeze()
            }
            Self::Resize {
                session_id,
                cols,
                rows,
            } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + 4);
                put_header(&mut buf, MuxFrameType::Resize, session_id);
                buf.put_u16_le(*cols);
                buf.put_u16_le(*rows);
                buf.freeze()
            }
            Self::SessionState {
                session_id,
                created,
            } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + 1);
                put_header(&mut buf, MuxFrameType::SessionState, session_id);
                buf.put_u8(u8::from(*created));
                buf.freeze()
            }
            Self::Resync { session_id } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN);
                put_header(&mut buf, MuxFrameType::Resync, session_id);
                buf.freeze()
            }
            Self::BufferRequest { session_id } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN);
                put_header(&mut buf, MuxFrameType::BufferRequest, session_id);
                buf.freeze()
            }
            Self::CompressedOutput {
                session_id,
                cols,
                rows,
                uncompressed_len,
                data,
            } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + 8 + data.len());
                put_header(&mut buf, MuxFrameType::CompressedOutput, session_id);
                buf.put_u16_le(*cols);
                buf.put_u16_le(*rows);
                buf.put_u32_le(*uncompressed_len);
                buf.put(data.as_ref());
                buf.freeze()
            }
            Self::ActiveSessionHint { session_id } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN);
                put_header(
                    &mut buf,
                    MuxFrameType::ActiveSessionHint,
                    session_id.as_deref().unwrap_or(""),
                );
                buf.freeze()
            }
            Self::Init => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN);
                put_header(&mut buf, MuxFrameType::Init, "");
                buf.freeze()
            }
        }
    }

    /// Decode one wire message.
    pub fn decode(data: &[u8]) -> Result<Self, MuxDecodeError> {
        if data.len() < HEADER_LEN {
            return Err(MuxDecodeError::TooShort(data.len()));
        }
        let frame_type =
            MuxFrameType::from_u8(data[0]).ok_or(MuxDecodeError::UnknownType(data[0]))?;
        let session_id = decode_session_id(&data[1..HEADER_LEN])?;
        let payload = &data[HEADER_LEN..];

        match frame_type {
            MuxFrameType::Output => {
                if payload.len() < 4 {
                    return Err(MuxDecodeError::TruncatedPayload(frame_type, payload.len()));
                }
                Ok(Self::Output {
                    session_id,
                    cols: u16::from_le_bytes([payload[0], payload[1]]),
                    rows: u16::from_le_bytes([payload[2], payload[3]]),
                    data: Bytes::copy_from_slice(&payload[4..]),
                })
            }
            MuxFrameType::Input => Ok(Self::Input {
                session_id,
                data: Bytes::copy_from_slice(payload),
            }),
            MuxFrameType::Resize => {
                if payload.len() < 4 {
                    return Err(MuxDecodeError::TruncatedPayload(frame_type, payload.len()));
                }
                Ok(Self::Resize {
                    session_id,
                    cols: u16::from_le_bytes([payload[0], payload[1]]),
                    rows: u16::from_le_bytes([payload[2], payload[3]]),
                })
            }
            MuxFrameType::SessionState => {
                if payload.is_empty() {
                    return Err(MuxDecodeError::TruncatedPayload(frame_type, 0));
                }
                Ok(Self::SessionState {
                    session_id,
                    created: payload[0] != 0,
                })
            }
            MuxFrameType::Resync => Ok(Self::Resync { session_id }),
            MuxFrameType::BufferRequest => Ok(Self::BufferRequest { session_id }),
            MuxFrameType::CompressedOutput => {
                if payload.len() < 8 {
                    return Err(MuxDecodeError::TruncatedPayload(frame_type, payload.len()));
                }
                Ok(Self::CompressedOutput {
                    session_id,
                    cols: u16::from_le_bytes([payload[0], payload[1]]),
                    rows: u16::from_le_bytes([payload[2], payload[3]]),
                    uncompressed_len: u32::from_le_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ]),
                    data: Bytes::copy_from_slice(&payload[8..]),
                })
            }
            MuxFrameType::ActiveSessionHint => Ok(Self::ActiveSessionHint {
                session_id: if session_id.is_empty() {
                    None
                } else {
                    Some(session_id)
                },
            }),
            MuxFrameType::Init => Ok(Self::Init),
        }
    }
}

fn put_header(buf: &mut BytesMut, frame_type: MuxFrameType, session_id: &str) {
    buf.put_u8(frame_type as u8);
    let id = session_id.as_bytes();
    let take = id.len().min(SESSION_ID_LEN);
    buf.put_slice(&id[..take]);
    for _ in take..SESSION_ID_LEN {
        buf.put_u8(0);
    }
}

/// Parse an 8-byte zero-padded ASCII session id. An all-zero id decodes to
/// the empty string.
fn decode_session_id(raw: &[u8]) -> Result<String, MuxDecodeError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let trimmed = &raw[..end];
    if !trimmed.is_ascii() {
        return Err(MuxDecodeError::BadSessionId);
    }
    Ok(String::from_utf8_lossy(trimmed).into_owned())
}
