//! Byte codec for the two frame layouts carried on the vending characteristic.
//!
//! Control frames (session and vend lifecycle):
//! ```text
//! [opcode:1][price:2][item_number:2][nonce:2][padding:3]
//! ```
//! Seven significant bytes, always written zero-padded to 10.  Decoding
//! accepts 7 or more bytes and ignores everything after byte 7.
//!
//! Provisioning frames (registration and Wi-Fi setup):
//! ```text
//! [opcode:1][utf-8 text:0..=20][0x00][zero padding]
//! ```
//! Exactly 22 bytes.  All multi-byte integers are big-endian unsigned.

use crate::protocol::opcode::{FrameKind, Opcode};
use thiserror::Error;

// ── Frame constants ───────────────────────────────────────────────────────────

/// Length of an encoded control frame.
pub const CONTROL_FRAME_LEN: usize = 10;

/// Number of significant bytes in a control frame.
pub const CONTROL_FRAME_MIN_LEN: usize = 7;

/// Length of an encoded provisioning frame.
pub const PROVISIONING_FRAME_LEN: usize = 22;

/// Largest provisioning text, in UTF-8 bytes, that still leaves room for the terminator.
pub const MAX_PROVISIONING_TEXT: usize = 20;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised while building a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// The opcode does not travel in the requested frame layout.
    #[error("opcode {0} cannot be encoded in this frame layout")]
    Unsupported(Opcode),

    /// The provisioning text does not fit in the frame.
    #[error("provisioning text is {len} bytes, at most {max} fit in a frame")]
    PayloadTooLong { len: usize, max: usize },

    /// The provisioning text contains a NUL byte, which would end it early on the device.
    #[error("provisioning text contains a NUL byte at offset {0}")]
    InteriorNul(usize),
}

/// Errors raised while parsing a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer length does not satisfy the layout.
    #[error("truncated frame: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// The first byte is not in the opcode table.
    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// The opcode is valid but belongs to the other frame layout.
    #[error("opcode {0} does not belong to this frame layout")]
    WrongFrameKind(Opcode),

    /// The provisioning text is not valid UTF-8.
    #[error("provisioning text is not valid UTF-8")]
    InvalidUtf8,
}

/// Either side of the codec failing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

// ── Control frames ────────────────────────────────────────────────────────────

/// The decoded fields of a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub opcode: Opcode,
    /// Price in the machine's smallest currency unit.
    pub price: u16,
    pub item_number: u16,
    /// Device-chosen value echoed through the authorization round trip.
    pub nonce: u16,
}

impl ControlFrame {
    /// A control frame with all numeric fields zero, as used for BEGIN and CANCEL.
    pub fn bare(opcode: Opcode) -> Self {
        Self {
            opcode,
            price: 0,
            item_number: 0,
            nonce: 0,
        }
    }

    /// Encodes this frame; see [`encode_control`].
    pub fn encode(&self) -> Result<[u8; CONTROL_FRAME_LEN], EncodeError> {
        encode_control(self.opcode, self.price, self.item_number, self.nonce)
    }
}

/// Encodes a 10-byte control frame.
///
/// # Errors
///
/// Returns [`EncodeError::Unsupported`] if `opcode` is a provisioning opcode.
///
/// # Examples
///
/// ```rust
/// use vend_core::protocol::{decode_control, encode_control, Opcode};
///
/// let bytes = encode_control(Opcode::VendRequest, 150, 7, 42).unwrap();
/// assert_eq!(bytes, [0x0A, 0x00, 0x96, 0x00, 0x07, 0x00, 0x2A, 0, 0, 0]);
///
/// let frame = decode_control(&bytes).unwrap();
/// assert_eq!((frame.price, frame.item_number, frame.nonce), (150, 7, 42));
/// ```
pub fn encode_control(
    opcode: Opcode,
    price: u16,
    item_number: u16,
    nonce: u16,
) -> Result<[u8; CONTROL_FRAME_LEN], EncodeError> {
    if opcode.kind() != FrameKind::Control {
        return Err(EncodeError::Unsupported(opcode));
    }

    let mut buf = [0u8; CONTROL_FRAME_LEN];
    buf[0] = opcode.as_byte();
    buf[1..3].copy_from_slice(&price.to_be_bytes());
    buf[3..5].copy_from_slice(&item_number.to_be_bytes());
    buf[5..7].copy_from_slice(&nonce.to_be_bytes());
    // bytes 7..10 stay zero
    Ok(buf)
}

/// Decodes a control frame from at least 7 bytes.  Bytes past the seventh are ignored.
///
/// # Errors
///
/// - [`DecodeError::Truncated`] if `bytes` is shorter than 7.
/// - [`DecodeError::UnknownOpcode`] if the first byte is not in the table.
/// - [`DecodeError::WrongFrameKind`] for provisioning opcodes.
pub fn decode_control(bytes: &[u8]) -> Result<ControlFrame, DecodeError> {
    if bytes.len() < CONTROL_FRAME_MIN_LEN {
        return Err(DecodeError::Truncated {
            needed: CONTROL_FRAME_MIN_LEN,
            available: bytes.len(),
        });
    }

    let opcode = read_opcode(bytes[0])?;
    if opcode.kind() != FrameKind::Control {
        return Err(DecodeError::WrongFrameKind(opcode));
    }

    Ok(ControlFrame {
        opcode,
        price: u16::from_be_bytes([bytes[1], bytes[2]]),
        item_number: u16::from_be_bytes([bytes[3], bytes[4]]),
        nonce: u16::from_be_bytes([bytes[5], bytes[6]]),
    })
}

// ── Provisioning frames ───────────────────────────────────────────────────────

/// Encodes a 22-byte provisioning frame carrying `text`.
///
/// Over-long text is rejected, never truncated.
///
/// # Errors
///
/// - [`EncodeError::Unsupported`] if `opcode` is a control opcode.
/// - [`EncodeError::PayloadTooLong`] if `text` exceeds 20 UTF-8 bytes.
/// - [`EncodeError::InteriorNul`] if `text` contains `'\0'`.
///
/// # Examples
///
/// ```rust
/// use vend_core::protocol::{encode_provisioning, Opcode};
///
/// let frame = encode_provisioning(Opcode::SetSubdomain, "000042").unwrap();
/// assert_eq!(&frame[..8], &[0x00, b'0', b'0', b'0', b'0', b'4', b'2', 0x00]);
/// assert!(frame[8..].iter().all(|b| *b == 0));
/// ```
pub fn encode_provisioning(
    opcode: Opcode,
    text: &str,
) -> Result<[u8; PROVISIONING_FRAME_LEN], EncodeError> {
    if opcode.kind() != FrameKind::Provisioning {
        return Err(EncodeError::Unsupported(opcode));
    }

    let payload = text.as_bytes();
    if payload.len() > MAX_PROVISIONING_TEXT {
        return Err(EncodeError::PayloadTooLong {
            len: payload.len(),
            max: MAX_PROVISIONING_TEXT,
        });
    }
    if let Some(pos) = payload.iter().position(|b| *b == 0) {
        return Err(EncodeError::InteriorNul(pos));
    }

    let mut buf = [0u8; PROVISIONING_FRAME_LEN];
    buf[0] = opcode.as_byte();
    buf[1..1 + payload.len()].copy_from_slice(payload);
    // terminator and padding are already zero
    Ok(buf)
}

/// Decodes a provisioning frame, reading text up to the first `0x00`.
///
/// # Errors
///
/// - [`DecodeError::Truncated`] unless `bytes` is exactly 22 bytes long.
/// - [`DecodeError::UnknownOpcode`] / [`DecodeError::WrongFrameKind`] for a bad first byte.
/// - [`DecodeError::InvalidUtf8`] if the text is not UTF-8.
pub fn decode_provisioning(bytes: &[u8]) -> Result<(Opcode, String), DecodeError> {
    if bytes.len() != PROVISIONING_FRAME_LEN {
        return Err(DecodeError::Truncated {
            needed: PROVISIONING_FRAME_LEN,
            available: bytes.len(),
        });
    }

    let opcode = read_opcode(bytes[0])?;
    if opcode.kind() != FrameKind::Provisioning {
        return Err(DecodeError::WrongFrameKind(opcode));
    }

    let body = &bytes[1..];
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    let text = std::str::from_utf8(&body[..end]).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok((opcode, text.to_string()))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_opcode(byte: u8) -> Result<Opcode, DecodeError> {
    Opcode::try_from(byte).map_err(|_| DecodeError::UnknownOpcode(byte))
}
