//! Typed view of frames the device pushes to the app.
//!
//! The transport hands the bridge raw bytes.  [`Notification::parse`] turns
//! them into one variant per device → app opcode so the session state
//! machine never has to look at `bytes[0]` itself.  The raw bytes are kept
//! on `VendRequest` because they are forwarded to the backend unmodified.

use crate::protocol::codec::{decode_control, ControlFrame, DecodeError};
use crate::protocol::opcode::{Direction, Opcode};

/// Price, item and nonce as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendDetails {
    pub price: u16,
    pub item_number: u16,
    pub nonce: u16,
}

impl From<ControlFrame> for VendDetails {
    fn from(frame: ControlFrame) -> Self {
        Self {
            price: frame.price,
            item_number: frame.item_number,
            nonce: frame.nonce,
        }
    }
}

/// A decoded device → app frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The customer picked an item; `raw` is the exact frame to relay.
    VendRequest { details: VendDetails, raw: Vec<u8> },
    VendSuccess(VendDetails),
    VendFailure(VendDetails),
    SessionComplete,
}

impl Notification {
    /// Parses one notification frame.
    ///
    /// # Errors
    ///
    /// Any [`DecodeError`] from the control codec, or
    /// [`DecodeError::WrongFrameKind`] if the frame carries an app → device opcode.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let frame = decode_control(bytes)?;
        if frame.opcode.direction() != Direction::DeviceToApp {
            return Err(DecodeError::WrongFrameKind(frame.opcode));
        }

        let notification = match frame.opcode {
            Opcode::VendRequest => Notification::VendRequest {
                details: frame.into(),
                raw: bytes.to_vec(),
            },
            Opcode::VendSuccess => Notification::VendSuccess(frame.into()),
            Opcode::VendFailure => Notification::VendFailure(frame.into()),
            Opcode::SessionComplete => Notification::SessionComplete,
            other => return Err(DecodeError::WrongFrameKind(other)),
        };
        Ok(notification)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Notification::VendRequest { .. } => Opcode::VendRequest,
            Notification::VendSuccess(_) => Opcode::VendSuccess,
            Notification::VendFailure(_) => Opcode::VendFailure,
            Notification::SessionComplete => Opcode::SessionComplete,
        }
    }
}
