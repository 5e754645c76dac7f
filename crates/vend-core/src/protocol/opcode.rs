//! The one-byte opcode space shared by the app and the payment controller.
//!
//! Every frame on the characteristic starts with one of these bytes.  The
//! space is closed: a byte outside the table is rejected by the decoder
//! instead of being silently ignored.
//!
//! | Opcode | Name              | Frame kind   | Direction     |
//! |--------|-------------------|--------------|---------------|
//! | 0x00   | SET_SUBDOMAIN     | provisioning | app → device  |
//! | 0x01   | SET_PASSKEY       | provisioning | app → device  |
//! | 0x02   | BEGIN_SESSION     | control      | app → device  |
//! | 0x04   | CANCEL_SESSION    | control      | app → device  |
//! | 0x06   | SET_WIFI_SSID     | provisioning | app → device  |
//! | 0x07   | SET_WIFI_PASSWORD | provisioning | app → device  |
//! | 0x0A   | VEND_REQUEST      | control      | device → app  |
//! | 0x0B   | VEND_SUCCESS      | control      | device → app  |
//! | 0x0C   | VEND_FAILURE      | control      | device → app  |
//! | 0x0D   | SESSION_COMPLETE  | control      | device → app  |
//!
//! # Legacy ASCII dialect
//!
//! Older firmware spoke an ASCII-keyed dialect with 10-byte frames.  It is
//! not supported; its bytes (`0x61..=0x66`) decode as unknown opcodes.  The
//! semantic mapping, for reference when reading captures from such devices:
//!
//! | ASCII | Binary equivalent             |
//! |-------|-------------------------------|
//! | `'a'` | VEND_REQUEST (0x0A)           |
//! | `'b'` | VEND_SUCCESS (0x0B)           |
//! | `'c'` | VEND_FAILURE (0x0C)           |
//! | `'d'` | SESSION_COMPLETE (0x0D)       |
//! | `'e'` | BEGIN_SESSION (0x02)          |
//! | `'f'` | authorization write (no opcode of its own) |

use serde::{Deserialize, Serialize};

/// All opcodes understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // Provisioning (app → device)
    SetSubdomain = 0x00,
    SetPasskey = 0x01,
    // Session control (app → device)
    BeginSession = 0x02,
    CancelSession = 0x04,
    // Provisioning (app → device)
    SetWifiSsid = 0x06,
    SetWifiPassword = 0x07,
    // Notifications (device → app)
    VendRequest = 0x0A,
    VendSuccess = 0x0B,
    VendFailure = 0x0C,
    SessionComplete = 0x0D,
}

/// Which frame layout an opcode travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `[opcode][price:2][item:2][nonce:2]`, padded to 10 bytes.
    Control,
    /// `[opcode][utf-8 text][0x00][padding]`, exactly 22 bytes.
    Provisioning,
}

/// Which side originates frames carrying an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AppToDevice,
    DeviceToApp,
}

impl Opcode {
    /// Every opcode in wire order.
    pub const ALL: [Opcode; 10] = [
        Opcode::SetSubdomain,
        Opcode::SetPasskey,
        Opcode::BeginSession,
        Opcode::CancelSession,
        Opcode::SetWifiSsid,
        Opcode::SetWifiPassword,
        Opcode::VendRequest,
        Opcode::VendSuccess,
        Opcode::VendFailure,
        Opcode::SessionComplete,
    ];

    /// The raw byte written on the wire.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn kind(self) -> FrameKind {
        match self {
            Opcode::SetSubdomain
            | Opcode::SetPasskey
            | Opcode::SetWifiSsid
            | Opcode::SetWifiPassword => FrameKind::Provisioning,
            Opcode::BeginSession
            | Opcode::CancelSession
            | Opcode::VendRequest
            | Opcode::VendSuccess
            | Opcode::VendFailure
            | Opcode::SessionComplete => FrameKind::Control,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Opcode::VendRequest
            | Opcode::VendSuccess
            | Opcode::VendFailure
            | Opcode::SessionComplete => Direction::DeviceToApp,
            _ => Direction::AppToDevice,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(Opcode::SetSubdomain),
            0x01 => Ok(Opcode::SetPasskey),
            0x02 => Ok(Opcode::BeginSession),
            0x04 => Ok(Opcode::CancelSession),
            0x06 => Ok(Opcode::SetWifiSsid),
            0x07 => Ok(Opcode::SetWifiPassword),
            0x0A => Ok(Opcode::VendRequest),
            0x0B => Ok(Opcode::VendSuccess),
            0x0C => Ok(Opcode::VendFailure),
            0x0D => Ok(Opcode::SessionComplete),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Opcode::SetSubdomain => "SET_SUBDOMAIN",
            Opcode::SetPasskey => "SET_PASSKEY",
            Opcode::BeginSession => "BEGIN_SESSION",
            Opcode::CancelSession => "CANCEL_SESSION",
            Opcode::SetWifiSsid => "SET_WIFI_SSID",
            Opcode::SetWifiPassword => "SET_WIFI_PASSWORD",
            Opcode::VendRequest => "VEND_REQUEST",
            Opcode::VendSuccess => "VEND_SUCCESS",
            Opcode::VendFailure => "VEND_FAILURE",
            Opcode::SessionComplete => "SESSION_COMPLETE",
        };
        write!(f, "{name} (0x{:02X})", self.as_byte())
    }
}
