//! Wire protocol: the opcode table, the two frame codecs, and typed notifications.

pub mod codec;
pub mod notification;
pub mod opcode;

pub use codec::{
    decode_control, decode_provisioning, encode_control, encode_provisioning, CodecError,
    ControlFrame, DecodeError, EncodeError, CONTROL_FRAME_LEN, PROVISIONING_FRAME_LEN,
};
pub use notification::{Notification, VendDetails};
pub use opcode::{Direction, FrameKind, Opcode};
