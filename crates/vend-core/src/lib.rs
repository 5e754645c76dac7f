//! # vend-core
//!
//! Protocol and domain library for bridging a phone-side app to the
//! payment controller fitted in a vending machine.
//!
//! The crate has no dependency on Bluetooth stacks, HTTP clients or async
//! runtimes, so everything in it is testable on any platform.
//!
//! # How a sale flows (for beginners)
//!
//! 1. The app connects to a controller over a single read/write/notify
//!    characteristic and writes `BEGIN_SESSION`.
//! 2. When the customer picks an item the controller notifies
//!    `VEND_REQUEST` carrying price, item number and a nonce.
//! 3. The app forwards those bytes, untouched, to the backend, which answers
//!    with an authorization blob.  The app writes that blob back.
//! 4. The controller reports `VEND_SUCCESS` or `VEND_FAILURE`, then
//!    `SESSION_COMPLETE`.
//!
//! This crate defines:
//!
//! - **`protocol`** – the opcode table and the two frame layouts (10-byte
//!   control frames and 22-byte provisioning frames).
//! - **`domain`** – controller aliases such as `42.vmflow.xyz`, and the
//!   session state machine that sequences steps 1–4.

pub mod domain;
pub mod protocol;

pub use domain::device::{parse_alias, AliasError, Device, NearbyMachine, SiteId};
pub use domain::session::{
    ProtocolError, SessionAction, SessionInput, SessionMachine, SessionOutcome, SessionState,
    VendProgress,
};
pub use protocol::codec::{
    decode_control, decode_provisioning, encode_control, encode_provisioning, CodecError,
    DecodeError, EncodeError,
};
pub use protocol::notification::{Notification, VendDetails};
pub use protocol::opcode::Opcode;
