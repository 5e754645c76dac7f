//! Domain entities for the vending bridge.
//!
//! Nothing in here performs I/O.  The types describe controllers and the
//! rules of one vending session; the `vend-bridge` crate supplies the
//! Bluetooth link, the backend, and the clock.

/// Controller identity and advertised-name parsing.
pub mod device;

/// The per-device session state machine.
pub mod session;
