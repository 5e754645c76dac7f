//! Transport adapters implementing [`Transport`](crate::application::transport::Transport).
//!
//! - [`ble`]: the real Bluetooth LE link, built on `btleplug` (feature `ble`).
//! - [`mock`]: a scripted in-memory link used by the test suites.

#[cfg(feature = "ble")]
pub mod ble;
pub mod mock;
