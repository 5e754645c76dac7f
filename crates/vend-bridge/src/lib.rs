//! vend-bridge library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does vend-bridge do? (for beginners)
//!
//! Payment controllers in vending machines have no internet connection of
//! their own during a sale.  The bridge runs next to them (on a phone or a
//! small computer with Bluetooth) and:
//!
//! 1. Finds controllers by their advertised alias (`42.vmflow.xyz`).
//! 2. Opens a vending session, waits for the customer's selection, and
//!    relays the controller's signed request to the credit backend.
//! 3. Writes the backend's authorization back so the machine dispenses.
//! 4. Registers new controllers and writes their Wi-Fi credentials.
//!
//! The pure protocol lives in `vend-core`; this crate adds the Bluetooth
//! transport, the HTTP backend client, configuration, and the CLI.

/// Application layer: use cases and ports.
pub mod application;

/// Infrastructure layer: BLE, HTTP and on-disk adapters.
pub mod infrastructure;
