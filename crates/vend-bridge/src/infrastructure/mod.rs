//! Infrastructure layer for the bridge.
//!
//! Contains the adapters behind the application ports: the HTTP backend
//! client, the Bluetooth and scripted transports, and configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and `vend_core`,
//! but MUST NOT be imported by the `application` or domain layers.

pub mod backend;
pub mod storage;
pub mod transport;
