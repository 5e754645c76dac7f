//! Application layer: the use cases of the bridge and the ports they need.
//!
//! - **`transport`** – the [`Transport`](transport::Transport) /
//!   [`FrameChannel`](transport::FrameChannel) boundary and bounded writes.
//! - **`auth`** – the shared credential owner with single-flighted refresh.
//! - **`backend`** – backend error vocabulary and the one-refresh retry rule.
//! - **`credit_relay`** – vend authorization and remote credit.
//! - **`session`** – drives one vending session; one per controller.
//! - **`provisioning`** – registration and Wi-Fi frame pairs.
//! - **`enroll`** – backend-assisted registration of a fresh controller.

pub mod auth;
pub mod backend;
pub mod credit_relay;
pub mod enroll;
pub mod provisioning;
pub mod session;
pub mod transport;
