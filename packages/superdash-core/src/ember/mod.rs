//! Ember+ provider stack.
//!
//! Layered bottom-up: [`ber`] (TLV primitives), [`s101`] (framing and
//! keepalive), [`glow`] (tree elements and consumer requests) and
//! [`provider`] (the TCP service holding the SuperDash tree).

pub mod ber;
pub mod glow;
pub mod provider;
pub mod s101;

pub use provider::{EmberDeviceUpdate, EmberProvider};
