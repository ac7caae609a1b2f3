//! Testing utilities and mock implementations
//!
//! Lets the pub/sub client and the purchase flow run without a broker,
//! the license API or a terminal.

pub mod mocks;

pub use mocks::*;
