//! Testing utilities and mock implementations
//!
//! Mocks for exercising the sampler and collectors without an Azure Monitor
//! endpoint.

pub mod mocks;

pub use mocks::*;
