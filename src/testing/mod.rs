//! Testing infrastructure for Gatekeeper.
//!
//! - **Mocks**: scripted gate runners, fixing agents and a store wrapper that
//!   injects write failures
//! - **Fixtures**: temporary git repositories (test-only)
//!
//! # Example
//!
//! ```rust,ignore
//! use gatekeeper::testing::{MockFixingAgent, MockGateRunner};
//!
//! let gates = MockGateRunner::failing_then_passing(2);
//! let agent = MockFixingAgent::new().with_success(true);
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;

#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
