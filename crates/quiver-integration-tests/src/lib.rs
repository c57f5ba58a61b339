//! Quiver Integration Tests
//!
//! End-to-end tests that run the managed consumer against in-process
//! stand-ins for `nsqd` and `nsqlookupd`. It is NOT published to crates.io.
//!
//! # Test Categories
//!
//! - **consume**: delivery, payload decoding and acknowledgment
//! - **flow_control**: RDY credit, backoff, touch and capacity limits
//! - **lifecycle**: start/stop, reconnects, heartbeats and AUTH
//! - **discovery**: nsqlookupd resolution and target reconciliation
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test -p quiver-integration-tests
//!
//! # Run specific test suite
//! cargo test -p quiver-integration-tests --test flow_control
//!
//! # Run with logging
//! RUST_LOG=debug cargo test -p quiver-integration-tests -- --nocapture
//! ```

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
