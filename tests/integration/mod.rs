//! Integration test suite for Ralph.
//!
//! These tests run whole waves against temporary git repositories, a JSON
//! file task store, and a scripted agent backend. The HTTP backend is
//! exercised against a mock agent runtime.
//!
//! # Test Categories
//!
//! - `scenarios`: layering, concurrency limits, revisions, failures
//! - `resume`: attempt accounting and retry rules across restarts
//! - `cancel`: cooperative cancellation
//! - `backend_http`: session lifecycle of the HTTP backend
//!
//! # CI Compatibility
//!
//! No test talks to a real agent runtime or issue tracker.

mod fixtures;

mod backend_http;
mod cancel;
mod scenarios;
