//! Workspace root crate.
//!
//! Carries the cross-crate integration test suites under `tests/integration/`.
//! The actual gateway lives in `services/gateway`; the wire codec lives in
//! `crates/dny-protocol`. Nothing here is meant to be depended on directly.
