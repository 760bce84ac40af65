//! Helpers for integration tests: a registry server, and builders for
//! layer archives.

// Each test crate uses a different subset of the helpers.
#![allow(dead_code)]

pub mod blobs;
pub mod registry;
