//! Common test utilities for attachment-fetch integration tests

#[allow(dead_code)]
pub mod assertions;
#[allow(dead_code)]
pub mod fixtures;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use fixtures::*;
