// Library exports for the CLI and integration tests

pub mod agent;
pub mod backend;
pub mod config;
pub mod download;
pub mod network;
pub mod source;
pub mod storage;
pub mod transfer;

// Test support (only available with test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
