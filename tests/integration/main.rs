//! syncr integration test harness.
//!
//! Boots real nodes in-process: each test node gets its own home directory,
//! keypair, and TCP request listener on a loopback port, and all discovery
//! goes through an in-process DHT server. No external services, no fixed
//! ports — tests run in parallel.

mod infra;
mod syncing;
mod versioning;

pub use infra::*;
