//! Mirror Store: local cache records and counters with TTLs.
//!
//! - [`traits::MirrorStore`]: the contract every component is handed explicitly
//! - [`memory::InMemoryMirror`]: DashMap implementation
//! - [`redis::RedisMirror`]: Redis implementation with server-side counter scripts

pub mod traits;
pub mod memory;
pub mod redis;
