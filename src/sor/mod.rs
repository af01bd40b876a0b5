//! System of record access.
//!
//! - [`traits::SorBackend`]: the two primitives (`batch_read`, `batch_write`) for one chunk
//! - [`client::SorBatchClient`]: chunking, bounded parallelism, per-chunk retry
//! - [`http::HttpSor`]: REST backend
//! - [`memory::InMemorySor`]: in-process backend

pub mod traits;
pub mod client;
pub mod http;
pub mod memory;

/// SoR object types the engine touches.
pub mod object_types {
    /// Bookings and other per-person rows
    pub const ITEMS: &str = "items";
    /// Parent rows (e.g., `exam:42`) carrying capacity and the derived active count
    pub const SUBJECTS: &str = "subjects";
}
