//! Retry and circuit-breaking around remote calls.

pub mod retry;
pub mod circuit_breaker;
