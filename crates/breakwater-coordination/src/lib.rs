//! Coordination backends for the breakwater circuit breaker.
//!
//! Two implementations of the [`breakwater_types::Coordination`] port:
//!
//! - [`RedisCoordination`] is the distributed backend. State lives in one
//!   Redis hash per logical key; transitions run as atomic server-side Lua
//!   scripts and are broadcast over pub/sub.
//! - [`MemoryCoordination`] is a single-process double with identical
//!   transition rules, for tests and standalone use.
//!
//! The breaker is constructed against the port and never learns which one
//! it is talking to.

pub mod memory;
pub mod redis;

pub use memory::MemoryCoordination;
pub use redis::RedisCoordination;
