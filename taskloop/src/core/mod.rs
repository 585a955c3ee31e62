//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (plan text, rule tables, counts) and return deterministic outputs
//! suitable for tests.

pub mod backoff;
pub mod classifier;
pub mod completion;
pub mod phase;
pub mod plan;
pub mod session_id;
pub mod types;
