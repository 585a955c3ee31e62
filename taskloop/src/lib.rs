//! Resumable, failure-aware loop runner for external coding agents.
//!
//! A session owns a markdown plan of `- [ ] task` lines. The engine plans
//! from specs, then hands one pending task at a time to an agent process,
//! marking tasks complete and checkpointing progress only after an agent run
//! succeeded.
//!
//! - **[`core`]**: pure logic (plan parsing, phases, error classification,
//!   backoff). No I/O.
//! - **[`io`]**: filesystem state, agent processes, prompts.
//!
//! Orchestration ([`retry`], [`iteration`], [`build_loop`], [`engine`]) ties
//! the two together behind an explicit [`context::EngineContext`].

pub mod build_loop;
pub mod context;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod retry;
pub mod signals;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
