//! Side-effecting operations: files, processes, prompts.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod init;
pub mod iteration_log;
pub mod operator;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod progress_log;
pub mod registry;
pub mod specs;
