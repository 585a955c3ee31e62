//! Stable exit codes for taskloop CLI commands.

/// Command succeeded, or the run finished its work.
pub const OK: i32 = 0;
/// Invalid arguments, configuration, or workspace state, or an I/O failure.
pub const ERROR: i32 = 1;
/// A fatal or critical agent error halted the run.
pub const HALTED: i32 = 2;
/// `max_iterations` passes ran with tasks still pending.
pub const LIMIT_REACHED: i32 = 3;
/// A unit kept failing and the operator (or non-interactive policy) stopped.
pub const EXHAUSTED: i32 = 4;
/// No spec source, or planning produced no tasks.
pub const NOTHING_TO_DO: i32 = 5;
/// Interrupted by the operator.
pub const CANCELLED: i32 = 130;
