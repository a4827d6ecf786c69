pub mod breakpoints;
pub mod execution;
pub mod inspection;
pub mod launch;

pub use breakpoints::{add_breakpoint, clear_breakpoints, resolve_godot_path, set_breakpoints};
pub use execution::{continue_execution, next, pause, step_in, step_out, wait_for_stop};
pub use inspection::{evaluate, scopes, set_variable, stack_trace, threads, variables};
pub use launch::{attach, launch, LaunchConfig, Platform, SceneLaunchMode};

/// Godot runs game scripts on a single thread with this id.
pub const DEFAULT_THREAD_ID: i64 = 1;
