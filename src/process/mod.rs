//! External process execution with cooperative cancellation.

mod cancel;
mod runner;

pub use cancel::CancelToken;
pub use runner::{
    parse_progress_hint, printable_command, quote_arg, shell_invocation, LogSink, ProcessRunner,
    ProgressSink, ShellPlatform,
};
