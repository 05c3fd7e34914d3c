//! Command trait definition for CLI commands.
//!
//! Each subcommand implements [`Command`]; dispatch across the subcommand
//! enum uses `enum_dispatch`. The `command_line` parameter carries the full
//! invocation for the `@PG` header line.

use enum_dispatch::enum_dispatch;

/// Trait implemented by all squall CLI commands.
#[enum_dispatch]
pub trait Command {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, command_line: &str) -> anyhow::Result<()>;
}
