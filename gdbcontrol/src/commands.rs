//! The GDB/MI commands the controller issues.

use std::fmt;

use crate::record::quote;

/// One MI command, rendered as `-operation arg...` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiCommand {
    operation: String,
    args: Vec<String>,
}

impl MiCommand {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Run a CLI command through the console interpreter
    pub fn console(cli: &str) -> Self {
        Self::new("interpreter-exec").arg("console").arg(quote(cli))
    }

    pub fn gdb_exit() -> Self {
        Self::new("gdb-exit")
    }

    pub fn list_features() -> Self {
        Self::new("list-features")
    }

    pub fn inferior_tty_set(tty: &str) -> Self {
        Self::new("inferior-tty-set").arg(tty)
    }

    pub fn target_detach() -> Self {
        Self::new("target-detach")
    }

    /// Kill the debuggee but keep GDB running
    pub fn kill_inferior() -> Self {
        Self::console("kill")
    }

    pub fn exec_run() -> Self {
        Self::new("exec-run")
    }

    pub fn exec_continue() -> Self {
        Self::new("exec-continue")
    }

    pub fn break_insert_temporary(location: &str) -> Self {
        Self::new("break-insert").arg("-t").arg(location)
    }

    pub fn set_environment(name: &str, value: &str) -> Self {
        Self::new("gdb-set")
            .arg("environment")
            .arg(format!("{name}={value}"))
    }

    pub fn unset_environment() -> Self {
        Self::console("unset environment")
    }
}

impl fmt::Display for MiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{}", self.operation)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
