//! Debugging session description and configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ControlError, Result};

/// How the debuggee is reached. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// GDB starts a fresh process
    Run,
    /// GDB attaches to a running process
    Attach,
    /// GDB inspects a core dump
    Core,
    /// GDB talks to a remote stub
    Remote,
}

impl FromStr for SessionKind {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "run" => Ok(SessionKind::Run),
            "attach" => Ok(SessionKind::Attach),
            "core" => Ok(SessionKind::Core),
            "remote" => Ok(SessionKind::Remote),
            other => Err(ControlError::InvalidConfig(format!(
                "unknown session kind `{other}`"
            ))),
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionKind::Run => "run",
            SessionKind::Attach => "attach",
            SessionKind::Core => "core",
            SessionKind::Remote => "remote",
        };
        write!(f, "{s}")
    }
}

/// Settings for one debugging session.
///
/// Every field has a default, so a JSON document only needs the fields it
/// wants to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub kind: SessionKind,
    pub gdb_path: PathBuf,
    pub program: Option<PathBuf>,
    /// Extra arguments placed right after the executable
    pub gdb_args: Vec<String>,
    /// Suffix of the stdout line that tells us GDB accepts commands
    pub ready_prompt: String,
    pub launch_timeout_ms: u64,
    pub terminate_grace_ms: u64,
    pub destroy_wait_ms: u64,
    pub exit_poll_ms: u64,
    /// Terminate GDB once the last debuggee exits
    pub auto_terminate: bool,
    /// Terminal device handed to GDB for the debuggee's I/O
    pub inferior_tty: Option<String>,
    /// Temporary breakpoint location used by `start_program`
    pub stop_at: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kind: SessionKind::Run,
            gdb_path: PathBuf::from("gdb"),
            program: None,
            gdb_args: Vec::new(),
            ready_prompt: "(gdb)".to_string(),
            launch_timeout_ms: 30_000,
            terminate_grace_ms: 2_000,
            destroy_wait_ms: 5_000,
            exit_poll_ms: 100,
            auto_terminate: true,
            inferior_tty: None,
            stop_at: None,
        }
    }
}

impl SessionConfig {
    pub fn new(kind: SessionKind, gdb_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            gdb_path: gdb_path.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| ControlError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gdb_path.as_os_str().is_empty() {
            return Err(ControlError::InvalidConfig("gdb_path is empty".into()));
        }
        if self.launch_timeout_ms == 0 {
            return Err(ControlError::InvalidConfig(
                "launch_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.ready_prompt.trim().is_empty() {
            return Err(ControlError::InvalidConfig("ready_prompt is empty".into()));
        }
        Ok(())
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn destroy_wait(&self) -> Duration {
        Duration::from_millis(self.destroy_wait_ms)
    }

    pub fn exit_poll(&self) -> Duration {
        Duration::from_millis(self.exit_poll_ms.max(1))
    }
}

/// One requested debugging session. The id is chosen by whoever creates
/// the session and names every event the controller raises.
#[derive(Debug, Clone)]
pub struct DebuggerSession {
    id: String,
    config: SessionConfig,
}

impl DebuggerSession {
    pub fn new(id: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.config.kind
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id.clone(),
            control_id: format!("gdb[{}]", self.id),
        }
    }
}

/// Identifies the session and controller an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub session_id: String,
    pub control_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_uses_defaults_for_missing_fields() {
        let config = SessionConfig::from_json_str(
            r#"{"kind":"attach","gdb_path":"/usr/bin/gdb","launch_timeout_ms":500}"#,
        )
        .unwrap();

        assert_eq!(config.kind, SessionKind::Attach);
        assert_eq!(config.gdb_path, PathBuf::from("/usr/bin/gdb"));
        assert_eq!(config.launch_timeout(), Duration::from_millis(500));
        assert_eq!(config.ready_prompt, "(gdb)");
        assert_eq!(config.terminate_grace(), Duration::from_secs(2));
        assert!(config.auto_terminate);
        assert!(config.program.is_none());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = SessionConfig::from_json_str(r#"{"launch_timeout_ms":0}"#).unwrap_err();
        assert!(matches!(err, ControlError::InvalidConfig(_)));
    }

    #[test]
    fn test_empty_gdb_path_is_rejected() {
        let config = SessionConfig::new(SessionKind::Run, "");
        assert!(matches!(
            config.validate(),
            Err(ControlError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(SessionConfig::from_json_str(r#"{"kind":"replay"}"#).is_err());
        assert!("replay".parse::<SessionKind>().is_err());
    }

    #[test]
    fn test_session_kind_round_trips_through_strings() {
        for kind in [
            SessionKind::Run,
            SessionKind::Attach,
            SessionKind::Core,
            SessionKind::Remote,
        ] {
            assert_eq!(kind.to_string().parse::<SessionKind>().unwrap(), kind);
        }
        assert_eq!("REMOTE".parse::<SessionKind>().unwrap(), SessionKind::Remote);
    }

    #[test]
    fn test_context_is_derived_from_session_id() {
        let session = DebuggerSession::new("s7", SessionConfig::default());
        let context = session.context();
        assert_eq!(context.session_id, "s7");
        assert_eq!(context.control_id, "gdb[s7]");
    }
}
