//! Startup capability probes.
//!
//! Neither probe can fail: an error answer is itself the result.

use crate::commands::MiCommand;
use crate::dispatch::CommandDispatch;

/// Whether GDB can run CLI commands through `-interpreter-exec console`.
pub async fn probe_enhanced_console(dispatch: &dyn CommandDispatch) -> bool {
    match dispatch.queue_command(MiCommand::console("echo")).await {
        Ok(_) => {
            log::debug!("Console probe succeeded, using enhanced console");
            true
        }
        Err(e) => {
            log::debug!("Console probe failed ({}), using basic console", e);
            false
        }
    }
}

/// The features reported by `-list-features`, or nothing if it fails.
pub async fn list_features(dispatch: &dyn CommandDispatch) -> Vec<String> {
    match dispatch.queue_command(MiCommand::list_features()).await {
        Ok(result) => {
            let features = result.string_list("features");
            log::debug!("GDB features: {:?}", features);
            features
        }
        Err(e) => {
            log::debug!("Feature listing failed: {}", e);
            Vec::new()
        }
    }
}
