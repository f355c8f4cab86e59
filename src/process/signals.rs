//! Termination signal listening.
//!
//! Instead of interrupt-style in-process signal delivery, a dedicated
//! listener thread catches SIGINT/SIGTERM and forwards them into the
//! designated handle's termination protocol, which ends the process.

use super::handle::ProcessHandle;
use nix::sys::signal::Signal;
use std::sync::Arc;
use tracing::debug;

/// Install the process-wide termination listener for `handle`.
///
/// The listener only reports that a termination signal fired, not which
/// one, so the cascade always forwards SIGTERM; SIGINT and SIGTERM run the
/// same protocol anyway. Installing a second listener in the same process
/// is a logged no-op.
pub fn listen_for_termination(handle: Arc<ProcessHandle>) {
    let result = ctrlc::set_handler(move || handle.handle_termination_signal(Signal::SIGTERM));
    if let Err(e) = result {
        debug!("Termination listener already installed: {}", e);
    }
}
