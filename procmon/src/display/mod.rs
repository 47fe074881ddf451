pub mod formatter;
pub mod headless;
pub mod viewer;

use std::sync::atomic::{AtomicBool, Ordering};

/// The process-wide signal flag. Its only legal writer is the signal
/// handler; the display drivers poll it between refreshes.
static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

pub fn install_sigint_handler() {
    if let Err(err) = ctrlc::set_handler(|| SIGINT_RECEIVED.store(true, Ordering::SeqCst)) {
        log::warn!("could not install Ctrl+C handler: {err}");
    }
}

pub fn sigint_received() -> bool {
    SIGINT_RECEIVED.load(Ordering::SeqCst)
}
