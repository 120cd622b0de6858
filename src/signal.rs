//! SIGINT/SIGTERM handling
//!
//! A signal trips the shared [`CancelToken`]; archivers and extractors see it
//! between entries and stop with `Cancelled`. A second signal exits at once.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use runner_archive::CancelToken;

/// Exit code used when a second signal arrives.
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Route SIGINT/SIGTERM into `token`.
pub fn install(token: CancelToken) -> Result<(), ctrlc::Error> {
    let count = Arc::new(AtomicU8::new(0));
    ctrlc::set_handler(move || {
        if count.fetch_add(1, Ordering::SeqCst) == 0 {
            tracing::warn!("received termination signal, cancelling");
            token.cancel();
        } else {
            std::process::exit(EXIT_CODE_INTERRUPTED);
        }
    })
}
