use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};

use crate::drivers::CancelToken;

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Conventional exit status for a process ended by SIGINT.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InterruptAction {
    Cancel,
    Exit(i32),
}

/// The first Ctrl+C asks the run to stop cleanly, any later one ends the
/// process.
fn interrupt_action(count: usize) -> InterruptAction {
    if count <= 1 {
        InterruptAction::Cancel
    } else {
        InterruptAction::Exit(INTERRUPT_EXIT_CODE)
    }
}

/// Cancels `token` on the first Ctrl+C. The acquisition loop notices the flag,
/// tears the device down and saves what it has. A second Ctrl+C exits
/// immediately, e.g. while a device open or a long CSV write is stuck.
///
/// The signal is awaited on a single-threaded runtime in a helper thread, so
/// the acquisition itself stays synchronous. Only the first call installs a
/// handler.
pub fn cancel_on_ctrl_c(token: CancelToken) {
    if HANDLER_INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        info!("Ctrl+C handler already installed");
        return;
    }

    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to create signal handler runtime: {}", e);
                return;
            }
        };

        rt.block_on(async {
            let mut count = 0;
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Unable to listen for Ctrl+C: {}", e);
                    return;
                }
                count += 1;
                match interrupt_action(count) {
                    InterruptAction::Cancel => {
                        warn!("Received Ctrl+C - stopping acquisition, press again to abort");
                        token.cancel();
                    }
                    InterruptAction::Exit(code) => {
                        error!("Received second Ctrl+C - exiting without cleanup");
                        std::process::exit(code);
                    }
                }
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_interrupt_exits() {
        assert_eq!(interrupt_action(1), InterruptAction::Cancel);
        assert_eq!(interrupt_action(2), InterruptAction::Exit(INTERRUPT_EXIT_CODE));
        assert_eq!(interrupt_action(5), InterruptAction::Exit(130));
    }
}
