//! Parent-process liveness watching.
//!
//! When the daemon is spawned by a front-end tool, the parent keeps our
//! stdin open for its lifetime; EOF means it exited. The watcher only fires
//! a shutdown signal — the serve loop owns the actual (abrupt) shutdown, so
//! flushing hooks stay composable and testable. This is a best-effort
//! liveness signal, not a clean shutdown protocol.

use std::io::Read;

use tokio::sync::oneshot;
use tracing::debug;

/// Resolves when the controlling parent process closes our stdin.
pub fn parent_exit_signal() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                // Input on stdin is not part of any protocol; drain it.
                Ok(n) if n > 0 => continue,
                // EOF or a read error: the parent is gone either way.
                _ => break,
            }
        }
        debug!("stdin closed, parent process exited");
        let _ = tx.send(());
    });
    rx
}
