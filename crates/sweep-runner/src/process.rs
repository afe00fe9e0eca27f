use std::io;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum ChildOutcome {
    Exited(ExitStatus),
    /// Killed because the sweep was aborted.
    Killed,
}

/// Waits for `child`, killing it as soon as `abort` is cancelled.
pub fn supervise(
    child: &mut Child,
    abort: &CancellationToken,
    poll: Duration,
) -> io::Result<ChildOutcome> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ChildOutcome::Exited(status));
        }
        if abort.is_cancelled() {
            tracing::warn!(pid = child.id(), "abort requested, killing child");
            // The child may have exited between try_wait and kill.
            if let Err(e) = child.kill() {
                if e.kind() != io::ErrorKind::InvalidInput {
                    return Err(e);
                }
            }
            let _ = child.wait()?;
            return Ok(ChildOutcome::Killed);
        }
        thread::sleep(poll);
    }
}
