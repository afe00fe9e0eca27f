use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub const EXIT_INTERRUPTED: i32 = 130;

/// Cancels the returned token on the first SIGTERM or SIGINT and exits the
/// process on the second.
///
/// Workers are plain threads, so the signal listener gets its own
/// single-threaded runtime on a background thread.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    // Register handlers before returning so an early Ctrl-C is not missed.
    let (mut sigterm, mut sigint) = runtime.block_on(async {
        Ok::<_, std::io::Error>((
            signal(SignalKind::terminate())?,
            signal(SignalKind::interrupt())?,
        ))
    })?;

    std::thread::Builder::new()
        .name("sweep-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    let name = tokio::select! {
                        _ = sigterm.recv() => "SIGTERM",
                        _ = sigint.recv() => "SIGINT",
                    };
                    if escalate(&token_clone, name) {
                        break;
                    }
                }
            });
            std::process::exit(EXIT_INTERRUPTED);
        })?;

    Ok(token)
}

/// Returns true once the sweep was already aborting and the process should exit.
fn escalate(token: &CancellationToken, signal_name: &str) -> bool {
    if token.is_cancelled() {
        tracing::error!("received second {}, exiting immediately", signal_name);
        return true;
    }
    tracing::warn!(
        "received {}, aborting sweep (send again to exit immediately)",
        signal_name
    );
    token.cancel();
    false
}
