use std::time::Duration;

use tracing::debug;

use crate::registry::RoomRegistry;

/// Runs `registry.cleanup_inactive()` on a fixed cadence until the process
/// shuts down. A room cancelled here closes every outstanding session
/// cleanly; a client that reconnects afterward transparently triggers room
/// recreation via `get_or_create`.
pub async fn run(registry: RoomRegistry, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so we don't sweep at t=0.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        debug!("reaper sweep starting");
        registry.cleanup_inactive().await;
    }
}
