//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use switchboard_hub::WebConn;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped answering pings.
    TimedOut,
    /// The connection closed for another reason.
    Cancelled,
}

/// Shortest timer period; `tokio::time::interval` rejects zero.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Timer period used for `interval`.
pub fn tick_period(interval: Duration) -> Duration {
    interval.max(MIN_TICK)
}

/// Consecutive missed intervals tolerated before timing out.
pub fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Watch a connection's pong flag.
///
/// Each `interval` tick consumes the alive flag set by inbound pongs and
/// frames. After [`max_missed`] ticks in a row with no activity the
/// connection is considered dead.
pub async fn run_heartbeat(
    conn: Arc<WebConn>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let limit = max_missed(interval, timeout);
    let period = tick_period(interval);
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if conn.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= limit {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
