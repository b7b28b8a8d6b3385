use std::time::{Duration, Instant};

use log::trace;

use crate::net::framing;

use super::connection::Connection;
use super::registry::ConnectionRegistry;

/// Periodic keep-alive pings.
///
/// Emission only: there is no pong bookkeeping and no forced disconnect
/// on missed heartbeats. A silently dead peer is caught by the
/// transport's end-of-stream/error signal or by the ping write failing,
/// which marks the connection for the next sweep.
pub struct HeartbeatMonitor {
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Schedules the connection's next ping one interval from `now`.
    pub fn arm(&self, conn: &mut Connection, now: Instant) {
        conn.next_ping = now + self.interval;
    }

    /// Earliest pending deadline across the registry. Bounds the poll
    /// timeout so a due ping is never stuck behind a quiet socket.
    pub fn next_deadline(&self, registry: &ConnectionRegistry) -> Option<Instant> {
        registry.values().map(|conn| conn.next_ping).min()
    }

    /// Pings every connection whose deadline has passed and re-arms it.
    /// Returns the number of pings queued.
    pub fn fire_due(&self, registry: &mut ConnectionRegistry, now: Instant) -> usize {
        let ping = framing::ping_frame();
        let mut fired = 0;
        registry.for_each_mut(|token, conn| {
            if conn.next_ping <= now {
                trace!("ping {:?}", token);
                conn.queue(&ping);
                conn.next_ping = now + self.interval;
                fired += 1;
            }
        });
        fired
    }
}
