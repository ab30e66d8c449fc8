//! Connection population metrics.
//!
//! Provides the rolling session-acceptance rate counter, the
//! advance-if-greater primitive used for high-water marks, and the report
//! types returned by `Server::metrics_report`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::router::EndpointReport;

/// Milliseconds of history that count towards the current rate.
const RATE_INTERVAL_MILLIS: u64 = 1000;

/// Current unix time in milliseconds.
pub(crate) fn unix_millis() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Advance `cell` to `observed` if greater, retrying on contention.
///
/// The stored maximum never regresses: a lost race is retried against the
/// freshest observed value, and the loop exits once the cell already holds
/// something at least as large.
pub(crate) fn advance_max(cell: &AtomicU64, observed: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while observed > current {
        match cell.compare_exchange_weak(current, observed, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

/// Rolling window over the timestamps of recent events.
///
/// Holds at most `capacity` timestamps; the current rate is the number of
/// events recorded within the last second. The maximum observed rate is
/// tracked with an advance-if-greater cell.
pub(crate) struct RateCounter {
    window: Mutex<VecDeque<u64>>,
    capacity: usize,
    max_rate: AtomicU64,
}

impl RateCounter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            max_rate: AtomicU64::new(0),
        }
    }

    /// Record `n` events at `now` (unix millis) and refresh the max rate.
    pub(crate) fn count(&self, now: u64, n: u32) {
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        for _ in 0..n {
            if window.len() == self.capacity {
                window.pop_front();
            }
            window.push_back(now);
        }
        let rate = rate_at(&window, now);
        advance_max(&self.max_rate, rate);
    }

    /// Events recorded within the last second, as seen from `now`.
    pub(crate) fn current_rate(&self, now: u64) -> u64 {
        match self.window.lock() {
            Ok(window) => rate_at(&window, now),
            Err(_) => 0,
        }
    }

    pub(crate) fn max_rate(&self) -> u64 {
        self.max_rate.load(Ordering::Acquire)
    }
}

fn rate_at(window: &VecDeque<u64>, now: u64) -> u64 {
    window
        .iter()
        .filter(|&&t| now.saturating_sub(t) < RATE_INTERVAL_MILLIS)
        .count() as u64
}

/// Point-in-time view of the connection population.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    /// Time the report was taken.
    pub time: DateTime<Utc>,
    /// Port the server is listening on.
    pub port: u16,
    pub sessions: SessionCounts,
    pub websocket_sessions: WebSocketCounts,
    /// Per-endpoint request and byte counters from the router.
    pub endpoints: Vec<EndpointReport>,
}

/// HTTP session counters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionCounts {
    /// Sessions currently registered.
    pub current: usize,
    /// High-water mark of concurrent sessions.
    pub max: usize,
    /// Sessions accepted since start.
    pub total: u64,
    /// Accepts within the last second.
    pub current_rate: u64,
    /// Maximum observed one-second accept rate.
    pub max_rate: u64,
}

/// WebSocket session counters.
#[derive(Debug, Clone, Serialize)]
pub struct WebSocketCounts {
    pub current: usize,
    pub max: usize,
    pub total: u64,
}
