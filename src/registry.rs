//! Shared session tables and accounting.
//!
//! Three concurrent mappings coordinate the acceptor, the per-session
//! workers and the idle sweeper:
//! - session id -> handle (present for the session's whole lifetime)
//! - session id -> read-start timestamp (present only while a read is in
//!   flight; cleared by a drop guard so error paths cannot leak an entry)
//! - websocket session ids (present for the upgraded session's lifetime)
//!
//! Totals use atomic increments; the concurrent high-water marks advance
//! through a compare-exchange retry loop and never regress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;

use crate::metrics::{advance_max, unix_millis};

/// Registered view of a live session.
///
/// The worker keeps exclusive ownership of the session itself; the handle
/// carries just enough state for another actor to force the session closed.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(id: u64, cancel: CancellationToken) -> Self {
        Self { id, cancel }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Force the session closed. Its worker observes this as a stream error
    /// on its current or next I/O operation.
    pub fn force_close(&self) {
        self.cancel.cancel();
    }
}

/// Thread-safe session tables shared by acceptor, workers and sweeper.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<u64, SessionHandle>,
    reads: DashMap<u64, u64>,
    websockets: DashSet<u64>,

    accepted_sessions: AtomicU64,
    accepted_websockets: AtomicU64,
    max_sessions: AtomicU64,
    max_websockets: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next session identity. Identities are monotonically
    /// increasing and never reused; the same counter is the accepted total.
    pub fn next_session_id(&self) -> u64 {
        self.accepted_sessions.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Allocate the next WebSocket session identity (separate counter,
    /// doubles as the accepted WebSocket total).
    pub fn next_websocket_id(&self) -> u64 {
        self.accepted_websockets.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn insert_session(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id(), handle);
        advance_max(&self.max_sessions, self.sessions.len() as u64);
    }

    fn remove_session(&self, id: u64) {
        self.sessions.remove(&id);
    }

    pub fn session(&self, id: u64) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn insert_websocket(&self, id: u64) {
        self.websockets.insert(id);
        advance_max(&self.max_websockets, self.websockets.len() as u64);
    }

    pub fn remove_websocket(&self, id: u64) {
        self.websockets.remove(&id);
    }

    /// Point-in-time view of all in-flight reads as (session id, started).
    pub fn reads_snapshot(&self) -> Vec<(u64, u64)> {
        self.reads.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn websocket_count(&self) -> usize {
        self.websockets.len()
    }

    pub fn accepted_sessions(&self) -> u64 {
        self.accepted_sessions.load(Ordering::Acquire)
    }

    pub fn accepted_websockets(&self) -> u64 {
        self.accepted_websockets.load(Ordering::Acquire)
    }

    pub fn max_sessions(&self) -> u64 {
        self.max_sessions.load(Ordering::Acquire)
    }

    pub fn max_websockets(&self) -> u64 {
        self.max_websockets.load(Ordering::Acquire)
    }

    /// Mark a read as in flight for `id`. The returned guard clears the entry
    /// when dropped, whichever way the read call returns.
    pub fn track_read(&self, id: u64) -> ReadGuard<'_> {
        self.reads.insert(id, unix_millis());
        ReadGuard { registry: self, id }
    }

    #[cfg(test)]
    fn read_in_flight(&self, id: u64) -> bool {
        self.reads.contains_key(&id)
    }
}

/// Clears the read-start entry on drop so the sweeper only ever targets
/// reads that are genuinely pending.
pub struct ReadGuard<'a> {
    registry: &'a SessionRegistry,
    id: u64,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.registry.reads.remove(&self.id);
    }
}

/// Registers a session on construction and deregisters it on drop.
///
/// Workers hold one of these for the whole request loop; any exit path,
/// including an unwind, removes the session from the registry.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: u64,
}

impl SessionGuard {
    pub fn register(registry: Arc<SessionRegistry>, handle: SessionHandle) -> Self {
        let id = handle.id();
        registry.insert_session(handle);
        Self { registry, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64) -> SessionHandle {
        SessionHandle::new(id, CancellationToken::new())
    }

    #[test]
    fn test_ids_are_monotonic_and_count_accepts() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.next_session_id(), 1);
        assert_eq!(registry.next_session_id(), 2);
        assert_eq!(registry.accepted_sessions(), 2);

        assert_eq!(registry.next_websocket_id(), 1);
        assert_eq!(registry.accepted_websockets(), 1);
    }

    #[test]
    fn test_session_guard_registers_and_deregisters() {
        let registry = Arc::new(SessionRegistry::new());
        {
            let _guard = SessionGuard::register(Arc::clone(&registry), handle(7));
            assert!(registry.session(7).is_some());
            assert_eq!(registry.session_count(), 1);
        }
        assert!(registry.session(7).is_none());
        assert_eq!(registry.session_count(), 0);
        // the high-water mark survives the removal
        assert_eq!(registry.max_sessions(), 1);
    }

    #[test]
    fn test_session_guard_deregisters_on_panic() {
        let registry = Arc::new(SessionRegistry::new());
        let reg = Arc::clone(&registry);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = SessionGuard::register(reg, handle(3));
            panic!("worker fault");
        }));
        assert!(result.is_err());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_read_guard_clears_entry() {
        let registry = SessionRegistry::new();
        {
            let _read = registry.track_read(5);
            assert!(registry.read_in_flight(5));
            assert_eq!(registry.reads_snapshot().len(), 1);
        }
        assert!(!registry.read_in_flight(5));
        assert!(registry.reads_snapshot().is_empty());
    }

    #[test]
    fn test_force_close_cancels_token() {
        let cancel = CancellationToken::new();
        let registry = SessionRegistry::new();
        registry.insert_session(SessionHandle::new(1, cancel.clone()));

        registry
            .session(1)
            .expect("session registered")
            .force_close();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_websocket_table() {
        let registry = SessionRegistry::new();
        registry.insert_websocket(1);
        registry.insert_websocket(2);
        assert_eq!(registry.websocket_count(), 2);
        assert_eq!(registry.max_websockets(), 2);

        registry.remove_websocket(1);
        // removing an unknown id is a no-op, not a fault
        registry.remove_websocket(99);
        assert_eq!(registry.websocket_count(), 1);
        assert_eq!(registry.max_websockets(), 2);
    }

    #[test]
    fn test_high_water_mark_under_concurrent_churn() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let id = t * 1000 + i;
                        let _guard =
                            SessionGuard::register(Arc::clone(&registry), handle(id));
                        std::hint::black_box(registry.session_count());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.session_count(), 0);
        let max = registry.max_sessions();
        assert!(max >= 1, "at least one session was live at a time");
        assert!(max <= 8, "never more than one live session per thread");
    }
}
