//! Global atomic counters for brokering and supervision.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit the current values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    jobs_submitted: AtomicU64,
    offers_declined: AtomicU64,
    peers_lost: AtomicU64,
    peers_evicted: AtomicU64,
    sandboxes_killed: AtomicU64,
    ledger_entries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            offers_declined: AtomicU64::new(0),
            peers_lost: AtomicU64::new(0),
            peers_evicted: AtomicU64::new(0),
            sandboxes_killed: AtomicU64::new(0),
            ledger_entries: AtomicU64::new(0),
        }
    }

    pub fn inc_jobs_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_submitted", "counter incremented");
    }

    pub fn inc_offers_declined(&self) {
        self.offers_declined.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "offers_declined", "counter incremented");
    }

    pub fn inc_peers_lost(&self) {
        self.peers_lost.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "peers_lost", "counter incremented");
    }

    pub fn add_peers_evicted(&self, n: u64) {
        self.peers_evicted.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "peers_evicted", n, "counter incremented");
    }

    pub fn inc_sandboxes_killed(&self) {
        self.sandboxes_killed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sandboxes_killed", "counter incremented");
    }

    pub fn inc_ledger_entries(&self) {
        self.ledger_entries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "ledger_entries", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            jobs_submitted = self.jobs_submitted(),
            offers_declined = self.offers_declined(),
            peers_lost = self.peers_lost(),
            peers_evicted = self.peers_evicted(),
            sandboxes_killed = self.sandboxes_killed(),
            ledger_entries = self.ledger_entries(),
        );
    }

    pub fn jobs_submitted(&self) -> u64 {
        self.jobs_submitted.load(Ordering::Relaxed)
    }

    pub fn offers_declined(&self) -> u64 {
        self.offers_declined.load(Ordering::Relaxed)
    }

    pub fn peers_lost(&self) -> u64 {
        self.peers_lost.load(Ordering::Relaxed)
    }

    pub fn peers_evicted(&self) -> u64 {
        self.peers_evicted.load(Ordering::Relaxed)
    }

    pub fn sandboxes_killed(&self) -> u64 {
        self.sandboxes_killed.load(Ordering::Relaxed)
    }

    pub fn ledger_entries(&self) -> u64 {
        self.ledger_entries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = Metrics::new();
        m.inc_jobs_submitted();
        m.inc_jobs_submitted();
        m.inc_offers_declined();
        m.add_peers_evicted(3);
        assert_eq!(m.jobs_submitted(), 2);
        assert_eq!(m.offers_declined(), 1);
        assert_eq!(m.peers_evicted(), 3);
        assert_eq!(m.sandboxes_killed(), 0);
        m.flush();
    }
}
