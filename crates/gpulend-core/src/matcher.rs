//! Matcher: picks one executor for a job from a registry snapshot.
//!
//! Candidates must be live, meet the VRAM and compute floor, have a working
//! sandbox and a free slot. Among them the highest
//! `trust_score × headroom` wins; ties go to fewer recent failures, then to
//! the lowest peer id. The decision holds no lock on the chosen peer, so the
//! dispatcher treats acceptance as provisional.

use std::cmp::Ordering;
use std::collections::HashSet;

use gpulend_ledger::PeerId;

use crate::domain::JobRequest;
use crate::registry::{PeerRecord, RegistryHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("no peer currently meets the job's requirement")]
    NoCandidate,
}

pub fn score(record: &PeerRecord) -> f64 {
    record.trust_score * record.capability.headroom()
}

fn rank(a: &PeerRecord, b: &PeerRecord) -> Ordering {
    score(b)
        .total_cmp(&score(a))
        .then_with(|| a.recent_failures.cmp(&b.recent_failures))
        .then_with(|| a.peer_id.cmp(&b.peer_id))
}

/// Choose among `candidates` (already live and above the floor).
pub fn select<'a>(
    candidates: impl IntoIterator<Item = &'a PeerRecord>,
    request: &JobRequest,
    exclude: &HashSet<PeerId>,
) -> Option<&'a PeerRecord> {
    candidates
        .into_iter()
        .filter(|r| !exclude.contains(&r.peer_id))
        .filter(|r| r.capability.satisfies(&request.requirement))
        .filter(|r| r.capability.can_execute())
        .min_by(|a, b| rank(a, b))
}

#[derive(Clone)]
pub struct Matcher {
    registry: RegistryHandle,
}

impl Matcher {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    /// Match against the registry as of this call, skipping `exclude`.
    pub fn match_job(
        &self,
        request: &JobRequest,
        exclude: &HashSet<PeerId>,
    ) -> Result<PeerRecord, MatchError> {
        let live = self.registry.list(&request.requirement);
        let chosen = select(&live, request, exclude).cloned();
        match chosen {
            Some(record) => {
                tracing::debug!(
                    peer = %record.peer_id.short(),
                    score = score(&record),
                    candidates = live.len(),
                    "matched job"
                );
                Ok(record)
            }
            None => Err(MatchError::NoCandidate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, PayloadRef, ResourceRequirement};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn peer(id: &str, vram_free: u64, vram_total: u64, cu: u32, trust: f64) -> PeerRecord {
        PeerRecord {
            peer_id: PeerId::from(id),
            addresses: vec![],
            capability: Capability {
                gpu_model: "gpu".into(),
                vram_total_mb: vram_total,
                vram_free_mb: vram_free,
                compute_units: cu,
                cpu_cores: 8,
                memory_total_mb: 32_000,
                memory_free_mb: 16_000,
                sandbox_available: true,
                max_concurrent_jobs: 1,
                active_jobs: 0,
                reported_at: Utc::now(),
            },
            last_seen: Instant::now(),
            reachable: true,
            trust_score: trust,
            recent_failures: 0,
            latency_ms: None,
        }
    }

    fn request(vram: u64, cu: u32) -> JobRequest {
        JobRequest::new(
            PeerId::from("req"),
            ResourceRequirement::vram(vram).with_compute(cu),
            PayloadRef::image("img"),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn big_peer_wins_small_never_qualifies() {
        let a = peer("a", 16_000, 16_000, 100, 0.5);
        let b = peer("b", 4_000, 4_000, 20, 0.5);
        let none = HashSet::new();
        let chosen = select([&a, &b], &request(8_000, 0), &none).unwrap();
        assert_eq!(chosen.peer_id.as_str(), "a");

        // Even with perfect trust B stays below the floor.
        let b_trusted = peer("b", 4_000, 4_000, 20, 1.0);
        let chosen = select([&a, &b_trusted], &request(8_000, 0), &none).unwrap();
        assert_eq!(chosen.peer_id.as_str(), "a");
    }

    #[test]
    fn chosen_peer_always_meets_requirement() {
        let peers: Vec<PeerRecord> = (0..12)
            .map(|i| {
                let free = 1_000 * (i as u64 + 1);
                peer(&format!("p{i:02}"), free, 12_000, 10 * (i + 1), 0.1 * (i % 5) as f64 + 0.1)
            })
            .collect();
        let none = HashSet::new();
        for vram in (0..=14_000).step_by(500) {
            for cu in [0, 15, 40, 90, 130] {
                let req = request(vram, cu);
                match select(&peers, &req, &none) {
                    Some(p) => {
                        assert!(p.capability.vram_free_mb >= vram);
                        assert!(p.capability.compute_units >= cu);
                    }
                    None => assert!(!peers.iter().any(|p| p.capability.vram_free_mb >= vram
                        && p.capability.compute_units >= cu)),
                }
            }
        }
    }

    #[test]
    fn score_prefers_trust_times_headroom() {
        // 0.9 × 0.5 = 0.45 vs 0.5 × 1.0 = 0.5
        let trusted_busy = peer("a", 8_000, 16_000, 50, 0.9);
        let fresh_idle = peer("b", 16_000, 16_000, 50, 0.5);
        let chosen = select([&trusted_busy, &fresh_idle], &request(1, 0), &HashSet::new()).unwrap();
        assert_eq!(chosen.peer_id.as_str(), "b");
    }

    #[test]
    fn ties_break_on_failures_then_id() {
        let mut a = peer("a", 8_000, 8_000, 10, 0.5);
        let b = peer("b", 8_000, 8_000, 10, 0.5);
        let none = HashSet::new();
        assert_eq!(select([&b, &a], &request(1, 0), &none).unwrap().peer_id.as_str(), "a");
        a.recent_failures = 2;
        assert_eq!(select([&a, &b], &request(1, 0), &none).unwrap().peer_id.as_str(), "b");
    }

    #[test]
    fn excluded_full_and_sandboxless_peers_skipped() {
        let a = peer("a", 8_000, 8_000, 10, 0.9);
        let mut b = peer("b", 8_000, 8_000, 10, 0.8);
        b.capability.active_jobs = 1;
        let mut c = peer("c", 8_000, 8_000, 10, 0.7);
        c.capability.sandbox_available = false;
        let d = peer("d", 8_000, 8_000, 10, 0.1);

        let exclude: HashSet<PeerId> = [PeerId::from("a")].into_iter().collect();
        let chosen = select([&a, &b, &c, &d], &request(1, 0), &exclude).unwrap();
        assert_eq!(chosen.peer_id.as_str(), "d");

        let exclude: HashSet<PeerId> = ["a", "d"].into_iter().map(PeerId::from).collect();
        assert!(select([&a, &b, &c, &d], &request(1, 0), &exclude).is_none());
    }
}
