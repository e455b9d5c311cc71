use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of what a peer can execute right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub gpu_model: String,
    pub vram_total_mb: u64,
    pub vram_free_mb: u64,
    pub compute_units: u32,
    pub cpu_cores: u32,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    /// Whether the peer has a working sandbox backend. A peer without one
    /// can submit but is never matched as an executor.
    pub sandbox_available: bool,
    pub max_concurrent_jobs: u32,
    pub active_jobs: u32,
    pub reported_at: DateTime<Utc>,
}

impl Capability {
    /// A capability with no GPU, no free slots and no sandbox.
    pub fn none() -> Self {
        Self {
            gpu_model: String::new(),
            vram_total_mb: 0,
            vram_free_mb: 0,
            compute_units: 0,
            cpu_cores: 0,
            memory_total_mb: 0,
            memory_free_mb: 0,
            sandbox_available: false,
            max_concurrent_jobs: 0,
            active_jobs: 0,
            reported_at: Utc::now(),
        }
    }

    pub fn free_slots(&self) -> u32 {
        self.max_concurrent_jobs.saturating_sub(self.active_jobs)
    }

    /// Resource floor check used by both registry listing and admission.
    pub fn satisfies(&self, req: &ResourceRequirement) -> bool {
        self.vram_free_mb >= req.min_vram_mb
            && self.compute_units >= req.min_compute_units
            && req.cpu_cores.map_or(true, |c| self.cpu_cores >= c)
            && req.memory_mb.map_or(true, |m| self.memory_free_mb >= m)
    }

    /// Whether this peer can take another job at all.
    pub fn can_execute(&self) -> bool {
        self.sandbox_available && self.free_slots() > 0
    }

    /// Fraction of VRAM free scaled by fraction of slots free, in `[0, 1]`.
    pub fn headroom(&self) -> f64 {
        if self.vram_total_mb == 0 || self.max_concurrent_jobs == 0 {
            return 0.0;
        }
        let vram = self.vram_free_mb.min(self.vram_total_mb) as f64 / self.vram_total_mb as f64;
        let slots = self.free_slots() as f64 / self.max_concurrent_jobs as f64;
        vram * slots
    }

    /// Equality on everything except the report timestamp.
    pub fn same_resources(&self, other: &Capability) -> bool {
        Capability {
            reported_at: other.reported_at,
            ..self.clone()
        } == *other
    }

    /// Component-wise minimum of two samples of the same machine. The
    /// timestamp of `self` is kept.
    pub fn conservative(&self, other: &Capability) -> Capability {
        Capability {
            gpu_model: self.gpu_model.clone(),
            vram_total_mb: self.vram_total_mb.min(other.vram_total_mb),
            vram_free_mb: self.vram_free_mb.min(other.vram_free_mb),
            compute_units: self.compute_units.min(other.compute_units),
            cpu_cores: self.cpu_cores.min(other.cpu_cores),
            memory_total_mb: self.memory_total_mb.min(other.memory_total_mb),
            memory_free_mb: self.memory_free_mb.min(other.memory_free_mb),
            sandbox_available: self.sandbox_available && other.sandbox_available,
            max_concurrent_jobs: self.max_concurrent_jobs.min(other.max_concurrent_jobs),
            active_jobs: self.active_jobs.max(other.active_jobs),
            reported_at: self.reported_at,
        }
    }
}

/// Minimum resources a job needs from its executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub min_vram_mb: u64,
    pub min_compute_units: u32,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

impl ResourceRequirement {
    pub fn vram(min_vram_mb: u64) -> Self {
        Self {
            min_vram_mb,
            ..Default::default()
        }
    }

    pub fn with_compute(mut self, units: u32) -> Self {
        self.min_compute_units = units;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(total: u64, free: u64, cu: u32) -> Capability {
        Capability {
            gpu_model: "test".into(),
            vram_total_mb: total,
            vram_free_mb: free,
            compute_units: cu,
            cpu_cores: 8,
            memory_total_mb: 32_000,
            memory_free_mb: 16_000,
            sandbox_available: true,
            max_concurrent_jobs: 2,
            active_jobs: 0,
            reported_at: Utc::now(),
        }
    }

    #[test]
    fn satisfies_checks_every_floor() {
        let cap = gpu(16_000, 12_000, 80);
        assert!(cap.satisfies(&ResourceRequirement::vram(12_000).with_compute(80)));
        assert!(!cap.satisfies(&ResourceRequirement::vram(12_001)));
        assert!(!cap.satisfies(&ResourceRequirement::vram(0).with_compute(81)));

        let mut req = ResourceRequirement::vram(1);
        req.cpu_cores = Some(16);
        assert!(!cap.satisfies(&req));
        req.cpu_cores = None;
        req.memory_mb = Some(16_000);
        assert!(cap.satisfies(&req));
    }

    #[test]
    fn headroom_scales_with_slots() {
        let mut cap = gpu(16_000, 8_000, 10);
        assert!((cap.headroom() - 0.5).abs() < 1e-9);
        cap.active_jobs = 1;
        assert!((cap.headroom() - 0.25).abs() < 1e-9);
        cap.active_jobs = 2;
        assert_eq!(cap.headroom(), 0.0);
        assert!(!cap.can_execute());
    }

    #[test]
    fn same_resources_ignores_timestamp() {
        let a = gpu(16_000, 8_000, 10);
        let mut b = a.clone();
        b.reported_at = a.reported_at + chrono::Duration::seconds(30);
        assert!(a.same_resources(&b));
        b.vram_free_mb -= 1;
        assert!(!a.same_resources(&b));
    }

    #[test]
    fn conservative_takes_minimum() {
        let reported = gpu(16_000, 12_000, 80);
        let mut sampled = reported.clone();
        sampled.vram_free_mb = 4_000;
        sampled.sandbox_available = false;
        let c = reported.conservative(&sampled);
        assert_eq!(c.vram_free_mb, 4_000);
        assert!(!c.sandbox_available);
    }
}
