//! Executor-side admission control. One table, guarded by the supervisor's
//! mutex, is the only authority that accepts concurrent offers.

use std::collections::HashMap;

use gpulend_ledger::{JobId, PeerId};

use crate::domain::{Capability, ResourceRequirement};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub job_id: JobId,
    pub requester: PeerId,
    pub vram_mb: u64,
    pub compute_units: u32,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

#[derive(Debug, Default)]
pub struct Admission {
    reservations: HashMap<JobId, Reservation>,
}

impl Admission {
    pub fn get(&self, job_id: &JobId) -> Option<&Reservation> {
        self.reservations.get(job_id)
    }

    pub fn active(&self) -> u32 {
        self.reservations.len() as u32
    }

    fn reserved(&self) -> (u64, u32, u32, u64) {
        self.reservations.values().fold((0, 0, 0, 0), |acc, r| {
            (
                acc.0 + r.vram_mb,
                acc.1 + r.compute_units,
                acc.2 + r.cpu_cores,
                acc.3 + r.memory_mb,
            )
        })
    }

    /// Reserve `req` against `available` minus what is already reserved.
    /// On refusal the reason is suitable for a decline message.
    pub fn try_reserve(
        &mut self,
        job_id: &JobId,
        requester: &PeerId,
        req: &ResourceRequirement,
        available: &Capability,
    ) -> Result<(), String> {
        if !available.sandbox_available {
            return Err("sandbox runtime unavailable".into());
        }
        if self.active() >= available.max_concurrent_jobs {
            return Err(format!(
                "no free job slot ({}/{} in use)",
                self.active(),
                available.max_concurrent_jobs
            ));
        }
        let (vram, cu, cpu, mem) = self.reserved();
        let free_vram = available.vram_free_mb.saturating_sub(vram);
        if free_vram < req.min_vram_mb {
            return Err(format!(
                "insufficient vram: need {} MB, {} MB free",
                req.min_vram_mb, free_vram
            ));
        }
        let free_cu = available.compute_units.saturating_sub(cu);
        if free_cu < req.min_compute_units {
            return Err(format!(
                "insufficient compute units: need {}, {} free",
                req.min_compute_units, free_cu
            ));
        }
        if let Some(cores) = req.cpu_cores {
            let free = available.cpu_cores.saturating_sub(cpu);
            if free < cores {
                return Err(format!("insufficient cpu: need {cores} cores, {free} free"));
            }
        }
        if let Some(mb) = req.memory_mb {
            let free = available.memory_free_mb.saturating_sub(mem);
            if free < mb {
                return Err(format!("insufficient memory: need {mb} MB, {free} MB free"));
            }
        }
        self.reservations.insert(
            job_id.clone(),
            Reservation {
                job_id: job_id.clone(),
                requester: requester.clone(),
                vram_mb: req.min_vram_mb,
                compute_units: req.min_compute_units,
                cpu_cores: req.cpu_cores.unwrap_or(0),
                memory_mb: req.memory_mb.unwrap_or(0),
            },
        );
        Ok(())
    }

    pub fn release(&mut self, job_id: &JobId) -> Option<Reservation> {
        self.reservations.remove(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cap(vram_free: u64, slots: u32) -> Capability {
        Capability {
            gpu_model: "gpu".into(),
            vram_total_mb: 24_000,
            vram_free_mb: vram_free,
            compute_units: 100,
            cpu_cores: 8,
            memory_total_mb: 32_000,
            memory_free_mb: 16_000,
            sandbox_available: true,
            max_concurrent_jobs: slots,
            active_jobs: 0,
            reported_at: Utc::now(),
        }
    }

    #[test]
    fn second_reservation_sees_first() {
        let mut adm = Admission::default();
        let req = ResourceRequirement::vram(6_000).with_compute(60);
        let p = PeerId::from("req");
        let avail = cap(10_000, 4);
        adm.try_reserve(&JobId::from("j1"), &p, &req, &avail).unwrap();
        let err = adm
            .try_reserve(&JobId::from("j2"), &p, &req, &avail)
            .unwrap_err();
        assert!(err.contains("vram"));

        adm.release(&JobId::from("j1"));
        adm.try_reserve(&JobId::from("j2"), &p, &req, &avail).unwrap();
    }

    #[test]
    fn slot_and_sandbox_checks() {
        let mut adm = Admission::default();
        let p = PeerId::from("req");
        let req = ResourceRequirement::vram(1);
        adm.try_reserve(&JobId::from("j1"), &p, &req, &cap(10_000, 1)).unwrap();
        assert!(adm
            .try_reserve(&JobId::from("j2"), &p, &req, &cap(10_000, 1))
            .unwrap_err()
            .contains("slot"));

        let mut no_sandbox = cap(10_000, 4);
        no_sandbox.sandbox_available = false;
        assert!(Admission::default()
            .try_reserve(&JobId::from("j3"), &p, &req, &no_sandbox)
            .is_err());
    }

    #[test]
    fn compute_units_are_reserved() {
        let mut adm = Admission::default();
        let p = PeerId::from("req");
        let req = ResourceRequirement::vram(0).with_compute(60);
        adm.try_reserve(&JobId::from("j1"), &p, &req, &cap(10_000, 4)).unwrap();
        assert!(adm
            .try_reserve(&JobId::from("j2"), &p, &req, &cap(10_000, 4))
            .unwrap_err()
            .contains("compute"));
        assert_eq!(adm.active(), 1);
    }
}
