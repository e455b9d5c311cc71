//! Local hardware sampling for capability reports.
//!
//! Probes fill the hardware fields of a [`Capability`]. Slot counts and
//! sandbox availability come from the supervisor, which owns admission.

use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::config::StaticCapability;
use crate::domain::Capability;

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(10);
const GPU_QUERY: &str = "name,memory.total,memory.free,multiprocessor_count";
const GPU_QUERY_BASIC: &str = "name,memory.total,memory.free";

#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn sample(&self) -> Capability;
}

/// Fixed values, adjustable at runtime. Used when hardware probing is
/// disabled and throughout the tests.
pub struct StaticProbe {
    capability: RwLock<Capability>,
}

impl StaticProbe {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability: RwLock::new(capability),
        }
    }

    pub fn from_config(fixed: &StaticCapability) -> Self {
        Self::new(Capability {
            gpu_model: fixed.gpu_model.clone(),
            vram_total_mb: fixed.vram_total_mb,
            vram_free_mb: fixed.vram_free_mb,
            compute_units: fixed.compute_units,
            cpu_cores: fixed.cpu_cores,
            memory_total_mb: fixed.memory_total_mb,
            memory_free_mb: fixed.memory_free_mb,
            ..Capability::none()
        })
    }

    /// A GPU with `vram_mb` free out of the same total.
    pub fn gpu(model: &str, vram_mb: u64, compute_units: u32) -> Self {
        Self::new(Capability {
            gpu_model: model.to_string(),
            vram_total_mb: vram_mb,
            vram_free_mb: vram_mb,
            compute_units,
            cpu_cores: 8,
            memory_total_mb: 32_768,
            memory_free_mb: 16_384,
            ..Capability::none()
        })
    }

    pub fn update(&self, f: impl FnOnce(&mut Capability)) {
        f(&mut self.capability.write().unwrap_or_else(|e| e.into_inner()));
    }
}

#[async_trait]
impl CapabilityProbe for StaticProbe {
    async fn sample(&self) -> Capability {
        let mut cap = self
            .capability
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        cap.reported_at = Utc::now();
        cap
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuSummary {
    pub model: String,
    pub count: usize,
    pub vram_total_mb: u64,
    pub vram_free_mb: u64,
    pub compute_units: u32,
}

/// Probes GPUs with `nvidia-smi`, CPUs from the OS and memory from
/// `/proc/meminfo`. Hosts without an NVIDIA driver report no GPU.
#[derive(Debug, Default)]
pub struct NvidiaSmiProbe;

/// Run `nvidia-smi --{query}={fields} --format=csv,noheader,nounits`.
/// `None` when the tool is missing, fails, or hangs.
pub(crate) async fn nvidia_smi_csv(query: &str, fields: &str) -> Option<String> {
    let child = Command::new("nvidia-smi")
        .arg(format!("--{query}={fields}"))
        .arg("--format=csv,noheader,nounits")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .ok()?;
    let output = tokio::time::timeout(NVIDIA_SMI_TIMEOUT, child.wait_with_output())
        .await
        .ok()?
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).to_string())
}

impl NvidiaSmiProbe {
    async fn query(fields: &str) -> Option<String> {
        nvidia_smi_csv("query-gpu", fields).await
    }

    async fn gpus() -> Option<GpuSummary> {
        if let Some(out) = Self::query(GPU_QUERY).await {
            return parse_nvidia_smi(&out);
        }
        let out = Self::query(GPU_QUERY_BASIC).await?;
        tracing::warn!("nvidia-smi has no multiprocessor_count; reporting 0 compute units");
        parse_nvidia_smi(&out)
    }
}

#[async_trait]
impl CapabilityProbe for NvidiaSmiProbe {
    async fn sample(&self) -> Capability {
        let mut cap = Capability::none();
        if let Some(gpu) = Self::gpus().await {
            cap.gpu_model = if gpu.count > 1 {
                format!("{} x{}", gpu.model, gpu.count)
            } else {
                gpu.model
            };
            cap.vram_total_mb = gpu.vram_total_mb;
            cap.vram_free_mb = gpu.vram_free_mb;
            cap.compute_units = gpu.compute_units;
        }
        cap.cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        if let Ok(text) = tokio::fs::read_to_string("/proc/meminfo").await {
            if let Some((total, free)) = parse_meminfo(&text) {
                cap.memory_total_mb = total;
                cap.memory_free_mb = free;
            }
        }
        cap.reported_at = Utc::now();
        cap
    }
}

/// Sum all GPUs listed in `nvidia-smi --format=csv,noheader,nounits` output.
pub fn parse_nvidia_smi(output: &str) -> Option<GpuSummary> {
    let mut summary: Option<GpuSummary> = None;
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let cols: Vec<&str> = line.split(',').map(str::trim).collect();
        if cols.len() < 3 {
            continue;
        }
        let (Ok(total), Ok(free)) = (cols[1].parse::<u64>(), cols[2].parse::<u64>()) else {
            continue;
        };
        let units = cols.get(3).and_then(|c| c.parse::<u32>().ok()).unwrap_or(0);
        let s = summary.get_or_insert_with(|| GpuSummary {
            model: cols[0].to_string(),
            count: 0,
            vram_total_mb: 0,
            vram_free_mb: 0,
            compute_units: 0,
        });
        s.count += 1;
        s.vram_total_mb += total;
        s.vram_free_mb += free;
        s.compute_units += units;
    }
    summary
}

/// `(MemTotal, MemAvailable)` in MB.
pub fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        text.lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb / 1024)
    };
    Some((field("MemTotal:")?, field("MemAvailable:").or_else(|| field("MemFree:"))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_gpu_output() {
        let out = "NVIDIA GeForce RTX 3090, 24576, 23000, 82\nNVIDIA GeForce RTX 3090, 24576, 1000, 82\n";
        let gpu = parse_nvidia_smi(out).unwrap();
        assert_eq!(gpu.count, 2);
        assert_eq!(gpu.vram_total_mb, 49_152);
        assert_eq!(gpu.vram_free_mb, 24_000);
        assert_eq!(gpu.compute_units, 164);
    }

    #[test]
    fn basic_query_and_garbage() {
        let gpu = parse_nvidia_smi("Tesla T4, 15360, 15000\n").unwrap();
        assert_eq!(gpu.compute_units, 0);
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("No devices were found").is_none());
        assert!(parse_nvidia_smi("X, [N/A], 10").is_none());
    }

    #[test]
    fn meminfo_prefers_available() {
        let text = "MemTotal:       32768000 kB\nMemFree:         1024000 kB\nMemAvailable:   16384000 kB\n";
        assert_eq!(parse_meminfo(text), Some((32_000, 16_000)));
        assert_eq!(parse_meminfo("MemFree: 1024 kB"), None);
    }

    #[tokio::test]
    async fn static_probe_updates() {
        let probe = StaticProbe::gpu("A100", 40_000, 108);
        probe.update(|c| c.vram_free_mb = 10_000);
        let cap = probe.sample().await;
        assert_eq!(cap.vram_free_mb, 10_000);
        assert_eq!(cap.vram_total_mb, 40_000);
        assert!(!cap.sandbox_available);
    }

    #[tokio::test]
    async fn nvidia_probe_never_fails() {
        let cap = NvidiaSmiProbe.sample().await;
        assert!(cap.cpu_cores >= 1);
    }
}
