//! Resource-based admission control
//!
//! A background monitor samples CPU and heap utilization; the limiter
//! rejects query-serving work when any monitored resource is above its
//! configured threshold. Rejections surface as a retriable "service
//! unavailable" signal to the transport layer.

use crate::{Error, Result};

use parking_lot::Mutex;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A monitored resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Cpu,
    Heap,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Heap => "heap",
        }
    }
}

/// Source of current resource utilizations, as fractions in `[0, 1]`.
pub trait UtilizationScanner: Send + Sync + 'static {
    fn utilization(&self, resource: ResourceType) -> f64;
}

/// Resource monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling cadence
    pub interval: Duration,
    /// Number of CPU samples in the rolling window
    pub cpu_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            cpu_window: 60,
        }
    }
}

/// Samples CPU and heap utilization from the host on a timer.
///
/// CPU is a rolling mean over the last `cpu_window` samples; heap is
/// used/total, honoring the cgroup memory limit when one is set.
pub struct ResourceMonitor {
    cfg: MonitorConfig,
    system: Mutex<System>,
    cpu_samples: Mutex<VecDeque<f64>>,
    cpu_utilization: AtomicU64,
    heap_utilization: AtomicU64,
    shutdown: CancellationToken,
}

impl ResourceMonitor {
    pub fn new(cfg: MonitorConfig) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::new().with_ram()),
        );
        Self {
            cfg,
            system: Mutex::new(system),
            cpu_samples: Mutex::new(VecDeque::new()),
            cpu_utilization: AtomicU64::new(0),
            heap_utilization: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Takes one sample and updates the published utilizations.
    pub fn sample(&self) {
        let (cpu_sample, heap) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();

            let cpu = system.global_cpu_info().cpu_usage() as f64 / 100.0;
            let limit = system
                .cgroup_limits()
                .map(|l| l.total_memory)
                .unwrap_or_else(|| system.total_memory());
            let heap = if limit == 0 {
                0.0
            } else {
                system.used_memory() as f64 / limit as f64
            };
            (cpu, heap)
        };

        let cpu = {
            let mut samples = self.cpu_samples.lock();
            samples.push_back(cpu_sample);
            while samples.len() > self.cfg.cpu_window {
                samples.pop_front();
            }
            samples.iter().sum::<f64>() / samples.len() as f64
        };

        self.cpu_utilization.store(cpu.to_bits(), Ordering::Relaxed);
        self.heap_utilization.store(heap.to_bits(), Ordering::Relaxed);
    }

    /// Runs the sampling loop until the shutdown token is cancelled.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.cfg.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sample(),
                _ = self.shutdown.cancelled() => {
                    debug!("resource monitor stopping");
                    break;
                }
            }
        }
    }
}

impl UtilizationScanner for ResourceMonitor {
    fn utilization(&self, resource: ResourceType) -> f64 {
        let bits = match resource {
            ResourceType::Cpu => self.cpu_utilization.load(Ordering::Relaxed),
            ResourceType::Heap => self.heap_utilization.load(Ordering::Relaxed),
        };
        f64::from_bits(bits)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResourceLabels {
    resource: String,
}

/// Refuses admission when any monitored resource exceeds its threshold.
pub struct ResourceBasedLimiter {
    scanner: Arc<dyn UtilizationScanner>,
    limits: Vec<(ResourceType, f64)>,
    rejections: Family<ResourceLabels, Counter>,
}

impl ResourceBasedLimiter {
    /// `limits` maps each monitored resource to its rejection threshold in
    /// `(0, 1]`; resources without an entry are unlimited.
    pub fn new(
        scanner: Arc<dyn UtilizationScanner>,
        limits: HashMap<ResourceType, f64>,
        registry: &mut Registry,
    ) -> Result<Self> {
        for (resource, limit) in &limits {
            if !(*limit > 0.0 && *limit <= 1.0) {
                return Err(Error::Config(format!(
                    "rejection threshold for {} must be in (0, 1], got {limit}",
                    resource.as_str()
                )));
            }
        }

        let rejections = Family::<ResourceLabels, Counter>::default();
        registry.register(
            "rejected_requests",
            "Total number of requests rejected for resource utilization",
            rejections.clone(),
        );

        let mut limits: Vec<(ResourceType, f64)> = limits.into_iter().collect();
        limits.sort_by_key(|(r, _)| r.as_str());
        for (resource, limit) in &limits {
            info!(resource = resource.as_str(), limit = *limit, "resource-based limiter enabled");
        }

        Ok(Self {
            scanner,
            limits,
            rejections,
        })
    }

    /// Admits the request unless a monitored resource is above its limit.
    ///
    /// The returned error maps to a retriable "service unavailable" response
    /// at the transport layer.
    pub fn accept_new_request(&self) -> Result<()> {
        for (resource, limit) in &self.limits {
            let utilization = self.scanner.utilization(*resource);
            if utilization > *limit {
                self.rejections
                    .get_or_create(&ResourceLabels {
                        resource: resource.as_str().to_string(),
                    })
                    .inc();
                return Err(Error::ResourceLimitReached {
                    resource: resource.as_str(),
                    utilization,
                    limit: *limit,
                });
            }
        }
        Ok(())
    }
}
