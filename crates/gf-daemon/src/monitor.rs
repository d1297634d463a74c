//! Resource monitor: periodic sampling of process and system memory/disk
//! pressure into a bounded in-memory ring.
//!
//! The ring holds ~a day of samples at one-minute cadence. Recording and
//! trimming happen under one short lock. The daemon MUST drive
//! [`ResourceMonitor::record`] from a timer loop — an unscheduled monitor
//! is the documented memory-leak failure mode.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sysinfo::{Disks, Pid, System};
use tracing::{debug, warn};

use gf_core::config::MonitorConfig;

// ---------------------------------------------------------------------------
// ResourceSample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub taken_at: DateTime<Utc>,
    /// Resident set size of this process, in MiB.
    pub process_rss_mb: f64,
    /// System-wide memory utilization, percent.
    pub system_memory_pct: f64,
    /// Highest disk utilization across mounted disks, percent.
    pub disk_used_pct: f64,
}

// ---------------------------------------------------------------------------
// ResourceMonitor
// ---------------------------------------------------------------------------

struct Inner {
    system: System,
    samples: VecDeque<ResourceSample>,
}

pub struct ResourceMonitor {
    cfg: MonitorConfig,
    inner: Mutex<Inner>,
}

impl ResourceMonitor {
    pub fn new(cfg: MonitorConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                system: System::new(),
                samples: VecDeque::new(),
            }),
        }
    }

    /// Take one sample, append it to the ring, trim the ring to its bound,
    /// and emit warnings when thresholds are crossed.
    pub fn record(&self) -> ResourceSample {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");

        let pid = Pid::from_u32(std::process::id());
        inner.system.refresh_memory();
        inner.system.refresh_process(pid);

        let process_rss_mb = inner
            .system
            .process(pid)
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);
        let total = inner.system.total_memory() as f64;
        let system_memory_pct = if total > 0.0 {
            inner.system.used_memory() as f64 / total * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_used_pct = disks
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let total = d.total_space() as f64;
                (total - d.available_space() as f64) / total * 100.0
            })
            .fold(0.0_f64, f64::max);

        let sample = ResourceSample {
            taken_at: Utc::now(),
            process_rss_mb,
            system_memory_pct,
            disk_used_pct,
        };

        if system_memory_pct > self.cfg.memory_warn_pct {
            warn!(
                system_memory_pct = format!("{system_memory_pct:.1}"),
                threshold = self.cfg.memory_warn_pct,
                "system memory pressure above threshold"
            );
        }
        if disk_used_pct > self.cfg.disk_warn_pct {
            warn!(
                disk_used_pct = format!("{disk_used_pct:.1}"),
                threshold = self.cfg.disk_warn_pct,
                "disk utilization above threshold"
            );
        }

        inner.samples.push_back(sample.clone());
        while inner.samples.len() > self.cfg.ring_capacity {
            inner.samples.pop_front();
        }
        debug!(
            rss_mb = format!("{process_rss_mb:.1}"),
            samples = inner.samples.len(),
            "resource sample recorded"
        );
        sample
    }

    /// Copy of the current ring, oldest first.
    pub fn snapshot(&self) -> Vec<ResourceSample> {
        let inner = self.inner.lock().expect("monitor lock poisoned");
        inner.samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("monitor lock poisoned");
        inner.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
