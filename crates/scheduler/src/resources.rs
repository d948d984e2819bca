//! Host and accelerator resource reporting

use crate::backend::{bytes_to_gb, DeviceInfo, DeviceMonitor};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::System;
use video_caption_common::MAX_BATCH_SIZE;

/// Accelerator inventory used to size runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub device_count: usize,
    pub devices: Vec<DeviceInfo>,
    pub accelerator_available: bool,
    /// Largest concurrency degree worth requesting on this host
    pub max_batch_size: usize,
}

impl SystemInfo {
    pub fn collect(monitor: &dyn DeviceMonitor) -> Self {
        let devices = monitor.devices();
        let device_count = devices.len();
        Self {
            device_count,
            devices,
            accelerator_available: device_count > 0,
            max_batch_size: device_count.clamp(1, MAX_BATCH_SIZE),
        }
    }
}

/// Live metrics for one accelerator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuMetrics {
    pub index: usize,
    pub name: String,
    pub utilization_percent: Option<u32>,
    pub vram_used_gb: f64,
    pub vram_total_gb: f64,
}

impl From<&DeviceInfo> for GpuMetrics {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            index: info.index,
            name: info.name.clone(),
            utilization_percent: info.utilization_percent,
            vram_used_gb: round2(bytes_to_gb(info.memory_used_bytes)),
            vram_total_gb: round2(bytes_to_gb(info.memory_total_bytes)),
        }
    }
}

/// Point-in-time host resource usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub ram_used_gb: f64,
    pub ram_total_gb: f64,
    pub gpus: Vec<GpuMetrics>,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

/// Samples CPU and RAM through `sysinfo` and accelerators through a [`DeviceMonitor`]
pub struct ResourceMonitor {
    system: Mutex<System>,
    devices: Arc<dyn DeviceMonitor>,
}

impl ResourceMonitor {
    pub fn new(devices: Arc<dyn DeviceMonitor>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            devices,
        }
    }

    /// CPU usage is measured against the previous call; the first sample may read 0
    pub fn snapshot(&self) -> ResourceSnapshot {
        let (cpu_percent, ram_used, ram_total) = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_cpu();
            system.refresh_memory();
            (
                system.global_cpu_info().cpu_usage(),
                system.used_memory(),
                system.total_memory(),
            )
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());

        ResourceSnapshot {
            cpu_percent,
            ram_used_gb: round2(bytes_to_gb(ram_used)),
            ram_total_gb: round2(bytes_to_gb(ram_total)),
            gpus: self.devices.devices().iter().map(GpuMetrics::from).collect(),
            timestamp,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
