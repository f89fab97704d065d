//! Host inventory facts.
//!
//! A `HostFacts` value is a point-in-time snapshot captured when a request is
//! accepted and handed to the task body through its context. Task bodies read
//! placement data (hostname, memory) from here instead of probing the host
//! themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFacts {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub cpu_count: usize,
    pub memory_mb: u64,
    pub uptime_secs: u64,
    pub collected_at: DateTime<Utc>,
}

/// Snapshot the host. Cheap enough to run per accepted request.
pub fn collect() -> HostFacts {
    let mut sys = System::new();
    sys.refresh_memory();

    HostFacts {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        os: System::long_os_version()
            .or_else(System::name)
            .unwrap_or_else(|| "unknown".to_string()),
        kernel: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        memory_mb: sys.total_memory() / (1024 * 1024),
        uptime_secs: System::uptime(),
        collected_at: Utc::now(),
    }
}
