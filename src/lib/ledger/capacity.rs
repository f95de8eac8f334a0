use std::path::Path;

use sysinfo::System;

use super::types::Resources;

/// What the local host offers, discovered once at startup.
#[derive(Debug, Clone)]
pub struct HostCapacity {
    pub hostname: String,
    pub system_name: String,
    pub total_cpus: u32,
    pub total_gpus: u32,
    pub total_memory_mb: u64,
}

impl HostCapacity {
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();
        Self::from_system(&sys, count_nvidia_devices(Path::new("/dev")))
    }

    fn from_system(sys: &System, gpus: u32) -> Self {
        HostCapacity {
            hostname: System::host_name().unwrap_or_else(|| "Unknown".to_string()),
            system_name: System::name().unwrap_or_else(|| "Unknown".to_string()),
            total_cpus: sys.cpus().len() as u32,
            total_gpus: gpus,
            total_memory_mb: sys.total_memory() / 1024 / 1024,
        }
    }

    pub fn resources(&self) -> Resources {
        Resources::new(self.total_cpus, self.total_gpus)
    }
}

/// Counts `nvidiaN` device nodes; control nodes such as `nvidiactl` and
/// `nvidia-uvm` are skipped.
pub fn count_nvidia_devices(dev: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(dev) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("nvidia"))
                .is_some_and(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
        })
        .count() as u32
}

/// Applies operator overrides on top of what was discovered.
pub fn resolve_capacity(discovered: Resources, cpus: Option<u32>, gpus: Option<u32>) -> Resources {
    Resources::new(
        cpus.unwrap_or(discovered.cpus),
        gpus.unwrap_or(discovered.gpus),
    )
}
