use serde::Serialize;
use sysinfo::{System, SystemExt};

/// Static facts about the machine the pipeline runs on, detected once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostResources {
    pub cpu_count: usize,
    pub total_memory: u64,
}

impl HostResources {
    pub fn detect() -> HostResources {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let cpu_count = match sys.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };

        HostResources {
            cpu_count,
            total_memory: sys.total_memory(),
        }
    }

    /// Worker count capped at `ceiling` and never below one.
    pub fn workers(&self, ceiling: usize) -> usize {
        self.cpu_count.min(ceiling).max(1)
    }

    /// Currently available memory in bytes. Refreshed on every call since
    /// memory pressure changes between pipeline stages.
    pub fn available_memory(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.available_memory()
    }
}
