use sysinfo::System;

use crate::error::Result;

/// Memory counters in bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStat {
    pub total: u64,
    pub available: u64,
}

/// Source of the OS counters that drive admission and `Status`.
///
/// The worker core takes this as a seam so admission decisions can be
/// driven deterministically in tests.
pub trait SystemProbe: Send + Sync + 'static {
    fn memory(&self) -> Result<MemoryStat>;
    fn load5(&self) -> Result<f64>;
}

/// Probe backed by the operating system. Counters are read fresh on every
/// call; a status snapshot is only ever momentary.
#[derive(Debug, Default)]
pub struct OsProbe;

impl SystemProbe for OsProbe {
    fn memory(&self) -> Result<MemoryStat> {
        let mut sys = System::new();
        sys.refresh_memory();
        Ok(MemoryStat {
            total: sys.total_memory(),
            available: sys.available_memory(),
        })
    }

    fn load5(&self) -> Result<f64> {
        Ok(System::load_average().five)
    }
}

/// Probe reporting fixed values, for driving admission in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe {
    pub total: u64,
    pub available: u64,
    pub load5: f64,
}

impl SystemProbe for FixedProbe {
    fn memory(&self) -> Result<MemoryStat> {
        Ok(MemoryStat {
            total: self.total,
            available: self.available,
        })
    }

    fn load5(&self) -> Result<f64> {
        Ok(self.load5)
    }
}

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}
