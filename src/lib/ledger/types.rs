use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A CPU/GPU amount: a task grant, a pool capacity, or a delta between grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u32,
    pub gpus: u32,
}

impl Resources {
    pub const fn new(cpus: u32, gpus: u32) -> Self {
        Self { cpus, gpus }
    }

    pub const fn is_empty(&self) -> bool {
        self.cpus == 0 && self.gpus == 0
    }

    /// True when both dimensions fit inside `other`.
    pub const fn fits_within(&self, other: &Resources) -> bool {
        self.cpus <= other.cpus && self.gpus <= other.gpus
    }

    /// Per-dimension `self - other`, clamped at zero.
    pub const fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpus: self.cpus.saturating_sub(other.cpus),
            gpus: self.gpus.saturating_sub(other.gpus),
        }
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpus: self.cpus.checked_add(other.cpus)?,
            gpus: self.gpus.checked_add(other.gpus)?,
        })
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} CPUs / {} GPUs", self.cpus, self.gpus)
    }
}

/// Pool-wide counters as reported by `/available-resources`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub total: Resources,
    pub free: Resources,
}

impl PoolSnapshot {
    pub fn allocated(&self) -> Resources {
        self.total.saturating_sub(&self.free)
    }
}

#[derive(Debug)]
pub(super) struct ResourcePool {
    pub(super) total: Resources,
    pub(super) free: Resources,
}

/// Authoritative total/free counters. Holds no task objects.
#[derive(Debug)]
pub struct Ledger {
    pub(super) pool: Mutex<ResourcePool>,
}
