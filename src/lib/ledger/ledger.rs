use parking_lot::Mutex;
use tracing::{debug, error};

use super::types::{Ledger, PoolSnapshot, ResourcePool, Resources};
use crate::lib::error::{ControllerError, ControllerResult};

impl Ledger {
    /// Starts with the whole capacity free.
    pub fn new(total: Resources) -> Self {
        Ledger {
            pool: Mutex::new(ResourcePool { total, free: total }),
        }
    }

    /// Deducts both dimensions together or neither.
    pub fn reserve(&self, request: Resources) -> ControllerResult<()> {
        let mut pool = self.pool.lock();
        if request.is_empty() || !request.fits_within(&pool.free) {
            return Err(insufficient(request, pool.free));
        }
        pool.free = pool.free.saturating_sub(&request);
        debug!(%request, free = %pool.free, "reserved");
        Ok(())
    }

    /// Returns a grant to the pool. Releasing more than is allocated means the
    /// registry and the ledger have diverged; the pool is left untouched.
    pub fn release(&self, grant: Resources) -> ControllerResult<()> {
        let mut pool = self.pool.lock();
        let allocated = pool.total.saturating_sub(&pool.free);
        if !grant.fits_within(&allocated) {
            let err = ControllerError::ConsistencyViolation(format!(
                "release of {grant} exceeds allocated {allocated}"
            ));
            error!(error = %err, "ledger release rejected");
            return Err(err);
        }
        pool.free = pool
            .free
            .checked_add(&grant)
            .ok_or_else(|| ControllerError::ConsistencyViolation("free counter overflow".into()))?;
        debug!(%grant, free = %pool.free, "released");
        Ok(())
    }

    /// Moves a grant from `current` to `target` in one critical section,
    /// reserving growth and releasing shrinkage per dimension.
    pub fn resize(&self, current: Resources, target: Resources) -> ControllerResult<()> {
        let mut pool = self.pool.lock();
        let allocated = pool.total.saturating_sub(&pool.free);
        if !current.fits_within(&allocated) {
            let err = ControllerError::ConsistencyViolation(format!(
                "resize from {current} exceeds allocated {allocated}"
            ));
            error!(error = %err, "ledger resize rejected");
            return Err(err);
        }

        let grow = target.saturating_sub(&current);
        let shrink = current.saturating_sub(&target);
        if !grow.fits_within(&pool.free) {
            return Err(insufficient(grow, pool.free));
        }

        pool.free = pool.free.saturating_sub(&grow);
        pool.free = pool
            .free
            .checked_add(&shrink)
            .ok_or_else(|| ControllerError::ConsistencyViolation("free counter overflow".into()))?;
        debug!(from = %current, to = %target, free = %pool.free, "resized");
        Ok(())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let pool = self.pool.lock();
        PoolSnapshot {
            total: pool.total,
            free: pool.free,
        }
    }
}

fn insufficient(requested: Resources, free: Resources) -> ControllerError {
    ControllerError::InsufficientCapacity {
        requested_cpus: requested.cpus,
        requested_gpus: requested.gpus,
        free_cpus: free.cpus,
        free_gpus: free.gpus,
    }
}
