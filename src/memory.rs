//! Memory probing and memory pressure hints.

use std::sync::Mutex;

use sysinfo::{Pid, System};

/// Resident memory tolerated above the configured limit before memory is reclaimed.
pub const RECLAIM_SLACK: u64 = 100 * 1024 * 1024;

/// Returns the amount of physical memory available for new allocations, or `None` if the platform
/// doesn't report it.
pub fn available_memory() -> Option<u64> {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return None;
    }

    let mut system = System::new();
    system.refresh_memory();

    match system.available_memory() {
        0 => None,
        available => Some(available),
    }
}

/// Memory pressure hint consulted by the sorter after each chunk and once after all chunks.
pub trait MemoryHint: Send + Sync {
    /// Returns `true` if the sorter should give idle memory back.
    ///
    /// # Arguments
    /// * `force` - Whether memory is going to be reclaimed regardless of the current usage
    fn reclaim(&self, force: bool) -> bool;
}

/// Hint that never requests reclaiming on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemoryHint;

impl MemoryHint for NoMemoryHint {
    fn reclaim(&self, force: bool) -> bool {
        force
    }
}

/// Hint comparing the resident set size of the current process with a memory limit.
pub struct ResidentSetHint {
    limit: Option<u64>,
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ResidentSetHint {
    /// Creates a hint requesting reclaiming when the process uses more than `limit` + [`RECLAIM_SLACK`]
    /// bytes. Without a limit only forced reclaiming is requested.
    pub fn new(limit: Option<u64>) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                log::warn!("current process memory usage is not available: {}", err);
                None
            }
        };

        ResidentSetHint {
            limit,
            pid,
            system: Mutex::new(System::new()),
        }
    }

    /// Returns the resident set size of the current process in bytes.
    pub fn resident_memory(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !system.refresh_process(pid) {
            return None;
        }

        system.process(pid).map(|process| process.memory())
    }
}

impl MemoryHint for ResidentSetHint {
    fn reclaim(&self, force: bool) -> bool {
        if force {
            return true;
        }

        let (limit, resident) = match (self.limit, self.resident_memory()) {
            (Some(limit), Some(resident)) => (limit, resident),
            _ => return false,
        };

        if resident > limit.saturating_add(RECLAIM_SLACK) {
            log::debug!("resident memory {} exceeds limit {}", resident, limit);
            return true;
        }

        return false;
    }
}

#[cfg(test)]
mod test {
    use super::{MemoryHint, NoMemoryHint, ResidentSetHint};

    #[test]
    fn test_no_memory_hint() {
        assert_eq!(NoMemoryHint.reclaim(false), false);
        assert_eq!(NoMemoryHint.reclaim(true), true);
    }

    #[test]
    fn test_resident_set_hint() {
        assert_eq!(ResidentSetHint::new(None).reclaim(false), false);
        assert_eq!(ResidentSetHint::new(None).reclaim(true), true);
        assert_eq!(ResidentSetHint::new(Some(u64::MAX)).reclaim(false), false);
    }
}
