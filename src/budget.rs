//! Merge concurrency budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counting allocator of parallel merge slots.
///
/// Acquisition never blocks: when no slot is available the caller is expected to do the work itself.
#[derive(Debug)]
pub struct ResourceBudget {
    capacity: usize,
    available: AtomicUsize,
    peak: AtomicUsize,
}

impl ResourceBudget {
    pub fn new(capacity: usize) -> Self {
        ResourceBudget {
            capacity,
            available: AtomicUsize::new(capacity),
            peak: AtomicUsize::new(0),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently in use.
    pub fn in_use(&self) -> usize {
        self.capacity - self.available.load(Ordering::Acquire)
    }

    /// Maximum number of slots that were ever in use simultaneously.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Takes a slot if one is available. The slot is given back when the permit is dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BudgetPermit> {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| available.checked_sub(1))
            .ok()?;
        self.peak.fetch_max(self.in_use(), Ordering::AcqRel);

        Some(BudgetPermit {
            budget: Arc::clone(self),
        })
    }

    fn release(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }
}

/// A slot taken from a [`ResourceBudget`].
#[derive(Debug)]
pub struct BudgetPermit {
    budget: Arc<ResourceBudget>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.release();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::ResourceBudget;

    #[test]
    fn test_budget_exhaustion() {
        let budget = Arc::new(ResourceBudget::new(2));

        let first = budget.try_acquire();
        let second = budget.try_acquire();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(budget.try_acquire().is_none());
        assert_eq!(budget.in_use(), 2);

        drop(first);
        assert_eq!(budget.in_use(), 1);
        assert!(budget.try_acquire().is_some());

        drop(second);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.peak(), 2);
    }

    #[test]
    fn test_empty_budget() {
        let budget = Arc::new(ResourceBudget::new(0));
        assert!(budget.try_acquire().is_none());
        assert_eq!(budget.peak(), 0);
    }
}
