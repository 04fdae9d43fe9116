//! Periodic processors and their copy-on-write registries.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Invoked once per processing iteration of a compartment.
pub trait CompartmentProcessor: Send + Sync {
    fn process(&self);
}

/// Invoked at most once per dispatch period with the current time.
pub trait CompartmentTimerProcessor: Send + Sync {
    fn on_timer(&self, current_time: u64);
}

/// Invoked by the shared timer of a compartment group.
pub trait CompartmentGroupProcessor: Send + Sync {
    fn on_timer(&self, current_time: u64);
}

/// Copy-on-write list of shared entries.
///
/// Readers take a snapshot without locking. Writers clone the current list,
/// modify the copy and swap it in, so iteration during dispatch never races
/// a concurrent registration change.
pub struct ProcessorList<T: ?Sized> {
    entries: ArcSwap<Vec<Arc<T>>>,
}

impl<T: ?Sized> ProcessorList<T> {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Register an entry. Registering the same entry twice is a no-op.
    pub fn add(&self, entry: Arc<T>) {
        self.entries.rcu(|current| {
            let mut next = Vec::clone(current);
            if !next.iter().any(|e| same_entry(e, &entry)) {
                next.push(entry.clone());
            }
            next
        });
    }

    /// Unregister an entry, returning whether it was present.
    pub fn remove(&self, entry: &Arc<T>) -> bool {
        let mut removed = false;
        self.entries.rcu(|current| {
            let mut next = Vec::clone(current);
            let before = next.len();
            next.retain(|e| !same_entry(e, entry));
            removed = next.len() != before;
            next
        });
        removed
    }

    /// Consistent snapshot of the registered entries.
    pub fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.entries.load_full()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity by allocation. Trait object vtables are not compared: the same
/// entry may carry different vtable pointers across codegen units.
fn same_entry<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl<T: ?Sized> Default for ProcessorList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl CompartmentProcessor for Counter {
        fn process(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_remove() {
        let list: ProcessorList<dyn CompartmentProcessor> = ProcessorList::new();
        let a: Arc<dyn CompartmentProcessor> = Arc::new(Counter(AtomicUsize::new(0)));
        let b: Arc<dyn CompartmentProcessor> = Arc::new(Counter(AtomicUsize::new(0)));

        list.add(a.clone());
        list.add(a.clone());
        list.add(b.clone());
        assert_eq!(list.len(), 2);

        assert!(list.remove(&a));
        assert!(!list.remove(&a));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_snapshot_is_stable_across_mutation() {
        let list: ProcessorList<dyn CompartmentProcessor> = ProcessorList::new();
        let a: Arc<dyn CompartmentProcessor> = Arc::new(Counter(AtomicUsize::new(0)));
        list.add(a.clone());

        let snapshot = list.snapshot();
        list.remove(&a);

        assert_eq!(snapshot.len(), 1);
        assert!(list.is_empty());
        for processor in snapshot.iter() {
            processor.process();
        }
    }

    #[test]
    fn test_entries_compare_by_allocation() {
        let list: ProcessorList<dyn CompartmentProcessor> = ProcessorList::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let registered: Arc<dyn CompartmentProcessor> = counter.clone();
        let other: Arc<dyn CompartmentProcessor> = Arc::new(Counter(AtomicUsize::new(0)));
        list.add(registered);

        let coerced: Arc<dyn CompartmentProcessor> = counter.clone();
        assert!(same_entry(&coerced, &list.snapshot()[0]));
        assert!(!list.remove(&other));

        let again: Arc<dyn CompartmentProcessor> = counter;
        list.add(again.clone());
        assert_eq!(list.len(), 1);
        assert!(list.remove(&again));
        assert!(list.is_empty());
    }
}
