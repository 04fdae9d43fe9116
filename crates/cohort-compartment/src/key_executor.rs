//! Keyed coalescing of compartment tasks.
//!
//! [`KeyCompartmentTaskExecutor`] guarantees at most one in-flight execution
//! per key. Callers arriving while an execution for their key is running only
//! register a completion handler; every handler receives the same result.
//!
//! An execution that never completes (interrupted, or discarded with the
//! queue of a stopped compartment) releases its key and hands
//! `TaskError::Interrupted` to its handlers, on the thread dropping it.

use crate::compartment::Compartment;
use crate::error::{Result, TaskError, TaskResult};
use crate::task::{notify_isolated, CompartmentTask};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// Completion handler receiving the shared result of a keyed execution.
pub type KeyHandler<R> = Box<dyn FnOnce(TaskResult<R>) + Send + 'static>;

type PendingMap<K, R> = Arc<Mutex<HashMap<K, Vec<KeyHandler<R>>>>>;

/// Executes tasks on a compartment, coalescing concurrent executions by key.
pub struct KeyCompartmentTaskExecutor<K, R> {
    compartment: Compartment,
    pending: PendingMap<K, R>,
}

impl<K, R> KeyCompartmentTaskExecutor<K, R>
where
    K: Eq + Hash + Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new(compartment: Compartment) -> Self {
        Self {
            compartment,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Execute `task` for `key` unless an execution for `key` is in flight.
    ///
    /// Returns `true` if a new execution was started, `false` if the handler
    /// was attached to the running one. Handlers run on the compartment
    /// thread.
    pub fn execute<F>(
        &self,
        key: K,
        task: F,
        handler: impl FnOnce(TaskResult<R>) + Send + 'static,
    ) -> Result<bool>
    where
        F: FnOnce() -> TaskResult<R> + Send + 'static,
    {
        {
            let mut pending = self.pending.lock();
            if let Some(handlers) = pending.get_mut(&key) {
                handlers.push(Box::new(handler));
                return Ok(false);
            }
            pending.insert(key.clone(), vec![Box::new(handler)]);
        }

        let keyed = KeyedTask {
            key: Some(key),
            task: Some(task),
            pending: self.pending.clone(),
        };
        // A rejected task is dropped here, which releases the key.
        self.compartment.execute(keyed)?;
        Ok(true)
    }

    /// Check if an execution for `key` is in flight.
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

struct KeyedTask<K: Eq + Hash, R: Clone, F> {
    key: Option<K>,
    task: Option<F>,
    pending: PendingMap<K, R>,
}

impl<K: Eq + Hash, R: Clone, F> KeyedTask<K, R, F> {
    fn complete(&mut self, result: TaskResult<R>) {
        let Some(key) = self.key.take() else {
            return;
        };
        let handlers = self.pending.lock().remove(&key).unwrap_or_default();
        debug!(handlers = handlers.len(), "Keyed task completed");
        for handler in handlers {
            let result = result.clone();
            notify_isolated("key executor", move || handler(result));
        }
    }
}

impl<K: Eq + Hash, R: Clone, F> Drop for KeyedTask<K, R, F> {
    fn drop(&mut self) {
        self.complete(Err(TaskError::Interrupted));
    }
}

impl<K, R, F> CompartmentTask for KeyedTask<K, R, F>
where
    K: Eq + Hash + Send + 'static,
    R: Clone + Send + 'static,
    F: FnOnce() -> TaskResult<R> + Send + 'static,
{
    type Output = R;

    fn execute(&mut self) -> TaskResult<R> {
        match self.task.take() {
            Some(task) => task(),
            None => Err(TaskError::failed("keyed task executed twice")),
        }
    }

    fn on_succeeded(mut self, result: R) {
        self.complete(Ok(result));
    }

    fn on_failed(mut self, error: TaskError) {
        self.complete(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::CompartmentConfigBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_failure_is_shared() {
        let compartment = Compartment::new(
            CompartmentConfigBuilder::new("key-failure")
                .dispatch_period(10)
                .build(),
        )
        .unwrap();
        let executor: KeyCompartmentTaskExecutor<u32, u32> =
            KeyCompartmentTaskExecutor::new(compartment.clone());

        let (tx, rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let tx = tx.clone();
            let calls = calls.clone();
            executor
                .execute(
                    7,
                    move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(TaskError::failed("unavailable"))
                    },
                    move |result| tx.send(result).unwrap(),
                )
                .unwrap();
        }
        compartment.start().unwrap();

        for _ in 0..2 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(2)).unwrap(),
                Err(TaskError::failed("unavailable"))
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!executor.is_pending(&7));
        compartment.stop();
    }

    fn started(name: &str) -> (Compartment, KeyCompartmentTaskExecutor<u32, u32>) {
        let compartment =
            Compartment::new(CompartmentConfigBuilder::new(name).dispatch_period(10).build())
                .unwrap();
        compartment.start().unwrap();
        let executor = KeyCompartmentTaskExecutor::new(compartment.clone());
        (compartment, executor)
    }

    #[test]
    fn test_in_flight_execution_is_shared() {
        let (compartment, executor) = started("key-in-flight");
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let calls = calls.clone();
            let tx = tx.clone();
            executor.execute(
                3,
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(7)
                },
                move |result| tx.send(result).unwrap(),
            )
        };
        assert!(first.unwrap());
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let second = {
            let calls = calls.clone();
            let tx = tx.clone();
            executor.execute(
                3,
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(8)
                },
                move |result| tx.send(result).unwrap(),
            )
        };
        assert!(!second.unwrap());
        assert!(executor.is_pending(&3));

        release_tx.send(()).unwrap();
        for _ in 0..2 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!executor.is_pending(&3));

        // The key is free again: a new execution starts.
        let third = executor.execute(3, || Ok(9), move |result| tx.send(result).unwrap());
        assert!(third.unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ok(9));
        compartment.stop();
    }

    #[test]
    fn test_interrupted_task_releases_key() {
        let (compartment, executor) = started("key-interrupted");
        let (tx, rx) = mpsc::channel();

        let first = {
            let tx = tx.clone();
            executor.execute(
                1,
                || Err(TaskError::Interrupted),
                move |result| tx.send(result).unwrap(),
            )
        };
        assert!(first.unwrap());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Err(TaskError::Interrupted)
        );
        assert!(!executor.is_pending(&1));

        // The interrupted loop is gone, so this execution never runs either,
        // but it is not attached to the abandoned one.
        let second = executor.execute(1, || Ok(7), move |result| tx.send(result).unwrap());
        assert!(!matches!(second, Ok(false)));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Err(TaskError::Interrupted)
        );
        assert!(!executor.is_pending(&1));
        compartment.stop();
    }

    #[test]
    fn test_stop_releases_queued_key() {
        let compartment = Compartment::new(
            CompartmentConfigBuilder::new("key-stopped")
                .dispatch_period(10)
                .build(),
        )
        .unwrap();
        let executor: KeyCompartmentTaskExecutor<u32, u32> =
            KeyCompartmentTaskExecutor::new(compartment.clone());
        let (tx, rx) = mpsc::channel();

        assert!(executor
            .execute(2, || Ok(1), move |result| tx.send(result).unwrap())
            .unwrap());
        assert!(executor.is_pending(&2));

        compartment.stop();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Err(TaskError::Interrupted)
        );
        assert!(!executor.is_pending(&2));
        assert!(executor.execute(2, || Ok(1), |_| {}).is_err());
    }
}
