//! Compartment groups: a shared worker pool and a shared timer.
//!
//! Compartments in a group hand long-running [`CompartmentTask`]s to the pool
//! with [`Compartment::execute`]; the completion is queued back on the
//! originating compartment. The group timer reads the time source once per
//! tick and fans it out to every registered [`CompartmentGroupProcessor`].
//!
//! [`CompartmentTask`]: crate::task::CompartmentTask

use crate::compartment::{set_thread_role, Compartment, ThreadRole};
use crate::error::{CompartmentError, Result};
use crate::processor::{CompartmentGroupProcessor, ProcessorList};
use crate::queue::{CompartmentQueue, Event, SimpleCompartmentQueue};
use crate::task::{notify_isolated, BoxedTask, Task};
use crate::time::{SystemTimeSource, TimeSource};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Configuration for a compartment group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompartmentGroupConfig {
    pub name: String,

    /// Number of pool threads.
    pub thread_count: usize,

    /// Period of the shared timer.
    pub timer_period_ms: u64,
}

impl Default for CompartmentGroupConfig {
    fn default() -> Self {
        CompartmentGroupConfig {
            name: "compartment-group".to_string(),
            thread_count: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            timer_period_ms: 100,
        }
    }
}

impl CompartmentGroupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(CompartmentError::InvalidConfig(
                "thread_count must be positive".to_string(),
            ));
        }
        if self.timer_period_ms == 0 {
            return Err(CompartmentError::InvalidConfig(
                "timer_period_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

struct PoolState {
    queue: SimpleCompartmentQueue,
    stopped: bool,
    started: bool,
}

struct GroupInner {
    config: CompartmentGroupConfig,
    time_source: Arc<dyn TimeSource>,
    pool: Mutex<PoolState>,
    work_available: Condvar,
    timer_wakeup: Condvar,
    processors: ProcessorList<dyn CompartmentGroupProcessor>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a compartment group. Cloning shares the same group.
#[derive(Clone)]
pub struct CompartmentGroup {
    inner: Arc<GroupInner>,
}

impl CompartmentGroup {
    pub fn new(config: CompartmentGroupConfig) -> Result<Self> {
        Self::with_time_source(config, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        config: CompartmentGroupConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(GroupInner {
                config,
                time_source,
                pool: Mutex::new(PoolState {
                    queue: SimpleCompartmentQueue::new(),
                    stopped: false,
                    started: false,
                }),
                work_available: Condvar::new(),
                timer_wakeup: Condvar::new(),
                processors: ProcessorList::new(),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        self.inner.time_source.clone()
    }

    pub fn current_time(&self) -> u64 {
        self.inner.time_source.current_time()
    }

    /// Spawn the pool threads and the timer thread.
    pub fn start(&self) -> Result<()> {
        {
            let mut pool = self.inner.pool.lock();
            if pool.started {
                return Err(CompartmentError::AlreadyStarted(self.name().to_string()));
            }
            pool.started = true;
        }

        let mut threads = self.inner.threads.lock();
        for i in 0..self.inner.config.thread_count {
            let inner = self.inner.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("{}-{}", self.inner.config.name, i))
                    .spawn(move || inner.run_worker())?,
            );
        }

        let inner = self.inner.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("{}-timer", self.inner.config.name))
                .spawn(move || inner.run_timer())?,
        );

        debug!(
            group = %self.name(),
            threads = self.inner.config.thread_count,
            "Compartment group started"
        );
        Ok(())
    }

    /// Stop all threads. Queued work that has not started is discarded.
    pub fn stop(&self) {
        {
            let mut pool = self.inner.pool.lock();
            pool.stopped = true;
            self.inner.work_available.notify_all();
            self.inner.timer_wakeup.notify_all();
        }

        let threads: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!(group = %self.name(), "Group thread panicked");
            }
        }
        debug!(group = %self.name(), "Compartment group stopped");
    }

    pub fn add_processor(&self, processor: Arc<dyn CompartmentGroupProcessor>) {
        self.inner.processors.add(processor);
    }

    pub fn remove_processor(&self, processor: &Arc<dyn CompartmentGroupProcessor>) -> bool {
        self.inner.processors.remove(processor)
    }

    /// Run an arbitrary task on the pool.
    pub fn offer(&self, task: Task) -> Result<()> {
        let mut pool = self.inner.pool.lock();
        if pool.stopped {
            return Err(CompartmentError::Stopped(self.name().to_string()));
        }
        pool.queue.offer(Event::new(task, 1));
        self.inner.work_available.notify_one();
        Ok(())
    }

    /// Run a compartment task on the pool and queue its completion back on
    /// `origin`.
    pub fn execute(&self, origin: Compartment, task: BoxedTask) -> Result<()> {
        self.offer(Task::fallible(move || {
            let completion = task.0.execute()?;
            if let Err(e) = origin.offer(Task::run(completion)) {
                warn!(
                    compartment = %origin.name(),
                    error = %e,
                    "Dropping task completion"
                );
            }
            Ok(())
        }))
    }

    pub fn pending(&self) -> usize {
        self.inner.pool.lock().queue.len()
    }
}

impl GroupInner {
    fn run_worker(self: Arc<Self>) {
        set_thread_role(ThreadRole::Pool);

        loop {
            let event = {
                let mut pool = self.pool.lock();
                loop {
                    if pool.stopped {
                        return;
                    }
                    if let Some(event) = pool.queue.poll(false) {
                        break event;
                    }
                    self.work_available.wait(&mut pool);
                }
            };

            if event.task.execute(&self.config.name).is_err() {
                error!(group = %self.config.name, "Pool thread interrupted");
                return;
            }
        }
    }

    fn run_timer(self: Arc<Self>) {
        set_thread_role(ThreadRole::Pool);
        let period = Duration::from_millis(self.config.timer_period_ms);

        loop {
            {
                let mut pool = self.pool.lock();
                if !pool.stopped {
                    self.timer_wakeup.wait_for(&mut pool, period);
                }
                if pool.stopped {
                    return;
                }
            }

            let now = self.time_source.current_time();
            for processor in self.processors.snapshot().iter() {
                notify_isolated(&self.config.name, || processor.on_timer(now));
            }
        }
    }
}

impl fmt::Debug for CompartmentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompartmentGroup")
            .field("name", &self.inner.config.name)
            .field("threads", &self.inner.config.thread_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::{CompartmentBuilder, CompartmentConfigBuilder};
    use crate::error::{TaskError, TaskResult};
    use crate::task::CompartmentTask;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;

    fn group(threads: usize) -> CompartmentGroup {
        CompartmentGroup::new(CompartmentGroupConfig {
            name: "test-group".to_string(),
            thread_count: threads,
            timer_period_ms: 10,
        })
        .unwrap()
    }

    struct Square {
        value: u64,
        reply: mpsc::Sender<(u64, bool)>,
        owner: Compartment,
    }

    impl CompartmentTask for Square {
        type Output = u64;

        fn execute(&mut self) -> TaskResult<u64> {
            if self.value == 0 {
                return Err(TaskError::failed("zero"));
            }
            Ok(self.value * self.value)
        }

        fn on_succeeded(self, result: u64) {
            self.reply.send((result, self.owner.is_main_thread())).unwrap();
        }

        fn on_failed(self, _error: TaskError) {
            self.reply.send((0, self.owner.is_main_thread())).unwrap();
        }
    }

    #[test]
    fn test_config_validation() {
        let config = CompartmentGroupConfig {
            thread_count: 0,
            ..Default::default()
        };
        assert!(CompartmentGroup::new(config).is_err());
    }

    #[test]
    fn test_completion_runs_on_origin_compartment() {
        let group = group(2);
        group.start().unwrap();

        let compartment = CompartmentBuilder::new(
            CompartmentConfigBuilder::new("origin")
                .dispatch_period(10)
                .build(),
        )
        .group(group.clone())
        .build()
        .unwrap();
        compartment.start().unwrap();

        let (tx, rx) = mpsc::channel();
        for value in [3, 0] {
            compartment
                .execute(Square {
                    value,
                    reply: tx.clone(),
                    owner: compartment.clone(),
                })
                .unwrap();
        }

        let mut results: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        results.sort();
        assert_eq!(results, vec![(0, true), (9, true)]);

        compartment.stop();
        group.stop();
    }

    #[test]
    fn test_timer_fans_out_to_processors() {
        struct Ticks(AtomicU64);

        impl CompartmentGroupProcessor for Ticks {
            fn on_timer(&self, _current_time: u64) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        struct Broken;

        impl CompartmentGroupProcessor for Broken {
            fn on_timer(&self, _current_time: u64) {
                panic!("broken processor");
            }
        }

        let group = group(1);
        let ticks = Arc::new(Ticks(AtomicU64::new(0)));
        group.add_processor(Arc::new(Broken));
        group.add_processor(ticks.clone());
        group.start().unwrap();

        let start = std::time::Instant::now();
        while ticks.0.load(Ordering::SeqCst) < 3 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ticks.0.load(Ordering::SeqCst) >= 3);
        group.stop();
    }

    #[test]
    fn test_offer_after_stop_fails() {
        let group = group(1);
        group.start().unwrap();
        group.stop();
        assert!(matches!(
            group.offer(Task::run(|| {})),
            Err(CompartmentError::Stopped(_))
        ));
    }
}
