//! The compartment: a single logical worker thread with its own queue.
//!
//! # Run loop
//!
//! ```text
//! while !dispatcher.can_finish(stop_requested):
//!     dispatch()        // block for dispatch_period, only if the queue is empty
//!     process_events()  // up to task_batch_size events, then processors,
//!                       // then timer processors once per dispatch_period
//! ```
//!
//! # Flow control
//!
//! Queue capacity is measured in estimated event sizes. Producers running on
//! a compartment thread never block: when the capacity reaches
//! `min_lock_queue_capacity` the flow controller is locked once, and it is
//! unlocked once the capacity falls back to `max_unlock_queue_capacity`.
//! Producers on any other thread block while the event would push the
//! capacity to the lock watermark.

use crate::dispatcher::{CompartmentDispatcher, SimpleCompartmentDispatcher};
use crate::error::{CompartmentError, Result, TaskError, TaskResult};
use crate::flow::{FlowController, NoFlowController};
use crate::group::CompartmentGroup;
use crate::processor::{CompartmentProcessor, CompartmentTimerProcessor, ProcessorList};
use crate::queue::{CompartmentQueue, Event, Priority, SimpleCompartmentQueue};
use crate::task::{run_guarded, BoxedTask, CompartmentTask, Task};
use crate::time::{SystemTimeSource, TimeSource};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

static NEXT_COMPARTMENT_ID: AtomicU64 = AtomicU64::new(1);

/// What kind of thread is currently running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ThreadRole {
    External,
    Compartment(u64),
    Pool,
}

thread_local! {
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::External) };
}

pub(crate) fn set_thread_role(role: ThreadRole) {
    THREAD_ROLE.with(|r| r.set(role));
}

fn thread_role() -> ThreadRole {
    THREAD_ROLE.with(|r| r.get())
}

/// Check whether the calling thread belongs to a compartment or a
/// compartment group pool.
pub fn is_compartment_thread() -> bool {
    thread_role() != ThreadRole::External
}

/// Configuration for a compartment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompartmentConfig {
    /// Name of the compartment and of its thread.
    pub name: String,

    /// Maximum idle wait, and minimum interval between timer ticks.
    pub dispatch_period_ms: u64,

    /// Maximum number of events processed per loop iteration.
    pub task_batch_size: usize,

    /// Upper watermark: flow is locked when the capacity reaches it.
    pub min_lock_queue_capacity: usize,

    /// Lower watermark: flow is unlocked when the capacity falls to it.
    pub max_unlock_queue_capacity: usize,

    /// Execute tasks inline when offered from the compartment's own thread
    /// (requires a dispatcher that supports direct calls).
    #[serde(default)]
    pub direct_calls: bool,
}

impl Default for CompartmentConfig {
    fn default() -> Self {
        CompartmentConfig {
            name: "compartment".to_string(),
            dispatch_period_ms: 100,
            task_batch_size: 1000,
            min_lock_queue_capacity: 10_000_000,
            max_unlock_queue_capacity: 5_000_000,
            direct_calls: false,
        }
    }
}

impl CompartmentConfig {
    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_period_ms == 0 {
            return Err(CompartmentError::InvalidConfig(
                "dispatch_period_ms must be positive".to_string(),
            ));
        }
        if self.task_batch_size == 0 {
            return Err(CompartmentError::InvalidConfig(
                "task_batch_size must be positive".to_string(),
            ));
        }
        if self.min_lock_queue_capacity == 0 {
            return Err(CompartmentError::InvalidConfig(
                "min_lock_queue_capacity must be positive".to_string(),
            ));
        }
        if self.max_unlock_queue_capacity > self.min_lock_queue_capacity {
            return Err(CompartmentError::InvalidConfig(format!(
                "max_unlock_queue_capacity {} exceeds min_lock_queue_capacity {}",
                self.max_unlock_queue_capacity, self.min_lock_queue_capacity
            )));
        }
        Ok(())
    }

    pub fn dispatch_period(&self) -> Duration {
        Duration::from_millis(self.dispatch_period_ms)
    }
}

/// Builder for compartment configuration.
pub struct CompartmentConfigBuilder {
    config: CompartmentConfig,
}

impl CompartmentConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: CompartmentConfig {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn dispatch_period(mut self, ms: u64) -> Self {
        self.config.dispatch_period_ms = ms;
        self
    }

    pub fn task_batch_size(mut self, size: usize) -> Self {
        self.config.task_batch_size = size;
        self
    }

    pub fn queue_capacities(mut self, min_lock: usize, max_unlock: usize) -> Self {
        self.config.min_lock_queue_capacity = min_lock;
        self.config.max_unlock_queue_capacity = max_unlock;
        self
    }

    pub fn direct_calls(mut self, enabled: bool) -> Self {
        self.config.direct_calls = enabled;
        self
    }

    pub fn build(self) -> CompartmentConfig {
        self.config
    }
}

/// Lifecycle state of a compartment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompartmentState {
    Created,
    Running,
    StopRequested,
    Stopped,
}

struct QueueState {
    queue: Box<dyn CompartmentQueue>,
    flow_locked: bool,
    lock_count: i64,
    external_waiters: usize,
}

struct Lifecycle {
    state: CompartmentState,
    thread: Option<JoinHandle<()>>,
}

struct Inner {
    id: u64,
    config: CompartmentConfig,
    dispatcher: Arc<dyn CompartmentDispatcher>,
    flow_controller: Arc<dyn FlowController>,
    time_source: Arc<dyn TimeSource>,
    group: Option<CompartmentGroup>,
    queue: Mutex<QueueState>,
    space_available: Condvar,
    stop_requested: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    processors: ProcessorList<dyn CompartmentProcessor>,
    timer_processors: ProcessorList<dyn CompartmentTimerProcessor>,
    last_timer_time: AtomicU64,
}

/// Handle to a compartment. Cloning shares the same compartment.
#[derive(Clone)]
pub struct Compartment {
    inner: Arc<Inner>,
}

/// Builder wiring a compartment to its collaborators.
pub struct CompartmentBuilder {
    config: CompartmentConfig,
    dispatcher: Option<Arc<dyn CompartmentDispatcher>>,
    queue: Option<Box<dyn CompartmentQueue>>,
    flow_controller: Option<Arc<dyn FlowController>>,
    time_source: Option<Arc<dyn TimeSource>>,
    group: Option<CompartmentGroup>,
}

impl CompartmentBuilder {
    pub fn new(config: CompartmentConfig) -> Self {
        Self {
            config,
            dispatcher: None,
            queue: None,
            flow_controller: None,
            time_source: None,
            group: None,
        }
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn CompartmentDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn queue(mut self, queue: Box<dyn CompartmentQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn flow_controller(mut self, flow_controller: Arc<dyn FlowController>) -> Self {
        self.flow_controller = Some(flow_controller);
        self
    }

    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(time_source);
        self
    }

    pub fn group(mut self, group: CompartmentGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn build(self) -> Result<Compartment> {
        self.config.validate()?;

        let time_source = match (self.time_source, &self.group) {
            (Some(time_source), _) => time_source,
            (None, Some(group)) => group.time_source(),
            (None, None) => Arc::new(SystemTimeSource),
        };

        Ok(Compartment {
            inner: Arc::new(Inner {
                id: NEXT_COMPARTMENT_ID.fetch_add(1, Ordering::Relaxed),
                dispatcher: self
                    .dispatcher
                    .unwrap_or_else(|| Arc::new(SimpleCompartmentDispatcher::new())),
                flow_controller: self
                    .flow_controller
                    .unwrap_or_else(|| Arc::new(NoFlowController)),
                time_source,
                group: self.group,
                queue: Mutex::new(QueueState {
                    queue: self
                        .queue
                        .unwrap_or_else(|| Box::new(SimpleCompartmentQueue::new())),
                    flow_locked: false,
                    lock_count: 0,
                    external_waiters: 0,
                }),
                space_available: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle {
                    state: CompartmentState::Created,
                    thread: None,
                }),
                processors: ProcessorList::new(),
                timer_processors: ProcessorList::new(),
                last_timer_time: AtomicU64::new(0),
                config: self.config,
            }),
        })
    }
}

impl Compartment {
    /// Create a compartment with the default collaborators.
    pub fn new(config: CompartmentConfig) -> Result<Self> {
        CompartmentBuilder::new(config).build()
    }

    pub fn builder(config: CompartmentConfig) -> CompartmentBuilder {
        CompartmentBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &CompartmentConfig {
        &self.inner.config
    }

    pub fn group(&self) -> Option<&CompartmentGroup> {
        self.inner.group.as_ref()
    }

    /// Current time according to the compartment's time source.
    pub fn current_time(&self) -> u64 {
        self.inner.time_source.current_time()
    }

    pub fn time_source(&self) -> Arc<dyn TimeSource> {
        self.inner.time_source.clone()
    }

    pub fn state(&self) -> CompartmentState {
        self.inner.lifecycle.lock().state
    }

    /// Check if the calling thread is this compartment's thread.
    pub fn is_main_thread(&self) -> bool {
        thread_role() == ThreadRole::Compartment(self.inner.id)
    }

    /// Sum of the sizes of queued events.
    pub fn capacity(&self) -> usize {
        self.inner.queue.lock().queue.capacity()
    }

    pub fn queued_events(&self) -> usize {
        self.inner.queue.lock().queue.len()
    }

    pub fn is_flow_locked(&self) -> bool {
        self.inner.queue.lock().flow_locked
    }

    /// Start the compartment's thread.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state != CompartmentState::Created {
            return Err(CompartmentError::AlreadyStarted(self.name().to_string()));
        }

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name(self.inner.config.name.clone())
            .spawn(move || inner.run())?;

        lifecycle.state = CompartmentState::Running;
        lifecycle.thread = Some(handle);
        debug!(compartment = %self.name(), "Compartment started");
        Ok(())
    }

    /// Request the loop to stop and wait for the thread to exit.
    ///
    /// Called from the compartment's own thread, the request is recorded and
    /// the loop exits after the current iteration.
    pub fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        {
            let _queue = self.inner.queue.lock();
            self.inner.space_available.notify_all();
        }
        self.inner.dispatcher.wakeup();

        let handle = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match lifecycle.state {
                CompartmentState::Created => {
                    lifecycle.state = CompartmentState::Stopped;
                    drop(lifecycle);
                    self.inner.discard_queue();
                    return;
                }
                CompartmentState::Running => lifecycle.state = CompartmentState::StopRequested,
                _ => {}
            }
            if self.is_main_thread() {
                None
            } else {
                lifecycle.thread.take()
            }
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(compartment = %self.name(), "Compartment thread panicked");
            }
        }
    }

    pub fn add_processor(&self, processor: Arc<dyn CompartmentProcessor>) {
        self.inner.processors.add(processor);
    }

    pub fn remove_processor(&self, processor: &Arc<dyn CompartmentProcessor>) -> bool {
        self.inner.processors.remove(processor)
    }

    pub fn add_timer_processor(&self, processor: Arc<dyn CompartmentTimerProcessor>) {
        self.inner.timer_processors.add(processor);
    }

    pub fn remove_timer_processor(&self, processor: &Arc<dyn CompartmentTimerProcessor>) -> bool {
        self.inner.timer_processors.remove(processor)
    }

    /// Queue a task with unit size.
    pub fn offer(&self, task: Task) -> Result<()> {
        self.offer_event(Event::new(task, 1))
    }

    /// Queue a task with an explicit size and priority.
    pub fn offer_sized(&self, task: Task, size: usize, priority: Priority) -> Result<()> {
        self.offer_event(Event::new(task, size).with_priority(priority))
    }

    /// Queue an event.
    ///
    /// From this compartment's thread with direct calls enabled, the task runs
    /// inline. From any compartment or pool thread the event is queued without
    /// blocking. From any other thread the call blocks while the queue is above
    /// the lock watermark.
    pub fn offer_event(&self, event: Event) -> Result<()> {
        match thread_role() {
            ThreadRole::Compartment(id) if id == self.inner.id => {
                if self.inner.config.direct_calls && self.inner.dispatcher.supports_direct_calls() {
                    if let Err(TaskError::Interrupted) = event.task.execute(self.name()) {
                        self.inner.stop_requested.store(true, Ordering::SeqCst);
                    }
                    return Ok(());
                }
                self.offer_internal(event)
            }
            ThreadRole::Compartment(_) | ThreadRole::Pool => self.offer_internal(event),
            ThreadRole::External => self.offer_external(event),
        }
    }

    /// Execute a compartment task, off-thread when the compartment belongs to a
    /// group. Completion callbacks run on this compartment.
    pub fn execute<T: CompartmentTask>(&self, task: T) -> Result<()> {
        match &self.inner.group {
            Some(group) => group.execute(self.clone(), BoxedTask::new(task)),
            None => self.offer(Task::compartment(task)),
        }
    }

    fn offer_internal(&self, event: Event) -> Result<()> {
        if self.inner.stop_requested.load(Ordering::SeqCst) {
            return Err(CompartmentError::Stopped(self.name().to_string()));
        }

        let lock = {
            let mut state = self.inner.queue.lock();
            state.queue.offer(event);
            if !state.flow_locked
                && state.queue.capacity() >= self.inner.config.min_lock_queue_capacity
            {
                state.flow_locked = true;
                state.lock_count += 1;
                true
            } else {
                false
            }
        };

        if lock {
            debug!(compartment = %self.name(), "Flow locked");
            self.inner.flow_controller.lock_flow();
        }
        self.inner.dispatcher.wakeup();
        Ok(())
    }

    fn offer_external(&self, event: Event) -> Result<()> {
        let limit = self.inner.config.min_lock_queue_capacity;
        if event.size >= limit {
            return Err(CompartmentError::EventTooLarge {
                size: event.size,
                limit,
            });
        }

        {
            let mut state = self.inner.queue.lock();
            while state.queue.capacity() + event.size >= limit
                && !self.inner.stop_requested.load(Ordering::SeqCst)
            {
                state.external_waiters += 1;
                self.inner.space_available.wait(&mut state);
                state.external_waiters -= 1;
            }

            if self.inner.stop_requested.load(Ordering::SeqCst) {
                return Err(CompartmentError::Stopped(self.name().to_string()));
            }
            state.queue.offer(event);
        }

        self.inner.dispatcher.wakeup();
        Ok(())
    }
}

impl Inner {
    fn run(self: Arc<Self>) {
        set_thread_role(ThreadRole::Compartment(self.id));

        match self.main_loop() {
            Ok(()) => debug!(compartment = %self.config.name, "Compartment stopped"),
            Err(_) => error!(compartment = %self.config.name, "Compartment thread interrupted"),
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        {
            let _queue = self.queue.lock();
            self.space_available.notify_all();
        }
        self.discard_queue();
        self.lifecycle.lock().state = CompartmentState::Stopped;
    }

    /// Drop events that will never run. Dropped outside the queue lock.
    fn discard_queue(&self) {
        let discarded: Vec<Event> = {
            let mut state = self.queue.lock();
            std::iter::from_fn(|| state.queue.poll(false)).collect()
        };
        if !discarded.is_empty() {
            debug!(
                compartment = %self.config.name,
                events = discarded.len(),
                "Discarded queued events"
            );
        }
    }

    fn main_loop(&self) -> TaskResult<()> {
        while !self
            .dispatcher
            .can_finish(self.stop_requested.load(Ordering::SeqCst))
        {
            self.dispatch();
            self.process_events()?;
        }
        Ok(())
    }

    fn dispatch(&self) {
        let idle = self.queue.lock().queue.is_empty();
        if idle {
            self.dispatcher.block(self.config.dispatch_period());
        }
    }

    fn process_events(&self) -> TaskResult<()> {
        for i in 0..self.config.task_batch_size {
            match self.poll(i == 0) {
                Some(event) => event.task.execute(&self.config.name)?,
                None => break,
            }
        }

        for processor in self.processors.snapshot().iter() {
            let result = run_guarded(|| {
                processor.process();
                Ok(())
            });
            self.check_callback(result, "processor")?;
        }

        let now = self.time_source.current_time();
        let last = self.last_timer_time.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= self.config.dispatch_period_ms {
            self.last_timer_time.store(now, Ordering::Relaxed);
            for processor in self.timer_processors.snapshot().iter() {
                let result = run_guarded(|| {
                    processor.on_timer(now);
                    Ok(())
                });
                self.check_callback(result, "timer processor")?;
            }
        }
        Ok(())
    }

    fn check_callback(&self, result: TaskResult<()>, kind: &str) -> TaskResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(TaskError::Interrupted) => Err(TaskError::Interrupted),
            Err(e) => {
                warn!(compartment = %self.config.name, kind, error = %e, "Callback failed");
                Ok(())
            }
        }
    }

    fn poll(&self, first_in_batch: bool) -> Option<Event> {
        let (event, unlock) = {
            let mut state = self.queue.lock();
            let event = state.queue.poll(first_in_batch)?;
            let capacity = state.queue.capacity();
            let mut unlock = false;

            if capacity <= self.config.max_unlock_queue_capacity {
                if state.flow_locked {
                    state.flow_locked = false;
                    state.lock_count -= 1;
                    assert!(state.lock_count >= 0, "unbalanced flow lock/unlock");
                    unlock = true;
                }
                if state.external_waiters > 0 {
                    self.space_available.notify_all();
                }
            }
            (event, unlock)
        };

        if unlock {
            debug!(compartment = %self.config.name, "Flow unlocked");
            self.flow_controller.unlock_flow();
        }
        Some(event)
    }
}

impl fmt::Debug for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compartment")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
