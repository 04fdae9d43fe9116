//! Cohort Compartment - single-threaded actor runtime
//!
//! A compartment is a scheduling unit with one owned thread, one queue and
//! its own flow control. Protocol code running on a compartment never needs
//! internal locking: all of its state is touched by exactly one thread.
//!
//! This crate provides:
//! - Event queues whose capacity is the sum of estimated event sizes
//! - Dispatchers for idle waiting (condition variable or I/O readiness loop)
//! - The compartment run loop with batching, processors and timers
//! - Compartment groups for off-thread work and a shared timer
//! - Keyed coalescing of concurrent task executions
//!
//! # Example
//!
//! ```rust,ignore
//! use cohort_compartment::{Compartment, CompartmentConfigBuilder, Task};
//!
//! let compartment = Compartment::new(CompartmentConfigBuilder::new("main").build())?;
//! compartment.start()?;
//! compartment.offer(Task::run(|| println!("on the compartment thread")))?;
//! compartment.stop();
//! ```

pub mod compartment;
pub mod dispatcher;
pub mod error;
pub mod flow;
pub mod group;
pub mod key_executor;
pub mod processor;
pub mod queue;
pub mod task;
pub mod time;

pub use compartment::{
    is_compartment_thread, Compartment, CompartmentBuilder, CompartmentConfig,
    CompartmentConfigBuilder, CompartmentState,
};
pub use dispatcher::{
    CompartmentDispatcher, ReadinessHandler, SelectorCompartmentDispatcher,
    SimpleCompartmentDispatcher,
};
pub use error::{CompartmentError, Result, TaskError, TaskResult};
pub use flow::{FlowController, NoFlowController};
pub use group::{CompartmentGroup, CompartmentGroupConfig};
pub use key_executor::{KeyCompartmentTaskExecutor, KeyHandler};
pub use processor::{
    CompartmentGroupProcessor, CompartmentProcessor, CompartmentTimerProcessor, ProcessorList,
};
pub use queue::{CompartmentQueue, Event, Priority, PriorityCompartmentQueue, SimpleCompartmentQueue};
pub use task::{notify_isolated, run_guarded, BoxedTask, CompartmentTask, Runnable, Task};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
