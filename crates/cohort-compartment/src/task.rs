//! Tasks executed by compartments.
//!
//! Three kinds of work can be queued, modelled as the closed [`Task`] enum:
//!
//! - `Run` - a plain closure
//! - `Compartment` - a [`CompartmentTask`] whose completion callbacks must run
//!   on the thread of the compartment that owns the task's state
//! - `List` - an ordered batch of tasks executed back to back
//!
//! Panics escaping a task are caught and converted to
//! [`TaskError::Panicked`], so one broken task never takes down the loop.
//! [`TaskError::Interrupted`] is the only error that propagates.

use crate::error::{TaskError, TaskResult};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, warn};

/// A plain closure task.
pub type Runnable = Box<dyn FnOnce() -> TaskResult<()> + Send + 'static>;

/// Deferred completion of a compartment task.
pub(crate) type Completion = Box<dyn FnOnce() + Send + 'static>;

/// A task with a result and completion callbacks.
///
/// `execute` may run on a pool thread; `on_succeeded` and `on_failed` always
/// run on the compartment the task was submitted from.
pub trait CompartmentTask: Send + 'static {
    type Output: Send + 'static;

    /// Perform the work.
    fn execute(&mut self) -> TaskResult<Self::Output>;

    /// Called with the result when `execute` succeeded.
    fn on_succeeded(self, result: Self::Output)
    where
        Self: Sized;

    /// Called when `execute` failed or panicked.
    fn on_failed(self, error: TaskError)
    where
        Self: Sized,
    {
        warn!(%error, "Compartment task failed");
    }
}

/// Type-erased compartment task.
pub(crate) trait ErasedTask: Send {
    /// Run `execute` and return the completion to deliver.
    ///
    /// Only `TaskError::Interrupted` is returned as an error.
    fn execute(self: Box<Self>) -> TaskResult<Completion>;
}

struct TaskCell<T>(T);

impl<T: CompartmentTask> ErasedTask for TaskCell<T> {
    fn execute(self: Box<Self>) -> TaskResult<Completion> {
        let mut task = self.0;
        match run_guarded(|| task.execute()) {
            Ok(result) => Ok(Box::new(move || task.on_succeeded(result))),
            Err(TaskError::Interrupted) => Err(TaskError::Interrupted),
            Err(e) => Ok(Box::new(move || task.on_failed(e))),
        }
    }
}

/// An erased [`CompartmentTask`].
pub struct BoxedTask(pub(crate) Box<dyn ErasedTask>);

impl BoxedTask {
    pub fn new<T: CompartmentTask>(task: T) -> Self {
        BoxedTask(Box::new(TaskCell(task)))
    }
}

impl fmt::Debug for BoxedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxedTask")
    }
}

/// Unit of work accepted by a compartment queue.
pub enum Task {
    Run(Runnable),
    Compartment(BoxedTask),
    List(Vec<Task>),
}

impl Task {
    /// Wrap an infallible closure.
    pub fn run(f: impl FnOnce() + Send + 'static) -> Self {
        Task::Run(Box::new(move || {
            f();
            Ok(())
        }))
    }

    /// Wrap a closure that may fail.
    pub fn fallible(f: impl FnOnce() -> TaskResult<()> + Send + 'static) -> Self {
        Task::Run(Box::new(f))
    }

    /// Wrap a compartment task.
    pub fn compartment<T: CompartmentTask>(task: T) -> Self {
        Task::Compartment(BoxedTask::new(task))
    }

    /// Group tasks that must run in order, without interleaving.
    pub fn list(tasks: Vec<Task>) -> Self {
        Task::List(tasks)
    }

    /// Execute the task on the current thread.
    ///
    /// Failures are logged and swallowed; only an interruption is returned.
    pub fn execute(self, context: &str) -> TaskResult<()> {
        match self {
            Task::Run(f) => match run_guarded(f) {
                Ok(()) => Ok(()),
                Err(TaskError::Interrupted) => Err(TaskError::Interrupted),
                Err(e) => {
                    log_failure(context, &e);
                    Ok(())
                }
            },
            Task::Compartment(task) => {
                let completion = task.0.execute()?;
                run_completion(context, completion)
            }
            Task::List(tasks) => {
                for task in tasks {
                    task.execute(context)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Run(_) => f.write_str("Task::Run"),
            Task::Compartment(_) => f.write_str("Task::Compartment"),
            Task::List(tasks) => write!(f, "Task::List({})", tasks.len()),
        }
    }
}

impl From<BoxedTask> for Task {
    fn from(task: BoxedTask) -> Self {
        Task::Compartment(task)
    }
}

pub(crate) fn run_completion(context: &str, completion: Completion) -> TaskResult<()> {
    match run_guarded(move || {
        completion();
        Ok(())
    }) {
        Err(TaskError::Interrupted) => Err(TaskError::Interrupted),
        Err(e) => {
            log_failure(context, &e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// Run `f`, converting a panic into [`TaskError::Panicked`].
pub fn run_guarded<R>(f: impl FnOnce() -> TaskResult<R>) -> TaskResult<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Invoke a listener callback, logging instead of propagating a panic.
///
/// Used by fan-out loops so one misbehaving listener cannot block delivery
/// to the others.
pub fn notify_isolated(context: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(
            context,
            panic = %panic_message(payload.as_ref()),
            "Listener panicked"
        );
    }
}

fn log_failure(context: &str, error: &TaskError) {
    match error {
        TaskError::Panicked(message) => error!(context, panic = %message, "Task panicked"),
        other => warn!(context, error = %other, "Task failed"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
