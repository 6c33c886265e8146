//! A minimal task runtime.
//!
//! The runtime spawns tasks, hands every task a [`TaskId`] that stays stable
//! for the task's whole life, and installs a thread-local binding so that
//! code running inside a task can recover the runtime ([`current_runtime`])
//! and its own identity ([`Runtime::current_task`]). The synchronization
//! primitives in [`crate::sync`] are built on top of these two facilities.
//!
//! Tasks are realized as dedicated threads; blocking a task parks its thread
//! until another task wakes it. The identity a task observes is always the
//! one assigned by the runtime, never the thread's own.

use log::{debug, trace};
use std::any::Any;
use std::cell::RefCell;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Identity of a task, assigned by the runtime at spawn time.
///
/// Two concurrently live tasks of the same runtime never share an id, and a
/// task observes the same id for its entire life. Ids are never reused.
#[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub struct TaskId(u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[cfg(test)]
impl TaskId {
    pub(crate) const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

/// A builder for a [`Runtime`].
#[derive(Debug)]
pub struct Builder {
    stack_size: usize,
    name_prefix: String,
}

impl Builder {
    /// Default stack size for new tasks.
    ///
    /// Is currently set to 2 MiB.
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024 * 2;

    /// Creates a new builder with the default settings.
    #[inline]
    pub fn new() -> Self {
        Self {
            stack_size: Self::DEFAULT_STACK_SIZE,
            name_prefix: "task".into(),
        }
    }

    /// Changes the stack size for new tasks.
    #[inline]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Changes the prefix used for the names of task threads.
    #[inline]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Builds the runtime with the provided settings.
    #[inline]
    pub fn build(self) -> Runtime {
        Runtime::with_settings(self.stack_size, self.name_prefix)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// A runtime for running tasks.
///
/// The handle is cheap to clone; all clones refer to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    id: u64,
    next_task: AtomicU64,
    live_tasks: AtomicUsize,
    stack_size: usize,
    name_prefix: String,
}

static RUNTIME_IDS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

struct Binding {
    runtime: Runtime,
    task: TaskId,
}

/// Returns the runtime the calling task belongs to, if any.
///
/// The binding is installed when a task starts and removed when it finishes,
/// so this returns `None` on threads not managed by a runtime.
pub fn current_runtime() -> Option<Runtime> {
    CURRENT.with(|current| current.borrow().as_ref().map(|b| b.runtime.clone()))
}

impl Runtime {
    /// Creates a runtime with the default settings.
    pub fn new() -> Self {
        Builder::new().build()
    }

    fn with_settings(stack_size: usize, name_prefix: String) -> Self {
        let id = RUNTIME_IDS.fetch_add(1, Ordering::Relaxed);
        debug!("starting task runtime {}", id);
        Self {
            inner: Arc::new(RuntimeInner {
                id,
                next_task: AtomicU64::new(0),
                live_tasks: AtomicUsize::new(0),
                stack_size,
                name_prefix,
            }),
        }
    }

    /// Spawns a new task.
    ///
    /// The task starts immediately and runs until `f` returns or panics. The
    /// returned handle can be used to wait for the task and fetch its result.
    pub fn spawn<T, F>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let task = TaskId(self.inner.next_task.fetch_add(1, Ordering::Relaxed));
        let name = format!("{}-{}", self.inner.name_prefix, task.0);
        self.inner.live_tasks.fetch_add(1, Ordering::AcqRel);
        trace!("spawning {} on runtime {}", task, self.inner.id);

        let runtime = self.clone();
        let thread = thread::Builder::new()
            .name(name)
            .stack_size(self.inner.stack_size)
            .spawn(move || {
                let _guard = Guard::install(runtime, task);
                f()
            })
            .expect("failed to spawn a task thread");

        JoinHandle { task, thread }
    }

    /// Enters the runtime with a function.
    ///
    /// Runs `f` as a task and blocks the caller until it has finished,
    /// resuming the unwind if the task panicked.
    pub fn enter<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match self.spawn(f).join() {
            Ok(value) => value,
            Err(e) => std::panic::resume_unwind(e),
        }
    }

    /// Fetches the id of the calling task.
    ///
    /// Returns `None` if the calling context is not a task of this runtime;
    /// tasks of other runtimes do not count.
    pub fn current_task(&self) -> Option<TaskId> {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(|b| (b.runtime.inner.id == self.inner.id).then_some(b.task))
        })
    }

    /// Yields the current task, allowing other tasks to run.
    #[inline]
    pub fn yield_now(&self) {
        thread::yield_now();
    }

    /// Number of tasks that have been spawned and not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.inner.live_tasks.load(Ordering::Acquire)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("live_tasks", &self.live_tasks())
            .finish_non_exhaustive()
    }
}

/// Installs the thread-local binding for the lifetime of a task body and
/// tears it down again, also when the task unwinds.
struct Guard {
    runtime: Runtime,
    task: TaskId,
}

impl Guard {
    fn install(runtime: Runtime, task: TaskId) -> Self {
        CURRENT.with(|current| {
            *current.borrow_mut() = Some(Binding {
                runtime: runtime.clone(),
                task,
            });
        });
        Self { runtime, task }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
        self.runtime.inner.live_tasks.fetch_sub(1, Ordering::AcqRel);
        if thread::panicking() {
            debug!("{} aborted by panic", self.task);
        } else {
            trace!("{} finished", self.task);
        }
    }
}

/// An owned permission to join on a task (block on its termination).
#[derive(Debug)]
pub struct JoinHandle<T> {
    task: TaskId,
    thread: thread::JoinHandle<T>,
}

impl<T> JoinHandle<T> {
    /// Fetches the id of the task.
    #[inline]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Polls whether the task has finished.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Blocks the current task until the task has finished.
    ///
    /// Returns the task's result, or the panic payload if it unwound.
    pub fn join(self) -> Result<T, Box<dyn Any + Send + 'static>> {
        self.thread.join()
    }
}
