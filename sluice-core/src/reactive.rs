//! The reactive executor.
//!
//! A cooperative, thread-local scheduler for continuations. Each thread
//! owns one worker with a FIFO queue of tasks and a stack of saved queues.
//! The first task scheduled on an idle worker runs a loop on the calling
//! thread; tasks scheduled while that loop is running are queued and picked
//! up by it instead of recursing. Deep chains of steps therefore unwind to
//! the loop between steps and never grow the stack.
//!
//! # Scheduling
//!
//! - [`schedule_main`]: starts a new unit of work. A non-empty current queue
//!   is saved on the back stack and a fresh queue started.
//! - [`schedule`]: resumes work; the task is put in front of the queue.
//! - [`schedule_sync`]: like `schedule_main`, but the task is appended and
//!   the loop is always drained on the calling thread, even when it is
//!   already running. Transacted work uses this to stay on one thread.
//! - [`schedule_queue`]: appends without running.
//! - [`execute_from_queue`]: runs exactly one queued task.

use std::{
    cell::RefCell,
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::atomic::{AtomicUsize, Ordering},
};

/// A unit of work scheduled on an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

static RUNNING_WORKERS: AtomicUsize = AtomicUsize::new(0);
static EXECUTED_TASKS: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct Worker {
    queue: VecDeque<Task>,
    back: Vec<VecDeque<Task>>,
    running: bool,
}

impl Worker {
    fn poll(&mut self) -> Option<Task> {
        loop {
            if let Some(task) = self.queue.pop_front() {
                return Some(task);
            }
            self.queue = self.back.pop()?;
        }
    }

    fn pending(&self) -> usize {
        self.queue.len() + self.back.iter().map(VecDeque::len).sum::<usize>()
    }
}

thread_local! {
    static WORKER: RefCell<Worker> = RefCell::new(Worker::default());
}

fn enqueue(task: Task, first: bool, main: bool, sync: bool) {
    let run = WORKER.with(|w| {
        let mut w = w.borrow_mut();
        if main && !w.queue.is_empty() {
            let saved = std::mem::take(&mut w.queue);
            w.back.push(saved);
        }
        if first {
            w.queue.push_front(task);
        } else {
            w.queue.push_back(task);
        }
        if !w.running || sync {
            let was_running = w.running;
            w.running = true;
            Some(was_running)
        } else {
            None
        }
    });
    if let Some(was_running) = run {
        drain(was_running);
    }
}

fn drain(was_running: bool) {
    RUNNING_WORKERS.fetch_add(1, Ordering::Relaxed);
    // The borrow is released before each task runs so tasks can schedule.
    while let Some(task) = WORKER.with(|w| w.borrow_mut().poll()) {
        run_task(task);
    }
    WORKER.with(|w| w.borrow_mut().running = was_running);
    RUNNING_WORKERS.fetch_sub(1, Ordering::Relaxed);
}

fn run_task(task: Task) {
    EXECUTED_TASKS.fetch_add(1, Ordering::Relaxed);
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned());
        tracing::warn!(%reason, "error executing reactive work, this is ignored");
    }
}

/// Schedules the start of a new unit of work.
pub fn schedule_main(task: impl FnOnce() + Send + 'static) {
    enqueue(Box::new(task), true, true, false);
}

/// Schedules the continuation of the current unit of work.
pub fn schedule(task: impl FnOnce() + Send + 'static) {
    enqueue(Box::new(task), true, false, false);
}

/// Schedules a task and drains the queue on the calling thread.
pub fn schedule_sync(task: impl FnOnce() + Send + 'static) {
    enqueue(Box::new(task), false, true, true);
}

/// Queues a task without running it.
pub fn schedule_queue(task: impl FnOnce() + Send + 'static) {
    WORKER.with(|w| w.borrow_mut().queue.push_back(Box::new(task)));
}

/// Runs one queued task, returning false when the queue was empty.
pub fn execute_from_queue() -> bool {
    match WORKER.with(|w| w.borrow_mut().poll()) {
        Some(task) => {
            run_task(task);
            true
        }
        None => false,
    }
}

/// Number of tasks queued on the current thread.
pub fn pending_tasks() -> usize {
    WORKER.with(|w| w.borrow().pending())
}

/// Number of workers currently draining their queue, across all threads.
pub fn running_workers() -> usize {
    RUNNING_WORKERS.load(Ordering::Relaxed)
}

/// Total number of tasks executed, across all threads.
pub fn executed_tasks() -> usize {
    EXECUTED_TASKS.load(Ordering::Relaxed)
}

/// Returns true while the current thread's worker is draining its queue.
pub fn is_running() -> bool {
    WORKER.with(|w| w.borrow().running)
}
