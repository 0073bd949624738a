//! Cooperative task executor.
//!
//! This module contains the [`Runtime`] which schedules tasks and polls
//! registered reactors, plus thread-local helpers so that code deep inside a
//! worker (the bridges in particular) can spawn fibers without threading a
//! runtime reference through every call.

use std::{
    cell::RefCell,
    collections::HashMap,
    future::Future,
    rc::Rc,
    task::Poll,
};

use futures::FutureExt;
use slab::Slab;
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::{
    poll::PollReactor,
    reactor::{Reactor, ReactorStatus},
    task::{JoinHandle, Task},
    timer::TimerReactor,
};

thread_local! {
    static RUNTIME: RefCell<Option<Rc<Runtime>>> = const { RefCell::new(None) };
}

/// Install `runtime` as the runtime of the current thread.
pub fn set_runtime(runtime: Rc<Runtime>) {
    RUNTIME.with(|r| *r.borrow_mut() = Some(runtime));
}

/// The runtime installed on the current thread, if any.
pub fn get_runtime() -> Option<Rc<Runtime>> {
    RUNTIME.with(|r| r.borrow().clone())
}

/// Forget the runtime installed on the current thread.
pub fn clear_runtime() {
    RUNTIME.with(|r| r.borrow_mut().take());
}

/// Spawn `future` onto the thread's runtime.
///
/// Returns `None` when no runtime is installed.
pub fn spawn<F, T>(future: F) -> Option<JoinHandle<T>>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    get_runtime().map(|rt| rt.spawn(future))
}

/// Spawn a named task onto the thread's runtime.
pub fn spawn_with_name<F, T>(future: F, name: impl Into<String>) -> Option<JoinHandle<T>>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    get_runtime().map(|rt| rt.spawn_with_name(future, name.into()))
}

/// Drive `future` to completion on the thread's runtime.
///
/// Returns `None` when no runtime is installed.
pub fn run<F, T>(future: F) -> Option<Result<T, String>>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    get_runtime().map(|rt| rt.run(future))
}

/// Asynchronous task runtime that manages reactors and tasks.
pub struct Runtime {
    reactors: RefCell<HashMap<&'static str, Rc<dyn Reactor>>>,
    task_sender: Sender<usize>,
    task_receiver: Receiver<usize>,
    task_pool: Rc<RefCell<Slab<Option<Task>>>>,
}

impl Runtime {
    /// Creates a new runtime with room for `queue_size` tasks before the pool grows.
    ///
    /// The thread's timer and descriptor-readiness reactors are registered
    /// automatically, under `"timer"` and `"poll"`.
    pub fn new(queue_size: usize) -> Rc<Self> {
        let (task_sender, task_receiver) = channel();
        let runtime = Rc::new(Runtime {
            reactors: RefCell::new(HashMap::new()),
            task_sender,
            task_receiver,
            task_pool: Rc::new(RefCell::new(Slab::with_capacity(queue_size))),
        });
        runtime.register_reactor("timer", TimerReactor::current());
        runtime.register_reactor("poll", PollReactor::current());
        runtime
    }

    /// Spawn a future onto the runtime and return a [`JoinHandle`] to await
    /// its result.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.insert_task(future, None)
    }

    /// Spawn a task and associate a name with it for logging.
    pub fn spawn_with_name<F, T>(&self, future: F, task_name: String) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.insert_task(future, Some(task_name))
    }

    fn insert_task<F, T>(&self, future: F, name: Option<String>) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let (task, handle) = Task::create_task_and_handle(future, self.task_sender.clone(), name);

        let task_id = self.task_pool.borrow_mut().insert(task);
        tracing::trace!(task_id, "Runtime::spawn");

        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.task_sender.send(task_id);

        handle
    }

    /// Register a reactor instance with this runtime.
    ///
    /// Registering under an existing id replaces the previous reactor.
    pub fn register_reactor<R>(&self, id: &'static str, reactor: R)
    where
        R: Reactor + 'static,
    {
        self.reactors
            .borrow_mut()
            .insert(id, Rc::new(reactor) as Rc<dyn Reactor>);
        tracing::debug!("Reactor {} registered", id);
    }

    /// Number of tasks that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        self.task_pool.borrow().len()
    }

    /// Run tasks until the task pool becomes empty.
    pub fn run_queue(&self) {
        while self.task_pool.borrow().len() > 0 {
            // Only one ready task per turn, so a task that keeps yielding
            // cannot starve the reactors.
            if let Ok(task_id) = self.task_receiver.try_recv() {
                tracing::trace!("Runtime::run_queue task_id: {}", task_id);
                if let Poll::Ready(_) = self.poll_task(task_id) {
                    let mut binding = self.task_pool.borrow_mut();
                    if let Some(Some(task)) = binding.try_remove(task_id) {
                        tracing::trace!(
                            name = task.name.as_deref().unwrap_or(""),
                            "Task {} completed, remaining tasks: {}",
                            task_id,
                            binding.len()
                        );
                    }
                }
            }

            let reactors: Vec<(&'static str, Rc<dyn Reactor>)> = self
                .reactors
                .borrow()
                .iter()
                .map(|(id, r)| (*id, r.clone()))
                .collect();
            for (id, reactor) in reactors {
                if let ReactorStatus::Running = reactor.status() {
                    reactor.poll();
                    tracing::trace!("Reactor {} polled", id);
                }
            }
        }
    }

    /// Run the provided future to completion, driving the event loop until
    /// every spawned task has finished.
    pub fn run<F, T>(&self, future: F) -> Result<T, String>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let handle = self.spawn(future);
        self.run_queue();
        handle
            .now_or_never()
            .unwrap_or_else(|| Err("task did not complete".to_string()))
    }

    /// Poll a single task by its id.
    ///
    /// Wakes that arrive after a task finished carry a stale id and are ignored.
    pub fn poll_task(&self, task_id: usize) -> Poll<()> {
        let task = {
            let mut binding = self.task_pool.borrow_mut();
            match binding.get_mut(task_id).and_then(|slot| slot.take()) {
                Some(task) => task,
                None => {
                    tracing::trace!(task_id, "stale wake ignored");
                    return Poll::Pending;
                }
            }
        };

        let ret = task.poll_task(task_id);

        let mut binding = self.task_pool.borrow_mut();
        if let Some(slot) = binding.get_mut(task_id) {
            slot.replace(task);
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn run_returns_main_output() {
        let runtime = Runtime::new(16);
        let out = runtime.run(async { 40 + 2 });
        assert_eq!(out, Ok(42));
        assert_eq!(runtime.pending_tasks(), 0);
    }

    #[test]
    fn spawned_tasks_interleave_on_yield() {
        let runtime = Runtime::new(16);
        let order = Rc::new(RefCell::new(Vec::new()));

        for id in 0..2 {
            let order = order.clone();
            runtime.spawn(async move {
                for step in 0..3 {
                    order.borrow_mut().push((id, step));
                    futures_lite::future::yield_now().await;
                }
            });
        }
        runtime.run_queue();

        let order = order.borrow();
        assert_eq!(order.len(), 6);
        assert_eq!(order[0], (0, 0));
        assert_eq!(order[1], (1, 0));
        assert_eq!(order[2], (0, 1));
    }

    #[test]
    fn join_handle_yields_child_output() {
        let runtime = Runtime::new(16);
        let rt = runtime.clone();
        let out = runtime.run(async move {
            let child = rt.spawn_with_name(async { "child" }, "child".into());
            child.await
        });
        assert_eq!(out, Ok(Ok("child")));
    }

    #[test]
    fn tls_helpers_follow_installed_runtime() {
        clear_runtime();
        assert!(get_runtime().is_none());
        assert!(spawn(async {}).is_none());

        let runtime = Runtime::new(16);
        set_runtime(runtime.clone());
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        spawn_with_name(async move { h.set(h.get() + 1) }, "tls").unwrap();
        let out = run(async { 5 }).unwrap();

        assert_eq!(out, Ok(5));
        assert_eq!(hits.get(), 1);
        clear_runtime();
    }

    #[test]
    fn stale_task_id_is_ignored() {
        let runtime = Runtime::new(16);
        assert_eq!(runtime.poll_task(99), Poll::Pending);
    }
}
