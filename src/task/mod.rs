//! Task abstractions used by the [`Runtime`](crate::executor::Runtime).
//!
//! This module provides the [`Task`] type and the [`JoinHandle`] returned when
//! spawning tasks. Every worker and every bridge reactor fiber is one task.

mod waker;

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::Sender;
use std::task::{Context, Poll};
use std::{future::Future, pin::Pin, task::Waker};

use crate::task::waker::new_waker;

/// Shared state between a running task and its [`JoinHandle`].
#[derive(Debug, Default)]
pub struct SharedState {
    pub waker: RefCell<Option<Waker>>,
    pub result: RefCell<Option<Result<Box<dyn Any + 'static>, String>>>,
}

impl SharedState {
    /// Create a new empty [`SharedState`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the state in an `Rc` for sharing.
    pub fn new_shared() -> Rc<Self> {
        Rc::new(Self::new())
    }
}

/// Handle returned from [`Runtime::spawn`](crate::executor::Runtime::spawn) that
/// allows awaiting the output of a task.
pub struct JoinHandle<T> {
    pub shared_state: Rc<SharedState>,
    pub type_data: std::marker::PhantomData<T>,
}

impl<T> JoinHandle<T> {
    /// Returns `true` once the task has produced its output.
    pub fn is_finished(&self) -> bool {
        self.shared_state.result.borrow().is_some()
    }
}

impl<T> Future for JoinHandle<T>
where
    T: 'static,
{
    type Output = Result<T, String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let shared = &self.shared_state;

        if let Some(result) = shared.result.borrow_mut().take() {
            let ret = match result {
                Ok(data) => match data.downcast::<T>() {
                    Ok(data) => Ok(*data),
                    Err(_) => Err("Failed to downcast".to_string()),
                },
                Err(err) => Err(err),
            };
            return Poll::Ready(ret);
        }

        *shared.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Internal representation of a spawned task.
pub struct Task {
    pub future: RefCell<Pin<Box<dyn Future<Output = ()> + 'static>>>,
    pub task_sender: Sender<usize>,
    pub shared_state: Rc<SharedState>,
    pub name: Option<String>,
}

impl Task {
    /// Wrap a future into a [`Task`] and return it with a [`JoinHandle`].
    pub fn create_task_and_handle<F, T>(
        future: F,
        sender: Sender<usize>,
        name: Option<String>,
    ) -> (Option<Task>, JoinHandle<T>)
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let shared = SharedState::new_shared();

        let handle: JoinHandle<T> = JoinHandle {
            shared_state: shared.clone(),
            type_data: std::marker::PhantomData,
        };

        let shared_clone = shared.clone();
        let wrapped_future = async move {
            let res = future.await;
            *shared_clone.result.borrow_mut() = Some(Ok(Box::new(res) as Box<dyn Any>));
            let waker = shared_clone.waker.borrow_mut().take();
            if let Some(waker) = waker {
                tracing::trace!("task finished, waking joiner");
                waker.wake();
            }
        };

        let task = Some(Task {
            future: RefCell::new(Box::pin(wrapped_future)),
            task_sender: sender,
            shared_state: shared,
            name,
        });

        (task, handle)
    }

    /// Poll the future contained in this task once.
    pub fn poll_task(&self, task_id: usize) -> Poll<()> {
        let waker = new_waker(self.task_sender.clone(), task_id);
        let mut context = Context::from_waker(&waker);

        let mut future_slot = match self.future.try_borrow_mut() {
            Ok(future) => future,
            Err(_) => {
                tracing::warn!(task_id, "task is already being polled");
                return Poll::Pending;
            }
        };

        future_slot.as_mut().poll(&mut context)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("shared_state", &self.shared_state)
            .finish()
    }
}
