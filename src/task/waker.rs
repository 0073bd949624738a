//! Custom waker used by [`Task`](crate::task::Task).

use std::{
    rc::Rc,
    sync::mpsc::Sender,
    task::{RawWaker, RawWakerVTable, Waker},
};

/// Internal waker data used to reschedule tasks on the runtime.
#[derive(Debug)]
struct PluvioWaker {
    task_id: usize,
    task_sender: Sender<usize>,
}

impl PluvioWaker {
    fn schedule(&self) {
        // The receiver only goes away with the runtime; nothing left to wake then.
        if self.task_sender.send(self.task_id).is_err() {
            tracing::trace!(task_id = self.task_id, "wake after runtime shutdown");
        }
    }
}

unsafe fn clone_raw(data: *const ()) -> RawWaker {
    let rc: Rc<PluvioWaker> = Rc::from_raw(data as *const PluvioWaker);
    let ptr = Rc::into_raw(rc.clone()) as *const ();
    // rcのdropを防ぐ
    std::mem::forget(rc);
    RawWaker::new(ptr, get_vtable())
}

unsafe fn wake_raw(data: *const ()) {
    let rc: Rc<PluvioWaker> = Rc::from_raw(data as *const PluvioWaker);
    rc.schedule();
}

unsafe fn wake_by_ref_raw(data: *const ()) {
    let rc: Rc<PluvioWaker> = Rc::from_raw(data as *const PluvioWaker);
    rc.schedule();
    std::mem::forget(rc);
}

unsafe fn drop_raw(data: *const ()) {
    drop(Rc::from_raw(data as *const PluvioWaker));
}

fn get_vtable() -> &'static RawWakerVTable {
    &RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw)
}

/// Create a [`Waker`] that requeues the task onto the runtime.
pub(crate) fn new_waker(sender: Sender<usize>, id: usize) -> Waker {
    let pluvio_waker = Rc::new(PluvioWaker {
        task_id: id,
        task_sender: sender,
    });
    let raw = RawWaker::new(Rc::into_raw(pluvio_waker) as *const (), get_vtable());
    unsafe { Waker::from_raw(raw) }
}
