//! Single-threaded event loop with next-tick and immediate phases.
//!
//! Streams never run deferred work themselves; they queue it here.
//!
//! ```text
//! run_until_idle()
//!   ├── drain next-tick queue (including ticks queued while draining)
//!   └── for each immediate queued at the start of the phase:
//!         ├── run it
//!         └── drain next-tick queue
//!   repeat until both queues are empty
//! ```
//!
//! Next-tick work (flush notifications, cleanup dispatch, writable
//! catch-up) therefore always runs before any immediate (final close
//! notification), and an immediate observes every tick queued by the
//! immediate before it.
//!
//! Work that completes outside the loop (a transport finishing a write on a
//! tokio task) holds a [`LoopRef`] while outstanding so [`EventLoop::drive`]
//! does not resolve early.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

type Task = Box<dyn FnOnce()>;

#[derive(Default)]
struct LoopState {
    ticks: RefCell<VecDeque<Task>>,
    immediates: RefCell<VecDeque<Task>>,
    refs: Cell<usize>,
    waker: RefCell<Option<Waker>>,
}

/// Handle to a single-threaded event loop. Cloning shares the same queues.
#[derive(Clone, Default)]
pub struct EventLoop {
    state: Rc<LoopState>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("ticks", &self.state.ticks.borrow().len())
            .field("immediates", &self.state.immediates.borrow().len())
            .field("refs", &self.state.refs.get())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task to run before any pending immediate.
    pub fn next_tick(&self, task: impl FnOnce() + 'static) {
        self.state.ticks.borrow_mut().push_back(Box::new(task));
        self.wake();
    }

    /// Queue a task to run once the next-tick queue has drained.
    pub fn set_immediate(&self, task: impl FnOnce() + 'static) {
        self.state.immediates.borrow_mut().push_back(Box::new(task));
        self.wake();
    }

    /// Number of queued tasks across both phases.
    pub fn pending_tasks(&self) -> usize {
        self.state.ticks.borrow().len() + self.state.immediates.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0
    }

    /// Keep [`drive`](Self::drive) pending until the returned guard is dropped.
    pub fn hold(&self) -> LoopRef {
        self.state.refs.set(self.state.refs.get() + 1);
        LoopRef {
            event_loop: self.clone(),
        }
    }

    /// Number of live [`LoopRef`] guards.
    pub fn outstanding_refs(&self) -> usize {
        self.state.refs.get()
    }

    /// Run queued work until both phases are empty. Returns the number of
    /// tasks executed.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = self.run_ticks();
        loop {
            // Immediates queued while this phase runs wait for the next one.
            let phase = self.state.immediates.borrow().len();
            if phase == 0 {
                break;
            }
            for _ in 0..phase {
                let task = self.state.immediates.borrow_mut().pop_front();
                let Some(task) = task else {
                    break;
                };
                task();
                ran += 1;
                ran += self.run_ticks();
            }
        }
        ran
    }

    /// A future that runs the loop whenever work is queued and resolves once
    /// the loop is idle with no outstanding [`LoopRef`].
    pub fn drive(&self) -> Drive {
        Drive {
            event_loop: self.clone(),
            ran: 0,
        }
    }

    fn run_ticks(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.state.ticks.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    fn wake(&self) {
        if let Some(waker) = self.state.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Keep-alive guard for work completing outside the loop.
#[must_use = "dropping a LoopRef immediately releases the loop"]
pub struct LoopRef {
    event_loop: EventLoop,
}

impl fmt::Debug for LoopRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopRef").finish_non_exhaustive()
    }
}

impl Drop for LoopRef {
    fn drop(&mut self) {
        let state = &self.event_loop.state;
        state.refs.set(state.refs.get().saturating_sub(1));
        self.event_loop.wake();
    }
}

/// Future returned by [`EventLoop::drive`]. Resolves to the number of tasks
/// it executed.
#[must_use = "futures do nothing unless polled"]
pub struct Drive {
    event_loop: EventLoop,
    ran: usize,
}

impl Future for Drive {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<usize> {
        let this = self.get_mut();
        this.ran += this.event_loop.run_until_idle();

        if this.event_loop.outstanding_refs() == 0 {
            return Poll::Ready(this.ran);
        }

        let mut waker = this.event_loop.state.waker.borrow_mut();
        match waker.as_ref() {
            Some(w) if w.will_wake(cx.waker()) => (),
            _ => *waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}
