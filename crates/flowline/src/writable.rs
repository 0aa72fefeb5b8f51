//! Writable side of the flow-control protocol.
//!
//! A [`WritableStream`] hands one [`WriteRequest`] at a time to its
//! [`WritableSink`]. Further writes queue behind the in-flight request and
//! are dispatched, in order, as each completion arrives.
//!
//! ```text
//! write(d1) ──► pending == 0 ──► sink.on_write(r1)      (pending 0 → 1)
//! write(d2) ──► pending  > 0 ──► queue: [r2]
//! r1.complete(None)
//!   ├── r1 callback (or on_error for an unhandled error)
//!   ├── pending == 0 → dispatch r2
//!   └── is_writable() → deferred forwards, then on_writable
//! ```
//!
//! `on_writable` fires after every completion that leaves the stream
//! writable, not only on a not-writable → writable edge, so a producer can
//! drip-feed one write per notification. Deferred forwards queued with
//! [`when_writable`](WritableStream::when_writable) run first; if they use up
//! the freed capacity, `on_writable` is skipped for that completion.

use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::callback::{ErrorCallback, Slot, WritableCallback, WritableDefaults};
use crate::config::StreamConfig;
use crate::event_loop::EventLoop;
use crate::readable::next_stream_id;
use crate::request::{CompleteFn, WriteRequest};

/// Hooks a concrete writable stream provides.
pub trait WritableSink<T: Clone + 'static>: 'static {
    /// Perform the write. The sink must eventually call
    /// [`WriteRequest::complete`] exactly once, synchronously or later.
    /// Returns the amount written, added to the stream's `tx()` total.
    fn on_write(&self, stream: &WritableStream<T>, request: &WriteRequest<T>) -> u64;

    /// Capacity predicate. Defaults to "at most `write_queue_limit` requests
    /// are queued".
    fn is_writable(&self, stream: &WritableStream<T>) -> bool {
        stream.queued_writes() <= stream.config().write_queue_limit
    }
}

impl<T: Clone + 'static, S: WritableSink<T> + ?Sized> WritableSink<T> for Rc<S> {
    fn on_write(&self, stream: &WritableStream<T>, request: &WriteRequest<T>) -> u64 {
        (**self).on_write(stream, request)
    }

    fn is_writable(&self, stream: &WritableStream<T>) -> bool {
        (**self).is_writable(stream)
    }
}

type Deferred<T> = Box<dyn FnOnce(&WritableStream<T>)>;

struct WriteState<T: Clone + 'static> {
    queue: VecDeque<WriteRequest<T>>,
    deferred: VecDeque<Deferred<T>>,
    pending: usize,
    ended: bool,
    tx: u64,
    next_request: u64,
}

pub(crate) struct WritableInner<T: Clone + 'static> {
    id: u64,
    event_loop: EventLoop,
    config: StreamConfig,
    sink: Box<dyn WritableSink<T>>,
    state: RefCell<WriteState<T>>,
    on_end: Slot<WritableCallback<T>>,
    on_error: Slot<ErrorCallback<T>>,
    on_writable: Slot<WritableCallback<T>>,
}

/// Handle to a writable stream. Clones refer to the same stream.
pub struct WritableStream<T: Clone + 'static> {
    inner: Rc<WritableInner<T>>,
}

impl<T: Clone + 'static> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("WritableStream")
            .field("id", &self.inner.id)
            .field("queued", &state.queue.len())
            .field("pending", &state.pending)
            .field("ended", &state.ended)
            .field("tx", &state.tx)
            .field("has_on_writable", &self.inner.on_writable.is_set())
            .finish()
    }
}

impl<T: Clone + 'static> WritableStream<T> {
    pub fn new(event_loop: &EventLoop, sink: impl WritableSink<T>) -> Self {
        Self::with_options(
            event_loop,
            sink,
            &StreamConfig::default(),
            &WritableDefaults::default(),
        )
    }

    pub fn with_defaults(
        event_loop: &EventLoop,
        sink: impl WritableSink<T>,
        defaults: &WritableDefaults<T>,
    ) -> Self {
        Self::with_options(event_loop, sink, &StreamConfig::default(), defaults)
    }

    pub fn with_options(
        event_loop: &EventLoop,
        sink: impl WritableSink<T>,
        config: &StreamConfig,
        defaults: &WritableDefaults<T>,
    ) -> Self {
        let id = next_stream_id();
        trace!(stream = id, "writable stream created");
        Self {
            inner: Rc::new(WritableInner {
                id,
                event_loop: event_loop.clone(),
                config: config.clone(),
                sink: Box::new(sink),
                state: RefCell::new(WriteState {
                    queue: VecDeque::new(),
                    deferred: VecDeque::new(),
                    pending: 0,
                    ended: false,
                    tx: 0,
                    next_request: 1,
                }),
                on_end: Slot::new(defaults.on_end.clone()),
                on_error: Slot::new(defaults.on_error.clone()),
                on_writable: Slot::new(defaults.on_writable.clone()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    fn state_mut(&self) -> RefMut<'_, WriteState<T>> {
        self.inner.state.borrow_mut()
    }

    // ── Writing ────────────────────────────────────────────────────

    /// Submit `data` for writing.
    ///
    /// Dispatched to the sink immediately when nothing is in flight,
    /// otherwise queued. Attach a completion callback on the returned
    /// request; a sink that completes synchronously inside `on_write` does so
    /// before the caller gets that chance, so its errors go to `on_error`.
    pub fn write(&self, data: T) -> WriteRequest<T> {
        let (request, dispatch) = {
            let mut state = self.state_mut();
            let request = WriteRequest::new(state.next_request, data, self.downgrade());
            state.next_request += 1;
            if state.pending > 0 {
                state.queue.push_back(request.clone());
                (request, false)
            } else {
                state.pending += 1;
                (request, true)
            }
        };

        if dispatch {
            self.dispatch(&request);
        } else {
            trace!(
                stream = self.inner.id,
                request = request.id(),
                queued = self.queued_writes(),
                "write queued behind in-flight request"
            );
        }
        request
    }

    fn dispatch(&self, request: &WriteRequest<T>) {
        trace!(stream = self.inner.id, request = request.id(), "dispatching write");
        let written = self.inner.sink.on_write(self, request);
        self.state_mut().tx += written;
    }

    /// Completion path for [`WriteRequest::complete`].
    pub(crate) fn complete_request(
        &self,
        request: &WriteRequest<T>,
        callback: Option<CompleteFn<T>>,
        error: Option<anyhow::Error>,
    ) {
        {
            let mut state = self.state_mut();
            state.pending = state.pending.saturating_sub(1);
        }

        match callback {
            Some(callback) => callback(request, error),
            None => {
                if let Some(error) = error {
                    self.report_error(error);
                }
            }
        }

        let next = {
            let mut state = self.state_mut();
            if state.pending == 0 {
                let next = state.queue.pop_front();
                if next.is_some() {
                    state.pending += 1;
                }
                next
            } else {
                None
            }
        };
        if let Some(next) = next {
            self.dispatch(&next);
        }

        if self.is_writable() {
            self.run_deferred();
            if self.is_writable() {
                if let Some(callback) = self.inner.on_writable.get() {
                    callback(self);
                }
            }
        }
    }

    fn report_error(&self, error: anyhow::Error) {
        match self.inner.on_error.get() {
            Some(callback) => callback(self, error),
            None => warn!(
                stream = self.inner.id,
                error = %error,
                "write failed with no completion callback or on_error handler; error dropped"
            ),
        }
    }

    /// Run `callback` once, the next time the stream signals it is writable.
    ///
    /// Callbacks run in registration order. If the stream is writable now and
    /// nothing else is waiting, the callback runs on the next tick.
    pub fn when_writable(&self, callback: impl FnOnce(&WritableStream<T>) + 'static) {
        let first = {
            let mut state = self.state_mut();
            state.deferred.push_back(Box::new(callback));
            state.deferred.len() == 1
        };
        if first && self.is_writable() {
            let stream = self.clone();
            self.inner.event_loop.next_tick(move || stream.run_deferred());
        }
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !self.inner.state.borrow().deferred.is_empty()
    }

    fn run_deferred(&self) {
        while self.is_writable() {
            let next = self.state_mut().deferred.pop_front();
            match next {
                Some(callback) => callback(self),
                None => break,
            }
        }
    }

    /// Stop accepting data. Already queued writes still drain.
    pub fn end(&self) {
        {
            let mut state = self.state_mut();
            if state.ended {
                return;
            }
            state.ended = true;
        }
        debug!(stream = self.inner.id, "writable stream ended");
        if let Some(callback) = self.inner.on_end.get() {
            callback(self);
        }
    }

    /// Drop every queued (not yet dispatched) write and pending one-shot
    /// writable callback without notification, then [`end`](Self::end).
    pub fn abort(&self) {
        let (dropped, deferred) = {
            let mut state = self.state_mut();
            (
                std::mem::take(&mut state.queue),
                std::mem::take(&mut state.deferred),
            )
        };
        debug!(
            stream = self.inner.id,
            dropped = dropped.len(),
            deferred = deferred.len(),
            "aborting writable stream"
        );
        drop(dropped);
        drop(deferred);
        self.end();
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn is_writable(&self) -> bool {
        self.inner.sink.is_writable(self)
    }

    /// Writes waiting behind the in-flight request.
    pub fn queued_writes(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    /// Writes dispatched to the sink and not yet completed.
    pub fn pending(&self) -> usize {
        self.inner.state.borrow().pending
    }

    pub fn has_ended(&self) -> bool {
        self.inner.state.borrow().ended
    }

    /// Total of the amounts returned by `on_write`.
    pub fn tx(&self) -> u64 {
        self.inner.state.borrow().tx
    }

    // ── Callbacks ──────────────────────────────────────────────────

    pub fn on_writable(&self) -> Option<Rc<WritableCallback<T>>> {
        self.inner.on_writable.get()
    }

    /// Install the writable callback.
    ///
    /// The callback runs after each completion that leaves the stream
    /// writable, unless deferred `when_writable` callbacks running first
    /// made it not writable again. If the stream is already writable, a
    /// catch-up call is scheduled for the next tick (re-checked before it
    /// fires).
    pub fn set_on_writable(&self, callback: impl Fn(&WritableStream<T>) + 'static) {
        self.inner.on_writable.set(Rc::new(callback));
        if !self.is_writable() {
            return;
        }
        let stream = self.clone();
        self.inner.event_loop.next_tick(move || {
            if !stream.is_writable() {
                return;
            }
            if let Some(callback) = stream.inner.on_writable.get() {
                callback(&stream);
            }
        });
    }

    pub fn clear_on_writable(&self) {
        self.inner.on_writable.clear();
    }

    pub fn on_end(&self) -> Option<Rc<WritableCallback<T>>> {
        self.inner.on_end.get()
    }

    pub fn set_on_end(&self, callback: impl Fn(&WritableStream<T>) + 'static) {
        self.inner.on_end.set(Rc::new(callback));
    }

    pub fn clear_on_end(&self) {
        self.inner.on_end.clear();
    }

    pub fn on_error(&self) -> Option<Rc<ErrorCallback<T>>> {
        self.inner.on_error.get()
    }

    pub fn set_on_error(&self, callback: impl Fn(&WritableStream<T>, anyhow::Error) + 'static) {
        self.inner.on_error.set(Rc::new(callback));
    }

    pub fn clear_on_error(&self) {
        self.inner.on_error.clear();
    }

    pub(crate) fn downgrade(&self) -> WeakWritable<T> {
        WeakWritable(Rc::downgrade(&self.inner))
    }
}

/// Non-owning reference to a writable stream.
pub(crate) struct WeakWritable<T: Clone + 'static>(Weak<WritableInner<T>>);

impl<T: Clone + 'static> Clone for WeakWritable<T> {
    fn clone(&self) -> Self {
        Self(Weak::clone(&self.0))
    }
}

impl<T: Clone + 'static> WeakWritable<T> {
    pub(crate) fn upgrade(&self) -> Option<WritableStream<T>> {
        self.0.upgrade().map(|inner| WritableStream { inner })
    }

    pub(crate) fn points_to(&self, stream: &WritableStream<T>) -> bool {
        std::ptr::eq(self.0.as_ptr(), Rc::as_ptr(&stream.inner))
    }
}
