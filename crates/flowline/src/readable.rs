//! Readable side of the flow-control protocol.
//!
//! A [`ReadableStream`] owns a FIFO queue of produced items. A producer (the
//! transport) calls [`push`](ReadableStream::push); a consumer registers
//! `on_readable` and pulls items with [`read`](ReadableStream::read) until it
//! returns `None`. Queue accounting and resource control are delegated to a
//! [`ReadableSource`] implementation.
//!
//! # Close sequence
//!
//! ```text
//! Open ── close() ──► Closing (on_closing runs, may call survive() → Open)
//!                        │
//!                        ├─ queue non-empty: stays closed, waits for read()
//!                        │                    to drain the queue
//!                        ▼
//!                  DrainingCleanup (next tick: source.on_cleanup(done),
//!                        │          only if source.has_cleanup())
//!                        │  done.finish()
//!                        ▼
//!                  ClosingFinal (immediate: pipe cleared, on_closed fires)
//!                        ▼
//!                      Closed
//! ```

use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::callback::{ClosedCallback, ReadableCallback, ReadableDefaults, Slot};
use crate::config::StreamConfig;
use crate::error::{FlowError, FlowResult};
use crate::event_loop::EventLoop;
use crate::pipe;
use crate::writable::{WeakWritable, WritableStream};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_stream_id() -> u64 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Hooks a concrete readable stream provides.
///
/// Only [`queued`](Self::queued) is required. Every hook receives the stream
/// and may call back into it; no internal borrow is held while a hook runs.
pub trait ReadableSource<T: Clone + 'static>: 'static {
    /// Amount of data currently queued, in whatever unit the source counts.
    fn queued(&self, stream: &ReadableStream<T>) -> u64;

    /// Readability predicate. Defaults to "the queue holds at least one item".
    fn is_readable(&self, stream: &ReadableStream<T>) -> bool {
        stream.queue_len() > 0
    }

    /// Called after an item is appended to the queue.
    fn on_push(&self, _stream: &ReadableStream<T>, _item: &T) {}

    /// Called after an item is dequeued by `read`. The return value is added
    /// to the stream's `rx()` total.
    fn on_read(&self, _stream: &ReadableStream<T>, _item: &T) -> u64 {
        0
    }

    /// Pause the underlying resource.
    fn on_pause(&self, _stream: &ReadableStream<T>) {}

    /// Resume the underlying resource.
    fn on_resume(&self, _stream: &ReadableStream<T>) {}

    /// Whether [`on_cleanup`](Self::on_cleanup) should run during close.
    /// Without cleanup the final close notification is queued as an
    /// immediate straight away. Sources overriding `on_cleanup` must return
    /// `true` here.
    fn has_cleanup(&self) -> bool {
        false
    }

    /// Release underlying resources once the stream is closed and drained.
    /// `done.finish()` must be called exactly once when cleanup is complete.
    fn on_cleanup(&self, _stream: &ReadableStream<T>, done: CleanupDone<T>) {
        done.finish();
    }

    /// Called on the next tick after `read` empties the queue, unless items
    /// were pushed in the meantime.
    fn on_flushed(&self, _stream: &ReadableStream<T>) {}
}

impl<T: Clone + 'static, S: ReadableSource<T> + ?Sized> ReadableSource<T> for Rc<S> {
    fn queued(&self, stream: &ReadableStream<T>) -> u64 {
        (**self).queued(stream)
    }

    fn is_readable(&self, stream: &ReadableStream<T>) -> bool {
        (**self).is_readable(stream)
    }

    fn on_push(&self, stream: &ReadableStream<T>, item: &T) {
        (**self).on_push(stream, item)
    }

    fn on_read(&self, stream: &ReadableStream<T>, item: &T) -> u64 {
        (**self).on_read(stream, item)
    }

    fn on_pause(&self, stream: &ReadableStream<T>) {
        (**self).on_pause(stream)
    }

    fn on_resume(&self, stream: &ReadableStream<T>) {
        (**self).on_resume(stream)
    }

    fn has_cleanup(&self) -> bool {
        (**self).has_cleanup()
    }

    fn on_cleanup(&self, stream: &ReadableStream<T>, done: CleanupDone<T>) {
        (**self).on_cleanup(stream, done)
    }

    fn on_flushed(&self, stream: &ReadableStream<T>) {
        (**self).on_flushed(stream)
    }
}

/// Completion token handed to [`ReadableSource::on_cleanup`].
///
/// Finishing schedules the final close notification. Dropping the token
/// without finishing leaves the stream closed but never reported as such.
#[must_use = "the stream only reports closed once CleanupDone::finish is called"]
pub struct CleanupDone<T: Clone + 'static> {
    stream: Option<ReadableStream<T>>,
}

impl<T: Clone + 'static> CleanupDone<T> {
    pub fn finish(mut self) {
        if let Some(stream) = self.stream.take() {
            trace!(stream = stream.id(), "cleanup finished");
            let event_loop = stream.inner.event_loop.clone();
            event_loop.set_immediate(move || stream.finalize());
        }
    }
}

impl<T: Clone + 'static> Drop for CleanupDone<T> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            warn!(
                stream = stream.inner.id,
                "cleanup token dropped without finish(); on_closed will not fire"
            );
        }
    }
}

struct ReadState<T: Clone + 'static> {
    queue: VecDeque<T>,
    closed: bool,
    paused: bool,
    flush_queued: bool,
    in_closing: bool,
    close_started: bool,
    close_error: Option<anyhow::Error>,
    pipe: Option<WeakWritable<T>>,
    rx: u64,
}

struct ReadableInner<T: Clone + 'static> {
    id: u64,
    event_loop: EventLoop,
    config: StreamConfig,
    source: Box<dyn ReadableSource<T>>,
    state: RefCell<ReadState<T>>,
    on_readable: Slot<ReadableCallback<T>>,
    on_closing: Slot<ReadableCallback<T>>,
    on_closed: Slot<ClosedCallback<T>>,
    on_pipe: Slot<ReadableCallback<T>>,
}

/// Handle to a readable stream. Clones refer to the same stream.
pub struct ReadableStream<T: Clone + 'static> {
    inner: Rc<ReadableInner<T>>,
}

impl<T: Clone + 'static> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("ReadableStream")
            .field("id", &self.inner.id)
            .field("queue_len", &state.queue.len())
            .field("closed", &state.closed)
            .field("paused", &state.paused)
            .field("piped", &state.pipe.is_some())
            .field("rx", &state.rx)
            .field("has_on_readable", &self.inner.on_readable.is_set())
            .finish()
    }
}

impl<T: Clone + 'static> ReadableStream<T> {
    pub fn new(event_loop: &EventLoop, source: impl ReadableSource<T>) -> Self {
        Self::with_options(
            event_loop,
            source,
            &StreamConfig::default(),
            &ReadableDefaults::default(),
        )
    }

    pub fn with_defaults(
        event_loop: &EventLoop,
        source: impl ReadableSource<T>,
        defaults: &ReadableDefaults<T>,
    ) -> Self {
        Self::with_options(event_loop, source, &StreamConfig::default(), defaults)
    }

    pub fn with_options(
        event_loop: &EventLoop,
        source: impl ReadableSource<T>,
        config: &StreamConfig,
        defaults: &ReadableDefaults<T>,
    ) -> Self {
        let id = next_stream_id();
        trace!(stream = id, "readable stream created");
        Self {
            inner: Rc::new(ReadableInner {
                id,
                event_loop: event_loop.clone(),
                config: config.clone(),
                source: Box::new(source),
                state: RefCell::new(ReadState {
                    queue: VecDeque::new(),
                    closed: false,
                    paused: false,
                    flush_queued: false,
                    in_closing: false,
                    close_started: false,
                    close_error: None,
                    pipe: None,
                    rx: 0,
                }),
                on_readable: Slot::new(defaults.on_readable.clone()),
                on_closing: Slot::new(defaults.on_closing.clone()),
                on_closed: Slot::new(defaults.on_closed.clone()),
                on_pipe: Slot::new(defaults.on_pipe.clone()),
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

    fn state_mut(&self) -> RefMut<'_, ReadState<T>> {
        self.inner.state.borrow_mut()
    }

    // ── Data flow ──────────────────────────────────────────────────

    /// Queue an item produced by the underlying source.
    ///
    /// Silently ignored once the stream is closed. Fails if the stream is
    /// paused: the producer should have stopped when `on_pause` fired.
    pub fn push(&self, item: T) -> FlowResult<()> {
        let (queue_len, target) = {
            let mut state = self.state_mut();
            if state.closed {
                trace!(stream = self.inner.id, "push after close ignored");
                return Ok(());
            }
            if state.paused {
                return Err(FlowError::PushWhilePaused);
            }
            state.queue.push_back(item.clone());
            (state.queue.len(), state.pipe.clone())
        };

        self.inner.source.on_push(self, &item);

        if let Some(target) = target.and_then(|weak| weak.upgrade()) {
            pipe::forward_pushed(self, &target, item);
            return Ok(());
        }

        if !self.is_readable() {
            return Ok(());
        }

        // Only the empty → non-empty transition notifies.
        if queue_len == 1 {
            self.notify_readable();
        }
        Ok(())
    }

    /// Push a chunk from a transport, pausing the stream once `queued()`
    /// exceeds the configured high-water mark. Returns whether the stream is
    /// paused afterwards.
    pub fn ingest(&self, item: T) -> FlowResult<bool> {
        self.push(item)?;
        let queued = self.queued();
        if !self.is_paused() && queued > self.inner.config.high_water_mark {
            debug!(
                stream = self.inner.id,
                queued,
                high_water_mark = self.inner.config.high_water_mark,
                "high-water mark exceeded, pausing"
            );
            self.pause();
        }
        Ok(self.is_paused())
    }

    /// Dequeue the next item.
    ///
    /// Returns `None` when the stream is not readable, or when a pipe target
    /// is attached and is not currently writable.
    pub fn read(&self) -> Option<T> {
        if !self.is_readable() {
            return None;
        }

        let target = self.pipe();
        if let Some(target) = &target {
            if !target.is_writable() {
                trace!(
                    stream = self.inner.id,
                    target = target.id(),
                    "read blocked by pipe backpressure"
                );
                return None;
            }
        }

        let (item, schedule_flush) = {
            let mut state = self.state_mut();
            let schedule_flush = state.queue.len() == 1 && !state.flush_queued;
            let item = state.queue.pop_front()?;
            if schedule_flush {
                state.flush_queued = true;
            }
            (item, schedule_flush)
        };

        if schedule_flush {
            self.schedule_flushed();
        }

        let weight = self.inner.source.on_read(self, &item);

        let drained_after_close = {
            let mut state = self.state_mut();
            state.rx += weight;
            state.closed && state.queue.is_empty()
        };
        if drained_after_close {
            self.begin_close();
        }

        if let Some(target) = target {
            target.write(item.clone());
        }

        Some(item)
    }

    fn schedule_flushed(&self) {
        let stream = self.clone();
        self.inner.event_loop.next_tick(move || {
            let refilled = {
                let mut state = stream.state_mut();
                state.flush_queued = false;
                !state.queue.is_empty()
            };
            if refilled {
                trace!(stream = stream.inner.id, "queue refilled before flush notification");
                return;
            }
            stream.inner.source.on_flushed(&stream);
        });
    }

    pub(crate) fn notify_readable(&self) {
        if let Some(callback) = self.inner.on_readable.get() {
            callback(self);
        }
    }

    // ── Flow control ───────────────────────────────────────────────

    pub fn pause(&self) {
        {
            let mut state = self.state_mut();
            if state.paused {
                return;
            }
            state.paused = true;
        }
        debug!(stream = self.inner.id, "readable stream paused");
        self.inner.source.on_pause(self);
    }

    pub fn resume(&self) {
        {
            let mut state = self.state_mut();
            if !state.paused {
                return;
            }
            state.paused = false;
        }
        debug!(stream = self.inner.id, "readable stream resumed");
        self.inner.source.on_resume(self);
    }

    // ── Closing ────────────────────────────────────────────────────

    /// Signal that no more data is wanted.
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// Close with an error, delivered once through `on_closed`.
    pub fn close_with_error(&self, error: impl Into<anyhow::Error>) {
        self.close_inner(Some(error.into()));
    }

    fn close_inner(&self, error: Option<anyhow::Error>) {
        {
            let mut state = self.state_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            if error.is_some() {
                state.close_error = error;
            }
        }
        debug!(stream = self.inner.id, "closing readable stream");

        if let Some(callback) = self.inner.on_closing.get() {
            self.state_mut().in_closing = true;
            callback(self);
            self.state_mut().in_closing = false;
        }

        let (closed, queue_len) = {
            let state = self.inner.state.borrow();
            (state.closed, state.queue.len())
        };
        if !closed {
            return;
        }
        if queue_len == 0 {
            self.begin_close();
        } else {
            debug!(
                stream = self.inner.id,
                queue_len, "close deferred until queue drains"
            );
        }
    }

    /// Keep the stream open. Only valid inside the `on_closing` callback.
    pub fn survive(&self) -> FlowResult<()> {
        let mut state = self.state_mut();
        if !state.in_closing {
            return Err(FlowError::SurviveOutsideClosing);
        }
        state.closed = false;
        state.close_error = None;
        debug!(stream = self.inner.id, "readable stream survived close");
        Ok(())
    }

    fn begin_close(&self) {
        {
            let mut state = self.state_mut();
            if state.close_started {
                return;
            }
            state.close_started = true;
        }
        let stream = self.clone();
        if !self.inner.source.has_cleanup() {
            trace!(stream = self.inner.id, "no cleanup, finalizing");
            self.inner.event_loop.set_immediate(move || stream.finalize());
            return;
        }
        trace!(stream = self.inner.id, "dispatching cleanup");
        self.inner.event_loop.next_tick(move || {
            let done = CleanupDone {
                stream: Some(stream.clone()),
            };
            stream.inner.source.on_cleanup(&stream, done);
        });
    }

    fn finalize(&self) {
        let error = {
            let mut state = self.state_mut();
            state.pipe = None;
            state.close_error.take()
        };
        debug!(
            stream = self.inner.id,
            errored = error.is_some(),
            "readable stream closed"
        );
        if let Some(callback) = self.inner.on_closed.get() {
            callback(self, error);
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn is_readable(&self) -> bool {
        self.inner.source.is_readable(self)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.borrow().paused
    }

    /// Queued amount as reported by the source.
    pub fn queued(&self) -> u64 {
        self.inner.source.queued(self)
    }

    /// Number of items in the queue.
    pub fn queue_len(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    /// Total of the weights returned by `on_read`.
    pub fn rx(&self) -> u64 {
        self.inner.state.borrow().rx
    }

    // ── Pipe ───────────────────────────────────────────────────────

    /// Current pipe target, if attached and still alive.
    pub fn pipe(&self) -> Option<WritableStream<T>> {
        let state = self.inner.state.borrow();
        state.pipe.as_ref().and_then(WeakWritable::upgrade)
    }

    /// Attach a pipe target, replacing any previous one, then fire `on_pipe`.
    pub fn set_pipe(&self, target: &WritableStream<T>) {
        self.state_mut().pipe = Some(target.downgrade());
        debug!(stream = self.inner.id, target = target.id(), "pipe attached");
        if let Some(callback) = self.inner.on_pipe.get() {
            callback(self);
        }
    }

    /// Detach `target` if it is the current pipe target. Returns whether it was.
    pub fn unpipe(&self, target: &WritableStream<T>) -> bool {
        let mut state = self.state_mut();
        let matches = state
            .pipe
            .as_ref()
            .is_some_and(|current| current.points_to(target));
        if matches {
            state.pipe = None;
            debug!(stream = self.inner.id, target = target.id(), "pipe detached");
        }
        matches
    }

    // ── Callbacks ──────────────────────────────────────────────────

    pub fn on_readable(&self) -> Option<Rc<ReadableCallback<T>>> {
        self.inner.on_readable.get()
    }

    /// Install the readable callback. If data is already queued and the
    /// stream is readable, the callback is invoked immediately.
    pub fn set_on_readable(&self, callback: impl Fn(&ReadableStream<T>) + 'static) {
        self.inner.on_readable.set(Rc::new(callback));
        if self.is_readable() && self.queue_len() > 0 {
            self.notify_readable();
        }
    }

    pub fn clear_on_readable(&self) {
        self.inner.on_readable.clear();
    }

    pub fn on_closing(&self) -> Option<Rc<ReadableCallback<T>>> {
        self.inner.on_closing.get()
    }

    pub fn set_on_closing(&self, callback: impl Fn(&ReadableStream<T>) + 'static) {
        self.inner.on_closing.set(Rc::new(callback));
    }

    pub fn clear_on_closing(&self) {
        self.inner.on_closing.clear();
    }

    pub fn on_closed(&self) -> Option<Rc<ClosedCallback<T>>> {
        self.inner.on_closed.get()
    }

    pub fn set_on_closed(
        &self,
        callback: impl Fn(&ReadableStream<T>, Option<anyhow::Error>) + 'static,
    ) {
        self.inner.on_closed.set(Rc::new(callback));
    }

    pub fn clear_on_closed(&self) {
        self.inner.on_closed.clear();
    }

    pub fn on_pipe(&self) -> Option<Rc<ReadableCallback<T>>> {
        self.inner.on_pipe.get()
    }

    pub fn set_on_pipe(&self, callback: impl Fn(&ReadableStream<T>) + 'static) {
        self.inner.on_pipe.set(Rc::new(callback));
    }

    pub fn clear_on_pipe(&self) {
        self.inner.on_pipe.clear();
    }

    pub(crate) fn downgrade(&self) -> WeakReadable<T> {
        WeakReadable(Rc::downgrade(&self.inner))
    }
}

/// Non-owning reference to a readable stream.
pub(crate) struct WeakReadable<T: Clone + 'static>(Weak<ReadableInner<T>>);

impl<T: Clone + 'static> WeakReadable<T> {
    pub(crate) fn upgrade(&self) -> Option<ReadableStream<T>> {
        self.0.upgrade().map(|inner| ReadableStream { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingSource {
        queued: Cell<u64>,
        pauses: Cell<u32>,
        resumes: Cell<u32>,
        flushed: Cell<u32>,
    }

    impl ReadableSource<&'static str> for CountingSource {
        fn queued(&self, _stream: &ReadableStream<&'static str>) -> u64 {
            self.queued.get()
        }

        fn on_push(&self, _stream: &ReadableStream<&'static str>, item: &&'static str) {
            self.queued.set(self.queued.get() + item.len() as u64);
        }

        fn on_read(&self, _stream: &ReadableStream<&'static str>, item: &&'static str) -> u64 {
            self.queued.set(self.queued.get() - item.len() as u64);
            item.len() as u64
        }

        fn on_pause(&self, _stream: &ReadableStream<&'static str>) {
            self.pauses.set(self.pauses.get() + 1);
        }

        fn on_resume(&self, _stream: &ReadableStream<&'static str>) {
            self.resumes.set(self.resumes.get() + 1);
        }

        fn on_flushed(&self, _stream: &ReadableStream<&'static str>) {
            self.flushed.set(self.flushed.get() + 1);
        }
    }

    fn stream() -> (EventLoop, Rc<CountingSource>, ReadableStream<&'static str>) {
        let event_loop = EventLoop::new();
        let source = Rc::new(CountingSource::default());
        let stream = ReadableStream::new(&event_loop, source.clone());
        (event_loop, source, stream)
    }

    #[test]
    fn push_read_is_fifo() {
        let (_el, _source, stream) = stream();
        stream.push("a").unwrap();
        stream.push("b").unwrap();
        stream.push("c").unwrap();
        assert_eq!(stream.read(), Some("a"));
        assert_eq!(stream.read(), Some("b"));
        assert_eq!(stream.read(), Some("c"));
        assert_eq!(stream.read(), None);
    }

    #[test]
    fn pause_and_resume_fire_hooks_on_change_only() {
        let (_el, source, stream) = stream();
        stream.pause();
        stream.pause();
        assert!(stream.is_paused());
        assert_eq!(source.pauses.get(), 1);

        stream.resume();
        stream.resume();
        assert!(!stream.is_paused());
        assert_eq!(source.resumes.get(), 1);
    }

    #[test]
    fn flushed_runs_on_next_tick() {
        let (el, source, stream) = stream();
        stream.push("x").unwrap();
        stream.read();
        assert_eq!(source.flushed.get(), 0);
        el.run_until_idle();
        assert_eq!(source.flushed.get(), 1);
    }

    #[test]
    fn flushed_skipped_when_refilled() {
        let (el, source, stream) = stream();
        stream.push("x").unwrap();
        stream.read();
        stream.push("y").unwrap();
        el.run_until_idle();
        assert_eq!(source.flushed.get(), 0);
    }

    #[test]
    fn ingest_pauses_above_high_water_mark() {
        let event_loop = EventLoop::new();
        let source = Rc::new(CountingSource::default());
        let config = StreamConfig {
            high_water_mark: 4,
            ..StreamConfig::default()
        };
        let stream = ReadableStream::with_options(
            &event_loop,
            source.clone(),
            &config,
            &ReadableDefaults::new(),
        );

        assert!(!stream.ingest("abc").unwrap());
        assert!(stream.ingest("de").unwrap());
        assert_eq!(source.pauses.get(), 1);
        assert_eq!(stream.ingest("f"), Err(FlowError::PushWhilePaused));
    }

    #[test]
    fn debug_output_names_stream() {
        let (_el, _source, stream) = stream();
        let out = format!("{stream:?}");
        assert!(out.contains("ReadableStream"));
        assert!(out.contains("queue_len"));
    }
}
