//! A single write submitted to a [`WritableStream`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::error::{FlowError, FlowResult};
use crate::writable::{WeakWritable, WritableStream};

/// Per-request completion callback. Receives the error passed to
/// [`WriteRequest::complete`], if any.
pub type CompleteFn<T> = Box<dyn FnOnce(&WriteRequest<T>, Option<anyhow::Error>)>;

struct RequestInner<T: Clone + 'static> {
    id: u64,
    data: T,
    owner: WeakWritable<T>,
    on_complete: RefCell<Option<CompleteFn<T>>>,
    completed: Cell<bool>,
}

/// Handle to one write. The sink keeps a clone until it completes it.
pub struct WriteRequest<T: Clone + 'static> {
    inner: Rc<RequestInner<T>>,
}

impl<T: Clone + 'static> Clone for WriteRequest<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for WriteRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("id", &self.inner.id)
            .field("data", &self.inner.data)
            .field("completed", &self.inner.completed.get())
            .finish()
    }
}

impl<T: Clone + 'static> WriteRequest<T> {
    pub(crate) fn new(id: u64, data: T, owner: WeakWritable<T>) -> Self {
        Self {
            inner: Rc::new(RequestInner {
                id,
                data,
                owner,
                on_complete: RefCell::new(None),
                completed: Cell::new(false),
            }),
        }
    }

    /// Sequence number, unique within the owning stream.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn data(&self) -> &T {
        &self.inner.data
    }

    /// The stream that created this request, if it is still alive.
    pub fn owner(&self) -> Option<WritableStream<T>> {
        self.inner.owner.upgrade()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.get()
    }

    /// Attach the completion callback, replacing any previous one.
    pub fn on_complete(
        &self,
        callback: impl FnOnce(&WriteRequest<T>, Option<anyhow::Error>) + 'static,
    ) -> &Self {
        *self.inner.on_complete.borrow_mut() = Some(Box::new(callback));
        self
    }

    pub fn clear_on_complete(&self) {
        self.inner.on_complete.borrow_mut().take();
    }

    pub fn has_on_complete(&self) -> bool {
        self.inner.on_complete.borrow().is_some()
    }

    /// Report the write as finished. Called by the sink exactly once.
    ///
    /// With no completion callback attached, an error is routed to the
    /// owner's `on_error` handler.
    pub fn complete(&self, error: Option<anyhow::Error>) -> FlowResult<()> {
        if self.inner.completed.replace(true) {
            return Err(FlowError::AlreadyCompleted(self.inner.id));
        }
        let callback = self.inner.on_complete.borrow_mut().take();
        match self.owner() {
            Some(owner) => owner.complete_request(self, callback, error),
            None => {
                debug!(request = self.inner.id, "write completed after its stream was dropped");
                if let Some(callback) = callback {
                    callback(self, error);
                }
            }
        }
        Ok(())
    }

    /// Shorthand for `complete(Some(error))`.
    pub fn fail(&self, error: impl Into<anyhow::Error>) -> FlowResult<()> {
        self.complete(Some(error.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::writable::WritableSink;

    struct NullSink;

    impl WritableSink<String> for NullSink {
        fn on_write(&self, _stream: &WritableStream<String>, request: &WriteRequest<String>) -> u64 {
            request.data().len() as u64
        }
    }

    #[test]
    fn request_exposes_data_and_owner() {
        let event_loop = EventLoop::new();
        let stream = WritableStream::new(&event_loop, NullSink);
        let request = stream.write("hello".to_string());

        assert_eq!(request.data(), "hello");
        assert_eq!(request.owner().unwrap().id(), stream.id());
        assert!(!request.is_completed());
        assert_eq!(stream.tx(), 5);
    }

    #[test]
    fn second_complete_is_rejected() {
        let event_loop = EventLoop::new();
        let stream = WritableStream::new(&event_loop, NullSink);
        let request = stream.write("x".to_string());

        request.complete(None).unwrap();
        assert!(request.is_completed());
        assert_eq!(
            request.complete(None),
            Err(FlowError::AlreadyCompleted(request.id()))
        );
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn callback_can_be_replaced_and_cleared() {
        let event_loop = EventLoop::new();
        let stream = WritableStream::new(&event_loop, NullSink);
        let request = stream.write("x".to_string());

        request.on_complete(|_, _| panic!("replaced callback must not run"));
        request.on_complete(|_, _| {});
        assert!(request.has_on_complete());
        request.clear_on_complete();
        assert!(!request.has_on_complete());
        request.complete(None).unwrap();
    }

    #[test]
    fn completion_after_stream_dropped_still_runs_callback() {
        let event_loop = EventLoop::new();
        let stream = WritableStream::new(&event_loop, NullSink);
        let request = stream.write("x".to_string());
        drop(stream);

        let seen = Rc::new(Cell::new(false));
        let s = seen.clone();
        request.on_complete(move |_, err| s.set(err.is_some()));
        request.fail(anyhow::anyhow!("gone")).unwrap();
        assert!(request.owner().is_none());
        assert!(seen.get());
    }
}
