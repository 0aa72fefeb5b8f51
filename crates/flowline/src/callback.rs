//! Callback slots and default-callback sets.
//!
//! Every `on_*` notification on a stream lives in a [`Slot`]: it can be read
//! back, replaced, or cleared. Anything a caller wants the callback to see is
//! captured by the closure when it is registered.
//!
//! [`ReadableDefaults`] and [`WritableDefaults`] are cloneable bundles of
//! callbacks installed on every stream constructed with them, so a family of
//! streams can share one set of handlers without repeating registration.

use std::cell::RefCell;
use std::rc::Rc;

use crate::readable::ReadableStream;
use crate::writable::WritableStream;

/// Notification about a readable stream (`on_readable`, `on_closing`, `on_pipe`).
pub type ReadableCallback<T> = dyn Fn(&ReadableStream<T>);

/// Final close notification, carrying the error passed to `close_with_error`.
pub type ClosedCallback<T> = dyn Fn(&ReadableStream<T>, Option<anyhow::Error>);

/// Notification about a writable stream (`on_writable`, `on_end`).
pub type WritableCallback<T> = dyn Fn(&WritableStream<T>);

/// Stream-level handler for write errors with no per-request callback.
pub type ErrorCallback<T> = dyn Fn(&WritableStream<T>, anyhow::Error);

/// A single replaceable callback.
///
/// The callback is handed out as an `Rc` so the slot is never borrowed while
/// user code runs; a callback may replace or clear its own slot.
pub(crate) struct Slot<F: ?Sized> {
    callback: RefCell<Option<Rc<F>>>,
}

impl<F: ?Sized> Slot<F> {
    pub(crate) fn new(initial: Option<Rc<F>>) -> Self {
        Self {
            callback: RefCell::new(initial),
        }
    }

    pub(crate) fn get(&self) -> Option<Rc<F>> {
        self.callback.borrow().clone()
    }

    pub(crate) fn set(&self, callback: Rc<F>) {
        *self.callback.borrow_mut() = Some(callback);
    }

    pub(crate) fn clear(&self) -> Option<Rc<F>> {
        self.callback.borrow_mut().take()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.callback.borrow().is_some()
    }
}

/// Default callbacks applied to readable streams at construction.
pub struct ReadableDefaults<T: Clone + 'static> {
    pub(crate) on_readable: Option<Rc<ReadableCallback<T>>>,
    pub(crate) on_closing: Option<Rc<ReadableCallback<T>>>,
    pub(crate) on_closed: Option<Rc<ClosedCallback<T>>>,
    pub(crate) on_pipe: Option<Rc<ReadableCallback<T>>>,
}

impl<T: Clone + 'static> Default for ReadableDefaults<T> {
    fn default() -> Self {
        Self {
            on_readable: None,
            on_closing: None,
            on_closed: None,
            on_pipe: None,
        }
    }
}

impl<T: Clone + 'static> Clone for ReadableDefaults<T> {
    fn clone(&self) -> Self {
        Self {
            on_readable: self.on_readable.clone(),
            on_closing: self.on_closing.clone(),
            on_closed: self.on_closed.clone(),
            on_pipe: self.on_pipe.clone(),
        }
    }
}

impl<T: Clone + 'static> ReadableDefaults<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_readable(mut self, callback: impl Fn(&ReadableStream<T>) + 'static) -> Self {
        self.on_readable = Some(Rc::new(callback));
        self
    }

    pub fn on_closing(mut self, callback: impl Fn(&ReadableStream<T>) + 'static) -> Self {
        self.on_closing = Some(Rc::new(callback));
        self
    }

    pub fn on_closed(
        mut self,
        callback: impl Fn(&ReadableStream<T>, Option<anyhow::Error>) + 'static,
    ) -> Self {
        self.on_closed = Some(Rc::new(callback));
        self
    }

    pub fn on_pipe(mut self, callback: impl Fn(&ReadableStream<T>) + 'static) -> Self {
        self.on_pipe = Some(Rc::new(callback));
        self
    }
}

/// Default callbacks applied to writable streams at construction.
pub struct WritableDefaults<T: Clone + 'static> {
    pub(crate) on_end: Option<Rc<WritableCallback<T>>>,
    pub(crate) on_error: Option<Rc<ErrorCallback<T>>>,
    pub(crate) on_writable: Option<Rc<WritableCallback<T>>>,
}

impl<T: Clone + 'static> Default for WritableDefaults<T> {
    fn default() -> Self {
        Self {
            on_end: None,
            on_error: None,
            on_writable: None,
        }
    }
}

impl<T: Clone + 'static> Clone for WritableDefaults<T> {
    fn clone(&self) -> Self {
        Self {
            on_end: self.on_end.clone(),
            on_error: self.on_error.clone(),
            on_writable: self.on_writable.clone(),
        }
    }
}

impl<T: Clone + 'static> WritableDefaults<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_end(mut self, callback: impl Fn(&WritableStream<T>) + 'static) -> Self {
        self.on_end = Some(Rc::new(callback));
        self
    }

    pub fn on_error(
        mut self,
        callback: impl Fn(&WritableStream<T>, anyhow::Error) + 'static,
    ) -> Self {
        self.on_error = Some(Rc::new(callback));
        self
    }

    pub fn on_writable(mut self, callback: impl Fn(&WritableStream<T>) + 'static) -> Self {
        self.on_writable = Some(Rc::new(callback));
        self
    }
}
