//! Callback-driven readable and writable streams with backpressure.
//!
//! Provides [`ReadableStream`] and [`WritableStream`], two small state
//! machines that move items between a producer and a consumer without
//! unbounded buffering, plus an optional pipe that couples one to the other.
//!
//! # Flow
//!
//! ```text
//! transport ── push/ingest ──► ReadableStream ── on_readable ──► consumer
//!                                   │  read()
//!                                   ▼ (pipe)
//! consumer ──── write ────────► WritableStream ── on_write ──► transport
//!                                   ▲                             │
//!                                   └─ on_writable ◄─ complete() ─┘
//! ```
//!
//! # Execution Model
//!
//! Everything runs on one thread. Streams are `Rc` handles; deferred work
//! (flush notifications, cleanup, close notifications, writable catch-up)
//! is queued on an [`EventLoop`] with two phases, next-tick and immediate.
//! The loop is run synchronously with [`EventLoop::run_until_idle`] or
//! awaited with [`EventLoop::drive`] when completions arrive from async
//! tasks on the same thread (for example a tokio `LocalSet`).
//!
//! # Errors
//!
//! Protocol misuse (pushing into a paused stream, calling `survive` outside
//! `on_closing`, completing a request twice) returns a [`FlowError`].
//! Runtime failures travel as `anyhow::Error` through `WriteRequest::complete`
//! and `ReadableStream::close_with_error` and surface in callbacks.

mod callback;
mod config;
mod error;
mod event_loop;
mod pipe;
mod readable;
mod request;
mod source;
mod writable;

pub use callback::{
    ClosedCallback, ErrorCallback, ReadableCallback, ReadableDefaults, WritableCallback,
    WritableDefaults,
};
pub use config::{DEFAULT_HIGH_WATER_MARK, DEFAULT_WRITE_QUEUE_LIMIT, StreamConfig};
pub use error::{FlowError, FlowResult};
pub use event_loop::{Drive, EventLoop, LoopRef};
pub use readable::{CleanupDone, ReadableSource, ReadableStream};
pub use request::{CompleteFn, WriteRequest};
pub use source::ByteSource;
pub use writable::{WritableSink, WritableStream};
