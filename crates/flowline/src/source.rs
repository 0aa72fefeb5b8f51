//! Ready-made source for byte streams.

use std::cell::Cell;

use bytes::Bytes;

use crate::readable::{ReadableSource, ReadableStream};

/// [`ReadableSource`] for `Bytes` chunks that counts queued bytes.
///
/// `queued()` is the number of bytes pushed but not yet read, and each read
/// adds the chunk length to `rx()`. With [`resume_on_flush`] the stream is
/// resumed whenever the queue drains, which pairs with
/// [`ReadableStream::ingest`] pausing it at the high-water mark.
///
/// [`resume_on_flush`]: ByteSource::resume_on_flush
#[derive(Debug, Default)]
pub struct ByteSource {
    queued: Cell<u64>,
    resume_on_flush: bool,
}

impl ByteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume_on_flush(mut self) -> Self {
        self.resume_on_flush = true;
        self
    }
}

impl ReadableSource<Bytes> for ByteSource {
    fn queued(&self, _stream: &ReadableStream<Bytes>) -> u64 {
        self.queued.get()
    }

    fn on_push(&self, _stream: &ReadableStream<Bytes>, item: &Bytes) {
        self.queued.set(self.queued.get() + item.len() as u64);
    }

    fn on_read(&self, _stream: &ReadableStream<Bytes>, item: &Bytes) -> u64 {
        let len = item.len() as u64;
        self.queued.set(self.queued.get().saturating_sub(len));
        len
    }

    fn on_flushed(&self, stream: &ReadableStream<Bytes>) {
        if self.resume_on_flush && stream.is_paused() {
            stream.resume();
        }
    }
}
