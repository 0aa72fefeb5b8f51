//! Integration tests for piping a readable stream into a writable one.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Once;

use flowline::{
    EventLoop, ReadableSource, ReadableStream, StreamConfig, WritableDefaults, WritableSink,
    WritableStream, WriteRequest,
};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

struct ItemCount;

impl ReadableSource<u32> for ItemCount {
    fn queued(&self, stream: &ReadableStream<u32>) -> u64 {
        stream.queue_len() as u64
    }
}

#[derive(Default)]
struct HeldSink {
    held: RefCell<Vec<WriteRequest<u32>>>,
    seen: RefCell<Vec<u32>>,
}

impl HeldSink {
    fn complete_first(&self) {
        let request = self.held.borrow_mut().remove(0);
        request.complete(None).unwrap();
    }
}

impl WritableSink<u32> for HeldSink {
    fn on_write(&self, _stream: &WritableStream<u32>, request: &WriteRequest<u32>) -> u64 {
        self.seen.borrow_mut().push(*request.data());
        self.held.borrow_mut().push(request.clone());
        1
    }
}

/// Target that is writable only while nothing waits behind the in-flight
/// write.
fn tight_target(event_loop: &EventLoop) -> (Rc<HeldSink>, WritableStream<u32>) {
    let sink = Rc::new(HeldSink::default());
    let config = StreamConfig {
        write_queue_limit: 0,
        ..StreamConfig::default()
    };
    let target =
        WritableStream::with_options(event_loop, sink.clone(), &config, &WritableDefaults::new());
    (sink, target)
}

#[test]
fn pushes_reach_a_blocked_target_once_and_in_order() {
    init_tracing();
    let event_loop = EventLoop::new();
    let (sink, target) = tight_target(&event_loop);
    let source = ReadableStream::new(&event_loop, ItemCount);
    source.set_pipe(&target);

    for item in 1..=4 {
        source.push(item).unwrap();
    }
    // 1 in flight, 2 queued, 3 and 4 waiting for capacity.
    assert_eq!(*sink.seen.borrow(), vec![1]);
    assert_eq!(target.queued_writes(), 1);
    assert!(!target.is_writable());

    for _ in 0..4 {
        sink.complete_first();
    }
    event_loop.run_until_idle();

    assert_eq!(*sink.seen.borrow(), vec![1, 2, 3, 4]);
    assert!(sink.held.borrow().is_empty());
    // Forwarded items also stay in the source queue.
    assert_eq!(source.queue_len(), 4);
}

#[test]
fn on_writable_skipped_when_deferred_forward_refills_target() {
    init_tracing();
    let event_loop = EventLoop::new();
    let sink = Rc::new(HeldSink::default());
    let config = StreamConfig {
        write_queue_limit: 0,
        ..StreamConfig::default()
    };
    let writable_calls = Rc::new(Cell::new(0));
    let w = writable_calls.clone();
    let defaults = WritableDefaults::new().on_writable(move |_| w.set(w.get() + 1));
    let target = WritableStream::with_options(&event_loop, sink.clone(), &config, &defaults);
    let source = ReadableStream::new(&event_loop, ItemCount);
    source.set_pipe(&target);

    for item in 1..=3 {
        source.push(item).unwrap();
    }

    // 2 is dispatched, deferred 3 takes the freed slot.
    sink.complete_first();
    assert_eq!(target.queued_writes(), 1);
    assert_eq!(writable_calls.get(), 0);

    sink.complete_first();
    assert!(target.is_writable());
    assert_eq!(writable_calls.get(), 1);
}

#[test]
fn on_readable_fires_after_each_forward() {
    init_tracing();
    let event_loop = EventLoop::new();
    let (_sink, target) = tight_target(&event_loop);
    let source = ReadableStream::new(&event_loop, ItemCount);
    let calls = Rc::new(Cell::new(0));
    let c = calls.clone();
    source.set_on_readable(move |_| c.set(c.get() + 1));
    source.set_pipe(&target);

    source.push(1).unwrap();
    source.push(2).unwrap();
    assert_eq!(calls.get(), 2);
}

#[test]
fn reading_a_forwarded_item_forwards_it_again() {
    init_tracing();
    let event_loop = EventLoop::new();
    let (sink, target) = tight_target(&event_loop);
    let source = ReadableStream::new(&event_loop, ItemCount);
    source.set_pipe(&target);

    source.push(8).unwrap();
    assert_eq!(*sink.seen.borrow(), vec![8]);

    sink.complete_first();
    assert_eq!(source.read(), Some(8));
    assert_eq!(*sink.seen.borrow(), vec![8, 8]);
}

#[test]
fn read_is_gated_by_target_writability() {
    init_tracing();
    let event_loop = EventLoop::new();
    let (sink, target) = tight_target(&event_loop);
    let source = ReadableStream::new(&event_loop, ItemCount);
    source.push(7).unwrap();
    source.set_pipe(&target);

    target.write(100);
    target.write(101);
    assert!(!target.is_writable());
    assert_eq!(source.read(), None);
    assert_eq!(source.queue_len(), 1);

    sink.complete_first();
    assert!(target.is_writable());
    assert_eq!(source.read(), Some(7));
    assert_eq!(*sink.seen.borrow(), vec![100, 101]);
    assert_eq!(target.queued_writes(), 1);
}

#[test]
fn unpipe_only_detaches_the_current_target() {
    init_tracing();
    let event_loop = EventLoop::new();
    let source = ReadableStream::new(&event_loop, ItemCount);
    let (_a_sink, a) = tight_target(&event_loop);
    let (_b_sink, b) = tight_target(&event_loop);

    source.set_pipe(&a);
    assert!(!source.unpipe(&b));
    assert_eq!(source.pipe().map(|t| t.id()), Some(a.id()));

    assert!(source.unpipe(&a));
    assert!(source.pipe().is_none());
    assert!(!source.unpipe(&a));
}

#[test]
fn set_pipe_fires_on_pipe_and_replaces_target() {
    init_tracing();
    let event_loop = EventLoop::new();
    let source = ReadableStream::new(&event_loop, ItemCount);
    let piped = Rc::new(Cell::new(0));
    let p = piped.clone();
    source.set_on_pipe(move |_| p.set(p.get() + 1));

    let (_a_sink, a) = tight_target(&event_loop);
    let (b_sink, b) = tight_target(&event_loop);
    source.set_pipe(&a);
    source.set_pipe(&b);
    assert_eq!(piped.get(), 2);

    source.push(5).unwrap();
    assert_eq!(*b_sink.seen.borrow(), vec![5]);
}

#[test]
fn close_clears_the_pipe() {
    init_tracing();
    let event_loop = EventLoop::new();
    let source = ReadableStream::new(&event_loop, ItemCount);
    let (_sink, target) = tight_target(&event_loop);
    source.set_pipe(&target);

    source.close();
    assert!(source.pipe().is_some());
    event_loop.run_until_idle();
    assert!(source.pipe().is_none());
}

#[test]
fn dropped_target_detaches_silently() {
    init_tracing();
    let event_loop = EventLoop::new();
    let source = ReadableStream::new(&event_loop, ItemCount);
    let (_sink, target) = tight_target(&event_loop);
    source.set_pipe(&target);
    drop(target);

    assert!(source.pipe().is_none());
    source.push(3).unwrap();
    assert_eq!(source.read(), Some(3));
}
