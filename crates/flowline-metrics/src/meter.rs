//! Traffic meter: per-connection and per-pool rx/tx byte counters.
//!
//! Counters are atomics so a meter can be shared across threads even though
//! the streams feeding it cannot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use flowline::{
    CleanupDone, ReadableSource, ReadableStream, WritableSink, WritableStream, WriteRequest,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Default)]
struct Counters {
    rx: AtomicU64,
    tx: AtomicU64,
}

/// Point-in-time counters for one registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub name: String,
    pub rx: u64,
    pub tx: u64,
}

/// Point-in-time counters for a whole pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub pool: String,
    /// Seconds since the Unix epoch when the snapshot was taken.
    pub epoch: u64,
    pub rx_total: u64,
    pub tx_total: u64,
    pub connections: Vec<ConnectionSnapshot>,
}

/// Pool-owned traffic accounting.
///
/// Pool totals include traffic from connections that have since been
/// unregistered.
pub struct TrafficMeter {
    pool: String,
    connections: Arc<RwLock<HashMap<String, Arc<Counters>>>>,
    totals: Arc<Counters>,
}

impl TrafficMeter {
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            connections: Arc::new(RwLock::new(HashMap::new())),
            totals: Arc::new(Counters::default()),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Register a connection, or return the existing meter if `name` is
    /// already registered.
    pub fn register(&self, name: &str) -> ConnectionMeter {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let counters = connections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counters::default()))
            .clone();
        debug!(pool = %self.pool, connection = %name, "registered for traffic metering");
        ConnectionMeter {
            connection: counters,
            totals: self.totals.clone(),
        }
    }

    /// Stop listing a connection. Meters already handed out keep adding to
    /// the pool totals.
    pub fn unregister(&self, name: &str) -> bool {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let removed = connections.remove(name).is_some();
        if removed {
            debug!(pool = %self.pool, connection = %name, "unregistered from traffic metering");
        }
        removed
    }

    pub fn total_rx(&self) -> u64 {
        self.totals.rx.load(Ordering::Relaxed)
    }

    pub fn total_tx(&self) -> u64 {
        self.totals.tx.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Capture current counters. Connections are sorted by name.
    pub fn snapshot(&self) -> TrafficSnapshot {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut listed: Vec<ConnectionSnapshot> = connections
            .iter()
            .map(|(name, c)| ConnectionSnapshot {
                name: name.clone(),
                rx: c.rx.load(Ordering::Relaxed),
                tx: c.tx.load(Ordering::Relaxed),
            })
            .collect();
        drop(connections);
        listed.sort_by(|a, b| a.name.cmp(&b.name));

        TrafficSnapshot {
            pool: self.pool.clone(),
            epoch: epoch_secs(),
            rx_total: self.total_rx(),
            tx_total: self.total_tx(),
            connections: listed,
        }
    }
}

/// Handle for recording one connection's traffic.
#[derive(Clone)]
pub struct ConnectionMeter {
    connection: Arc<Counters>,
    totals: Arc<Counters>,
}

impl ConnectionMeter {
    pub fn record_rx(&self, bytes: u64) {
        self.connection.rx.fetch_add(bytes, Ordering::Relaxed);
        self.totals.rx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_tx(&self, bytes: u64) {
        self.connection.tx.fetch_add(bytes, Ordering::Relaxed);
        self.totals.tx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn rx(&self) -> u64 {
        self.connection.rx.load(Ordering::Relaxed)
    }

    pub fn tx(&self) -> u64 {
        self.connection.tx.load(Ordering::Relaxed)
    }
}

/// Wraps a source or sink and records the amounts it reports.
///
/// As a [`ReadableSource`], every `on_read` weight is recorded as rx. As a
/// [`WritableSink`], every `on_write` amount is recorded as tx. All other
/// hooks pass through unchanged.
pub struct Metered<S> {
    inner: S,
    meter: ConnectionMeter,
}

impl<S> Metered<S> {
    pub fn new(inner: S, meter: ConnectionMeter) -> Self {
        Self { inner, meter }
    }

    pub fn meter(&self) -> &ConnectionMeter {
        &self.meter
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<T: Clone + 'static, S: ReadableSource<T>> ReadableSource<T> for Metered<S> {
    fn queued(&self, stream: &ReadableStream<T>) -> u64 {
        self.inner.queued(stream)
    }

    fn is_readable(&self, stream: &ReadableStream<T>) -> bool {
        self.inner.is_readable(stream)
    }

    fn on_push(&self, stream: &ReadableStream<T>, item: &T) {
        self.inner.on_push(stream, item)
    }

    fn on_read(&self, stream: &ReadableStream<T>, item: &T) -> u64 {
        let weight = self.inner.on_read(stream, item);
        self.meter.record_rx(weight);
        weight
    }

    fn on_pause(&self, stream: &ReadableStream<T>) {
        self.inner.on_pause(stream)
    }

    fn on_resume(&self, stream: &ReadableStream<T>) {
        self.inner.on_resume(stream)
    }

    fn has_cleanup(&self) -> bool {
        self.inner.has_cleanup()
    }

    fn on_cleanup(&self, stream: &ReadableStream<T>, done: CleanupDone<T>) {
        self.inner.on_cleanup(stream, done)
    }

    fn on_flushed(&self, stream: &ReadableStream<T>) {
        self.inner.on_flushed(stream)
    }
}

impl<T: Clone + 'static, S: WritableSink<T>> WritableSink<T> for Metered<S> {
    fn on_write(&self, stream: &WritableStream<T>, request: &WriteRequest<T>) -> u64 {
        let written = self.inner.on_write(stream, request);
        self.meter.record_tx(written);
        written
    }

    fn is_writable(&self, stream: &WritableStream<T>) -> bool {
        self.inner.is_writable(stream)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
