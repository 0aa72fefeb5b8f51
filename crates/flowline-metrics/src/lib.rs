//! flowline-metrics — traffic accounting for pools of flowline streams.
//!
//! Tracks rx/tx byte counts per connection and per pool, and renders
//! snapshots in Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! TrafficMeter (one per pool)
//!   ├── register() → ConnectionMeter   ← one per connection
//!   │     └── Metered<S> wraps a ReadableSource / WritableSink
//!   └── snapshot() → TrafficSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for a /metrics endpoint
//! ```

pub mod meter;
pub mod prometheus;

pub use meter::{ConnectionMeter, ConnectionSnapshot, Metered, TrafficMeter, TrafficSnapshot};
pub use prometheus::render_prometheus;
