//! Prometheus text exposition format.
//!
//! Renders traffic snapshots into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use crate::meter::TrafficSnapshot;

/// Render a list of traffic snapshots into Prometheus text format.
///
/// Produces pool-level counters with a `pool` label, per-connection counters
/// with `pool` and `connection` labels, and a connection-count gauge.
pub fn render_prometheus(snapshots: &[TrafficSnapshot]) -> String {
    let mut out = String::new();

    out.push_str("# HELP flowline_rx_bytes_total Bytes read across the pool.\n");
    out.push_str("# TYPE flowline_rx_bytes_total counter\n");
    for s in snapshots {
        out.push_str(&format!(
            "flowline_rx_bytes_total{{pool=\"{}\"}} {}\n",
            escape(&s.pool),
            s.rx_total
        ));
    }

    out.push_str("# HELP flowline_tx_bytes_total Bytes written across the pool.\n");
    out.push_str("# TYPE flowline_tx_bytes_total counter\n");
    for s in snapshots {
        out.push_str(&format!(
            "flowline_tx_bytes_total{{pool=\"{}\"}} {}\n",
            escape(&s.pool),
            s.tx_total
        ));
    }

    out.push_str("# HELP flowline_connections Registered connections.\n");
    out.push_str("# TYPE flowline_connections gauge\n");
    for s in snapshots {
        out.push_str(&format!(
            "flowline_connections{{pool=\"{}\"}} {}\n",
            escape(&s.pool),
            s.connections.len()
        ));
    }

    out.push_str("# HELP flowline_connection_rx_bytes_total Bytes read per connection.\n");
    out.push_str("# TYPE flowline_connection_rx_bytes_total counter\n");
    for s in snapshots {
        for c in &s.connections {
            out.push_str(&format!(
                "flowline_connection_rx_bytes_total{{pool=\"{}\",connection=\"{}\"}} {}\n",
                escape(&s.pool),
                escape(&c.name),
                c.rx
            ));
        }
    }

    out.push_str("# HELP flowline_connection_tx_bytes_total Bytes written per connection.\n");
    out.push_str("# TYPE flowline_connection_tx_bytes_total counter\n");
    for s in snapshots {
        for c in &s.connections {
            out.push_str(&format!(
                "flowline_connection_tx_bytes_total{{pool=\"{}\",connection=\"{}\"}} {}\n",
                escape(&s.pool),
                escape(&c.name),
                c.tx
            ));
        }
    }

    out
}

/// Escape a label value: backslash, double quote and newline.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::ConnectionSnapshot;

    fn test_snapshot(pool: &str) -> TrafficSnapshot {
        TrafficSnapshot {
            pool: pool.to_string(),
            epoch: 1000,
            rx_total: 2048,
            tx_total: 512,
            connections: vec![
                ConnectionSnapshot {
                    name: "c1".to_string(),
                    rx: 2000,
                    tx: 500,
                },
                ConnectionSnapshot {
                    name: "c2".to_string(),
                    rx: 48,
                    tx: 12,
                },
            ],
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&[]);
        // Should still have type declarations.
        assert!(output.contains("# HELP flowline_rx_bytes_total"));
        assert!(output.contains("# TYPE flowline_rx_bytes_total counter"));
    }

    #[test]
    fn render_single_pool() {
        let output = render_prometheus(&[test_snapshot("edge")]);

        assert!(output.contains("flowline_rx_bytes_total{pool=\"edge\"} 2048"));
        assert!(output.contains("flowline_tx_bytes_total{pool=\"edge\"} 512"));
        assert!(output.contains("flowline_connections{pool=\"edge\"} 2"));
        assert!(output.contains(
            "flowline_connection_rx_bytes_total{pool=\"edge\",connection=\"c1\"} 2000"
        ));
        assert!(output.contains(
            "flowline_connection_tx_bytes_total{pool=\"edge\",connection=\"c2\"} 12"
        ));
    }

    #[test]
    fn label_values_are_escaped() {
        let output = render_prometheus(&[test_snapshot("a\"b")]);
        assert!(output.contains("pool=\"a\\\"b\""));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(&[test_snapshot("p1"), test_snapshot("p2")]);

        // Every non-empty, non-comment line should match: metric_name{labels} value
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(
                line.contains('{') && line.contains('}'),
                "line should have labels: {line}"
            );
            let value = line.rsplit(' ').next().unwrap();
            assert!(value.parse::<u64>().is_ok(), "bad value in: {line}");
        }
    }
}
