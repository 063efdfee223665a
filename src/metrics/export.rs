//! Metric export renderers: JSON and Prometheus text format 0.0.4.

use serde::Serialize;

use super::{Metric, MetricKey, MetricsRegistry, Percentiles};

/// One metric in the JSON dump.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricExport {
    Counter {
        name: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        labels: Vec<(String, String)>,
        value: u64,
    },
    Gauge {
        name: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        labels: Vec<(String, String)>,
        value: f64,
    },
    Histogram {
        name: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        labels: Vec<(String, String)>,
        count: u64,
        sum: f64,
    },
    PercentileHistogram {
        name: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        labels: Vec<(String, String)>,
        count: u64,
        sum: f64,
        #[serde(flatten)]
        percentiles: Percentiles,
    },
    Timer {
        name: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        labels: Vec<(String, String)>,
        count: u64,
        sum_seconds: f64,
        #[serde(flatten)]
        percentiles: Percentiles,
    },
}

#[derive(Serialize)]
struct Dump {
    metrics: Vec<MetricExport>,
}

impl MetricsRegistry {
    /// Render every metric as `{"metrics":[…]}`.
    pub fn export_json(&self) -> String {
        let metrics = self
            .sorted_entries()
            .into_iter()
            .map(|(key, metric)| json_entry(&key, &metric))
            .collect();
        serde_json::to_string(&Dump { metrics }).unwrap_or_else(|_| "{\"metrics\":[]}".into())
    }

    /// Render every metric in Prometheus text format 0.0.4.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        let mut last_name = String::new();
        for (key, metric) in self.sorted_entries() {
            prometheus_entry(&mut out, &mut last_name, &key, &metric);
        }
        out
    }
}

fn json_entry(key: &MetricKey, metric: &Metric) -> MetricExport {
    let name = key.name().to_string();
    let labels = key.labels().to_vec();
    match metric {
        Metric::Counter(c) => MetricExport::Counter {
            name,
            labels,
            value: c.get(),
        },
        Metric::Gauge(g) => MetricExport::Gauge {
            name,
            labels,
            value: g.get(),
        },
        Metric::Histogram(h) => MetricExport::Histogram {
            name,
            labels,
            count: h.count(),
            sum: h.sum(),
        },
        Metric::Percentile(p) => MetricExport::PercentileHistogram {
            name,
            labels,
            count: p.count(),
            sum: p.sum(),
            percentiles: p.percentiles(),
        },
        Metric::Timer(t) => MetricExport::Timer {
            name,
            labels,
            count: t.count(),
            sum_seconds: t.sum_seconds(),
            percentiles: t.percentiles(),
        },
    }
}

fn prometheus_entry(out: &mut String, last_name: &mut String, key: &MetricKey, metric: &Metric) {
    use std::fmt::Write;

    let name = key.name();
    let prom_kind = match metric {
        Metric::Counter(_) => "counter",
        Metric::Gauge(_) => "gauge",
        Metric::Histogram(_) => "histogram",
        // Reservoir percentiles map to the summary exposition.
        Metric::Percentile(_) | Metric::Timer(_) => "summary",
    };
    // One TYPE line per metric family; labeled series share it.
    if name != last_name.as_str() {
        let _ = writeln!(out, "# TYPE {name} {prom_kind}");
        *last_name = name.to_string();
    }

    let labels = render_labels(key.labels(), &[]);
    match metric {
        Metric::Counter(c) => {
            let _ = writeln!(out, "{name}{labels} {}", c.get());
        }
        Metric::Gauge(g) => {
            let _ = writeln!(out, "{name}{labels} {}", fmt_f64(g.get()));
        }
        Metric::Histogram(h) => {
            let _ = writeln!(out, "{name}_count{labels} {}", h.count());
            let _ = writeln!(out, "{name}_sum{labels} {}", fmt_f64(h.sum()));
        }
        Metric::Percentile(p) => {
            write_summary(out, name, key.labels(), p.count(), p.sum(), p.percentiles());
        }
        Metric::Timer(t) => {
            write_summary(
                out,
                name,
                key.labels(),
                t.count(),
                t.sum_seconds(),
                t.percentiles(),
            );
        }
    }
}

fn write_summary(
    out: &mut String,
    name: &str,
    labels: &[(String, String)],
    count: u64,
    sum: f64,
    pct: Percentiles,
) {
    use std::fmt::Write;
    for (q, v) in [
        ("0.5", pct.p50),
        ("0.9", pct.p90),
        ("0.95", pct.p95),
        ("0.99", pct.p99),
    ] {
        let with_quantile = render_labels(labels, &[("quantile", q)]);
        let _ = writeln!(out, "{name}{with_quantile} {}", fmt_f64(v));
    }
    let plain = render_labels(labels, &[]);
    let _ = writeln!(out, "{name}_count{plain} {count}");
    let _ = writeln!(out, "{name}_sum{plain} {}", fmt_f64(sum));
}

fn render_labels(labels: &[(String, String)], extra: &[(&str, &str)]) -> String {
    if labels.is_empty() && extra.is_empty() {
        return String::new();
    }
    let mut parts = Vec::with_capacity(labels.len() + extra.len());
    for (k, v) in labels {
        parts.push(format!("{k}=\"{}\"", escape_label(v)));
    }
    for (k, v) in extra {
        parts.push(format!("{k}=\"{}\"", escape_label(v)));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Render without scientific notation surprises; integral values print bare.
fn fmt_f64(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_dump_shape() {
        let reg = MetricsRegistry::new();
        reg.counter("requests_total").add(3);
        reg.gauge("inflight").set(2.0);

        let dump = reg.export_json();
        let parsed: serde_json::Value = serde_json::from_str(&dump).unwrap();
        let metrics = parsed["metrics"].as_array().unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0]["type"], "gauge");
        assert_eq!(metrics[0]["name"], "inflight");
        assert_eq!(metrics[1]["type"], "counter");
        assert_eq!(metrics[1]["value"], 3);
    }

    #[test]
    fn prometheus_counter_and_labels() {
        let reg = MetricsRegistry::new();
        reg.counter_with("hits_total", &[("route", "/a")]).add(2);
        reg.counter_with("hits_total", &[("route", "/b")]).add(5);

        let text = reg.export_prometheus();
        assert_eq!(
            text.matches("# TYPE hits_total counter").count(),
            1,
            "one TYPE line per family:\n{text}"
        );
        assert!(text.contains("hits_total{route=\"/a\"} 2"));
        assert!(text.contains("hits_total{route=\"/b\"} 5"));
    }

    #[test]
    fn prometheus_quantile_lines() {
        let reg = MetricsRegistry::new();
        let p = reg.percentile_histogram("latency");
        for i in 1..=100 {
            p.observe(i as f64);
        }

        let text = reg.export_prometheus();
        assert!(text.contains("# TYPE latency summary"));
        assert!(text.contains("latency{quantile=\"0.5\"} 50"));
        assert!(text.contains("latency{quantile=\"0.99\"} 99"));
        assert!(text.contains("latency_count 100"));
    }

    #[test]
    fn label_escaping() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }
}
