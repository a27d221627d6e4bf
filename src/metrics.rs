//! Prometheus-compatible metrics endpoint
//!
//! Counters for both input paths and the coordinator, served together with
//! a JSON dump of the current snapshots.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;

/// Poll durations kept for percentiles
const POLL_HISTORY: usize = 256;

/// Metrics registry for the bridge
#[derive(Debug)]
pub struct Metrics {
    // Broadcast path
    pub packets_received: AtomicU64,
    pub packets_decoded: AtomicU64,
    pub packets_ignored: AtomicU64,
    pub packets_out_of_sequence: AtomicU64,
    pub packets_corrupt: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub transport_errors: AtomicU64,
    pub broadcast_alive: AtomicU64, // 0 or 1

    // Query path
    pub poll_cycles: AtomicU64,
    pub poll_unreachable: AtomicU64,
    pub poll_reachable: AtomicU64, // 0 or 1
    pub queries_ok: AtomicU64,
    pub queries_no_session: AtomicU64,
    pub queries_eval_error: AtomicU64,
    pub queries_http_error: AtomicU64,
    pub queries_transport_error: AtomicU64,
    pub parse_errors: AtomicU64,

    // Poll timing (milliseconds)
    pub poll_duration_ms: AtomicU64,
    pub poll_duration_p95_ms: AtomicU64,
    pub poll_duration_max_ms: AtomicU64,

    // Fusion
    pub updates_applied: AtomicU64,
    pub updates_discarded: AtomicU64,
    pub broadcast_buffered: AtomicU64,
    pub broadcast_buffer_expired: AtomicU64,
    pub identity_ambiguities: AtomicU64,
    pub ships_tracked: AtomicU64,
    pub ships_created: AtomicU64,
    pub ships_retired: AtomicU64,
    pub snapshot_publishes: AtomicU64,

    start_time: Instant,

    poll_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_decoded: AtomicU64::new(0),
            packets_ignored: AtomicU64::new(0),
            packets_out_of_sequence: AtomicU64::new(0),
            packets_corrupt: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            broadcast_alive: AtomicU64::new(0),
            poll_cycles: AtomicU64::new(0),
            poll_unreachable: AtomicU64::new(0),
            poll_reachable: AtomicU64::new(0),
            queries_ok: AtomicU64::new(0),
            queries_no_session: AtomicU64::new(0),
            queries_eval_error: AtomicU64::new(0),
            queries_http_error: AtomicU64::new(0),
            queries_transport_error: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            poll_duration_ms: AtomicU64::new(0),
            poll_duration_p95_ms: AtomicU64::new(0),
            poll_duration_max_ms: AtomicU64::new(0),
            updates_applied: AtomicU64::new(0),
            updates_discarded: AtomicU64::new(0),
            broadcast_buffered: AtomicU64::new(0),
            broadcast_buffer_expired: AtomicU64::new(0),
            identity_ambiguities: AtomicU64::new(0),
            ships_tracked: AtomicU64::new(0),
            ships_created: AtomicU64::new(0),
            ships_retired: AtomicU64::new(0),
            snapshot_publishes: AtomicU64::new(0),
            start_time: Instant::now(),
            poll_history: RwLock::new(VecDeque::with_capacity(POLL_HISTORY)),
        }
    }

    /// Record how long a poll cycle took and update percentiles
    pub fn record_poll_duration(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.poll_duration_ms.store(ms, Ordering::Relaxed);

        let mut history = self.poll_history.write();
        history.push_back(ms);
        while history.len() > POLL_HISTORY {
            history.pop_front();
        }

        let mut sorted: Vec<u64> = history.iter().copied().collect();
        sorted.sort_unstable();

        let p95_idx = (sorted.len() as f32 * 0.95) as usize;
        self.poll_duration_p95_ms
            .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
        self.poll_duration_max_ms
            .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Broadcast path
        metric!("epsilon_bridge_packets_received_total", "Datagrams received on the broadcast socket", "counter",
            self.packets_received.load(Ordering::Relaxed));
        metric!("epsilon_bridge_packets_decoded_total", "Datagrams decoded into frames", "counter",
            self.packets_decoded.load(Ordering::Relaxed));
        metric!("epsilon_bridge_packets_ignored_total", "Valid datagrams not addressed to this bridge", "counter",
            self.packets_ignored.load(Ordering::Relaxed));
        metric!("epsilon_bridge_packets_out_of_sequence_total", "Datagrams rejected by sequence tracking", "counter",
            self.packets_out_of_sequence.load(Ordering::Relaxed));
        metric!("epsilon_bridge_packets_corrupt_total", "Malformed datagrams", "counter",
            self.packets_corrupt.load(Ordering::Relaxed));
        metric!("epsilon_bridge_frames_dropped_total", "Frames dropped because the ingest queue was full", "counter",
            self.frames_dropped.load(Ordering::Relaxed));
        metric!("epsilon_bridge_transport_errors_total", "Socket bind and receive errors", "counter",
            self.transport_errors.load(Ordering::Relaxed));
        metric!("epsilon_bridge_broadcast_alive", "Broadcast stream alive (0/1)", "gauge",
            self.broadcast_alive.load(Ordering::Relaxed));

        // Query path
        metric!("epsilon_bridge_poll_cycles_total", "Poll cycles completed", "counter",
            self.poll_cycles.load(Ordering::Relaxed));
        metric!("epsilon_bridge_poll_unreachable_total", "Poll cycles that could not reach the server", "counter",
            self.poll_unreachable.load(Ordering::Relaxed));
        metric!("epsilon_bridge_poll_reachable", "Query endpoint reachable (0/1)", "gauge",
            self.poll_reachable.load(Ordering::Relaxed));
        metric!("epsilon_bridge_parse_errors_total", "Query results that could not be parsed", "counter",
            self.parse_errors.load(Ordering::Relaxed));

        output.push_str("# HELP epsilon_bridge_queries_total Queries by outcome\n# TYPE epsilon_bridge_queries_total counter\n");
        for (outcome, counter) in [
            ("ok", &self.queries_ok),
            ("no_session", &self.queries_no_session),
            ("evaluation_error", &self.queries_eval_error),
            ("http_error", &self.queries_http_error),
            ("transport_error", &self.queries_transport_error),
        ] {
            output.push_str(&format!(
                "epsilon_bridge_queries_total{{outcome=\"{}\"}} {}\n",
                outcome,
                counter.load(Ordering::Relaxed)
            ));
        }

        metric!("epsilon_bridge_poll_duration_milliseconds", "Duration of the last poll cycle", "gauge",
            self.poll_duration_ms.load(Ordering::Relaxed));
        metric!("epsilon_bridge_poll_duration_p95_milliseconds", "95th percentile poll cycle duration", "gauge",
            self.poll_duration_p95_ms.load(Ordering::Relaxed));
        metric!("epsilon_bridge_poll_duration_max_milliseconds", "Maximum poll cycle duration", "gauge",
            self.poll_duration_max_ms.load(Ordering::Relaxed));

        // Fusion
        metric!("epsilon_bridge_updates_applied_total", "Field updates written to snapshots", "counter",
            self.updates_applied.load(Ordering::Relaxed));
        metric!("epsilon_bridge_updates_discarded_total", "Field updates for unknown or retired entities", "counter",
            self.updates_discarded.load(Ordering::Relaxed));
        metric!("epsilon_bridge_broadcast_buffered_total", "Broadcast fields held while no primary ship existed", "counter",
            self.broadcast_buffered.load(Ordering::Relaxed));
        metric!("epsilon_bridge_broadcast_buffer_expired_total", "Buffered broadcast fields dropped after the grace period", "counter",
            self.broadcast_buffer_expired.load(Ordering::Relaxed));
        metric!("epsilon_bridge_identity_ambiguities_total", "Duplicate callsigns seen during enumeration", "counter",
            self.identity_ambiguities.load(Ordering::Relaxed));
        metric!("epsilon_bridge_ships_tracked", "Ships currently tracked", "gauge",
            self.ships_tracked.load(Ordering::Relaxed));
        metric!("epsilon_bridge_ships_created_total", "Ship snapshots created", "counter",
            self.ships_created.load(Ordering::Relaxed));
        metric!("epsilon_bridge_ships_retired_total", "Ship snapshots retired", "counter",
            self.ships_retired.load(Ordering::Relaxed));
        metric!("epsilon_bridge_snapshot_publishes_total", "Snapshot publications", "counter",
            self.snapshot_publishes.load(Ordering::Relaxed));

        metric!("epsilon_bridge_uptime_seconds", "Bridge uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        json!({
            "broadcast": {
                "alive": load(&self.broadcast_alive) == 1,
                "packets_received": load(&self.packets_received),
                "packets_decoded": load(&self.packets_decoded),
                "packets_ignored": load(&self.packets_ignored),
                "packets_out_of_sequence": load(&self.packets_out_of_sequence),
                "packets_corrupt": load(&self.packets_corrupt),
                "frames_dropped": load(&self.frames_dropped),
                "transport_errors": load(&self.transport_errors),
            },
            "query": {
                "reachable": load(&self.poll_reachable) == 1,
                "poll_cycles": load(&self.poll_cycles),
                "poll_unreachable": load(&self.poll_unreachable),
                "queries": {
                    "ok": load(&self.queries_ok),
                    "no_session": load(&self.queries_no_session),
                    "evaluation_error": load(&self.queries_eval_error),
                    "http_error": load(&self.queries_http_error),
                    "transport_error": load(&self.queries_transport_error),
                },
                "parse_errors": load(&self.parse_errors),
                "poll_duration_ms": load(&self.poll_duration_ms),
                "poll_duration_p95_ms": load(&self.poll_duration_p95_ms),
                "poll_duration_max_ms": load(&self.poll_duration_max_ms),
            },
            "fusion": {
                "updates_applied": load(&self.updates_applied),
                "updates_discarded": load(&self.updates_discarded),
                "broadcast_buffered": load(&self.broadcast_buffered),
                "broadcast_buffer_expired": load(&self.broadcast_buffer_expired),
                "identity_ambiguities": load(&self.identity_ambiguities),
                "ships_tracked": load(&self.ships_tracked),
                "ships_created": load(&self.ships_created),
                "ships_retired": load(&self.ships_retired),
                "snapshot_publishes": load(&self.snapshot_publishes),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "metrics_server")]
pub use server::{route, serve, start_metrics_server};

#[cfg(feature = "metrics_server")]
mod server {
    use std::sync::Arc;
    use std::time::Instant;

    use chrono::Utc;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracing::{debug, info, warn};

    use super::Metrics;
    use crate::fusion::coordinator::FusionCoordinator;
    use crate::util::shutdown::Shutdown;

    /// Start the metrics HTTP server
    pub async fn start_metrics_server(
        metrics: Arc<Metrics>,
        coordinator: Arc<FusionCoordinator>,
        port: u16,
        shutdown: Shutdown,
    ) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;

        info!("Metrics server listening on http://{}/metrics", addr);

        serve(listener, metrics, coordinator, shutdown).await
    }

    /// Answer requests on an already bound listener until shutdown
    pub async fn serve(
        listener: TcpListener,
        metrics: Arc<Metrics>,
        coordinator: Arc<FusionCoordinator>,
        mut shutdown: Shutdown,
    ) -> anyhow::Result<()> {
        loop {
            let (mut socket, peer) = tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Metrics accept failed: {}", e);
                        continue;
                    }
                },
            };
            let metrics = metrics.clone();
            let coordinator = coordinator.clone();

            tokio::spawn(async move {
                let mut buffer = [0u8; 1024];

                match socket.read(&mut buffer).await {
                    Ok(n) if n > 0 => {
                        let request = String::from_utf8_lossy(&buffer[..n]);
                        let response = route(&request, &metrics, &coordinator);

                        if let Err(e) = socket.write_all(response.as_bytes()).await {
                            debug!("Failed to write metrics response to {}: {}", peer, e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Failed to read from metrics socket {}: {}", peer, e);
                    }
                }
            });
        }
    }

    /// Build the full HTTP response for a raw request
    pub fn route(request: &str, metrics: &Metrics, coordinator: &FusionCoordinator) -> String {
        let mut parts = request.lines().next().unwrap_or("").split_whitespace();
        let (method, path) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
        let path = path.split('?').next().unwrap_or("");

        if method != "GET" {
            return response("405 Method Not Allowed", "text/plain", "");
        }

        match path {
            "/metrics/json" | "/json" => response("200 OK", "application/json", &metrics.to_json()),
            "/metrics" => response("200 OK", "text/plain; version=0.0.4", &metrics.to_prometheus()),
            "/snapshots" => {
                let body = json!({
                    "generated_at": Utc::now(),
                    "primary": coordinator.primary(),
                    "snapshots": coordinator.snapshot_views(Instant::now()),
                });
                response("200 OK", "application/json", &body.to_string())
            }
            "/health" | "/" => response("200 OK", "text/plain", "OK"),
            _ => response("404 Not Found", "text/plain", ""),
        }
    }

    fn response(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            content_type,
            body.len(),
            body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.packets_received.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.poll_cycles.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_poll_duration() {
        let metrics = Metrics::new();

        for i in 0..100 {
            metrics.record_poll_duration(Duration::from_millis(10 + i));
        }

        assert_eq!(metrics.poll_duration_ms.load(Ordering::Relaxed), 109);
        assert_eq!(metrics.poll_duration_max_ms.load(Ordering::Relaxed), 109);
        let p95 = metrics.poll_duration_p95_ms.load(Ordering::Relaxed);
        assert!((100..=109).contains(&p95));
    }

    #[test]
    fn test_poll_history_bounded() {
        let metrics = Metrics::new();
        for _ in 0..(POLL_HISTORY + 50) {
            metrics.record_poll_duration(Duration::from_millis(5));
        }
        assert_eq!(metrics.poll_history.read().len(), POLL_HISTORY);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.packets_received.store(50, Ordering::Relaxed);
        metrics.ships_tracked.store(3, Ordering::Relaxed);
        metrics.queries_no_session.store(2, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("epsilon_bridge_packets_received_total 50"));
        assert!(output.contains("epsilon_bridge_ships_tracked 3"));
        assert!(output.contains("epsilon_bridge_queries_total{outcome=\"no_session\"} 2"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.packets_decoded.store(100, Ordering::Relaxed);
        metrics.broadcast_alive.store(1, Ordering::Relaxed);

        let value: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();

        assert_eq!(value["broadcast"]["packets_decoded"], 100);
        assert_eq!(value["broadcast"]["alive"], true);
        assert_eq!(value["query"]["reachable"], false);
    }

    #[cfg(feature = "metrics_server")]
    mod http {
        use super::*;
        use crate::fusion::coordinator::{FusionCoordinator, FusionSettings};
        use crate::util::shutdown::ShutdownTrigger;
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        fn coordinator() -> FusionCoordinator {
            FusionCoordinator::new(FusionSettings::default(), Arc::new(Metrics::new()))
        }

        #[test]
        fn test_routes() {
            let metrics = Metrics::new();
            let coordinator = coordinator();

            let json = route("GET /metrics/json HTTP/1.1\r\n\r\n", &metrics, &coordinator);
            assert!(json.starts_with("HTTP/1.1 200 OK"));
            assert!(json.contains("application/json"));

            let prom = route("GET /metrics HTTP/1.1\r\n\r\n", &metrics, &coordinator);
            assert!(prom.contains("epsilon_bridge_uptime_seconds"));

            let missing = route("GET /nope HTTP/1.1\r\n\r\n", &metrics, &coordinator);
            assert!(missing.starts_with("HTTP/1.1 404"));

            let post = route("POST /metrics HTTP/1.1\r\n\r\n", &metrics, &coordinator);
            assert!(post.starts_with("HTTP/1.1 405"));
        }

        #[test]
        fn test_snapshots_route() {
            let metrics = Metrics::new();
            let coordinator = coordinator();

            let response = route("GET /snapshots HTTP/1.1\r\n\r\n", &metrics, &coordinator);
            let body = response.split("\r\n\r\n").nth(1).unwrap();
            let value: serde_json::Value = serde_json::from_str(body).unwrap();

            assert!(value["generated_at"].is_string());
            assert!(value["primary"].is_null());
            assert_eq!(value["snapshots"].as_array().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_serve_over_tcp() {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let trigger = ShutdownTrigger::new();
            let task = tokio::spawn(serve(
                listener,
                Arc::new(Metrics::new()),
                Arc::new(coordinator()),
                trigger.subscribe(),
            ));

            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"GET /health HTTP/1.1\r\n\r\n").await.unwrap();
            let mut body = String::new();
            stream.read_to_string(&mut body).await.unwrap();
            assert!(body.starts_with("HTTP/1.1 200 OK"));
            assert!(body.ends_with("OK"));

            trigger.trigger();
            tokio::time::timeout(std::time::Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }
}
