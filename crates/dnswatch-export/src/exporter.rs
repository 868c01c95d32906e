//! Prometheus endpoint for `dnswatch exporter`

use crate::{ExportResult, RecordSink};
use async_trait::async_trait;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use dnswatch_core::{DnsSendRecord, MetricsCollector};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Routes serving the collector: `/metrics`, `/metrics.json` and `/health`
pub fn metrics_router(metrics: Arc<MetricsCollector>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics_prometheus))
        .route("/metrics.json", get(get_metrics_json))
        .route("/health", get(health_check))
        .with_state(metrics)
}

/// Bind `addr` and serve metrics until `shutdown` resolves
pub async fn serve_metrics<F>(
    addr: SocketAddr,
    metrics: Arc<MetricsCollector>,
    shutdown: F,
) -> ExportResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve_metrics_on(listener, metrics, shutdown).await
}

/// Serve metrics on an already bound listener
pub async fn serve_metrics_on<F>(
    listener: TcpListener,
    metrics: Arc<MetricsCollector>,
    shutdown: F,
) -> ExportResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "Metrics available at http://{}/metrics",
        listener.local_addr()?
    );
    axum::serve(listener, metrics_router(metrics))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn get_metrics_prometheus(State(metrics): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        metrics.to_prometheus(),
    )
}

async fn get_metrics_json(State(metrics): State<Arc<MetricsCollector>>) -> Json<serde_json::Value> {
    Json(metrics.to_json())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "dnswatch",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Counts every exported record into a [`MetricsCollector`]
pub struct MetricsSink {
    metrics: Arc<MetricsCollector>,
}

impl MetricsSink {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl RecordSink for MetricsSink {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn export(&self, record: &DnsSendRecord) -> ExportResult<()> {
        self.metrics.record(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnswatch_ebpf_common::{DnsSendEvent, FnId};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn record(comm: &str) -> DnsSendRecord {
        let mut event = DnsSendEvent::zeroed();
        event.comm[..comm.len()].copy_from_slice(comm.as_bytes());
        event.fn_id = FnId::UdpSendmsg as u8;
        DnsSendRecord::from_raw(&event).unwrap()
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_metrics_sink_counts_records() {
        let metrics = Arc::new(MetricsCollector::new());
        let sink = MetricsSink::new(metrics.clone());
        sink.export(&record("dig")).await.unwrap();
        sink.export(&record("dig")).await.unwrap();
        assert_eq!(metrics.total_sends(), 2);
    }

    #[tokio::test]
    async fn test_serves_metrics_until_shutdown() {
        let metrics = Arc::new(MetricsCollector::new());
        metrics.record(&record("dig"));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_metrics_on(listener, metrics, async move {
            let _ = stop_rx.await;
        }));

        let response = get(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("text/plain; version=0.0.4"));
        assert!(response.contains("dnswatch_dns_sends_total{process=\"dig\",hook=\"udp_sendmsg\"} 1"));

        let response = get(addr, "/health").await;
        assert!(response.contains("\"status\":\"healthy\""));

        let response = get(addr, "/metrics.json").await;
        assert!(response.contains("\"uptime_seconds\""));

        let response = get(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
