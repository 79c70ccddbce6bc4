use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::collector::Collector;
use crate::exposition;
use crate::rate::minute_of_day;

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
    pub metrics_path: String,
}

impl AppState {
    pub fn new(collector: Collector, metrics_path: impl Into<String>) -> Self {
        Self {
            collector: Arc::new(collector),
            metrics_path: metrics_path.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route(&state.metrics_path, get(metrics))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then lets in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, metrics_path = %state.metrics_path, "Serving metrics");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn metrics(State(state): State<AppState>) -> Response {
    let minute = minute_of_day(&chrono::Local::now());
    let report = state.collector.collect(minute).await;

    match exposition::render(&report.samples) {
        Ok(body) => ([(header::CONTENT_TYPE, exposition::content_type())], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let devices: String = state
        .collector
        .endpoints()
        .map(|endpoint| match &endpoint.metadata {
            Some(meta) => format!(
                "<li>{} ({}, {})</li>",
                endpoint.url, meta.name, meta.category
            ),
            None => format!("<li>{}</li>", endpoint.url),
        })
        .collect();

    Html(format!(
        "<html>\
         <head><title>Shelly Exporter</title></head>\
         <body>\
         <h1>Shelly Exporter</h1>\
         <p><a href=\"{path}\">Metrics</a></p>\
         <h2>Devices</h2>\
         <ul>{devices}</ul>\
         </body>\
         </html>",
        path = state.metrics_path,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::config::{CostConfig, DeviceEndpoint, DeviceMetadata};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(endpoints: Vec<DeviceEndpoint>, metrics_path: &str) -> AppState {
        let collector = Collector::new(
            endpoints,
            reqwest::Client::new(),
            CostConfig::default(),
            Duration::from_secs(2),
            2,
        );
        AppState::new(collector, metrics_path)
    }

    async fn send(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|value| value.to_str().unwrap().to_string());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, _, body) = send(router(state(vec![], "/metrics")), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_index_lists_devices() {
        let endpoints = vec![
            DeviceEndpoint::bare("http://192.168.1.100"),
            DeviceEndpoint {
                url: "http://192.168.1.150".to_string(),
                metadata: Some(DeviceMetadata {
                    name: "heat_pump".to_string(),
                    category: "heating".to_string(),
                    description: String::new(),
                }),
            },
        ];
        let (status, _, body) = send(router(state(endpoints, "/custom")), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("href=\"/custom\""));
        assert!(body.contains("<li>http://192.168.1.100</li>"));
        assert!(body.contains("http://192.168.1.150 (heat_pump, heating)"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let (status, _, _) = send(router(state(vec![], "/metrics")), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_scrapes_devices() {
        let mut device = mockito::Server::new_async().await;
        device
            .mock("GET", "/rpc/Shelly.GetStatus")
            .with_status(200)
            .with_body(r#"{"sys": {"mac": "AABBCC"}, "em:0": {"total_act_power": 42.0}}"#)
            .create_async()
            .await;
        let url = device.url();

        let app = router(state(vec![DeviceEndpoint::bare(url.clone())], "/metrics"));
        let (status, content_type, body) = send(app, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/plain"));
        assert!(body.contains(&format!("shelly_device_up{{device=\"{url}\"}} 1")));
        assert!(body.contains(&format!(
            "shelly_power_watts{{device=\"{url}\",meter=\"total\"}} 42"
        )));
    }

    #[tokio::test]
    async fn test_metrics_path_is_configurable() {
        let app = router(state(vec![], "/custom"));
        let (status, _, _) = send(app.clone(), "/custom").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(app, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
