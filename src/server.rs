//! HTTP server for the reader.
//!
//! Serves the reader page, the relay endpoint and the display directory.
//! The relay endpoint always answers 200; a backend failure is reported
//! inside the body.

use crate::config::{DisplayConfig, HttpConfig};
use crate::relay::Relay;
use axum::{extract::State, response::Html, routing::get, Router};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Shared handler state
#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    page: Bytes,
}

/// Server instance
pub struct Server {
    http: HttpConfig,
    display: DisplayConfig,
    relay: Arc<Relay>,
}

impl Server {
    pub fn new(http: HttpConfig, display: DisplayConfig, relay: Relay) -> Self {
        Server {
            http,
            display,
            relay: Arc::new(relay),
        }
    }

    /// Bind and serve until cancelled.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.http.listen).await?;
        info!(
            address = %listener.local_addr()?,
            relay_path = %self.http.relay_path,
            display_dir = %self.display.dir.display(),
            backend = %format!("{}:{}", self.relay.request().host, self.relay.request().port),
            "Server listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!("Server stopped");
        Ok(())
    }

    fn router(&self) -> Router {
        let state = AppState {
            relay: Arc::clone(&self.relay),
            page: Bytes::from(render_page(&self.display.file)),
        };

        Router::new()
            .route("/", get(index))
            .route(&self.http.relay_path, get(relay_text))
            .with_state(state)
            .fallback_service(ServeDir::new(&self.display.dir))
            .layer(TraceLayer::new_for_http())
    }
}

/// `source` lands inside a script string literal; `Config::resolve` only
/// admits file names made of `[A-Za-z0-9._-]`.
fn render_page(source: &str) -> String {
    INDEX_HTML.replace("{{SOURCE}}", source)
}

async fn index(State(state): State<AppState>) -> Html<Bytes> {
    Html(state.page)
}

async fn relay_text(State(state): State<AppState>) -> Html<String> {
    Html(state.relay.fetch_text().await.into_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayRequest;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    fn server(port: u16, dir: &Path) -> Server {
        Server::new(
            HttpConfig::default(),
            DisplayConfig {
                dir: dir.to_path_buf(),
                file: "helloClient.txt".to_string(),
            },
            Relay::new(RelayRequest {
                host: "127.0.0.1".to_string(),
                port,
                connect_timeout: Duration::from_secs(2),
                read_timeout: None,
                max_response_bytes: 1024,
            }),
        )
    }

    async fn fetch(router: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_index_page_polls_display_file() {
        let dir = tempfile::tempdir().unwrap();
        let (status, content_type, body) =
            fetch(server(closed_port().await, dir.path()).router(), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/html"));
        assert!(body.contains(r#"var SOURCE = "helloClient.txt";"#));
    }

    #[tokio::test]
    async fn test_relay_endpoint_escapes_backend_text() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 64];
            while !request.ends_with(b"\n.\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            stream.write_all(b"<b>bold</b>").await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let (status, _, body) = fetch(server(port, dir.path()).router(), "/textReceiver").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "&lt;b&gt;bold&lt;/b&gt;");
    }

    #[tokio::test]
    async fn test_relay_endpoint_reports_connect_error_in_body() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _, body) =
            fetch(server(closed_port().await, dir.path()).router(), "/textReceiver").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with(")\n"), "body: {body:?}");
        assert!(body.contains(" ("));
        assert!(!body.contains("&"));
    }

    #[tokio::test]
    async fn test_display_file_served() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("helloClient.txt"), "Hello Client!\n").unwrap();

        let router = server(closed_port().await, dir.path()).router();
        let (status, _, body) = fetch(router.clone(), "/helloClient.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Hello Client!\n");

        let (status, _, _) = fetch(router, "/missing.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
