use std::{net::SocketAddr, time::Instant};

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use wpb_core::service::PairingService;

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub service: PairingService,
    pub started: Instant,
}

impl AppState {
    pub fn new(service: PairingService) -> Self {
        Self {
            service,
            started: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/pair", get(handlers::pair))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Serve until `shutdown` fires. In-flight requests are allowed to finish.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("pairing server listening on {}", listener.local_addr()?);

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("pairing server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::{
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    };
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use wpb_core::{
        domain::{Jid, MessageKey, PhoneKey},
        errors::Error,
        messaging::{
            port::{Connection, CredentialStore, ProtocolClient, SessionConnector},
            types::{ClientEvent, ConnectionState, OutgoingMessage},
        },
        retry::RetryPolicy,
        service::ServiceSettings,
        Result,
    };

    /// How the fake protocol behaves for a connect call.
    #[derive(Clone, Copy)]
    enum Mode {
        Code,
        Registered,
        Rejected,
        NeverOpens,
    }

    struct FakeClient {
        mode: Mode,
    }

    #[async_trait]
    impl ProtocolClient for FakeClient {
        async fn request_pairing_code(&self, _phone: &PhoneKey) -> Result<String> {
            match self.mode {
                Mode::Rejected => Err(Error::External("invalid phone number".to_string())),
                _ => Ok("ABCD-1234".to_string()),
            }
        }

        async fn send_message(&self, _jid: &Jid, _message: OutgoingMessage) -> Result<()> {
            Ok(())
        }

        async fn read_messages(&self, _keys: &[MessageKey]) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeConnector {
        mode: Mode,
        // Keeps event streams open for the life of the test.
        held: Mutex<Vec<mpsc::Sender<ClientEvent>>>,
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(&self, _phone: &PhoneKey, _dir: &Path) -> Result<Connection> {
            let (tx, rx) = mpsc::channel(8);
            if !matches!(self.mode, Mode::NeverOpens) {
                let _ = tx.try_send(ClientEvent::ConnectionUpdate(ConnectionState::Open));
            }
            self.held.lock().unwrap().push(tx);
            Ok(Connection {
                registered: matches!(self.mode, Mode::Registered),
                client: Arc::new(FakeClient { mode: self.mode }),
                events: rx,
            })
        }
    }

    struct NoCreds;

    #[async_trait]
    impl CredentialStore for NoCreds {
        async fn session_dir(&self, phone: &PhoneKey) -> Result<PathBuf> {
            Ok(PathBuf::from("/tmp/wpb-http-test").join(phone.as_str()))
        }

        async fn save(&self, _phone: &PhoneKey, _creds: &Value) -> Result<()> {
            Ok(())
        }
    }

    fn app(mode: Mode) -> (Router, PairingService) {
        let settings = ServiceSettings {
            retry: RetryPolicy {
                initial_delay: std::time::Duration::ZERO,
                ..RetryPolicy::default()
            },
            ..ServiceSettings::default()
        };
        let service = PairingService::new(
            Arc::new(FakeConnector {
                mode,
                held: Mutex::new(Vec::new()),
            }),
            Arc::new(NoCreds),
            settings,
        );
        (build_router(AppState::new(service.clone())), service)
    }

    async fn fetch(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
        let req = Request::get(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn missing_and_invalid_phone_are_400() {
        let (app, _) = app(Mode::Code);

        let (status, _, body) = fetch(&app, "/pair").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Phone number required");

        let (status, _, body) = fetch(&app, "/pair?phone=12345").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid phone number format");
    }

    #[tokio::test]
    async fn unregistered_phone_gets_code_then_429() {
        let (app, _) = app(Mode::Code);

        let (status, _, body) = fetch(&app, "/pair?number=%2B15551234567").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"code": "ABCD-1234"}));

        let (status, headers, body) = fetch(&app, "/pair?phone=15551234567").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body["error"],
            "Too many requests. Please wait a bit before requesting a new code."
        );
        assert!(headers.contains_key("retry-after"));
    }

    #[tokio::test]
    async fn registered_phone_reports_running() {
        let (app, service) = app(Mode::Registered);

        let (status, _, body) = fetch(&app, "/pair?phone=15551234567").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Bot connected & running");
        assert_eq!(body["phone"], "15551234567");
        assert_eq!(body["registered"], true);

        let (status, _, body) = fetch(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 1);

        service.shutdown();
    }

    #[tokio::test]
    async fn rejected_code_is_500_with_details() {
        let (app, _) = app(Mode::Rejected);

        let (status, _, body) = fetch(&app, "/pair?phone=15551234567").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to generate pairing code");
        assert!(body["details"]
            .as_str()
            .unwrap()
            .contains("invalid phone number"));
    }

    #[tokio::test(start_paused = true)]
    async fn never_opening_connection_is_504() {
        let (app, _) = app(Mode::NeverOpens);

        let (status, _, body) = fetch(&app, "/pair?phone=15551234567").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"], "Pairing timeout. Try again.");
    }

    #[tokio::test]
    async fn health_starts_empty() {
        let (app, _) = app(Mode::Code);
        let (status, _, body) = fetch(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"], 0);
        assert!(body["uptime_secs"].is_u64());
    }
}
