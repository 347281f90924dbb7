use crate::acme::Http01Challenges;
use crate::certs::CertificateResolver;
use crate::labels::normalize_hostname;
use crate::reload::ReloadCoordinator;
use crate::routes::RouteTable;
use crate::shutdown::wait_for_shutdown;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const CERTIFICATES_PREFIX: &str = "/certificates/";
const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = response(status, body.to_string());
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Everything the admin API reads from
#[derive(Clone)]
pub struct AdminState {
    pub routes: Arc<RouteTable>,
    pub coordinator: Arc<ReloadCoordinator>,
    pub resolver: CertificateResolver,
    pub challenges: Http01Challenges,
}

/// Local API queried by the serving engine for certificates and ACME tokens
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: AdminState,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API listening (HTTP/1.1 and HTTP/2)");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Admin server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: AdminState) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let state = state.clone();
        async move { Ok::<_, hyper::Error>(handle_admin_request(req.method(), req.uri().path(), &state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

pub async fn handle_admin_request(
    method: &Method,
    path: &str,
    state: &AdminState,
) -> Response<Full<Bytes>> {
    debug!(%method, %path, "Admin API request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        // Certificate identity for a hostname: GET /certificates/{hostname}
        (&Method::GET, path) if path.starts_with(CERTIFICATES_PREFIX) => {
            let hostname = path.strip_prefix(CERTIFICATES_PREFIX).unwrap_or("");
            if normalize_hostname(hostname).is_none() {
                return response(StatusCode::BAD_REQUEST, "invalid hostname");
            }
            let identity = state.resolver.resolve(hostname);
            match serde_json::to_value(&identity) {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }

        // HTTP-01 answer: GET /.well-known/acme-challenge/{token}
        (&Method::GET, path) if path.starts_with(ACME_CHALLENGE_PREFIX) => {
            let token = path.strip_prefix(ACME_CHALLENGE_PREFIX).unwrap_or("");
            match state.challenges.get(token).await {
                Some(key_authorization) => {
                    debug!(token, "Serving ACME challenge");
                    response(StatusCode::OK, key_authorization)
                }
                None => response(StatusCode::NOT_FOUND, "not found"),
            }
        }

        (&Method::GET, "/routes") => {
            let snapshot = state.routes.snapshot();
            let entries: Vec<_> = snapshot.entries().collect();
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "generation": snapshot.generation(),
                    "routes": entries,
                    "count": entries.len(),
                }),
            )
        }

        (&Method::GET, "/reloads") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "applied_generation": state.coordinator.applied_generation(),
                "config_path": state.coordinator.config_path(),
                "history": state.coordinator.history(),
            }),
        ),

        (&Method::GET, "/certificates") => json_response(
            StatusCode::OK,
            &serde_json::json!({ "records": state.resolver.records() }),
        ),

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use crate::error::ReloadError;
    use crate::reload::ServingEngine;
    use crate::routes::RouteEntry;
    use async_trait::async_trait;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    struct AcceptAll;

    #[async_trait]
    impl ServingEngine for AcceptAll {
        async fn validate(&self, _candidate: &Path) -> Result<(), ReloadError> {
            Ok(())
        }

        async fn reload(&self, _active: &Path) -> Result<(), ReloadError> {
            Ok(())
        }
    }

    fn state(dir: &TempDir) -> AdminState {
        let routes = Arc::new(RouteTable::new());
        let mut entries = BTreeMap::new();
        entries.insert(
            "app.example.com".to_string(),
            RouteEntry {
                hostname: "app.example.com".to_string(),
                upstream: "172.18.0.5:3000".parse().unwrap(),
                container_id: "abc123".to_string(),
                updated_at: Utc::now(),
            },
        );
        routes.commit(0, entries).unwrap();

        let tls = TlsConfig {
            acme_enabled: false,
            store_dir: dir.path().join("certs"),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(false);
        let resolver = CertificateResolver::new(&tls, Arc::clone(&routes), None, rx).unwrap();

        AdminState {
            routes,
            coordinator: Arc::new(ReloadCoordinator::new(
                Arc::new(AcceptAll),
                dir.path().join("nginx.conf"),
            )),
            resolver,
            challenges: Http01Challenges::new(),
        }
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let health = handle_admin_request(&Method::GET, "/health", &state).await;
        assert_eq!(health.status(), StatusCode::OK);

        let version = handle_admin_request(&Method::GET, "/version", &state).await;
        let body = body_json(version).await;
        assert_eq!(body["name"], "dockgate");
    }

    #[tokio::test]
    async fn test_certificate_lookup() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let found = handle_admin_request(&Method::GET, "/certificates/app.example.com", &state).await;
        assert_eq!(found.status(), StatusCode::OK);
        let body = body_json(found).await;
        assert_eq!(body["hostname"], "app.example.com");
        assert_eq!(body["source"], "self_signed");
        assert!(body["cert_path"].as_str().unwrap().ends_with("cert.pem"));

        // Unrouted hosts still get a usable identity
        let unrouted =
            handle_admin_request(&Method::GET, "/certificates/other.example.com", &state).await;
        assert_eq!(unrouted.status(), StatusCode::OK);

        let invalid = handle_admin_request(&Method::GET, "/certificates/bad..host", &state).await;
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_acme_challenge() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        state
            .challenges
            .set("tok".to_string(), "tok.thumbprint".to_string())
            .await;

        let found =
            handle_admin_request(&Method::GET, "/.well-known/acme-challenge/tok", &state).await;
        assert_eq!(found.status(), StatusCode::OK);
        let bytes = found.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"tok.thumbprint");

        let missing =
            handle_admin_request(&Method::GET, "/.well-known/acme-challenge/nope", &state).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_routes_and_reloads() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let routes = body_json(handle_admin_request(&Method::GET, "/routes", &state).await).await;
        assert_eq!(routes["generation"], 1);
        assert_eq!(routes["count"], 1);
        assert_eq!(routes["routes"][0]["upstream"], "172.18.0.5:3000");

        let reloads = body_json(handle_admin_request(&Method::GET, "/reloads", &state).await).await;
        assert_eq!(reloads["applied_generation"], 0);
        assert!(reloads["history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let response = handle_admin_request(&Method::POST, "/routes", &state).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = AdminServer::new("127.0.0.1:0".parse().unwrap(), state(&dir), rx);
        let handle = tokio::spawn(server.serve(listener));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
