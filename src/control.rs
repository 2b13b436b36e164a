//! Control API
//!
//! A small JSON API used by the tray and the dashboard: it reports whether
//! each backend is running and which account it is logged in as, and accepts
//! start/stop/login/logout commands.

use crate::credentials::CredentialInspector;
use crate::dashboard;
use crate::error::{ControlErrorCode, ErrorResponse};
use crate::login::LoginLauncher;
use crate::process::{StartOutcome, Supervisor};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Commands accepted by `POST /api/action`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Login,
    Logout,
}

/// Body of `POST /api/action`
#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub id: String,
    pub action: Action,
}

/// Entry in the `GET /api/status` map
#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub active: bool,
    pub user: Option<String>,
}

/// Entry in the `GET /api/backends` list
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDetail {
    pub id: String,
    pub port: u16,
    pub active: bool,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub user: Option<String>,
    pub credential_file: Option<String>,
}

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(code: ControlErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(code.status_code(), ErrorResponse::new(code, message).to_json())
}

/// Everything a control request handler needs
pub struct ControlState {
    supervisor: Arc<Supervisor>,
    inspector: CredentialInspector,
    launcher: LoginLauncher,
    static_dir: Option<PathBuf>,
    auth_token: Option<String>,
    enable_stop_action: bool,
}

impl ControlState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let inspector = CredentialInspector::new(Arc::clone(supervisor.registry()));
        Self {
            supervisor,
            inspector,
            launcher: LoginLauncher::default(),
            static_dir: None,
            auth_token: None,
            enable_stop_action: false,
        }
    }

    pub fn with_login_launcher(mut self, launcher: LoginLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_static_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.static_dir = dir;
        self
    }

    /// Require `Authorization: Bearer <token>` on `/api/*`
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_stop_action(mut self, enabled: bool) -> Self {
        self.enable_stop_action = enabled;
        self
    }

    /// `{id: {active, user}}` in registry order
    pub fn status(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for backend in self.supervisor.registry().iter() {
            let record = self.inspector.inspect(&backend.id);
            let status = BackendStatus {
                active: self.supervisor.is_running(&backend.id),
                user: record.label,
            };
            map.insert(
                backend.id.clone(),
                serde_json::to_value(status).unwrap_or(serde_json::Value::Null),
            );
        }
        map
    }

    pub fn details(&self) -> Vec<BackendDetail> {
        self.supervisor
            .registry()
            .iter()
            .map(|backend| {
                let record = self.inspector.inspect(&backend.id);
                let info = self.supervisor.info(&backend.id);
                BackendDetail {
                    id: backend.id.clone(),
                    port: backend.port,
                    active: info.is_some(),
                    pid: info.as_ref().map(|i| i.pid),
                    started_at: info.as_ref().map(|i| i.started_at.to_rfc3339()),
                    user: record.label,
                    credential_file: record.file_name,
                }
            })
            .collect()
    }

    /// Carry out an action for a registered backend
    ///
    /// Every action is best-effort and the caller always reports success.
    /// When starting or launching the login session fails, the returned
    /// message describes why so an interactive caller can show it.
    pub fn perform(&self, id: &str, action: Action) -> Option<String> {
        info!(id, ?action, "Control action");

        match action {
            Action::Start => self.start(id),
            Action::Stop => {
                if self.enable_stop_action {
                    self.supervisor.stop(id);
                } else {
                    info!(id, "Stop action is disabled, ignoring");
                }
                None
            }
            Action::Login => {
                let backend = self.supervisor.registry().get(id)?;
                match self.launcher.launch(backend) {
                    Ok(()) => None,
                    Err(e) => {
                        error!(id, error = %e, "Failed to launch interactive login");
                        Some(format!("Failed to launch login for '{}': {}", id, e))
                    }
                }
            }
            Action::Logout => {
                self.supervisor.stop(id);
                match self.inspector.revoke(id) {
                    Some(file) => info!(id, file = %file, "Logged out"),
                    None => debug!(id, "No credential file to remove"),
                }
                self.supervisor.start_after_delay(id);
                None
            }
        }
    }

    fn start(&self, id: &str) -> Option<String> {
        match self.supervisor.start(id) {
            Ok(StartOutcome::Started { pid }) => {
                debug!(id, pid, "Backend started via control API");
                None
            }
            Ok(StartOutcome::AlreadyRunning { pid }) => {
                debug!(id, pid, "Backend already running");
                None
            }
            Err(e) => {
                error!(id, error = %e, "Failed to start backend");
                Some(e.to_string())
            }
        }
    }

    fn authorized(&self, req: &Request<Incoming>) -> bool {
        match &self.auth_token {
            Some(expected) => check_auth(req, expected),
            None => true,
        }
    }
}

/// Control API server
pub struct ControlServer {
    bind_addr: SocketAddr,
    state: Arc<ControlState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: ControlState,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_control_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_control_connection(
    stream: TcpStream,
    _addr: SocketAddr,
    state: Arc<ControlState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_control_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

async fn handle_control_request(
    req: Request<Incoming>,
    state: Arc<ControlState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    debug!(method = %req.method(), path = %req.uri().path(), "Control API request");

    let mut response = if req.method() == Method::OPTIONS {
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, Authorization")
            .body(Full::new(Bytes::new()))
            .expect("valid response with StatusCode enum and static headers")
    } else {
        route(req, &state).await
    };

    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

    Ok(response)
}

async fn route(req: Request<Incoming>, state: &ControlState) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if path.starts_with("/api/") && !state.authorized(&req) {
        warn!(path, "Unauthorized control API request");
        return json_error(ControlErrorCode::Unauthorized, "unauthorized");
    }

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/api/status") => {
            let body = serde_json::Value::Object(state.status());
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/api/backends") => {
            let backends = state.details();
            let count = backends.len();
            let body = serde_json::json!({
                "backends": backends,
                "count": count,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, "/api/action") => handle_action(req, state).await,

        (&Method::GET, _) if !path.starts_with("/api/") => match &state.static_dir {
            Some(dir) => dashboard::serve_static(dir, &path).await,
            None => json_error(ControlErrorCode::NotFound, "not found"),
        },

        _ => json_error(ControlErrorCode::NotFound, "not found"),
    }
}

/// Collect a request body, refusing anything over [`MAX_BODY_BYTES`]
pub async fn read_body<B>(body: B) -> Result<Bytes, ControlErrorCode>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(limit = MAX_BODY_BYTES, "Control request body too large");
            Err(ControlErrorCode::PayloadTooLarge)
        }
        Err(e) => {
            debug!(error = %e, "Failed to read control request body");
            Err(ControlErrorCode::MalformedBody)
        }
    }
}

async fn handle_action(req: Request<Incoming>, state: &ControlState) -> Response<Full<Bytes>> {
    let body = match read_body(req.into_body()).await {
        Ok(body) => body,
        Err(code) => return json_error(code, "failed to read request body"),
    };

    let request: ActionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed action request");
            return json_error(ControlErrorCode::MalformedBody, format!("invalid request: {}", e));
        }
    };

    if !state.supervisor.registry().contains(&request.id) {
        warn!(id = %request.id, "Action for unknown backend");
        return json_error(
            ControlErrorCode::InvalidBackend,
            format!("Invalid ID: {}", request.id),
        );
    }

    let body = match state.perform(&request.id, request.action) {
        Some(message) => serde_json::json!({ "success": true, "message": message }),
        None => serde_json::json!({ "success": true }),
    };
    json_response(StatusCode::OK, body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::credential_path;
    use crate::registry::{Backend, BackendRegistry};
    use std::time::Duration;

    fn backend(id: &str, port: u16, credential_dir: PathBuf) -> Backend {
        Backend {
            id: id.to_string(),
            working_dir: PathBuf::from("."),
            port,
            credential_dir,
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            login_args: Vec::new(),
            autostart: false,
        }
    }

    fn state_with(dirs: &[&std::path::Path]) -> ControlState {
        let backends = dirs
            .iter()
            .enumerate()
            .map(|(i, dir)| {
                let id = if i == 0 { "primary" } else { "secondary" };
                backend(id, 8317 + i as u16, dir.to_path_buf())
            })
            .collect();
        let registry = Arc::new(BackendRegistry::new(backends));
        ControlState::new(Supervisor::new(registry, Duration::from_millis(100)))
    }

    #[test]
    fn test_action_parsing() {
        let req: ActionRequest =
            serde_json::from_str(r#"{"id":"primary","action":"logout"}"#).unwrap();
        assert_eq!(req.id, "primary");
        assert_eq!(req.action, Action::Logout);

        assert!(serde_json::from_str::<ActionRequest>(r#"{"id":"primary","action":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ActionRequest>(r#"{"id":"primary"}"#).is_err());
        assert!(serde_json::from_str::<ActionRequest>("not json").is_err());
    }

    #[tokio::test]
    async fn test_read_body_limit() {
        let small = Full::new(Bytes::from_static(br#"{"id":"primary","action":"start"}"#));
        assert!(read_body(small).await.is_ok());

        let exact = Full::new(Bytes::from(vec![b'a'; MAX_BODY_BYTES]));
        assert_eq!(read_body(exact).await.unwrap().len(), MAX_BODY_BYTES);

        let large = Full::new(Bytes::from(vec![b'a'; MAX_BODY_BYTES + 1]));
        assert_eq!(
            read_body(large).await.unwrap_err(),
            ControlErrorCode::PayloadTooLarge
        );
    }

    #[test]
    fn test_status_in_registry_order() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(credential_path(b.path(), "foo_bar_com"), "{}").unwrap();

        let state = state_with(&[a.path(), b.path()]);
        let json = serde_json::Value::Object(state.status()).to_string();

        assert_eq!(
            json,
            r#"{"primary":{"active":false,"user":null},"secondary":{"active":false,"user":"foo.bar.com"}}"#
        );
    }

    #[test]
    fn test_details_without_process() {
        let a = tempfile::tempdir().unwrap();
        let state = state_with(&[a.path()]);

        let details = state.details();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].id, "primary");
        assert_eq!(details[0].port, 8317);
        assert!(!details[0].active);
        assert!(details[0].pid.is_none());

        let json = serde_json::to_value(&details[0]).unwrap();
        assert!(json.get("startedAt").is_some());
        assert!(json.get("credentialFile").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_action_disabled_by_default() {
        let a = tempfile::tempdir().unwrap();
        let state = state_with(&[a.path()]);

        state.perform("primary", Action::Start);
        assert!(state.supervisor.is_running("primary"));

        state.perform("primary", Action::Stop);
        assert!(state.supervisor.is_running("primary"));

        state.supervisor.stop_all();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_action_when_enabled() {
        let a = tempfile::tempdir().unwrap();
        let state = state_with(&[a.path()]).with_stop_action(true);

        state.perform("primary", Action::Start);
        assert!(state.supervisor.is_running("primary"));

        state.perform("primary", Action::Stop);
        assert!(!state.supervisor.is_running("primary"));
    }

    #[tokio::test]
    async fn test_spawn_failures_are_reported_to_caller() {
        let a = tempfile::tempdir().unwrap();
        let mut missing = backend("primary", 8317, a.path().to_path_buf());
        missing.command = "/definitely/not/a/real/binary".to_string();
        let registry = Arc::new(BackendRegistry::new(vec![missing]));
        let state = ControlState::new(Supervisor::new(registry, Duration::from_millis(100)))
            .with_login_launcher(LoginLauncher::new(Some("xterm -hold -e")).unwrap());

        let start = state.perform("primary", Action::Start).unwrap();
        assert!(start.contains("/definitely/not/a/real/binary"));

        let login = state.perform("primary", Action::Login).unwrap();
        assert!(login.starts_with("Failed to launch login for 'primary'"));
        assert!(login.contains("/definitely/not/a/real/binary"));

        assert!(state.perform("primary", Action::Logout).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_logout_sequence() {
        let a = tempfile::tempdir().unwrap();
        let file = credential_path(a.path(), "someone_example_com");
        std::fs::write(&file, "{}").unwrap();

        let state = state_with(&[a.path()]);
        state.perform("primary", Action::Start);
        let first_pid = state.supervisor.pid("primary").unwrap();

        state.perform("primary", Action::Logout);
        assert!(!state.supervisor.is_running("primary"));
        assert!(!file.exists());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(state.supervisor.is_running("primary"));
        assert_ne!(state.supervisor.pid("primary"), Some(first_pid));
        assert!(!file.exists());

        state.supervisor.stop_all();
    }
}
