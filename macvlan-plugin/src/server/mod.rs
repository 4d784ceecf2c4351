//! Plugin protocol dispatcher.
//!
//! Docker talks to the driver with JSON over HTTP on a unix socket. Every
//! request is decoded here and the handler is run on a blocking thread, so
//! kernel and engine calls never stall other requests.

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::error::DriverError;
use crate::plugin::MacvlanDriver;
use crate::types::{ErrorResponse, HandshakeResponse};

/// Content type of plugin protocol responses.
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1+json";

type SharedDriver = Arc<MacvlanDriver>;

/// Routes for the plugin handshake and every `NetworkDriver` method.
pub fn create_router(driver: SharedDriver) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(handshake))
        .route("/status", get(status))
        .route("/NetworkDriver.GetCapabilities", post(get_capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.DiscoverNew", post(discover_new))
        .route("/NetworkDriver.DiscoverDelete", post(discover_delete))
        .route(
            "/NetworkDriver.ProgramExternalConnectivity",
            post(program_external_connectivity),
        )
        .route(
            "/NetworkDriver.RevokeExternalConnectivity",
            post(revoke_external_connectivity),
        )
        .fallback(not_found)
        .with_state(driver)
}

fn plugin_json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => (status, [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)], bytes).into_response(),
        Err(e) => {
            error!("Could not JSON encode response: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not JSON encode response",
            )
                .into_response()
        }
    }
}

fn error_response(err: &DriverError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    plugin_json(status, &ErrorResponse::new(err.to_string()))
}

/// Decode a request body. An empty body is treated as `{}`.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, DriverError> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|e| DriverError::BadRequest(format!("Unable to decode JSON payload: {}", e)))
}

async fn dispatch<Req, Resp, F>(driver: SharedDriver, body: Bytes, op: F) -> Response
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: FnOnce(&MacvlanDriver, &Req) -> crate::error::Result<Resp> + Send + 'static,
{
    let req: Req = match decode(&body) {
        Ok(req) => req,
        Err(e) => {
            error!("{}", e);
            return error_response(&e);
        }
    };

    match tokio::task::spawn_blocking(move || op(driver.as_ref(), &req)).await {
        Ok(Ok(resp)) => plugin_json(StatusCode::OK, &resp),
        Ok(Err(e)) => {
            warn!("{}", e);
            error_response(&e)
        }
        Err(e) => {
            error!("handler task failed: {}", e);
            plugin_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ErrorResponse::new("internal driver error"),
            )
        }
    }
}

async fn handshake() -> Response {
    debug!("Handshake completed");
    plugin_json(StatusCode::OK, &HandshakeResponse::default())
}

async fn status() -> String {
    format!("macvlan plugin {}\n", env!("CARGO_PKG_VERSION"))
}

async fn get_capabilities(State(driver): State<SharedDriver>) -> Response {
    plugin_json(StatusCode::OK, &driver.capabilities())
}

async fn create_network(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, MacvlanDriver::create_network).await
}

async fn delete_network(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, MacvlanDriver::delete_network).await
}

async fn create_endpoint(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, MacvlanDriver::create_endpoint).await
}

async fn delete_endpoint(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, MacvlanDriver::delete_endpoint).await
}

async fn endpoint_info(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, MacvlanDriver::endpoint_info).await
}

async fn join(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, MacvlanDriver::join).await
}

async fn leave(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, MacvlanDriver::leave).await
}

async fn discover_new(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, |d: &MacvlanDriver, _: &IgnoredAny| d.discover_new()).await
}

async fn discover_delete(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    dispatch(driver, body, |d: &MacvlanDriver, _: &IgnoredAny| d.discover_delete()).await
}

async fn program_external_connectivity(
    State(driver): State<SharedDriver>,
    body: Bytes,
) -> Response {
    dispatch(driver, body, |d: &MacvlanDriver, _: &IgnoredAny| {
        d.program_external_connectivity()
    })
    .await
}

async fn revoke_external_connectivity(
    State(driver): State<SharedDriver>,
    body: Bytes,
) -> Response {
    dispatch(driver, body, |d: &MacvlanDriver, _: &IgnoredAny| {
        d.revoke_external_connectivity()
    })
    .await
}

async fn not_found(method: Method, uri: Uri) -> Response {
    warn!("[plugin] Not found: {} {}", method, uri);
    (StatusCode::NOT_FOUND, "404 page not found\n").into_response()
}

/// Serves the driver on a unix socket
pub struct PluginServer {
    socket_path: PathBuf,
    driver: SharedDriver,
}

impl PluginServer {
    pub fn new(socket_path: impl Into<PathBuf>, driver: SharedDriver) -> Self {
        Self {
            socket_path: socket_path.into(),
            driver,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale socket file from a previous run.
    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("could not create plugin directory {}", parent.display())
            })?;
        }
        if self.socket_path.exists() {
            debug!(
                "socket file [ {} ] already exists, unlinking the old file handle",
                self.socket_path.display()
            );
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!(
                    "unable to remove the old socket file {}",
                    self.socket_path.display()
                )
            })?;
        }
        UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))
    }

    /// Accept connections until `shutdown` resolves, then remove the socket.
    pub async fn serve<S>(&self, listener: UnixListener, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let app = create_router(Arc::clone(&self.driver));
        info!("Macvlan plugin listening on {}", self.socket_path.display());

        tokio::pin!(shutdown);
        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted.context("failed to accept connection")?,
                _ = &mut shutdown => break,
            };

            let tower_service = app.clone();
            tokio::spawn(async move {
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .await
                {
                    let err_str = err.to_string().to_lowercase();
                    if !err_str.contains("connection reset") && !err_str.contains("broken pipe") {
                        error!("Error serving connection: {}", err);
                    }
                }
            });
        }

        info!("Shutting down, removing {}", self.socket_path.display());
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("could not remove socket {}: {}", self.socket_path.display(), e);
        }
        Ok(())
    }

    /// Bind and serve until Ctrl-C or SIGTERM.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(term) => term,
        Err(e) => {
            warn!("could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term.recv() => {},
    }
}
