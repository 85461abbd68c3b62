use crate::error::{json_error_response, Error, ErrorCode, Lookup, Result};
use crate::keyspace::SourceIdentity;
use crate::reconcile::{NewRoute, RouteManager};
use crate::users::CredentialStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Version information for the control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub password: String,
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn ok_json<T: Serialize>(status: StatusCode, data: T) -> Response<Full<Bytes>> {
    match serde_json::to_string(&ApiResponse::ok(data)) {
        Ok(body) => json_response(status, body),
        Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
    }
}

fn unauthorized(realm: &str) -> Response<Full<Bytes>> {
    let mut response = json_error_response(ErrorCode::Unauthorized, "unauthorized");
    if let Ok(value) = format!("Basic realm=\"{}\"", realm).parse() {
        response.headers_mut().insert(WWW_AUTHENTICATE, value);
    }
    response
}

/// Collaborators shared by every request
pub struct AdminState {
    routes: RouteManager,
    users: CredentialStore,
    realm: String,
}

impl AdminState {
    pub fn new(routes: RouteManager, users: CredentialStore, realm: impl Into<String>) -> Self {
        Self {
            routes,
            users,
            realm: realm.into(),
        }
    }
}

/// JSON admin API over routes, services and credentials
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "Admin API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_connection(tls_stream, state).await {
                                                debug!(addr = %addr, error = %e, "Admin TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "Admin TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(handle_request(req, &state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

/// Username and password from an `Authorization: Basic` header
fn basic_credentials<B>(req: &Request<B>) -> Option<(String, String)> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn query_params(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((form_decode(key)?, form_decode(value)?))
        })
        .collect()
}

/// application/x-www-form-urlencoded component: '+' is a space
fn form_decode(component: &str) -> Option<String> {
    urlencoding::decode(&component.replace('+', " "))
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Route identity from `?host=&path=`; path defaults to `/`
fn source_from_query(query: Option<&str>) -> Option<SourceIdentity> {
    let params = query_params(query);
    let host = params.get("host").filter(|h| !h.trim().is_empty())?;
    Some(SourceIdentity::new(host, params.get("path").map(String::as_str)))
}

async fn read_json<T, B>(req: Request<B>) -> std::result::Result<T, Response<Full<Bytes>>>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| json_error_response(ErrorCode::BadRequest, format!("Failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| json_error_response(ErrorCode::BadRequest, format!("Invalid JSON: {}", e)))
}

/// Dispatch one admin request; every failure is rendered as a JSON error
pub async fn handle_request<B>(req: Request<B>, state: &AdminState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    // Health check and version need no credentials
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return json_response(StatusCode::OK, r#"{"status":"ok"}"#),
        (&Method::GET, "/version") => {
            let version = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, version.to_string());
        }
        _ => {}
    }

    let Some((user, password)) = basic_credentials(&req) else {
        warn!(%path, "Admin API request without credentials");
        return unauthorized(&state.realm);
    };
    match state.users.login(&user, &password).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(%path, user, "Unauthorized admin API request");
            return unauthorized(&state.realm);
        }
        Err(e) => {
            error!(error = %e, "Credential check failed");
            return Response::from(&e);
        }
    }

    let result = match (method, path.as_str()) {
        (Method::GET, "/api/services") => state
            .routes
            .list_services()
            .await
            .map(|services| ok_json(StatusCode::OK, services)),

        (Method::GET, "/api/routes") => state
            .routes
            .list_routes()
            .await
            .map(|routes| ok_json(StatusCode::OK, routes)),
        (Method::GET, "/api/routes/orphaned") => state
            .routes
            .orphaned_routes()
            .await
            .map(|routes| ok_json(StatusCode::OK, routes)),
        (Method::POST, "/api/routes") => {
            let route: NewRoute = match read_json(req).await {
                Ok(route) => route,
                Err(response) => return response,
            };
            let source = route.source();
            match state.routes.add_route(route).await {
                Ok(()) => get_route(state, &source, StatusCode::CREATED).await,
                Err(e) => Err(e),
            }
        }

        (method, "/api/route") => {
            let Some(source) = source_from_query(req.uri().query()) else {
                return json_error_response(ErrorCode::BadRequest, "missing 'host' query parameter");
            };
            match method {
                Method::GET => get_route(state, &source, StatusCode::OK).await,
                Method::PUT => {
                    let route: NewRoute = match read_json(req).await {
                        Ok(route) => route,
                        Err(response) => return response,
                    };
                    let updated = route.source();
                    match state.routes.update_route(&source, route).await {
                        Ok(()) => get_route(state, &updated, StatusCode::OK).await,
                        Err(e) => Err(e),
                    }
                }
                Method::DELETE => state
                    .routes
                    .delete_route(&source)
                    .await
                    .map(|()| ok_json(StatusCode::OK, serde_json::json!({ "deleted": source.to_string() }))),
                _ => return json_error_response(ErrorCode::NotFound, "Not found"),
            }
        }

        (Method::GET, "/api/users") => state
            .users
            .lookup("")
            .await
            .map(|users| ok_json(StatusCode::OK, users)),
        (method, p) if p.starts_with("/api/users/") => {
            let name = p.strip_prefix("/api/users/").unwrap_or("");
            let name = match urlencoding::decode(name) {
                Ok(name) if !name.is_empty() && !name.contains('/') => name.into_owned(),
                _ => return json_error_response(ErrorCode::BadRequest, "Invalid username"),
            };
            match method {
                Method::GET => match state.users.get(&name).await {
                    Ok(Lookup::Found(username)) => {
                        Ok(ok_json(StatusCode::OK, serde_json::json!({ "username": username })))
                    }
                    Ok(Lookup::NotFound) => Err(Error::UserNotFound(name)),
                    Err(e) => Err(e),
                },
                Method::PUT => {
                    let body: SetPasswordRequest = match read_json(req).await {
                        Ok(body) => body,
                        Err(response) => return response,
                    };
                    state
                        .users
                        .insert(&name, &body.password)
                        .await
                        .map(|()| ok_json(StatusCode::OK, serde_json::json!({ "username": name })))
                }
                Method::DELETE => match state.users.delete(&name).await {
                    Ok(true) => Ok(ok_json(StatusCode::OK, serde_json::json!({ "deleted": name }))),
                    Ok(false) => Err(Error::UserNotFound(name)),
                    Err(e) => Err(e),
                },
                _ => return json_error_response(ErrorCode::NotFound, "Not found"),
            }
        }

        _ => return json_error_response(ErrorCode::NotFound, "Not found"),
    };

    result.unwrap_or_else(|e| {
        match e.code() {
            ErrorCode::NotFound | ErrorCode::ValidationFailed | ErrorCode::SourceExists => {
                debug!(%path, error = %e, "Admin API request rejected")
            }
            _ => error!(%path, error = %e, "Admin API error"),
        }
        Response::from(&e)
    })
}

async fn get_route(
    state: &AdminState,
    source: &SourceIdentity,
    status: StatusCode,
) -> Result<Response<Full<Bytes>>> {
    state
        .routes
        .get_route(source)
        .await?
        .map(|route| ok_json(status, route))
        .or_else_err(|| Error::RouteNotFound(source.to_string()))
}
