// HTTP front end
// Routes JSON requests to the Authority and turns every error into a short
// {"error": ...} body with a matching status.
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::protocol::Authority;

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, authority: Arc<Authority>, shutdown: F) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let authority = authority.clone();
        let peer = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(authority.clone(), peer, req)))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("Server running on http://{}", addr);

    server.with_graceful_shutdown(shutdown).await
}

pub async fn handle_request(
    authority: Arc<Authority>,
    peer: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match route(&authority, peer, req).await {
        Ok(response) => Ok(response),
        Err(err) => {
            match &err {
                Error::Internal(detail) => error!(%method, %path, "request failed: {}", detail),
                other => debug!(%method, %path, "request rejected: {}", other),
            }
            Ok(error_response(&err))
        }
    }
}

async fn route(authority: &Authority, peer: SocketAddr, req: Request<Body>) -> Result<Response<Body>> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/a/session") => {
            let body = read_json(req).await?;
            Ok(json_response(&authority.start_session(body).await?))
        }
        (&Method::DELETE, "/a/session") => {
            let body = read_json(req).await?;
            Ok(json_response(&authority.stop_session(body)))
        }
        (&Method::PUT, "/a/session/challenge") => {
            let ip = client_ip(&req, peer)?;
            let body = read_json(req).await?;
            Ok(json_response(&authority.complete_session(body, ip).await?))
        }
        (&Method::POST, "/a/session/refresh") => {
            let body = read_json(req).await?;
            Ok(json_response(&authority.refresh_session(body)?))
        }
        (&Method::PUT, "/a/register") => {
            let body = read_json(req).await?;
            Ok(json_response(&authority.begin_registration(body).await?))
        }
        (&Method::PUT, "/a/register/challenge") => {
            let body = read_json(req).await?;
            Ok(json_response(&authority.complete_registration(body).await?))
        }
        (&Method::POST, "/a/sign") => {
            let body = read_json(req).await?;
            Ok(json_response(&authority.add_signature(body).await?))
        }
        (&Method::GET, "/a/signatures") => {
            let key = query_param(&req, "key").ok_or_else(|| Error::invalid("missing key"))?;
            Ok(json_response(&authority.signatures(&key).await?))
        }
        (&Method::GET, "/a/sessions") => {
            let query = query_param(&req, "q");
            Ok(json_response(&authority.sessions(query.as_deref())))
        }
        (&Method::GET, "/a/keys") => {
            let query = query_param(&req, "q");
            Ok(json_response(&authority.keys(query.as_deref()).await?))
        }
        (&Method::GET, "/a/identity") => Ok(json_response(authority.identity())),
        _ => Err(Error::NotFound("document")),
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T> {
    let body_bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| Error::invalid(format!("could not read request: {e}")))?;
    serde_json::from_slice(&body_bytes).map_err(|e| Error::invalid(format!("invalid request: {e}")))
}

fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    let query = req.uri().query().unwrap_or_default();
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// First `X-Forwarded-For` hop when present, otherwise the TCP peer.
fn client_ip(req: &Request<Body>, peer: SocketAddr) -> Result<IpAddr> {
    match req.headers().get("x-forwarded-for") {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| Error::invalid("invalid IP")),
        None => Ok(peer.ip()),
    }
}

fn json_response<T: Serialize>(data: &T) -> Response<Body> {
    match serde_json::to_string(data) {
        Ok(json) => with_status(StatusCode::OK, json),
        Err(e) => error_response(&Error::from(e)),
    }
}

fn error_response(err: &Error) -> Response<Body> {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let json_response = serde_json::json!({
        "error": err.public_message()
    });
    with_status(status, json_response.to_string())
}

fn with_status(status: StatusCode, json: String) -> Response<Body> {
    let mut response = Response::new(Body::from(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
