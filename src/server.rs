//! HTTP server plumbing shared by all three node roles.
//!
//! A role supplies a router function; the wrapper applies the active
//! task gate, request/response logging and the uniform rendering of
//! `ServiceError` into a JSON error body.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{format_err, Error};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use url::form_urlencoded;

use crate::error::{ServiceError, ServiceResult};
use crate::node::NodeState;
use crate::store::unix_now;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ServiceResult<Response<Body>>> + Send>>;
pub type Router =
    Arc<dyn Fn(Arc<NodeState>, Request<Body>, SocketAddr) -> HandlerFuture + Send + Sync>;

pub fn json_response(status: StatusCode, value: &Value) -> ServiceResult<Response<Body>> {
    let data = serde_json::to_vec(value)
        .map_err(|err| ServiceError::Internal(format!("serialize response: {}", err)))?;
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(data))
        .map_err(|err| ServiceError::Internal(format!("build response: {}", err)))
}

pub fn ok_json(value: &Value) -> ServiceResult<Response<Body>> {
    json_response(StatusCode::OK, value)
}

pub fn created_json(value: &Value) -> ServiceResult<Response<Body>> {
    json_response(StatusCode::CREATED, value)
}

pub fn binary_response(data: Vec<u8>) -> ServiceResult<Response<Body>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
        .header(hyper::header::CONTENT_LENGTH, data.len())
        .body(Body::from(data))
        .map_err(|err| ServiceError::Internal(format!("build response: {}", err)))
}

fn error_response(err: &ServiceError) -> Response<Body> {
    let status = err.status();
    let body = json!({ "error": err.to_string() });
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Query string as a map; later duplicates win.
pub fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = req.uri().query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            params.insert(key.into_owned(), value.into_owned());
        }
    }
    params
}

pub async fn read_body(req: Request<Body>) -> ServiceResult<Vec<u8>> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|err| ServiceError::BadRequest(format!("read request body: {}", err)))?;
    Ok(body.to_vec())
}

pub async fn read_json(req: Request<Body>) -> ServiceResult<Value> {
    let data = read_body(req).await?;
    if data.is_empty() {
        return Err(ServiceError::BadRequest("expected request body".to_string()));
    }
    serde_json::from_slice(&data)
        .map_err(|err| ServiceError::BadRequest(format!("malformed JSON body: {}", err)))
}

/// Require an `application/octet-stream` content type on binary
/// transfer endpoints.
pub fn check_binary_content_type(req: &Request<Body>) -> ServiceResult<()> {
    match req.headers().get(hyper::header::CONTENT_TYPE) {
        None => Ok(()),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ServiceError::BadRequest("bad content-type".to_string()))?;
            if value == "application/octet-stream" {
                Ok(())
            } else {
                Err(ServiceError::BadRequest(format!("unexpected content type: {}", value)))
            }
        }
    }
}

/// `GET /info` body, common to every role.
pub fn node_info(state: &NodeState) -> Value {
    json!({
        "id": state.id,
        "node_type": state.role.as_str(),
        "node_state": state.status().as_str(),
        "node_number": state.node_number(),
        "node_count": state.node_count(),
        "start_time": state.start_time,
        "up_time": unix_now().saturating_sub(state.start_time),
        "active_task_count": state.active_task_count(),
    })
}

async fn handle(
    state: Arc<NodeState>,
    router: Router,
    req: Request<Body>,
    peer: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    log::info!("REQ {} {} from {}", method, path, peer);

    let _guard = match state.begin_task() {
        Some(guard) => guard,
        None => {
            let err = ServiceError::Unavailable("active task limit reached".to_string());
            log::warn!("RSP {} {} <{}>", method, path, err.status());
            return Ok(error_response(&err));
        }
    };

    let response = match (*router)(state, req, peer).await {
        Ok(response) => response,
        Err(err) => {
            match err {
                ServiceError::Internal(_) | ServiceError::Unavailable(_) => {
                    log::error!("{} {} failed: {}", method, path, err)
                }
                _ => log::warn!("{} {}: {}", method, path, err),
            }
            error_response(&err)
        }
    };
    log::info!("RSP {} {} <{}>", method, path, response.status().as_u16());
    Ok(response)
}

/// Bind and spawn the server; returns the bound address (useful with
/// an ephemeral port) and the serve task.
pub fn spawn(
    state: Arc<NodeState>,
    router: Router,
    port: u16,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let router = router.clone();
        let peer = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle(state.clone(), router.clone(), req, peer)
            }))
        }
    });
    let server = Server::try_bind(&addr)
        .map_err(|err| format_err!("unable to bind {}: {}", addr, err))?
        .serve(make);
    let local_addr = server.local_addr();
    let task = tokio::spawn(async move {
        if let Err(err) = server.await {
            log::error!("server error: {}", err);
        }
    });
    log::info!("listening on {}", local_addr);
    Ok((local_addr, task))
}
