//! Inter-node HTTP helpers.
//!
//! All node-to-node traffic goes through the shared hyper client
//! with the configured timeout. Transport failures surface as
//! `Unavailable`; a non-2xx response is translated back into the
//! taxonomy kind the remote reported, so fan-out callers propagate
//! the first failed sub-request status unchanged.

use std::time::Duration;

use hyper::{Body, Method, Request, StatusCode};
use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};
use crate::node::NodeState;

const OCTET_STREAM: &str = "application/octet-stream";
const APPLICATION_JSON: &str = "application/json";

async fn send(
    state: &NodeState,
    req: Request<Body>,
) -> ServiceResult<(StatusCode, Vec<u8>)> {
    let url = req.uri().to_string();
    let timeout = Duration::from_secs(state.config.timeout);
    let response = tokio::time::timeout(timeout, state.client.request(req))
        .await
        .map_err(|_| ServiceError::Unavailable(format!("timeout for {}", url)))?
        .map_err(|err| ServiceError::Unavailable(format!("request to {} failed: {}", url, err)))?;

    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|err| ServiceError::Unavailable(format!("read from {} failed: {}", url, err)))?;
    Ok((status, body.to_vec()))
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

fn check_status(status: StatusCode, body: &[u8]) -> ServiceResult<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ServiceError::from_status(status, &error_message(body)))
    }
}

fn build_json(method: Method, url: &str, body: Option<&Value>) -> ServiceResult<Request<Body>> {
    let builder = Request::builder()
        .method(method)
        .uri(url)
        .header(hyper::header::CONTENT_TYPE, APPLICATION_JSON);
    let body = match body {
        Some(value) => Body::from(serde_json::to_vec(value).map_err(|err| {
            ServiceError::Internal(format!("serialize request body: {}", err))
        })?),
        None => Body::empty(),
    };
    builder
        .body(body)
        .map_err(|err| ServiceError::Internal(format!("build request: {}", err)))
}

pub async fn get_json(state: &NodeState, url: &str) -> ServiceResult<Value> {
    let req = build_json(Method::GET, url, None)?;
    let (status, body) = send(state, req).await?;
    check_status(status, &body)?;
    serde_json::from_slice(&body)
        .map_err(|err| ServiceError::Internal(format!("bad JSON from {}: {}", url, err)))
}

pub async fn post_json(state: &NodeState, url: &str, body: &Value) -> ServiceResult<Value> {
    let req = build_json(Method::POST, url, Some(body))?;
    let (status, data) = send(state, req).await?;
    check_status(status, &data)?;
    serde_json::from_slice(&data)
        .map_err(|err| ServiceError::Internal(format!("bad JSON from {}: {}", url, err)))
}

pub async fn put_json(state: &NodeState, url: &str, body: &Value) -> ServiceResult<Value> {
    let req = build_json(Method::PUT, url, Some(body))?;
    let (status, data) = send(state, req).await?;
    check_status(status, &data)?;
    serde_json::from_slice(&data)
        .map_err(|err| ServiceError::Internal(format!("bad JSON from {}: {}", url, err)))
}

pub async fn delete(state: &NodeState, url: &str, body: Option<&Value>) -> ServiceResult<()> {
    let req = build_json(Method::DELETE, url, body)?;
    let (status, data) = send(state, req).await?;
    check_status(status, &data)
}

/// Binary GET; a 404 means "never written" and is reported as `None`
/// rather than an error.
pub async fn get_binary(state: &NodeState, url: &str) -> ServiceResult<Option<Vec<u8>>> {
    let req = Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(Body::empty())
        .map_err(|err| ServiceError::Internal(format!("build request: {}", err)))?;
    let (status, body) = send(state, req).await?;
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    check_status(status, &body)?;
    Ok(Some(body))
}

pub async fn put_binary(state: &NodeState, url: &str, data: Vec<u8>) -> ServiceResult<()> {
    let req = Request::builder()
        .method(Method::PUT)
        .uri(url)
        .header(hyper::header::CONTENT_TYPE, OCTET_STREAM)
        .body(Body::from(data))
        .map_err(|err| ServiceError::Internal(format!("build request: {}", err)))?;
    let (status, body) = send(state, req).await?;
    check_status(status, &body)
}

/// Binary POST returning the raw response body.
pub async fn post_binary(state: &NodeState, url: &str, data: Vec<u8>) -> ServiceResult<Vec<u8>> {
    let req = Request::builder()
        .method(Method::POST)
        .uri(url)
        .header(hyper::header::CONTENT_TYPE, OCTET_STREAM)
        .body(Body::from(data))
        .map_err(|err| ServiceError::Internal(format!("build request: {}", err)))?;
    let (status, body) = send(state, req).await?;
    check_status(status, &body)?;
    Ok(body)
}

/// Binary POST where a 404 means "target never written".
pub async fn post_binary_opt(
    state: &NodeState,
    url: &str,
    data: Vec<u8>,
) -> ServiceResult<Option<Vec<u8>>> {
    let req = Request::builder()
        .method(Method::POST)
        .uri(url)
        .header(hyper::header::CONTENT_TYPE, OCTET_STREAM)
        .body(Body::from(data))
        .map_err(|err| ServiceError::Internal(format!("build request: {}", err)))?;
    let (status, body) = send(state, req).await?;
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    check_status(status, &body)?;
    Ok(Some(body))
}
