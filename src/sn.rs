//! Service node: the public REST surface.
//!
//! Every request runs the same pipeline: parse the target domain,
//! authenticate, resolve the domain record from its owning data
//! node, check the ACL, then route. Service nodes hold no
//! authoritative state; the domain cache here is advisory and is
//! bypassed on every mutating path.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;

use crate::auth::{self, AclAction};
use crate::client;
use crate::domain as domain_util;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::node::NodeState;
use crate::server::{self, HandlerFuture, Router};

pub mod attr;
pub mod ctype;
pub mod dataset;
pub mod domain;
pub mod group;
pub mod link;
pub mod value;

pub fn encode_param(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Resolve the domain record from its owning data node. The local
/// cache is only consulted when the caller allows it (object reads);
/// mutating paths always revalidate.
pub async fn get_domain_json(
    state: &NodeState,
    domain_path: &str,
    allow_cached: bool,
) -> ServiceResult<Value> {
    let domain_key = domain_util::domain_key(domain_path);
    if allow_cached {
        if let Some(value) = state.domain_cache.lock().unwrap().get(&domain_key) {
            return Ok(value);
        }
    }
    let dn_url = state.dn_url_for(&domain_key)?;
    let url = format!("{}/domains?domain={}", dn_url, encode_param(domain_path));
    let domain_json = client::get_json(state, &url).await?;
    state.domain_cache.lock().unwrap().insert(&domain_key, domain_json.clone());
    Ok(domain_json)
}

pub fn invalidate_domain(state: &NodeState, domain_path: &str) {
    let domain_key = domain_util::domain_key(domain_path);
    state.domain_cache.lock().unwrap().remove(&domain_key);
}

/// Object record from its owning data node.
pub async fn get_object_json(state: &NodeState, id: &str) -> ServiceResult<Value> {
    let class = idutil::class_of(id)
        .filter(|class| *class != ObjClass::Chunk)
        .ok_or_else(|| ServiceError::BadRequest(format!("invalid object id: {}", id)))?;
    let dn_url = state.dn_url_for(id)?;
    let url = format!("{}/{}/{}", dn_url, class.collection(), id);
    client::get_json(state, &url).await
}

/// The domain-level authorization gate: resolve the record and check
/// the requested action for the user. Returns the domain record for
/// further use.
pub async fn validate_action(
    state: &NodeState,
    domain_path: &str,
    user: &str,
    action: AclAction,
) -> ServiceResult<Value> {
    let allow_cached = action == AclAction::Read;
    let domain_json = get_domain_json(state, domain_path, allow_cached).await?;
    auth::acl_check(&domain_json, action, user)?;
    Ok(domain_json)
}

fn decode_segment(seg: &str) -> ServiceResult<String> {
    percent_decode_str(seg)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| ServiceError::BadRequest(format!("bad path segment: {}", seg)))
}

async fn route(state: Arc<NodeState>, req: Request<Body>) -> ServiceResult<Response<Body>> {
    let path = req.uri().path().to_string();
    let mut segments = Vec::new();
    for seg in path.split('/').filter(|seg| !seg.is_empty()) {
        segments.push(decode_segment(seg)?);
    }
    let segs: Vec<&str> = segments.iter().map(String::as_str).collect();
    let method = req.method().clone();

    match (&method, segs.as_slice()) {
        (&Method::GET, ["info"]) => server::ok_json(&server::node_info(&state)),

        (&Method::GET, []) => domain::get_domain(&state, &req).await,
        (&Method::PUT, []) => domain::put_domain(&state, req).await,
        (&Method::DELETE, []) => domain::delete_domain(&state, &req).await,
        (&Method::GET, ["domains"]) => domain::get_domains(&state, &req).await,

        (&Method::GET, ["acls"]) => domain::get_acls(&state, &req).await,
        (&Method::GET, ["acls", user]) => domain::get_acl(&state, &req, user).await,
        (&Method::PUT, ["acls", user]) => {
            let user = user.to_string();
            domain::put_acl(&state, req, &user).await
        }
        (&Method::DELETE, ["acls", user]) => domain::delete_acl(&state, &req, user).await,

        (&Method::GET, ["groups"]) => group::get_groups(&state, &req).await,
        (&Method::POST, ["groups"]) => group::post_group(&state, req).await,
        (&Method::GET, ["groups", id]) => group::get_group(&state, &req, id).await,
        (&Method::DELETE, ["groups", id]) => group::delete_group(&state, &req, id).await,

        (&Method::GET, ["groups", id, "links"]) => link::get_links(&state, &req, id).await,
        (&Method::GET, ["groups", id, "links", title]) => {
            link::get_link(&state, &req, id, title).await
        }
        (&Method::PUT, ["groups", id, "links", title]) => {
            let (id, title) = (id.to_string(), title.to_string());
            link::put_link(&state, req, &id, &title).await
        }
        (&Method::DELETE, ["groups", id, "links", title]) => {
            link::delete_link(&state, &req, id, title).await
        }

        (&Method::GET, [coll, id, "attributes"]) if ObjClass::from_collection(coll).is_some() => {
            attr::get_attributes(&state, &req, coll, id).await
        }
        (&Method::GET, [coll, id, "attributes", name])
            if ObjClass::from_collection(coll).is_some() =>
        {
            attr::get_attribute(&state, &req, coll, id, name).await
        }
        (&Method::PUT, [coll, id, "attributes", name])
            if ObjClass::from_collection(coll).is_some() =>
        {
            let (coll, id, name) = (coll.to_string(), id.to_string(), name.to_string());
            attr::put_attribute(&state, req, &coll, &id, &name).await
        }
        (&Method::DELETE, [coll, id, "attributes", name])
            if ObjClass::from_collection(coll).is_some() =>
        {
            attr::delete_attribute(&state, &req, coll, id, name).await
        }

        (&Method::GET, ["datasets"]) => dataset::get_datasets(&state, &req).await,
        (&Method::POST, ["datasets"]) => dataset::post_dataset(&state, req).await,
        (&Method::GET, ["datasets", id]) => dataset::get_dataset(&state, &req, id).await,
        (&Method::DELETE, ["datasets", id]) => dataset::delete_dataset(&state, &req, id).await,
        (&Method::GET, ["datasets", id, "shape"]) => dataset::get_shape(&state, &req, id).await,
        (&Method::PUT, ["datasets", id, "shape"]) => {
            let id = id.to_string();
            dataset::put_shape(&state, req, &id).await
        }
        (&Method::GET, ["datasets", id, "type"]) => dataset::get_type(&state, &req, id).await,

        (&Method::GET, ["datasets", id, "value"]) => value::get_value(&state, &req, id).await,
        (&Method::PUT, ["datasets", id, "value"]) => {
            let id = id.to_string();
            value::put_value(&state, req, &id).await
        }
        (&Method::POST, ["datasets", id, "value"]) => {
            let id = id.to_string();
            value::post_value(&state, req, &id).await
        }

        (&Method::GET, ["datatypes"]) => ctype::get_datatypes(&state, &req).await,
        (&Method::POST, ["datatypes"]) => ctype::post_datatype(&state, req).await,
        (&Method::GET, ["datatypes", id]) => ctype::get_datatype(&state, &req, id).await,
        (&Method::DELETE, ["datatypes", id]) => ctype::delete_datatype(&state, &req, id).await,

        _ => Err(ServiceError::NotFound),
    }
}

pub fn router() -> Router {
    Arc::new(|state: Arc<NodeState>, req: Request<Body>, _peer: SocketAddr| -> HandlerFuture {
        Box::pin(route(state, req))
    })
}
