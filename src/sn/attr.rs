//! Service-node attribute operations; forwarded to the owning
//! object's data node.

use hyper::{Body, Request, Response};
use serde_json::json;

use crate::auth::{self, AclAction};
use crate::client;
use crate::domain as domain_util;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::node::NodeState;
use crate::server;

use super::{encode_param, validate_action};

fn attr_url(
    state: &NodeState,
    coll: &str,
    obj_id: &str,
    name: Option<&str>,
) -> ServiceResult<String> {
    let dn_url = state.dn_url_for(obj_id)?;
    Ok(match name {
        Some(name) => {
            format!("{}/{}/{}/attributes/{}", dn_url, coll, obj_id, encode_param(name))
        }
        None => format!("{}/{}/{}/attributes", dn_url, coll, obj_id),
    })
}

fn validate_target(coll: &str, obj_id: &str) -> ServiceResult<()> {
    let class = ObjClass::from_collection(coll)
        .filter(|class| *class != ObjClass::Chunk)
        .ok_or_else(|| ServiceError::BadRequest(format!("bad collection: {}", coll)))?;
    idutil::validate_id(obj_id, Some(class))
}

pub async fn get_attributes(
    state: &NodeState,
    req: &Request<Body>,
    coll: &str,
    obj_id: &str,
) -> ServiceResult<Response<Body>> {
    validate_target(coll, obj_id)?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;

    let params = server::query_params(req);
    let mut url = attr_url(state, coll, obj_id, None)?;
    let mut sep = '?';
    for key in &["Marker", "Limit"] {
        if let Some(value) = params.get(*key) {
            url.push(sep);
            url.push_str(&format!("{}={}", key, encode_param(value)));
            sep = '&';
        }
    }
    let rsp = client::get_json(state, &url).await?;
    server::ok_json(&rsp)
}

pub async fn get_attribute(
    state: &NodeState,
    req: &Request<Body>,
    coll: &str,
    obj_id: &str,
    name: &str,
) -> ServiceResult<Response<Body>> {
    validate_target(coll, obj_id)?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;

    let rsp = client::get_json(state, &attr_url(state, coll, obj_id, Some(name))?).await?;
    server::ok_json(&rsp)
}

pub async fn put_attribute(
    state: &NodeState,
    req: Request<Body>,
    coll: &str,
    obj_id: &str,
    name: &str,
) -> ServiceResult<Response<Body>> {
    validate_target(coll, obj_id)?;
    let user = auth::authenticate(state, &req, false).await?;
    let domain_path = domain_util::domain_from_request(&req)?;
    validate_action(state, &domain_path, &user, AclAction::Create).await?;

    let body = server::read_json(req).await?;
    let rsp = client::put_json(state, &attr_url(state, coll, obj_id, Some(name))?, &body).await?;
    server::created_json(&rsp)
}

pub async fn delete_attribute(
    state: &NodeState,
    req: &Request<Body>,
    coll: &str,
    obj_id: &str,
    name: &str,
) -> ServiceResult<Response<Body>> {
    validate_target(coll, obj_id)?;
    let user = auth::authenticate(state, req, false).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Delete).await?;

    client::delete(state, &attr_url(state, coll, obj_id, Some(name))?, None).await?;
    server::ok_json(&json!({}))
}
