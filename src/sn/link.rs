//! Service-node link operations; all forwarded to the parent
//! group's owning data node.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::auth::{self, AclAction};
use crate::client;
use crate::domain as domain_util;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::node::NodeState;
use crate::server;

use super::{encode_param, validate_action};

fn links_url(state: &NodeState, group_id: &str, title: Option<&str>) -> ServiceResult<String> {
    let dn_url = state.dn_url_for(group_id)?;
    Ok(match title {
        Some(title) => format!("{}/groups/{}/links/{}", dn_url, group_id, encode_param(title)),
        None => format!("{}/groups/{}/links", dn_url, group_id),
    })
}

pub async fn get_links(
    state: &NodeState,
    req: &Request<Body>,
    group_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;

    let params = server::query_params(req);
    let mut url = links_url(state, group_id, None)?;
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

pub async fn get_link(
    state: &NodeState,
    req: &Request<Body>,
    group_id: &str,
    title: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;

    let rsp = client::get_json(state, &links_url(state, group_id, Some(title))?).await?;
    server::ok_json(&rsp)
}

pub async fn put_link(
    state: &NodeState,
    req: Request<Body>,
    group_id: &str,
    title: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let user = auth::authenticate(state, &req, false).await?;
    let domain_path = domain_util::domain_from_request(&req)?;
    validate_action(state, &domain_path, &user, AclAction::Create).await?;

    let body = server::read_json(req).await?;
    let link_body = if body.get("id").is_some() {
        json!({ "class": "H5L_TYPE_HARD", "id": body["id"] })
    } else if body.get("h5domain").is_some() {
        json!({
            "class": "H5L_TYPE_EXTERNAL",
            "h5domain": body["h5domain"],
            "h5path": body.get("h5path").cloned().unwrap_or(Value::Null),
        })
    } else if body.get("h5path").is_some() {
        json!({ "class": "H5L_TYPE_SOFT", "h5path": body["h5path"] })
    } else {
        return Err(ServiceError::BadRequest(
            "link body needs id, h5path or h5domain".to_string(),
        ));
    };

    let rsp = client::put_json(state, &links_url(state, group_id, Some(title))?, &link_body).await?;
    server::created_json(&rsp)
}

pub async fn delete_link(
    state: &NodeState,
    req: &Request<Body>,
    group_id: &str,
    title: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let user = auth::authenticate(state, req, false).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Delete).await?;

    client::delete(state, &links_url(state, group_id, Some(title))?, None).await?;
    server::ok_json(&json!({}))
}
