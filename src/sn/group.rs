//! Service-node group operations.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::auth::{self, AclAction};
use crate::client;
use crate::domain as domain_util;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::index;
use crate::node::NodeState;
use crate::server;

use super::{get_object_json, validate_action};

/// Create an object record on its owning data node, applying an
/// optional parent link. When the parent group hashes to the same
/// data node the link rides along in the create body; otherwise the
/// link is a second request to the parent's node, and a title
/// conflict unwinds the fresh object so the client never observes a
/// half-created pair.
pub async fn create_object_with_link(
    state: &NodeState,
    class: ObjClass,
    mut record: Value,
    link: Option<&Value>,
) -> ServiceResult<Value> {
    let id = record["id"].as_str().unwrap_or_default().to_string();
    let dn_url = state.dn_url_for(&id)?;
    let create_url = format!("{}/{}", dn_url, class.collection());

    let link = match link {
        None => {
            return client::post_json(state, &create_url, &record).await;
        }
        Some(link) => link,
    };

    let parent_id = link
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("link has no parent id".to_string()))?
        .to_string();
    idutil::validate_id(&parent_id, Some(ObjClass::Group))?;
    let title = link
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .ok_or_else(|| ServiceError::BadRequest("link has no usable name".to_string()))?
        .to_string();

    let dn_count = state.dn_urls.read().unwrap().len();
    if dn_count == 0 {
        return Err(ServiceError::Unavailable("cluster not ready".to_string()));
    }

    if idutil::partition(&parent_id, dn_count) == idutil::partition(&id, dn_count) {
        record["link"] = json!({ "id": parent_id, "name": title });
        return client::post_json(state, &create_url, &record).await;
    }

    // cross-node: create first, then link, unwinding on conflict
    let created = client::post_json(state, &create_url, &record).await?;
    let parent_url = state.dn_url_for(&parent_id)?;
    let link_url = format!(
        "{}/groups/{}/links/{}",
        parent_url,
        parent_id,
        super::encode_param(&title)
    );
    let link_body = json!({ "class": "H5L_TYPE_HARD", "id": id });
    if let Err(err) = client::put_json(state, &link_url, &link_body).await {
        log::warn!("link {} on {} failed, removing fresh object {}", title, parent_id, id);
        let _ = client::delete(state, &format!("{}/{}/{}", dn_url, class.collection(), id), None)
            .await;
        return Err(err);
    }
    Ok(created)
}

fn domain_root(domain_json: &Value) -> ServiceResult<String> {
    domain_json
        .get("root")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::BadRequest("domain is a folder".to_string()))
}

/// GET /groups — ids in the domain, from the collection index.
pub async fn get_groups(state: &NodeState, req: &Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    let domain_json = validate_action(state, &domain_path, &user, AclAction::Read).await?;
    let root = domain_root(&domain_json)?;

    let params = server::query_params(req);
    let index_key = domain_util::collection_index_key(&domain_path, "groups");
    let mut ids = index::list_ids(
        &state.storage,
        &index_key,
        params.get("Marker").map(String::as_str),
        params.get("Limit").and_then(|l| l.parse().ok()),
    )
    .await?;
    ids.retain(|id| *id != root);
    server::ok_json(&json!({ "groups": ids }))
}

/// POST /groups — create, with optional `{link: {id, name}}`.
pub async fn post_group(state: &NodeState, req: Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, &req, false).await?;
    let domain_path = domain_util::domain_from_request(&req)?;
    let domain_json = validate_action(state, &domain_path, &user, AclAction::Create).await?;
    let root = domain_root(&domain_json)?;

    let body = match server::read_body(req).await {
        Ok(data) if data.is_empty() => json!({}),
        Ok(data) => serde_json::from_slice(&data)
            .map_err(|err| ServiceError::BadRequest(format!("malformed JSON body: {}", err)))?,
        Err(err) => return Err(err),
    };

    let id = idutil::create_id(ObjClass::Group);
    let record = json!({
        "id": id,
        "root": root,
        "domain": domain_path,
        "links": {},
        "attributes": {},
        "linkCount": 0,
        "attributeCount": 0,
    });
    let created =
        create_object_with_link(state, ObjClass::Group, record, body.get("link")).await?;
    server::created_json(&created)
}

pub async fn get_group(
    state: &NodeState,
    req: &Request<Body>,
    group_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;
    let obj = get_object_json(state, group_id).await?;
    server::ok_json(&obj)
}

pub async fn delete_group(
    state: &NodeState,
    req: &Request<Body>,
    group_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let user = auth::authenticate(state, req, false).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    let domain_json = validate_action(state, &domain_path, &user, AclAction::Delete).await?;

    if domain_json.get("root").and_then(Value::as_str) == Some(group_id) {
        return Err(ServiceError::Forbidden);
    }

    let dn_url = state.dn_url_for(group_id)?;
    client::delete(state, &format!("{}/groups/{}", dn_url, group_id), None).await?;
    server::ok_json(&json!({}))
}
