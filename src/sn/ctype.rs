//! Service-node committed datatype operations.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::auth::{self, AclAction};
use crate::client;
use crate::domain as domain_util;
use crate::dtype::DataType;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::index;
use crate::node::NodeState;
use crate::server;

use super::{get_object_json, group::create_object_with_link, validate_action};

pub async fn get_datatypes(state: &NodeState, req: &Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;

    let params = server::query_params(req);
    let index_key = domain_util::collection_index_key(&domain_path, "datatypes");
    let ids = index::list_ids(
        &state.storage,
        &index_key,
        params.get("Marker").map(String::as_str),
        params.get("Limit").and_then(|l| l.parse().ok()),
    )
    .await?;
    server::ok_json(&json!({ "datatypes": ids }))
}

/// POST /datatypes — commit a type: `{type, link?}`.
pub async fn post_datatype(state: &NodeState, req: Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, &req, false).await?;
    let domain_path = domain_util::domain_from_request(&req)?;
    let domain_json = validate_action(state, &domain_path, &user, AclAction::Create).await?;
    let root = domain_json
        .get("root")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("domain is a folder".to_string()))?
        .to_string();

    let body = server::read_json(req).await?;
    let type_json = body
        .get("type")
        .ok_or_else(|| ServiceError::BadRequest("missing type".to_string()))?;
    let dtype = DataType::from_json(type_json)?;
    if let DataType::Committed { .. } = dtype {
        return Err(ServiceError::BadRequest("cannot commit a committed type".to_string()));
    }

    let id = idutil::create_id(ObjClass::Datatype);
    let record = json!({
        "id": id,
        "root": root,
        "domain": domain_path,
        "type": dtype.to_json(),
        "attributes": {},
        "attributeCount": 0,
    });
    let created =
        create_object_with_link(state, ObjClass::Datatype, record, body.get("link")).await?;
    server::created_json(&created)
}

pub async fn get_datatype(
    state: &NodeState,
    req: &Request<Body>,
    ctype_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(ctype_id, Some(ObjClass::Datatype))?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;
    let obj = get_object_json(state, ctype_id).await?;
    server::ok_json(&obj)
}

pub async fn delete_datatype(
    state: &NodeState,
    req: &Request<Body>,
    ctype_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(ctype_id, Some(ObjClass::Datatype))?;
    let user = auth::authenticate(state, req, false).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Delete).await?;

    let dn_url = state.dn_url_for(ctype_id)?;
    client::delete(state, &format!("{}/datatypes/{}", dn_url, ctype_id), None).await?;
    server::ok_json(&json!({}))
}
