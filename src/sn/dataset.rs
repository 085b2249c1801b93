//! Service-node dataset operations: create (type resolution, shape
//! validation, chunk layout selection), metadata reads, resize and
//! delete.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::auth::{self, AclAction};
use crate::client;
use crate::domain as domain_util;
use crate::dtype::{DataType, Shape};
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::index;
use crate::layout;
use crate::node::NodeState;
use crate::server;

use super::{get_object_json, group::create_object_with_link, validate_action};

pub async fn get_datasets(state: &NodeState, req: &Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;

    let params = server::query_params(req);
    let index_key = domain_util::collection_index_key(&domain_path, "datasets");
    let ids = index::list_ids(
        &state.storage,
        &index_key,
        params.get("Marker").map(String::as_str),
        params.get("Limit").and_then(|l| l.parse().ok()),
    )
    .await?;
    server::ok_json(&json!({ "datasets": ids }))
}

/// Resolve the request's type descriptor; a committed type id is
/// fetched and replaced by its stored definition.
async fn resolve_type(state: &NodeState, type_json: &Value) -> ServiceResult<DataType> {
    let dtype = DataType::from_json(type_json)?;
    if let DataType::Committed { id } = &dtype {
        idutil::validate_id(id, Some(ObjClass::Datatype))?;
        let ctype_json = get_object_json(state, id).await?;
        let stored = ctype_json
            .get("type")
            .ok_or_else(|| ServiceError::Internal("committed type has no definition".to_string()))?;
        return DataType::from_json(stored);
    }
    Ok(dtype)
}

fn shape_from_body(body: &Value) -> ServiceResult<Shape> {
    let shape_json = match body.get("shape") {
        None => return Ok(Shape::Scalar),
        Some(shape_json) => shape_json,
    };
    let shape = Shape::from_json(shape_json)?;
    match (shape, body.get("maxdims")) {
        (Shape::Simple { dims, maxdims: None }, Some(maxdims_json)) => {
            let merged = json!({
                "class": "H5S_SIMPLE",
                "dims": dims,
                "maxdims": maxdims_json,
            });
            Shape::from_json(&merged)
        }
        (shape, _) => Ok(shape),
    }
}

fn layout_dims_from_body(body: &Value) -> Option<Vec<u64>> {
    let layout = body
        .get("layout")
        .or_else(|| body.get("creationProperties").and_then(|props| props.get("layout")))?;
    let dims = layout.get("dims").or(Some(layout))?;
    dims.as_array()
        .map(|dims| dims.iter().filter_map(Value::as_u64).collect::<Vec<u64>>())
        .filter(|dims| !dims.is_empty())
}

/// POST /datasets — `{type, shape?, maxdims?, layout?,
/// creationProperties?, link?}`.
pub async fn post_dataset(state: &NodeState, req: Request<Body>) -> ServiceResult<Response<Body>> {
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
    let dtype = resolve_type(state, type_json).await?;
    let itemsize = dtype.item_size().ok_or_else(|| {
        ServiceError::BadRequest("variable width types not supported for datasets".to_string())
    })?;

    let shape = shape_from_body(&body)?;
    if shape == Shape::Null {
        return Err(ServiceError::BadRequest("cannot create dataset with null shape".to_string()));
    }
    let dims = shape.value_dims().unwrap();

    let layout_dims = match &shape {
        Shape::Scalar => vec![1],
        _ => match layout_dims_from_body(&body) {
            Some(user_dims) => layout::validate_layout(
                &user_dims,
                &dims,
                itemsize,
                state.config.min_chunk_size,
                state.config.max_chunk_size,
            )?,
            None => layout::guess_chunk(&dims, itemsize)?,
        },
    };

    let creation_props = body
        .get("creationProperties")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let id = idutil::create_id(ObjClass::Dataset);
    let record = json!({
        "id": id,
        "root": root,
        "domain": domain_path,
        "type": dtype.to_json(),
        "shape": shape.to_json(),
        "layout": { "class": "H5D_CHUNKED", "dims": layout_dims },
        "creationProperties": creation_props,
        "attributes": {},
        "attributeCount": 0,
    });
    let created =
        create_object_with_link(state, ObjClass::Dataset, record, body.get("link")).await?;
    server::created_json(&created)
}

pub async fn get_dataset(
    state: &NodeState,
    req: &Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(dset_id, Some(ObjClass::Dataset))?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;
    let obj = get_object_json(state, dset_id).await?;
    server::ok_json(&obj)
}

pub async fn delete_dataset(
    state: &NodeState,
    req: &Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(dset_id, Some(ObjClass::Dataset))?;
    let user = auth::authenticate(state, req, false).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Delete).await?;

    let dn_url = state.dn_url_for(dset_id)?;
    client::delete(state, &format!("{}/datasets/{}", dn_url, dset_id), None).await?;
    server::ok_json(&json!({}))
}

pub async fn get_shape(
    state: &NodeState,
    req: &Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(dset_id, Some(ObjClass::Dataset))?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;
    let obj = get_object_json(state, dset_id).await?;
    server::ok_json(&json!({ "shape": obj["shape"] }))
}

/// PUT /datasets/{id}/shape — resize within maxdims.
pub async fn put_shape(
    state: &NodeState,
    req: Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(dset_id, Some(ObjClass::Dataset))?;
    let user = auth::authenticate(state, &req, false).await?;
    let domain_path = domain_util::domain_from_request(&req)?;
    validate_action(state, &domain_path, &user, AclAction::Update).await?;

    let body = server::read_json(req).await?;
    if body.get("shape").is_none() {
        return Err(ServiceError::BadRequest("missing shape".to_string()));
    }

    let dn_url = state.dn_url_for(dset_id)?;
    let rsp =
        client::put_json(state, &format!("{}/datasets/{}/shape", dn_url, dset_id), &body).await?;
    server::created_json(&rsp)
}

pub async fn get_type(
    state: &NodeState,
    req: &Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(dset_id, Some(ObjClass::Dataset))?;
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;
    let obj = get_object_json(state, dset_id).await?;
    server::ok_json(&json!({ "type": obj["type"] }))
}
