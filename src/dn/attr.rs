//! Attribute handlers. Attributes are small named values stored
//! inside the owning object's record (`attributes` map); their values
//! travel as JSON, so variable width types are fine here.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::dtype::{DataType, Shape};
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::node::NodeState;
use crate::server;
use crate::store::unix_now;

use super::{get_metadata_obj, save_metadata_obj};

fn validate_target(coll: &str, obj_id: &str) -> ServiceResult<()> {
    let class = ObjClass::from_collection(coll)
        .filter(|class| *class != ObjClass::Chunk)
        .ok_or_else(|| ServiceError::BadRequest(format!("bad collection: {}", coll)))?;
    idutil::validate_id(obj_id, Some(class))
}

fn bump_attr_count(obj_json: &mut Value, delta: i64) {
    let count = obj_json.get("attributeCount").and_then(Value::as_i64).unwrap_or(0);
    obj_json["attributeCount"] = json!((count + delta).max(0));
}

pub async fn get_attributes(
    state: &NodeState,
    req: &Request<Body>,
    coll: &str,
    obj_id: &str,
) -> ServiceResult<Response<Body>> {
    validate_target(coll, obj_id)?;
    let obj_json = get_metadata_obj(state, obj_id).await?;
    let attributes = obj_json
        .get("attributes")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let params = server::query_params(req);
    let marker = params.get("Marker").map(String::as_str);
    let limit: Option<usize> = params.get("Limit").and_then(|l| l.parse().ok());

    let mut names: Vec<&String> = attributes.keys().collect();
    names.sort();
    let mut out = Vec::new();
    for name in names {
        if let Some(marker) = marker {
            if name.as_str() <= marker {
                continue;
            }
        }
        if let Some(limit) = limit {
            if out.len() >= limit {
                break;
            }
        }
        let mut attr = attributes[name].clone();
        attr["name"] = json!(name);
        out.push(attr);
    }
    server::ok_json(&json!({ "attributes": out }))
}

pub async fn get_attribute(
    state: &NodeState,
    coll: &str,
    obj_id: &str,
    name: &str,
) -> ServiceResult<Response<Body>> {
    validate_target(coll, obj_id)?;
    let obj_json = get_metadata_obj(state, obj_id).await?;
    let attr = obj_json
        .get("attributes")
        .and_then(|attrs| attrs.get(name))
        .ok_or(ServiceError::NotFound)?;
    server::ok_json(attr)
}

pub async fn put_attribute(
    state: &NodeState,
    req: Request<Body>,
    coll: &str,
    obj_id: &str,
    name: &str,
) -> ServiceResult<Response<Body>> {
    validate_target(coll, obj_id)?;
    if name.is_empty() {
        return Err(ServiceError::BadRequest("empty attribute name".to_string()));
    }
    let body = server::read_json(req).await?;

    let type_json = body
        .get("type")
        .ok_or_else(|| ServiceError::BadRequest("attribute has no type".to_string()))?;
    DataType::from_json(type_json)?;
    let shape_json = body.get("shape").cloned().unwrap_or_else(|| json!({"class": "H5S_SCALAR"}));
    Shape::from_json(&shape_json)?;

    let attr = json!({
        "type": type_json,
        "shape": shape_json,
        "value": body.get("value").cloned().unwrap_or(Value::Null),
        "created": unix_now(),
    });

    let _guard = state.meta_write_lock.lock().await;
    let mut obj_json = get_metadata_obj(state, obj_id).await?;
    let attributes = obj_json
        .get_mut("attributes")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ServiceError::Internal("object record has no attributes".to_string()))?;
    let replaced = attributes.insert(name.to_string(), attr).is_some();
    if !replaced {
        bump_attr_count(&mut obj_json, 1);
    }
    obj_json["lastModified"] = json!(unix_now());
    save_metadata_obj(state, obj_id, obj_json, false).await?;
    server::created_json(&json!({}))
}

pub async fn delete_attribute(
    state: &NodeState,
    coll: &str,
    obj_id: &str,
    name: &str,
) -> ServiceResult<Response<Body>> {
    validate_target(coll, obj_id)?;
    let _guard = state.meta_write_lock.lock().await;
    let mut obj_json = get_metadata_obj(state, obj_id).await?;
    let removed = obj_json
        .get_mut("attributes")
        .and_then(Value::as_object_mut)
        .and_then(|attrs| attrs.remove(name));
    if removed.is_none() {
        return Err(ServiceError::NotFound);
    }
    bump_attr_count(&mut obj_json, -1);
    obj_json["lastModified"] = json!(unix_now());
    save_metadata_obj(state, obj_id, obj_json, false).await?;
    server::ok_json(&json!({}))
}
