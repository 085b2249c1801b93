//! Links live inside the parent group's record; these handlers
//! mutate the `links` map in place and keep `linkCount` current.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::node::NodeState;
use crate::server;
use crate::store::unix_now;

use super::{get_metadata_obj, save_metadata_obj};

/// Add a link to a group record; `409` when the title is taken.
pub fn insert_link(group_json: &mut Value, title: &str, link: Value) -> ServiceResult<()> {
    let links = group_json
        .get_mut("links")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ServiceError::Internal("group record has no links".to_string()))?;
    if links.contains_key(title) {
        return Err(ServiceError::Conflict(format!("link {} already exists", title)));
    }
    links.insert(title.to_string(), link);
    bump_link_count(group_json, 1);
    group_json["lastModified"] = json!(unix_now());
    Ok(())
}

fn bump_link_count(group_json: &mut Value, delta: i64) {
    let count = group_json.get("linkCount").and_then(Value::as_i64).unwrap_or(0);
    group_json["linkCount"] = json!((count + delta).max(0));
}

fn validate_link_body(link: &Value) -> ServiceResult<Value> {
    let class = link.get("class").and_then(Value::as_str).unwrap_or("H5L_TYPE_HARD");
    let mut out = json!({ "class": class, "created": unix_now() });
    match class {
        "H5L_TYPE_HARD" => {
            let id = link
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| ServiceError::BadRequest("hard link has no id".to_string()))?;
            idutil::validate_id(id, None)?;
            let collection = idutil::class_of(id)
                .filter(|class| *class != ObjClass::Chunk)
                .ok_or_else(|| ServiceError::BadRequest("hard link to non-object".to_string()))?
                .collection();
            out["id"] = json!(id);
            out["collection"] = json!(collection);
        }
        "H5L_TYPE_SOFT" => {
            let h5path = link
                .get("h5path")
                .and_then(Value::as_str)
                .ok_or_else(|| ServiceError::BadRequest("soft link has no h5path".to_string()))?;
            out["h5path"] = json!(h5path);
        }
        "H5L_TYPE_EXTERNAL" => {
            let h5path = link
                .get("h5path")
                .and_then(Value::as_str)
                .ok_or_else(|| ServiceError::BadRequest("external link has no h5path".to_string()))?;
            let h5domain = link.get("h5domain").and_then(Value::as_str).ok_or_else(|| {
                ServiceError::BadRequest("external link has no h5domain".to_string())
            })?;
            out["h5path"] = json!(h5path);
            out["h5domain"] = json!(h5domain);
        }
        other => {
            return Err(ServiceError::BadRequest(format!("unknown link class: {}", other)))
        }
    }
    Ok(out)
}

pub async fn get_links(
    state: &NodeState,
    req: &Request<Body>,
    group_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let group_json = get_metadata_obj(state, group_id).await?;
    let links = group_json
        .get("links")
        .and_then(Value::as_object)
        .ok_or_else(|| ServiceError::Internal("group record has no links".to_string()))?;

    let params = server::query_params(req);
    let marker = params.get("Marker").map(String::as_str);
    let limit: Option<usize> = params.get("Limit").and_then(|l| l.parse().ok());

    let mut titles: Vec<&String> = links.keys().collect();
    titles.sort();
    let mut out = Vec::new();
    for title in titles {
        if let Some(marker) = marker {
            if title.as_str() <= marker {
                continue;
            }
        }
        if let Some(limit) = limit {
            if out.len() >= limit {
                break;
            }
        }
        let mut link = links[title].clone();
        link["title"] = json!(title);
        out.push(link);
    }
    server::ok_json(&json!({ "links": out }))
}

pub async fn get_link(
    state: &NodeState,
    group_id: &str,
    title: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let group_json = get_metadata_obj(state, group_id).await?;
    let link = group_json
        .get("links")
        .and_then(|links| links.get(title))
        .ok_or(ServiceError::NotFound)?;
    server::ok_json(&json!({ "link": link, "title": title }))
}

pub async fn put_link(
    state: &NodeState,
    req: Request<Body>,
    group_id: &str,
    title: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    if title.is_empty() || title.contains('/') {
        return Err(ServiceError::BadRequest(format!("invalid link title: {}", title)));
    }
    let body = server::read_json(req).await?;
    let link = validate_link_body(&body)?;

    let _guard = state.meta_write_lock.lock().await;
    let mut group_json = get_metadata_obj(state, group_id).await?;
    insert_link(&mut group_json, title, link)?;
    save_metadata_obj(state, group_id, group_json, false).await?;
    server::created_json(&json!({}))
}

pub async fn delete_link(
    state: &NodeState,
    group_id: &str,
    title: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(group_id, Some(ObjClass::Group))?;
    let _guard = state.meta_write_lock.lock().await;
    let mut group_json = get_metadata_obj(state, group_id).await?;
    let removed = group_json
        .get_mut("links")
        .and_then(Value::as_object_mut)
        .and_then(|links| links.remove(title));
    if removed.is_none() {
        return Err(ServiceError::NotFound);
    }
    bump_link_count(&mut group_json, -1);
    group_json["lastModified"] = json!(unix_now());
    save_metadata_obj(state, group_id, group_json, false).await?;
    server::ok_json(&json!({}))
}
