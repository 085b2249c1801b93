//! Data-node domain record handlers. The domain key partitions like
//! any object id, so exactly one data node owns each domain record.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::domain;
use crate::error::{ServiceError, ServiceResult};
use crate::index;
use crate::node::NodeState;
use crate::server;
use crate::store::unix_now;

use super::{check_metadata_obj, delete_metadata_obj, get_metadata_obj, save_metadata_obj};

fn domain_from_params(req: &Request<Body>) -> ServiceResult<String> {
    let params = server::query_params(req);
    let domain = params
        .get("domain")
        .ok_or_else(|| ServiceError::BadRequest("no domain provided".to_string()))?;
    domain::validate_domain(domain)?;
    Ok(domain.clone())
}

fn domain_from_body(body: &Value) -> ServiceResult<String> {
    let domain = body
        .get("domain")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("missing domain".to_string()))?;
    domain::validate_domain(domain)?;
    Ok(domain.to_string())
}

/// Key of the parent's child-domain index for this domain.
fn parent_index_key(domain_path: &str) -> String {
    match domain::parent_domain(domain_path) {
        Some(parent) => domain::domains_index_key(Some(&parent)),
        None => domain::domains_index_key(None),
    }
}

pub async fn get_domain(state: &NodeState, req: &Request<Body>) -> ServiceResult<Response<Body>> {
    let domain_path = domain_from_params(req)?;
    let domain_key = domain::domain_key(&domain_path);
    let domain_json = get_metadata_obj(state, &domain_key).await?;
    server::ok_json(&domain_json)
}

pub async fn put_domain(state: &NodeState, req: Request<Body>) -> ServiceResult<Response<Body>> {
    let body = server::read_json(req).await?;
    let domain_path = domain_from_body(&body)?;
    let domain_key = domain::domain_key(&domain_path);
    state.validate_in_partition(&domain_key)?;

    let _guard = state.meta_write_lock.lock().await;
    if check_metadata_obj(state, &domain_key).await? {
        return Err(ServiceError::Conflict(format!("domain {} exists", domain_path)));
    }

    let owner = body
        .get("owner")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("missing owner".to_string()))?;
    let acls = body
        .get("acls")
        .ok_or_else(|| ServiceError::BadRequest("missing acls".to_string()))?;

    let now = unix_now();
    let mut domain_json = json!({
        "owner": owner,
        "acls": acls,
        "created": now,
        "lastModified": now,
    });
    if let Some(root) = body.get("root") {
        domain_json["root"] = root.clone();
    } else {
        log::info!("no root id for {}, creating folder", domain_path);
    }

    // the record is the anchor of everything in the domain; persist
    // it before acknowledging
    save_metadata_obj(state, &domain_key, domain_json.clone(), true).await?;

    let class = if domain_json.get("root").is_some() { "domain" } else { "folder" };
    let index_key = parent_index_key(&domain_path);
    if let Err(err) =
        index::update_line(&state.storage, &index_key, &domain_path, vec![class.to_string()]).await
    {
        log::warn!("domain index update failed for {}: {}", domain_path, err);
    }

    server::created_json(&domain_json)
}

pub async fn delete_domain(state: &NodeState, req: Request<Body>) -> ServiceResult<Response<Body>> {
    let body = server::read_json(req).await?;
    let domain_path = domain_from_body(&body)?;
    let domain_key = domain::domain_key(&domain_path);
    state.validate_in_partition(&domain_key)?;

    let _guard = state.meta_write_lock.lock().await;
    if !check_metadata_obj(state, &domain_key).await? {
        return Err(ServiceError::NotFound);
    }

    delete_metadata_obj(state, &domain_key).await?;

    let index_key = parent_index_key(&domain_path);
    if let Err(err) = index::remove_line(&state.storage, &index_key, &domain_path).await {
        log::warn!("domain index cleanup failed for {}: {}", domain_path, err);
    }

    server::ok_json(&json!({ "domain": domain_path }))
}

/// Create or update one user's permission record on the domain.
pub async fn put_acl(
    state: &NodeState,
    req: Request<Body>,
    acl_user: &str,
) -> ServiceResult<Response<Body>> {
    let body = server::read_json(req).await?;
    let domain_path = domain_from_body(&body)?;
    let domain_key = domain::domain_key(&domain_path);

    let _guard = state.meta_write_lock.lock().await;
    let mut domain_json = get_metadata_obj(state, &domain_key).await?;
    let acls = domain_json
        .get_mut("acls")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ServiceError::Internal("domain record has no acls".to_string()))?;

    let mut acl = match acls.get(acl_user) {
        Some(acl) => acl.clone(),
        None => {
            // start from no permissions
            let mut empty = serde_json::Map::new();
            for key in &crate::auth::ACL_KEYS {
                empty.insert(key.to_string(), Value::Bool(false));
            }
            Value::Object(empty)
        }
    };
    for key in &crate::auth::ACL_KEYS {
        if let Some(flag) = body.get(*key) {
            if !flag.is_boolean() {
                return Err(ServiceError::BadRequest(format!("acl flag {} must be boolean", key)));
            }
            acl[*key] = flag.clone();
        }
    }
    acls.insert(acl_user.to_string(), acl.clone());
    domain_json["lastModified"] = json!(unix_now());

    save_metadata_obj(state, &domain_key, domain_json, false).await?;
    server::created_json(&json!({ "acl": { acl_user: acl } }))
}

/// Remove one user's permission record from the domain.
pub async fn delete_acl(
    state: &NodeState,
    req: Request<Body>,
    acl_user: &str,
) -> ServiceResult<Response<Body>> {
    let body = server::read_json(req).await?;
    let domain_path = domain_from_body(&body)?;
    let domain_key = domain::domain_key(&domain_path);

    let _guard = state.meta_write_lock.lock().await;
    let mut domain_json = get_metadata_obj(state, &domain_key).await?;
    let removed = domain_json
        .get_mut("acls")
        .and_then(Value::as_object_mut)
        .and_then(|acls| acls.remove(acl_user));
    if removed.is_none() {
        return Err(ServiceError::NotFound);
    }
    domain_json["lastModified"] = json!(unix_now());
    save_metadata_obj(state, &domain_key, domain_json, false).await?;
    server::ok_json(&json!({}))
}
