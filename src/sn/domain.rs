//! Service-node domain operations: domain CRUD, child listings and
//! the ACL endpoints.

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

use super::{encode_param, get_domain_json, invalidate_domain};

fn domain_class(domain_json: &Value) -> &'static str {
    if domain_json.get("root").is_some() {
        "domain"
    } else {
        "folder"
    }
}

/// GET / — domain metadata.
pub async fn get_domain(state: &NodeState, req: &Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;

    // a direct domain request always queries the authoritative node
    let domain_json = get_domain_json(state, &domain_path, false).await?;
    auth::acl_check(&domain_json, AclAction::Read, &user)?;

    let mut rsp = json!({
        "owner": domain_json["owner"],
        "class": domain_class(&domain_json),
    });
    for key in &["root", "created", "lastModified"] {
        if let Some(value) = domain_json.get(*key) {
            rsp[*key] = value.clone();
        }
    }
    server::ok_json(&rsp)
}

/// PUT / — create a domain (or folder with `{"folder": true}`).
pub async fn put_domain(state: &NodeState, req: Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, &req, false).await?;
    let domain_path = domain_util::domain_from_request(&req)?;

    let body = match server::read_body(req).await {
        Ok(data) if data.is_empty() => json!({}),
        Ok(data) => serde_json::from_slice(&data)
            .map_err(|err| ServiceError::BadRequest(format!("malformed JSON body: {}", err)))?,
        Err(err) => return Err(err),
    };
    let folder = body.get("folder").and_then(Value::as_bool).unwrap_or(false);

    // creation requires `create` on an existing parent; top level
    // domains only need an authenticated (non-anonymous) user
    let parent_json = match domain_util::parent_domain(&domain_path) {
        Some(parent) => match get_domain_json(state, &parent, false).await {
            Ok(parent_json) => {
                auth::acl_check(&parent_json, AclAction::Create, &user)?;
                Some(parent_json)
            }
            Err(ServiceError::NotFound) => {
                return Err(ServiceError::NotFound);
            }
            Err(err) => return Err(err),
        },
        None => {
            if user == auth::DEFAULT_USER {
                return Err(ServiceError::Unauthorized);
            }
            None
        }
    };

    let acls = auth::inherit_acls(parent_json.as_ref(), &user);

    let mut dn_body = json!({
        "domain": domain_path,
        "owner": user,
        "acls": acls,
    });

    let root_id = if folder {
        None
    } else {
        let root_id = idutil::create_id(ObjClass::Group);
        let group = json!({
            "id": root_id,
            "root": root_id,
            "domain": domain_path,
            "links": {},
            "attributes": {},
            "linkCount": 0,
            "attributeCount": 0,
        });
        let dn_url = state.dn_url_for(&root_id)?;
        client::post_json(state, &format!("{}/groups", dn_url), &group).await?;
        dn_body["root"] = json!(root_id);
        Some(root_id)
    };

    let domain_key = domain_util::domain_key(&domain_path);
    let dn_url = state.dn_url_for(&domain_key)?;
    let result = client::put_json(state, &format!("{}/domains", dn_url), &dn_body).await;
    let domain_json = match result {
        Ok(domain_json) => domain_json,
        Err(err) => {
            // unwind the orphaned root group
            if let Some(root_id) = root_id {
                let dn_url = state.dn_url_for(&root_id)?;
                let _ = client::delete(state, &format!("{}/groups/{}", dn_url, root_id), None).await;
            }
            return Err(err);
        }
    };

    invalidate_domain(state, &domain_path);
    let mut rsp = json!({
        "owner": domain_json["owner"],
        "acls": domain_json["acls"],
        "class": domain_class(&domain_json),
    });
    if let Some(root) = domain_json.get("root") {
        rsp["root"] = root.clone();
    }
    server::created_json(&rsp)
}

/// DELETE / — delete the domain record. Objects and chunks below it
/// are swept by the async GC collaborator.
pub async fn delete_domain(state: &NodeState, req: &Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, false).await?;
    let domain_path = domain_util::domain_from_request(req)?;

    let domain_json = get_domain_json(state, &domain_path, false).await?;
    auth::acl_check(&domain_json, AclAction::Delete, &user)?;

    let domain_key = domain_util::domain_key(&domain_path);
    let dn_url = state.dn_url_for(&domain_key)?;
    client::delete(state, &format!("{}/domains", dn_url), Some(&json!({ "domain": domain_path })))
        .await?;

    invalidate_domain(state, &domain_path);
    server::ok_json(&json!({ "domain": domain_path }))
}

/// GET /domains — list child domains of a folder.
pub async fn get_domains(state: &NodeState, req: &Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, true).await?;
    let params = server::query_params(req);

    let parent = match params.get("domain").map(String::as_str) {
        None | Some("") | Some("/") => None,
        Some(raw) => {
            let trimmed = raw.trim_end_matches('/');
            domain_util::validate_domain(trimmed)?;
            Some(trimmed.to_string())
        }
    };

    // a folder that exists as a record gates its listing
    if let Some(parent) = &parent {
        match get_domain_json(state, parent, false).await {
            Ok(parent_json) => auth::acl_check(&parent_json, AclAction::Read, &user)?,
            Err(ServiceError::NotFound) => {}
            Err(err) => return Err(err),
        }
    }

    let index_key = domain_util::domains_index_key(parent.as_deref());
    let marker = params.get("Marker").map(String::as_str);
    let limit: Option<usize> = params.get("Limit").and_then(|l| l.parse().ok());
    let paths = index::list_ids(&state.storage, &index_key, marker, limit).await?;

    let mut domains = Vec::new();
    for path in paths {
        let child_json = match get_domain_json(state, &path, true).await {
            Ok(child_json) => child_json,
            Err(err) => {
                log::warn!("skipping unreadable child domain {}: {}", path, err);
                continue;
            }
        };
        if auth::acl_check(&child_json, AclAction::Read, &user).is_err() {
            continue;
        }
        domains.push(json!({
            "name": path,
            "class": domain_class(&child_json),
            "owner": child_json["owner"],
        }));
    }
    server::ok_json(&json!({ "domains": domains }))
}

/// GET /acls — the whole ACL map.
pub async fn get_acls(state: &NodeState, req: &Request<Body>) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    let domain_json = get_domain_json(state, &domain_path, false).await?;
    auth::acl_check(&domain_json, AclAction::ReadAcl, &user)?;
    server::ok_json(&json!({ "acls": domain_json["acls"] }))
}

/// GET /acls/{user}
pub async fn get_acl(
    state: &NodeState,
    req: &Request<Body>,
    acl_user: &str,
) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    let domain_json = get_domain_json(state, &domain_path, false).await?;
    auth::acl_check(&domain_json, AclAction::ReadAcl, &user)?;
    let acl = domain_json
        .get("acls")
        .and_then(|acls| acls.get(acl_user))
        .ok_or(ServiceError::NotFound)?;
    server::ok_json(&json!({ "acl": { acl_user: acl } }))
}

/// PUT /acls/{user}
pub async fn put_acl(
    state: &NodeState,
    req: Request<Body>,
    acl_user: &str,
) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, &req, false).await?;
    let domain_path = domain_util::domain_from_request(&req)?;
    let domain_json = get_domain_json(state, &domain_path, false).await?;
    auth::acl_check(&domain_json, AclAction::UpdateAcl, &user)?;

    let body = server::read_json(req).await?;
    let mut dn_body = json!({ "domain": domain_path });
    let mut any_flag = false;
    for key in &auth::ACL_KEYS {
        if let Some(flag) = body.get(*key) {
            dn_body[*key] = flag.clone();
            any_flag = true;
        }
    }
    if !any_flag {
        return Err(ServiceError::BadRequest("no acl flags in body".to_string()));
    }

    let domain_key = domain_util::domain_key(&domain_path);
    let dn_url = state.dn_url_for(&domain_key)?;
    let rsp = client::put_json(
        state,
        &format!("{}/acls/{}", dn_url, encode_param(acl_user)),
        &dn_body,
    )
    .await?;
    invalidate_domain(state, &domain_path);
    server::created_json(&rsp)
}

/// DELETE /acls/{user}
pub async fn delete_acl(
    state: &NodeState,
    req: &Request<Body>,
    acl_user: &str,
) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, false).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    let domain_json = get_domain_json(state, &domain_path, false).await?;
    auth::acl_check(&domain_json, AclAction::UpdateAcl, &user)?;

    let domain_key = domain_util::domain_key(&domain_path);
    let dn_url = state.dn_url_for(&domain_key)?;
    client::delete(
        state,
        &format!("{}/acls/{}", dn_url, encode_param(acl_user)),
        Some(&json!({ "domain": domain_path })),
    )
    .await?;
    invalidate_domain(state, &domain_path);
    server::ok_json(&json!({}))
}
