//! Authentication and domain ACLs.
//!
//! Credentials arrive as HTTP Basic auth and are checked against the
//! password map stored in the bucket (`passwd.json`). Authorization
//! is per-domain: the domain record carries a map from username to a
//! six flag permission record; a missing user entry falls back to the
//! `default` entry.

use std::collections::HashMap;

use hyper::{Body, Request};
use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};
use crate::node::NodeState;
use crate::store::StoreError;

pub const PASSWD_KEY: &str = "passwd.json";
pub const DEFAULT_USER: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Create,
    Read,
    Update,
    Delete,
    ReadAcl,
    UpdateAcl,
}

impl AclAction {
    pub fn as_key(self) -> &'static str {
        match self {
            AclAction::Create => "create",
            AclAction::Read => "read",
            AclAction::Update => "update",
            AclAction::Delete => "delete",
            AclAction::ReadAcl => "readACL",
            AclAction::UpdateAcl => "updateACL",
        }
    }
}

pub const ACL_KEYS: [&str; 6] = ["create", "read", "update", "delete", "readACL", "updateACL"];

/// Decode the Basic Authorization header, if present.
pub fn parse_basic_auth(req: &Request<Body>) -> ServiceResult<Option<(String, String)>> {
    let header = match req.headers().get(hyper::header::AUTHORIZATION) {
        None => return Ok(None),
        Some(header) => header
            .to_str()
            .map_err(|_| ServiceError::BadRequest("bad authorization header".to_string()))?,
    };
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| ServiceError::BadRequest("unsupported authorization scheme".to_string()))?;
    let decoded = base64::decode(encoded)
        .map_err(|_| ServiceError::BadRequest("bad authorization encoding".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ServiceError::BadRequest("bad authorization encoding".to_string()))?;
    let pos = decoded
        .find(':')
        .ok_or_else(|| ServiceError::BadRequest("bad authorization value".to_string()))?;
    Ok(Some((decoded[..pos].to_string(), decoded[pos + 1..].to_string())))
}

async fn password_map(state: &NodeState) -> ServiceResult<HashMap<String, String>> {
    if let Some(map) = state.passwords.lock().unwrap().as_ref() {
        return Ok(map.clone());
    }
    let map = match state.storage.get_json(PASSWD_KEY).await {
        Ok(value) => {
            let mut map = HashMap::new();
            if let Some(obj) = value.as_object() {
                for (user, pass) in obj {
                    if let Some(pass) = pass.as_str() {
                        map.insert(user.clone(), pass.to_string());
                    }
                }
            }
            map
        }
        Err(StoreError::NotFound) => HashMap::new(),
        Err(err) => return Err(err.into()),
    };
    *state.passwords.lock().unwrap() = Some(map.clone());
    Ok(map)
}

pub async fn validate_user(state: &NodeState, user: &str, password: &str) -> ServiceResult<()> {
    if user.is_empty() || password.is_empty() {
        return Err(ServiceError::Unauthorized);
    }
    let map = password_map(state).await?;
    match map.get(user) {
        Some(expected) if expected == password => Ok(()),
        _ => {
            log::warn!("invalid credentials for user {}", user);
            Err(ServiceError::Unauthorized)
        }
    }
}

/// Resolve the requesting user. Requests without credentials map to
/// the anonymous `default` user when the deployment allows it and
/// the caller says anonymous access is acceptable for this operation
/// (read paths only).
pub async fn authenticate(
    state: &NodeState,
    req: &Request<Body>,
    allow_anonymous: bool,
) -> ServiceResult<String> {
    match parse_basic_auth(req)? {
        Some((user, password)) => {
            validate_user(state, &user, &password).await?;
            Ok(user)
        }
        None => {
            if allow_anonymous && state.config.allow_noauth {
                Ok(DEFAULT_USER.to_string())
            } else {
                Err(ServiceError::Unauthorized)
            }
        }
    }
}

/// Check the domain's ACL map for the requested action.
pub fn acl_check(domain_json: &Value, action: AclAction, user: &str) -> ServiceResult<()> {
    let acls = domain_json
        .get("acls")
        .and_then(Value::as_object)
        .ok_or_else(|| ServiceError::Internal("domain record has no acls".to_string()))?;
    let acl = acls.get(user).or_else(|| acls.get(DEFAULT_USER));
    let allowed = acl
        .and_then(|acl| acl.get(action.as_key()))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if allowed {
        Ok(())
    } else {
        log::warn!("acl deny: user {} action {}", user, action.as_key());
        Err(ServiceError::Forbidden)
    }
}

/// Full-access permission record.
pub fn owner_acl() -> Value {
    let mut acl = serde_json::Map::new();
    for key in &ACL_KEYS {
        acl.insert(key.to_string(), Value::Bool(true));
    }
    Value::Object(acl)
}

/// ACL map for a fresh domain: the parent's entries, with the owner
/// granted everything.
pub fn inherit_acls(parent_json: Option<&Value>, owner: &str) -> Value {
    let mut acls = parent_json
        .and_then(|parent| parent.get("acls"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    acls.insert(owner.to_string(), owner_acl());
    Value::Object(acls)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn domain_with_acls() -> Value {
        json!({
            "owner": "alice",
            "acls": {
                "alice": {
                    "create": true, "read": true, "update": true,
                    "delete": true, "readACL": true, "updateACL": true,
                },
                "bob": {
                    "create": false, "read": true, "update": false,
                    "delete": false, "readACL": false, "updateACL": false,
                },
                "default": {
                    "create": false, "read": true, "update": false,
                    "delete": false, "readACL": false, "updateACL": false,
                },
            },
        })
    }

    #[test]
    fn test_acl_check() {
        let domain = domain_with_acls();
        acl_check(&domain, AclAction::Delete, "alice").unwrap();
        acl_check(&domain, AclAction::Read, "bob").unwrap();
        assert!(acl_check(&domain, AclAction::Delete, "bob").is_err());
        // unknown user falls back to default
        acl_check(&domain, AclAction::Read, "mallory").unwrap();
        assert!(acl_check(&domain, AclAction::Update, "mallory").is_err());
    }

    #[test]
    fn test_inherit_acls() {
        let parent = domain_with_acls();
        let acls = inherit_acls(Some(&parent), "carol");
        assert_eq!(acls["carol"]["updateACL"], json!(true));
        assert_eq!(acls["bob"]["read"], json!(true));

        let acls = inherit_acls(None, "carol");
        assert_eq!(acls["carol"]["create"], json!(true));
        assert!(acls.get("default").is_none());
    }

    #[test]
    fn test_parse_basic_auth() {
        let value = format!("Basic {}", base64::encode("alice:secret"));
        let req = Request::builder()
            .uri("/")
            .header("Authorization", value)
            .body(Body::empty())
            .unwrap();
        let (user, pass) = parse_basic_auth(&req).unwrap().unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "secret");

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert!(parse_basic_auth(&req).unwrap().is_none());

        let req = Request::builder()
            .uri("/")
            .header("Authorization", "Bearer tok")
            .body(Body::empty())
            .unwrap();
        assert!(parse_basic_auth(&req).is_err());
    }
}
