//! Worker-side cluster membership.
//!
//! Each service and data node finds the head node through the well
//! known `headnode` store key, registers to obtain its slot, and then
//! polls `/nodestate` to track peers and the cluster state. Losing
//! its slot (the head reassigned it, or the head restarted) drops the
//! node back to `Initializing` and it re-registers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::client;
use crate::error::ServiceResult;
use crate::idutil::HEAD_NODE_KEY;
use crate::node::{NodeRole, NodeState, NodeStatus};

/// Head url from the cache or the store.
pub async fn head_url(state: &NodeState) -> ServiceResult<String> {
    if let Some(url) = state.head_url.read().unwrap().clone() {
        return Ok(url);
    }
    let head_state = state.storage.get_json(HEAD_NODE_KEY).await?;
    let url = head_state
        .get("head_url")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            crate::error::ServiceError::Internal("head_url missing from headnode object".to_string())
        })?
        .to_string();
    *state.head_url.write().unwrap() = Some(url.clone());
    Ok(url)
}

/// Register with the head node. Safe to repeat; the head keeps the
/// slot of a node it already knows.
pub async fn register(state: &NodeState) -> ServiceResult<()> {
    let head = head_url(state).await?;
    let body = json!({
        "id": state.id,
        "port": state.port(),
        "node_type": state.role.as_str(),
    });
    let rsp = client::post_json(state, &format!("{}/register", head), &body).await?;
    let node_number = rsp
        .get("node_number")
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    let node_count = rsp.get("node_count").and_then(Value::as_u64).unwrap_or(0) as usize;
    if node_number < 0 || node_count == 0 {
        return Err(crate::error::ServiceError::Internal(
            "unexpected register response".to_string(),
        ));
    }
    *state.node_number.write().unwrap() = node_number;
    *state.node_count.write().unwrap() = node_count;
    state.set_status(NodeStatus::Waiting);
    log::info!("registered as {} {} of {}", state.role.as_str(), node_number, node_count);
    Ok(())
}

/// One `/nodestate` poll: verify our slot, rebuild the peer url
/// tables, and track the cluster state.
pub async fn health_check(state: &NodeState) -> ServiceResult<()> {
    let head = head_url(state).await?;
    let rsp = client::get_json(state, &format!("{}/nodestate?id={}", head, state.id)).await?;

    let cluster_ready = rsp.get("cluster_state").and_then(Value::as_str) == Some("READY");
    let nodes = rsp
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut sn_urls = HashMap::new();
    let mut dn_urls = HashMap::new();
    let mut found_self = false;
    for node in &nodes {
        let node_type = node.get("node_type").and_then(Value::as_str).unwrap_or("");
        let number = match node.get("node_number").and_then(Value::as_i64) {
            Some(n) if n >= 0 => n as usize,
            _ => continue,
        };
        let host = match node.get("host").and_then(Value::as_str) {
            Some(host) if !host.is_empty() => host,
            _ => {
                // offline slot; if it is ours we must re-register
                if node.get("id").and_then(Value::as_str) == Some(state.id.as_str()) {
                    found_self = false;
                }
                continue;
            }
        };
        let port = node.get("port").and_then(Value::as_u64).unwrap_or(0);
        let url = format!("http://{}:{}", host, port);

        if node_type == state.role.as_str() && number as i64 == state.node_number() {
            if node.get("id").and_then(Value::as_str) == Some(state.id.as_str()) {
                found_self = true;
            } else {
                log::warn!(
                    "slot {} {} now held by another node, re-initializing",
                    node_type,
                    number
                );
                found_self = false;
            }
        }

        match node_type {
            "dn" => {
                dn_urls.insert(number, url);
            }
            "sn" => {
                sn_urls.insert(number, url);
            }
            _ => {}
        }
    }

    *state.sn_urls.write().unwrap() = sn_urls;
    *state.dn_urls.write().unwrap() = dn_urls;

    if state.node_number() < 0 || !found_self {
        state.set_status(NodeStatus::Initializing);
        *state.node_number.write().unwrap() = -1;
        return Ok(());
    }

    if cluster_ready {
        state.set_status(NodeStatus::Ready);
    } else if state.status() == NodeStatus::Ready {
        state.set_status(NodeStatus::Waiting);
    }
    Ok(())
}

/// Periodic membership task for worker nodes.
pub async fn run_health_task(state: Arc<NodeState>) {
    debug_assert!(state.role != NodeRole::Head);
    let sleep = Duration::from_secs(state.config.node_sleep_time.max(1));
    loop {
        let result = if state.status() == NodeStatus::Initializing {
            register(&state).await
        } else {
            health_check(&state).await
        };
        if let Err(err) = result {
            log::warn!("health check failed: {}", err);
        }
        tokio::time::sleep(sleep).await;
    }
}
