//! Head node: the cluster rendezvous point.
//!
//! Workers register here to obtain a stable slot number for their
//! role; everyone polls `/nodestate` for the cluster view. The head
//! also writes its own coordinates to the well known `headnode`
//! store key so workers can find it with nothing but the bucket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Error;
use hyper::{Body, Method, Request, Response};
use serde_json::{json, Value};

use crate::error::{ServiceError, ServiceResult};
use crate::idutil::HEAD_NODE_KEY;
use crate::node::{NodeRole, NodeState, NodeStatus};
use crate::server::{self, HandlerFuture, Router};
use crate::store::unix_now;

#[derive(Debug, Clone)]
struct Slot {
    id: String,
    host: String,
    port: u16,
    last_seen: u64,
}

pub struct Registry {
    sn_slots: Vec<Option<Slot>>,
    dn_slots: Vec<Option<Slot>>,
    /// seconds without contact before a slot is considered absent
    expiry: u64,
}

impl Registry {
    pub fn new(target_sn_count: usize, target_dn_count: usize, expiry: u64) -> Self {
        Registry {
            sn_slots: vec![None; target_sn_count],
            dn_slots: vec![None; target_dn_count],
            expiry: expiry.max(1),
        }
    }

    fn slots_mut(&mut self, role: NodeRole) -> Option<&mut Vec<Option<Slot>>> {
        match role {
            NodeRole::Service => Some(&mut self.sn_slots),
            NodeRole::Data => Some(&mut self.dn_slots),
            NodeRole::Head => None,
        }
    }

    fn alive(&self, slot: &Slot) -> bool {
        unix_now().saturating_sub(slot.last_seen) < self.expiry
    }

    /// Assign a slot: a node the registry already knows keeps its
    /// number; otherwise the first free (or expired) slot is taken.
    fn register(&mut self, role: NodeRole, id: &str, host: &str, port: u16) -> ServiceResult<(usize, usize)> {
        let now = unix_now();
        let expiry = self.expiry;
        let slots = self
            .slots_mut(role)
            .ok_or_else(|| ServiceError::BadRequest("unexpected node_type".to_string()))?;
        let count = slots.len();

        for (number, slot) in slots.iter_mut().enumerate() {
            if let Some(slot) = slot {
                if slot.id == id {
                    slot.host = host.to_string();
                    slot.port = port;
                    slot.last_seen = now;
                    return Ok((number, count));
                }
            }
        }

        for (number, entry) in slots.iter_mut().enumerate() {
            let free = match entry {
                None => true,
                Some(slot) => now.saturating_sub(slot.last_seen) >= expiry,
            };
            if free {
                if let Some(old) = entry {
                    log::warn!("replacing absent node {} in slot {}", old.id, number);
                }
                *entry = Some(Slot {
                    id: id.to_string(),
                    host: host.to_string(),
                    port,
                    last_seen: now,
                });
                return Ok((number, count));
            }
        }
        Err(ServiceError::Unavailable("no free node slot".to_string()))
    }

    /// Refresh the liveness stamp of a polling node.
    fn touch(&mut self, id: &str) {
        let now = unix_now();
        for slot in self.sn_slots.iter_mut().chain(self.dn_slots.iter_mut()) {
            if let Some(slot) = slot {
                if slot.id == id {
                    slot.last_seen = now;
                    return;
                }
            }
        }
    }

    fn cluster_ready(&self) -> bool {
        self.sn_slots
            .iter()
            .chain(self.dn_slots.iter())
            .all(|slot| slot.as_ref().map(|s| self.alive(s)).unwrap_or(false))
    }

    fn view(&self) -> Value {
        let mut nodes = Vec::new();
        for (role, slots) in &[("sn", &self.sn_slots), ("dn", &self.dn_slots)] {
            for (number, slot) in slots.iter().enumerate() {
                let node = match slot {
                    Some(slot) if self.alive(slot) => json!({
                        "id": slot.id,
                        "host": slot.host,
                        "port": slot.port,
                        "node_type": role,
                        "node_number": number,
                    }),
                    Some(slot) => json!({
                        "id": slot.id,
                        "host": "",
                        "port": slot.port,
                        "node_type": role,
                        "node_number": number,
                    }),
                    None => json!({
                        "id": "",
                        "host": "",
                        "port": 0,
                        "node_type": role,
                        "node_number": number,
                    }),
                };
                nodes.push(node);
            }
        }
        json!({
            "cluster_state": if self.cluster_ready() { "READY" } else { "INITIALIZING" },
            "target_sn_count": self.sn_slots.len(),
            "target_dn_count": self.dn_slots.len(),
            "nodes": nodes,
        })
    }
}

async fn post_register(
    registry: Arc<Mutex<Registry>>,
    state: Arc<NodeState>,
    req: Request<Body>,
    peer: SocketAddr,
) -> ServiceResult<Response<Body>> {
    let body = server::read_json(req).await?;
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("missing id".to_string()))?
        .to_string();
    let port = body
        .get("port")
        .and_then(Value::as_u64)
        .ok_or_else(|| ServiceError::BadRequest("missing port".to_string()))? as u16;
    let node_type = body
        .get("node_type")
        .and_then(Value::as_str)
        .and_then(NodeRole::from_str)
        .ok_or_else(|| ServiceError::BadRequest("missing or bad node_type".to_string()))?;

    // the registering connection's source address is the peer's host
    let host = peer.ip().to_string();
    let (number, count, ready) = {
        let mut registry = registry.lock().unwrap();
        let (number, count) = registry.register(node_type, &id, &host, port)?;
        (number, count, registry.cluster_ready())
    };
    log::info!("registered {} {} as {} {} of {}", node_type.as_str(), id, host, number, count);
    state.set_status(if ready { NodeStatus::Ready } else { NodeStatus::Waiting });

    server::ok_json(&json!({ "node_number": number, "node_count": count }))
}

fn get_nodestate(
    registry: &Arc<Mutex<Registry>>,
    state: &Arc<NodeState>,
    req: &Request<Body>,
) -> ServiceResult<Response<Body>> {
    let params = server::query_params(req);
    let view = {
        let mut registry = registry.lock().unwrap();
        if let Some(id) = params.get("id") {
            registry.touch(id);
        }
        registry.view()
    };
    let ready = view.get("cluster_state").and_then(Value::as_str) == Some("READY");
    state.set_status(if ready { NodeStatus::Ready } else { NodeStatus::Waiting });
    server::ok_json(&view)
}

pub fn router(registry: Arc<Mutex<Registry>>) -> Router {
    Arc::new(move |state: Arc<NodeState>, req: Request<Body>, peer: SocketAddr| -> HandlerFuture {
        let registry = registry.clone();
        Box::pin(async move {
            let path = req.uri().path().trim_end_matches('/').to_string();
            match (req.method().clone(), path.as_str()) {
                (Method::POST, "/register") => post_register(registry, state, req, peer).await,
                (Method::GET, "/nodestate") => get_nodestate(&registry, &state, &req),
                (Method::GET, "/info") | (Method::GET, "") => {
                    server::ok_json(&server::node_info(&state))
                }
                _ => Err(ServiceError::NotFound),
            }
        })
    })
}

/// Publish the head url under the well known store key.
pub async fn publish_head_url(state: &NodeState, url: &str) -> ServiceResult<()> {
    state
        .storage
        .put_json(HEAD_NODE_KEY, &json!({ "head_url": url }))
        .await?;
    log::info!("published head url {}", url);
    Ok(())
}

/// Boot a head node: publish the url, then serve until shutdown.
pub async fn run(state: Arc<NodeState>) -> Result<(), Error> {
    let url = format!("http://{}:{}", state.config.head_host, state.config.head_port);
    publish_head_url(&state, &url).await?;

    let registry = Arc::new(Mutex::new(Registry::new(
        state.config.target_sn_count,
        state.config.target_dn_count,
        state.config.head_sleep_time * 3,
    )));
    let (_, task) = server::spawn(state.clone(), router(registry), state.port())?;
    task.await?;
    Ok(())
}

/// Test/bootstrap entry that returns the bound address instead of
/// serving forever.
pub fn spawn(
    state: Arc<NodeState>,
    port: u16,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), Error> {
    let registry = Arc::new(Mutex::new(Registry::new(
        state.config.target_sn_count,
        state.config.target_dn_count,
        state.config.head_sleep_time * 3,
    )));
    server::spawn(state, router(registry), port)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_registry_assignment() {
        let mut reg = Registry::new(1, 2, 30);
        let (n0, count) = reg.register(NodeRole::Data, "dn-a", "10.0.0.1", 5101).unwrap();
        assert_eq!((n0, count), (0, 2));
        let (n1, _) = reg.register(NodeRole::Data, "dn-b", "10.0.0.2", 5101).unwrap();
        assert_eq!(n1, 1);
        // same id keeps its slot
        let (again, _) = reg.register(NodeRole::Data, "dn-a", "10.0.0.9", 5101).unwrap();
        assert_eq!(again, 0);
        // full role rejects a third node
        assert!(reg.register(NodeRole::Data, "dn-c", "10.0.0.3", 5101).is_err());
        assert!(!reg.cluster_ready());

        reg.register(NodeRole::Service, "sn-a", "10.0.0.4", 5102).unwrap();
        assert!(reg.cluster_ready());
    }

    #[test]
    fn test_registry_view() {
        let mut reg = Registry::new(1, 1, 30);
        reg.register(NodeRole::Data, "dn-a", "10.0.0.1", 5101).unwrap();
        let view = reg.view();
        let nodes = view["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(view["cluster_state"], "INITIALIZING");
        let dn = nodes.iter().find(|n| n["node_type"] == "dn").unwrap();
        assert_eq!(dn["host"], "10.0.0.1");
        assert_eq!(dn["node_number"], 0);
    }

    #[test]
    fn test_expired_slot_reassigned() {
        let mut reg = Registry::new(0, 1, 1);
        reg.register(NodeRole::Data, "dn-a", "10.0.0.1", 5101).unwrap();
        // force the slot stale
        reg.dn_slots[0].as_mut().unwrap().last_seen = 0;
        assert!(!reg.cluster_ready());
        let (number, _) = reg.register(NodeRole::Data, "dn-b", "10.0.0.2", 5101).unwrap();
        assert_eq!(number, 0);
        assert!(reg.cluster_ready());
    }
}
