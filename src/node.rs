//! Per-node shared state.
//!
//! Everything a node mutates at runtime lives in one `NodeState`
//! passed explicitly to handlers and background tasks. Locks are
//! narrow and never held across an await; the pending-read/write
//! maps and the dirty map are the coordination points between
//! request handlers and the background writer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use anyhow::Error;
use hyper::client::HttpConnector;
use hyper::{Body, Client};

use crate::cache::{ChunkCache, MetaCache};
use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil;
use crate::store::{unix_now, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Head,
    Service,
    Data,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Head => "head",
            NodeRole::Service => "sn",
            NodeRole::Data => "dn",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "head" => Some(NodeRole::Head),
            "sn" => Some(NodeRole::Service),
            "dn" => Some(NodeRole::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Initializing,
    Waiting,
    Ready,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Initializing => "INITIALIZING",
            NodeStatus::Waiting => "WAITING",
            NodeStatus::Ready => "READY",
        }
    }
}

pub struct NodeState {
    pub config: Config,
    pub role: NodeRole,
    pub id: String,
    /// announced listen port; rebound when the server binds an
    /// ephemeral port
    port: RwLock<u16>,
    pub storage: Storage,
    pub client: Client<HttpConnector, Body>,
    pub start_time: u64,

    pub status: RwLock<NodeStatus>,
    pub node_number: RwLock<i64>,
    pub node_count: RwLock<usize>,
    pub head_url: RwLock<Option<String>>,
    pub sn_urls: RwLock<HashMap<usize, String>>,
    pub dn_urls: RwLock<HashMap<usize, String>>,

    pub meta_cache: Mutex<MetaCache>,
    pub chunk_cache: Mutex<ChunkCache>,
    /// SN-side advisory cache of domain records.
    pub domain_cache: Mutex<MetaCache>,
    /// id -> time of last mutation; consumed by the background writer.
    pub dirty_ids: Mutex<HashMap<String, u64>>,
    /// tombstones for freshly deleted ids and domain keys
    pub deleted_ids: Mutex<HashSet<String>>,
    /// dataset id -> deflate level, for lazy chunk writes
    pub deflate_map: Mutex<HashMap<String, u32>>,
    pub pending_reads: Mutex<HashMap<String, Instant>>,
    pub pending_writes: Mutex<HashMap<String, Instant>>,
    /// serializes metadata read-modify-write sequences (which span
    /// store awaits) on this node
    pub meta_write_lock: tokio::sync::Mutex<()>,
    /// user -> password map, loaded lazily from the store
    pub passwords: Mutex<Option<HashMap<String, String>>>,

    active_tasks: AtomicUsize,
}

impl NodeState {
    pub fn new(role: NodeRole, config: Config) -> Result<std::sync::Arc<Self>, Error> {
        let storage = Storage::open(&config)?;
        let port = match role {
            NodeRole::Head => config.head_port,
            NodeRole::Service => config.sn_port,
            NodeRole::Data => config.dn_port,
        };
        let state = NodeState {
            id: format!("{}-{}", role.as_str(), uuid::Uuid::new_v4()),
            role,
            port: RwLock::new(port),
            storage,
            client: Client::new(),
            start_time: unix_now(),
            status: RwLock::new(NodeStatus::Initializing),
            node_number: RwLock::new(-1),
            node_count: RwLock::new(0),
            head_url: RwLock::new(None),
            sn_urls: RwLock::new(HashMap::new()),
            dn_urls: RwLock::new(HashMap::new()),
            meta_cache: Mutex::new(MetaCache::new(config.metadata_mem_cache_size)),
            chunk_cache: Mutex::new(ChunkCache::new(config.chunk_mem_cache_size)),
            domain_cache: Mutex::new(MetaCache::new(config.metadata_mem_cache_size)),
            dirty_ids: Mutex::new(HashMap::new()),
            deleted_ids: Mutex::new(HashSet::new()),
            deflate_map: Mutex::new(HashMap::new()),
            pending_reads: Mutex::new(HashMap::new()),
            pending_writes: Mutex::new(HashMap::new()),
            meta_write_lock: tokio::sync::Mutex::new(()),
            passwords: Mutex::new(None),
            active_tasks: AtomicUsize::new(0),
            config,
        };
        Ok(std::sync::Arc::new(state))
    }

    pub fn port(&self) -> u16 {
        *self.port.read().unwrap()
    }

    pub fn set_port(&self, port: u16) {
        *self.port.write().unwrap() = port;
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read().unwrap()
    }

    pub fn set_status(&self, status: NodeStatus) {
        let mut current = self.status.write().unwrap();
        if *current != status {
            log::info!("node {} state {} -> {}", self.id, current.as_str(), status.as_str());
            *current = status;
        }
    }

    pub fn node_number(&self) -> i64 {
        *self.node_number.read().unwrap()
    }

    pub fn node_count(&self) -> usize {
        *self.node_count.read().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == NodeStatus::Ready
    }

    /// Url of the data node that owns the given id or domain key.
    pub fn dn_url_for(&self, key: &str) -> ServiceResult<String> {
        let dn_urls = self.dn_urls.read().unwrap();
        if dn_urls.is_empty() {
            return Err(ServiceError::Unavailable("cluster not ready".to_string()));
        }
        let number = idutil::partition(key, dn_urls.len());
        dn_urls
            .get(&number)
            .cloned()
            .ok_or_else(|| ServiceError::Unavailable(format!("no data node {}", number)))
    }

    /// Routing invariant: the request for this key must have been
    /// dispatched to this node.
    pub fn validate_in_partition(&self, key: &str) -> ServiceResult<()> {
        let count = self.node_count();
        let number = self.node_number();
        if count == 0 || number < 0 {
            return Err(ServiceError::Unavailable("node not registered".to_string()));
        }
        let expected = idutil::partition(key, count) as i64;
        if expected != number {
            return Err(ServiceError::BadRequest(format!(
                "wrong node for key {}: partition {} != {}",
                key, expected, number
            )));
        }
        Ok(())
    }

    pub fn begin_task(self: &std::sync::Arc<Self>) -> Option<TaskGuard> {
        let count = self.active_tasks.fetch_add(1, Ordering::SeqCst);
        if count >= self.config.max_task_count {
            self.active_tasks.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(TaskGuard { state: self.clone() })
    }

    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Stamp an id dirty for the background writer.
    pub fn mark_dirty(&self, id: &str) {
        self.dirty_ids.lock().unwrap().insert(id.to_string(), unix_now());
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted_ids.lock().unwrap().contains(id)
    }
}

pub struct TaskGuard {
    state: std::sync::Arc<NodeState>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.state.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_state() -> std::sync::Arc<NodeState> {
        let mut config = Config::default();
        config.aws_s3_gateway = "memory://".to_string();
        config.max_task_count = 2;
        NodeState::new(NodeRole::Data, config).unwrap()
    }

    #[test]
    fn test_task_gate() {
        let state = test_state();
        let g1 = state.begin_task().unwrap();
        let _g2 = state.begin_task().unwrap();
        assert!(state.begin_task().is_none());
        drop(g1);
        assert!(state.begin_task().is_some());
    }

    #[test]
    fn test_partition_validation() {
        let state = test_state();
        *state.node_count.write().unwrap() = 4;
        let id = "g-12345678-1234-1234-1234-1234567890ab";
        let owner = idutil::partition(id, 4) as i64;
        *state.node_number.write().unwrap() = owner;
        state.validate_in_partition(id).unwrap();
        *state.node_number.write().unwrap() = (owner + 1) % 4;
        assert!(state.validate_in_partition(id).is_err());
    }
}
