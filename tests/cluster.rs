//! End-to-end tests: a head node, data nodes and a service node run
//! in-process on ephemeral ports over a shared directory-backed
//! store, and the scenarios drive the public REST API over real
//! HTTP.

use std::sync::Arc;

use hyper::{Body, Client, Method, Request, StatusCode};
use serde_json::{json, Value};

use tessera::node::{NodeRole, NodeState};
use tessera::store::unix_now;
use tessera::{dn, head, health, idutil, server, sn, sync, Config};

struct Cluster {
    sn_url: String,
    dn_states: Vec<Arc<NodeState>>,
    client: Client<hyper::client::HttpConnector, Body>,
    _tmp: tempfile::TempDir,
}

async fn start_cluster(dn_count: usize) -> Cluster {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.aws_s3_gateway = format!("file://{}", tmp.path().display());
    config.bucket_name = "testbucket".to_string();
    config.target_sn_count = 1;
    config.target_dn_count = dn_count;
    config.node_sleep_time = 1;
    config.head_sleep_time = 10;
    config.min_chunk_size = 4;

    let head_state = NodeState::new(NodeRole::Head, config.clone()).unwrap();
    let (head_addr, _head_task) = head::spawn(head_state.clone(), 0).unwrap();
    head::publish_head_url(&head_state, &format!("http://127.0.0.1:{}", head_addr.port()))
        .await
        .unwrap();

    head_state
        .storage
        .put_json(
            tessera::auth::PASSWD_KEY,
            &json!({ "alice": "alicepw", "bob": "bobpw" }),
        )
        .await
        .unwrap();

    let mut workers = Vec::new();
    let mut dn_states = Vec::new();
    for _ in 0..dn_count {
        let state = NodeState::new(NodeRole::Data, config.clone()).unwrap();
        let (addr, _task) = server::spawn(state.clone(), dn::router(), 0).unwrap();
        state.set_port(addr.port());
        dn_states.push(state.clone());
        workers.push(state);
    }
    let sn_state = NodeState::new(NodeRole::Service, config.clone()).unwrap();
    let (sn_addr, _sn_task) = server::spawn(sn_state.clone(), sn::router(), 0).unwrap();
    sn_state.set_port(sn_addr.port());
    workers.push(sn_state);

    // drive membership deterministically instead of waiting on the
    // periodic task
    for state in &workers {
        health::register(state).await.unwrap();
    }
    for state in &workers {
        health::health_check(state).await.unwrap();
        assert!(state.is_ready(), "node {} not ready", state.id);
    }

    Cluster {
        sn_url: format!("http://127.0.0.1:{}", sn_addr.port()),
        dn_states,
        client: Client::new(),
        _tmp: tmp,
    }
}

impl Cluster {
    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        user: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.sn_url, path_and_query));
        if let Some((user, pass)) = user {
            builder = builder.header(
                "Authorization",
                format!("Basic {}", base64::encode(format!("{}:{}", user, pass))),
            );
        }
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let response = self.client.request(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn flush_all(&self) {
        for state in &self.dn_states {
            sync::sync_pass(state, unix_now() + 1).await.unwrap();
        }
    }

    /// Create the `/u` folder and `/u/<name>` domain as alice;
    /// returns the root group id.
    async fn create_domain(&self, name: &str) -> String {
        let alice = Some(("alice", "alicepw"));
        let (status, _) =
            self.request(Method::PUT, "/?domain=/u", alice, Some(json!({"folder": true}))).await;
        assert!(
            status == StatusCode::CREATED || status == StatusCode::CONFLICT,
            "folder create failed: {}",
            status
        );
        let path = format!("/?domain=/u/{}", name);
        let (status, body) = self.request(Method::PUT, &path, alice, None).await;
        assert_eq!(status, StatusCode::CREATED, "domain create failed: {}", body);
        body["root"].as_str().unwrap().to_string()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_and_list_domains() {
    let cluster = start_cluster(2).await;
    let alice = Some(("alice", "alicepw"));

    cluster.create_domain("test.h6").await;

    let (status, body) = cluster.request(Method::GET, "/?domain=/u/test.h6", alice, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["owner"], "alice");
    assert_eq!(body["class"], "domain");
    assert!(body["root"].as_str().unwrap().starts_with("g-"));

    let (status, body) =
        cluster.request(Method::GET, "/domains?domain=/u/", alice, None).await;
    assert_eq!(status, StatusCode::OK);
    let domains = body["domains"].as_array().unwrap();
    assert!(
        domains
            .iter()
            .any(|d| d["name"] == "/u/test.h6" && d["class"] == "domain"),
        "missing child domain in {:?}",
        domains
    );

    // duplicate create conflicts
    let (status, _) = cluster.request(Method::PUT, "/?domain=/u/test.h6", alice, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_value_round_trip_1d() {
    let cluster = start_cluster(2).await;
    let alice = Some(("alice", "alicepw"));
    cluster.create_domain("values.h6").await;
    let domain = "domain=/u/values.h6";

    let (status, dset) = cluster
        .request(
            Method::POST,
            &format!("/datasets?{}", domain),
            alice,
            Some(json!({ "type": "H5T_STD_I32LE", "shape": [10] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", dset);
    let dset_id = dset["id"].as_str().unwrap().to_string();

    let values: Vec<i64> = (0..10).collect();
    let (status, _) = cluster
        .request(
            Method::PUT,
            &format!("/datasets/{}/value?{}", dset_id, domain),
            alice,
            Some(json!({ "value": values })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = cluster
        .request(
            Method::GET,
            &format!("/datasets/{}/value?select=%5B2:8%5D&{}", dset_id, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!([2, 3, 4, 5, 6, 7]));

    // idempotent write: repeating the PUT leaves the same state
    let (status, _) = cluster
        .request(
            Method::PUT,
            &format!("/datasets/{}/value?{}", dset_id, domain),
            alice,
            Some(json!({ "value": values })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = cluster
        .request(
            Method::GET,
            &format!("/datasets/{}/value?{}", dset_id, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(body["value"], json!(values));

    // after a flush the chunk blob is in the store
    cluster.flush_all().await;
    let chunk_id = idutil::chunk_id_for(&dset_id, &[0]);
    let exists = cluster.dn_states[0]
        .storage
        .exists(&idutil::s3_key(&chunk_id))
        .await
        .unwrap();
    assert!(exists, "chunk blob not persisted");

    // and the collection index serves listings
    let (status, body) =
        cluster.request(Method::GET, &format!("/datasets?{}", domain), alice, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["datasets"].as_array().unwrap().iter().any(|id| id == dset_id.as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_chunk_write() {
    let cluster = start_cluster(2).await;
    let alice = Some(("alice", "alicepw"));
    cluster.create_domain("strip.h6").await;
    let domain = "domain=/u/strip.h6";

    let (status, dset) = cluster
        .request(
            Method::POST,
            &format!("/datasets?{}", domain),
            alice,
            Some(json!({
                "type": "H5T_STD_I32LE",
                "shape": [45, 54],
                "layout": { "class": "H5D_CHUNKED", "dims": [10, 10] },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", dset);
    let dset_id = dset["id"].as_str().unwrap().to_string();

    // horizontal strip crossing six chunks
    let strip: Vec<i64> = vec![22; 50];
    let (status, _) = cluster
        .request(
            Method::PUT,
            &format!("/datasets/{}/value?select=%5B22:23,2:52%5D&{}", dset_id, domain),
            alice,
            Some(json!({ "value": [strip] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = cluster
        .request(
            Method::GET,
            &format!("/datasets/{}/value?select=%5B20:25,21:22%5D&{}", dset_id, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!([[0], [0], [22], [0], [0]]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fill_value_on_unwritten_selection() {
    let cluster = start_cluster(1).await;
    let alice = Some(("alice", "alicepw"));
    cluster.create_domain("fill.h6").await;
    let domain = "domain=/u/fill.h6";

    let (status, dset) = cluster
        .request(
            Method::POST,
            &format!("/datasets?{}", domain),
            alice,
            Some(json!({
                "type": "H5T_STD_I32LE",
                "shape": [6],
                "creationProperties": { "fillValue": 42 },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", dset);
    let dset_id = dset["id"].as_str().unwrap();

    let (status, body) = cluster
        .request(
            Method::GET,
            &format!("/datasets/{}/value?{}", dset_id, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!([42, 42, 42, 42, 42, 42]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resize_within_maxdims() {
    let cluster = start_cluster(1).await;
    let alice = Some(("alice", "alicepw"));
    cluster.create_domain("resize.h6").await;
    let domain = "domain=/u/resize.h6";

    let (status, dset) = cluster
        .request(
            Method::POST,
            &format!("/datasets?{}", domain),
            alice,
            Some(json!({ "type": "H5T_STD_I32LE", "shape": [10], "maxdims": [20] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", dset);
    let dset_id = dset["id"].as_str().unwrap();

    let (status, _) = cluster
        .request(
            Method::PUT,
            &format!("/datasets/{}/shape?{}", dset_id, domain),
            alice,
            Some(json!({ "shape": [15] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = cluster
        .request(
            Method::GET,
            &format!("/datasets/{}/shape?{}", dset_id, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shape"]["dims"], json!([15]));

    let (status, _) = cluster
        .request(
            Method::PUT,
            &format!("/datasets/{}/shape?{}", dset_id, domain),
            alice,
            Some(json!({ "shape": [25] })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_link_conflict() {
    let cluster = start_cluster(2).await;
    let alice = Some(("alice", "alicepw"));
    let root = cluster.create_domain("links.h6").await;
    let domain = "domain=/u/links.h6";

    let (status, first) = cluster
        .request(
            Method::POST,
            &format!("/groups?{}", domain),
            alice,
            Some(json!({ "link": { "id": root, "name": "g1" } })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", first);

    let (status, _) = cluster
        .request(
            Method::POST,
            &format!("/groups?{}", domain),
            alice,
            Some(json!({ "link": { "id": root, "name": "g1" } })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // the surviving link resolves to the first group
    let (status, body) = cluster
        .request(
            Method::GET,
            &format!("/groups/{}/links/g1?{}", root, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["link"]["id"], first["id"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_acl_gates_mutation() {
    let cluster = start_cluster(1).await;
    let alice = Some(("alice", "alicepw"));
    let bob = Some(("bob", "bobpw"));
    cluster.create_domain("private.h6").await;
    let domain = "domain=/u/private.h6";

    let (status, dset) = cluster
        .request(
            Method::POST,
            &format!("/datasets?{}", domain),
            alice,
            Some(json!({ "type": "H5T_STD_I32LE", "shape": [4] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let dset_id = dset["id"].as_str().unwrap().to_string();

    // no entry for bob at all: read denied
    let (status, _) = cluster
        .request(Method::GET, &format!("/datasets/{}?{}", dset_id, domain), bob, None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // grant bob read only
    let (status, _) = cluster
        .request(
            Method::PUT,
            &format!("/acls/bob?{}", domain),
            alice,
            Some(json!({ "read": true })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = cluster
        .request(Method::GET, &format!("/datasets/{}?{}", dset_id, domain), bob, None)
        .await;
    assert_eq!(status, StatusCode::OK);

    // delete still denied, and the dataset survives
    let (status, _) = cluster
        .request(Method::DELETE, &format!("/datasets/{}?{}", dset_id, domain), bob, None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = cluster
        .request(Method::GET, &format!("/datasets/{}?{}", dset_id, domain), alice, None)
        .await;
    assert_eq!(status, StatusCode::OK);

    // bad credentials are unauthorized
    let (status, _) = cluster
        .request(Method::GET, &format!("/?{}", domain), Some(("bob", "wrong")), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_point_read_and_write() {
    let cluster = start_cluster(2).await;
    let alice = Some(("alice", "alicepw"));
    cluster.create_domain("points.h6").await;
    let domain = "domain=/u/points.h6";

    let (status, dset) = cluster
        .request(
            Method::POST,
            &format!("/datasets?{}", domain),
            alice,
            Some(json!({
                "type": "H5T_STD_I32LE",
                "shape": [30],
                "layout": { "class": "H5D_CHUNKED", "dims": [10] },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", dset);
    let dset_id = dset["id"].as_str().unwrap();

    // write three points across chunks, then read them back with an
    // unwritten position mixed in
    let (status, _) = cluster
        .request(
            Method::POST,
            &format!("/datasets/{}/value?{}", dset_id, domain),
            alice,
            Some(json!({ "points": [3, 15, 27], "value": [30, 150, 270] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = cluster
        .request(
            Method::POST,
            &format!("/datasets/{}/value?{}", dset_id, domain),
            alice,
            Some(json!({ "points": [3, 9, 15, 27] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!([30, 0, 150, 270]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_attributes_and_groups() {
    let cluster = start_cluster(2).await;
    let alice = Some(("alice", "alicepw"));
    let root = cluster.create_domain("attrs.h6").await;
    let domain = "domain=/u/attrs.h6";

    let (status, _) = cluster
        .request(
            Method::PUT,
            &format!("/groups/{}/attributes/units?{}", root, domain),
            alice,
            Some(json!({
                "type": { "class": "H5T_STRING", "charSet": "H5T_CSET_ASCII",
                          "strPad": "H5T_STR_NULLPAD", "length": 6 },
                "value": "meters",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = cluster
        .request(
            Method::GET,
            &format!("/groups/{}/attributes/units?{}", root, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "meters");

    let (status, body) = cluster
        .request(
            Method::GET,
            &format!("/groups/{}/attributes?{}", root, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attributes"].as_array().unwrap().len(), 1);

    let (status, _) = cluster
        .request(
            Method::DELETE,
            &format!("/groups/{}/attributes/units?{}", root, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = cluster
        .request(
            Method::GET,
            &format!("/groups/{}/attributes/units?{}", root, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_too_large() {
    let cluster = start_cluster(1).await;
    let alice = Some(("alice", "alicepw"));
    cluster.create_domain("big.h6").await;
    let domain = "domain=/u/big.h6";

    // tiny chunks make the selection span more chunks than allowed
    let (status, dset) = cluster
        .request(
            Method::POST,
            &format!("/datasets?{}", domain),
            alice,
            Some(json!({
                "type": "H5T_STD_I32LE",
                "shape": [2000],
                "layout": { "class": "H5D_CHUNKED", "dims": [1] },
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", dset);
    let dset_id = dset["id"].as_str().unwrap();

    let (status, _) = cluster
        .request(
            Method::GET,
            &format!("/datasets/{}/value?{}", dset_id, domain),
            alice,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tombstoned_object_gone() {
    let cluster = start_cluster(1).await;
    let alice = Some(("alice", "alicepw"));
    cluster.create_domain("gone.h6").await;
    let domain = "domain=/u/gone.h6";

    let (status, group) = cluster
        .request(Method::POST, &format!("/groups?{}", domain), alice, None)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let group_id = group["id"].as_str().unwrap();

    let (status, _) = cluster
        .request(Method::DELETE, &format!("/groups/{}?{}", group_id, domain), alice, None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = cluster
        .request(Method::GET, &format!("/groups/{}?{}", group_id, domain), alice, None)
        .await;
    assert_eq!(status, StatusCode::GONE);
}
