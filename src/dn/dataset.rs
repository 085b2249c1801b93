//! Data-node dataset handlers: create, resize and delete. The chunk
//! sweep after a delete belongs to the async GC collaborator; this
//! node only tombstones the record and forgets the dataset's deflate
//! level.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::dset;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::node::NodeState;
use crate::server;
use crate::store::unix_now;

use super::{create_obj, delete_metadata_obj, get_metadata_obj, save_metadata_obj};

pub async fn post_dataset(state: &NodeState, req: Request<Body>) -> ServiceResult<Response<Body>> {
    let body = server::read_json(req).await?;
    let obj = create_obj(state, ObjClass::Dataset, body).await?;

    // make the deflate level available to the lazy chunk writer
    if let (Some(id), Some(level)) =
        (obj.get("id").and_then(Value::as_str), dset::deflate_level(&obj))
    {
        state.deflate_map.lock().unwrap().insert(id.to_string(), level);
    }
    server::created_json(&obj)
}

/// Grow the dataset within its maxdims. Shrinking is not supported.
pub async fn put_shape(
    state: &NodeState,
    req: Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    idutil::validate_id(dset_id, Some(ObjClass::Dataset))?;
    let body = server::read_json(req).await?;
    let new_dims: Option<Vec<u64>> = body
        .get("shape")
        .and_then(Value::as_array)
        .map(|dims| dims.iter().map(Value::as_u64).collect())
        .unwrap_or(None);
    let new_dims =
        new_dims.ok_or_else(|| ServiceError::BadRequest("missing shape dims".to_string()))?;

    let _guard = state.meta_write_lock.lock().await;
    let mut dset_json = get_metadata_obj(state, dset_id).await?;
    let shape = dset::dataset_shape(&dset_json)?;
    let dims = shape
        .value_dims()
        .ok_or_else(|| ServiceError::BadRequest("dataset is not resizable".to_string()))?;
    let maxdims = shape
        .maxdims()
        .ok_or_else(|| ServiceError::BadRequest("dataset has no maxdims".to_string()))?;

    if new_dims.len() != dims.len() {
        return Err(ServiceError::BadRequest(format!(
            "shape rank {} does not match dataset rank {}",
            new_dims.len(),
            dims.len()
        )));
    }
    for ((new_dim, dim), maxdim) in new_dims.iter().zip(&dims).zip(maxdims) {
        if new_dim < dim {
            return Err(ServiceError::BadRequest(format!(
                "dimension may not shrink: {} < {}",
                new_dim, dim
            )));
        }
        if *maxdim != 0 && new_dim > maxdim {
            return Err(ServiceError::BadRequest(format!(
                "dimension {} exceeds maxdim {}",
                new_dim, maxdim
            )));
        }
    }

    dset_json["shape"]["dims"] = json!(new_dims);
    dset_json["lastModified"] = json!(unix_now());
    save_metadata_obj(state, dset_id, dset_json, false).await?;

    server::created_json(&json!({ "shape": { "dims": new_dims } }))
}

pub async fn delete_dataset(state: &NodeState, dset_id: &str) -> ServiceResult<Response<Body>> {
    idutil::validate_id(dset_id, Some(ObjClass::Dataset))?;
    state.deflate_map.lock().unwrap().remove(dset_id);
    delete_metadata_obj(state, dset_id).await?;
    server::ok_json(&json!({}))
}
