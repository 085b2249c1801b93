//! Data-node group create handler. Reads and deletes go through the
//! uniform object paths in the parent module.

use hyper::{Body, Request, Response};

use crate::error::ServiceResult;
use crate::idutil::ObjClass;
use crate::node::NodeState;
use crate::server;

use super::create_obj;

pub async fn post_group(state: &NodeState, req: Request<Body>) -> ServiceResult<Response<Body>> {
    let body = server::read_json(req).await?;
    let obj = create_obj(state, ObjClass::Group, body).await?;
    server::created_json(&obj)
}
