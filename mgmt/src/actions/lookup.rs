// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Name and id resolution.

use crate::context::RequestContext;
use crate::pipeline::perms_of;
use crate::server::ApiServer;
use config::{ApiError, ApiResult, FqName};
use perms::Crud;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Clone, Deserialize)]
pub struct FqNameToId {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub fq_name: FqName,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdToFqName {
    pub uuid: String,
}

impl ApiServer {
    pub fn fqname_to_id(&self, ctx: &RequestContext, req: &FqNameToId) -> ApiResult<Value> {
        let ty = Self::resource_type(&req.resource_type)?;
        self.check_rbac(ctx, "fqname-to-id", &[], Crud::Create)?;
        let uuid = self
            .db()
            .uuid_of(ty, &req.fq_name)
            .map_err(|_| ApiError::NotFound(format!("Name {:?} not found", req.fq_name.segments())))?;
        if !self.perms().is_admin(&ctx.identity) {
            self.perms()
                .check_read(&ctx.identity, &perms_of(self, &uuid)?)?;
        }
        Ok(json!({ "uuid": uuid.to_string() }))
    }

    pub fn id_to_fqname(&self, ctx: &RequestContext, req: &IdToFqName) -> ApiResult<Value> {
        self.check_rbac(ctx, "id-to-fqname", &[], Crud::Create)?;
        let not_found = || ApiError::NotFound(format!("UUID {} not found", req.uuid));
        let uuid = id::parse_lenient(&req.uuid).map_err(|_| not_found())?;
        let ty = self.db().resource_type(&uuid).map_err(|_| not_found())?;
        if !self.perms().is_admin(&ctx.identity) {
            self.perms()
                .check_read(&ctx.identity, &perms_of(self, &uuid)?)?;
        }
        Ok(json!({ "fq_name": self.db().fq_name(&uuid)?, "type": ty }))
    }
}
