// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Virtual port groups.

use super::{TypeHooks, fq_of};
use crate::context::RequestContext;
use crate::pipeline::undo::{Compensation, CompensationList, IdPool};
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult};
use serde_json::{Map, Value, json};

fn vpg_id(value: Option<&Value>) -> Option<u32> {
    value
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

pub struct VirtualPortGroupHooks;

#[async_trait]
impl TypeHooks for VirtualPortGroupHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let owner = fq_of(obj)?.to_string();
        let id = match vpg_id(obj.get("virtual_port_group_id")) {
            Some(id) => api.ids().vpg.reserve(id, &owner).await?,
            None => api.ids().vpg.alloc(&owner).await?,
        };
        undo.push(Compensation::FreeId {
            pool: IdPool::VirtualPortGroup,
            id,
        });
        obj.insert("virtual_port_group_id".into(), json!(id));
        Ok(())
    }

    async fn pre_update(
        &self,
        _api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
        patch: &mut Map<String, Value>,
        _undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if let Some(given) = vpg_id(patch.get("virtual_port_group_id"))
            && Some(given) != vpg_id(current.get("virtual_port_group_id"))
        {
            return Err(ApiError::bad_request(
                "Virtual port group id cannot be changed",
            ));
        }
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        if let Some(id) = vpg_id(current.get("virtual_port_group_id")) {
            api.ids().vpg.free(id).await?;
        }
        Ok(())
    }
}
