// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! BGP as a service sessions.

use super::{TypeHooks, as_bool, fq_of};
use crate::context::RequestContext;
use crate::pipeline::undo::{Compensation, CompensationList, IdPool};
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult};
use idalloc::AllocError;
use serde_json::{Map, Value, json};
use tracing::debug;

pub struct BgpaasHooks;

#[async_trait]
impl TypeHooks for BgpaasHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        if as_bool(obj.get("bgpaas_shared"))
            && obj.get("bgpaas_ip_address").is_none_or(Value::is_null)
        {
            return Err(ApiError::bad_request(
                "BGPaaS IP Address needs to be configured if BGPaaS is shared",
            ));
        }
        let fq = fq_of(obj)?.to_string();
        let port = match api.ids().bgpaas_port.alloc(&fq).await {
            Ok(port) => port,
            Err(AllocError::Exhausted(_)) => {
                let (start, end) = api.ids().bgpaas_port.range();
                return Err(ApiError::bad_request(format!(
                    "BGPaaS ports exhausted in range [{start}, {end}]"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        undo.push(Compensation::FreeId {
            pool: IdPool::BgpaasPort,
            id: port,
        });
        let mut attrs = obj
            .get("bgpaas_session_attributes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        attrs.insert("source_port".into(), json!(port));
        obj.insert("bgpaas_session_attributes".into(), Value::Object(attrs));
        debug!("BGPaaS {fq} gets port {port}");
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
        if patch.contains_key("bgpaas_shared")
            && as_bool(patch.get("bgpaas_shared")) != as_bool(current.get("bgpaas_shared"))
        {
            return Err(ApiError::bad_request("BGPaaS sharing cannot be modified"));
        }
        // the allocated port survives attribute updates
        if let Some(attrs) = patch
            .get_mut("bgpaas_session_attributes")
            .and_then(Value::as_object_mut)
            && let Some(port) = current
                .get("bgpaas_session_attributes")
                .and_then(|a| a.get("source_port"))
        {
            attrs.insert("source_port".into(), port.clone());
        }
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        api.ids()
            .bgpaas_port
            .free_owner(&fq_of(current)?.to_string())
            .await?;
        Ok(())
    }
}
