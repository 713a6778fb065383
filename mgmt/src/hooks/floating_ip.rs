// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Floating ips: addresses from the network owning their pool.

use super::instance_ip::parse_addr;
use super::{TypeHooks, fq_of, parent_uuid_of};
use crate::context::RequestContext;
use crate::pipeline::undo::{Compensation, CompensationList};
use crate::server::ApiServer;
use async_trait::async_trait;
use config::{ApiError, ApiResult, FqName};
use serde_json::{Map, Value, json};
use store::ReadOptions;
use tracing::debug;

/// The network a pool floating ip draws from, `None` for floating ips under an instance ip.
fn pool_network(obj: &Map<String, Value>) -> ApiResult<Option<FqName>> {
    if obj.get("parent_type").and_then(Value::as_str) == Some("instance-ip") {
        return Ok(None);
    }
    let fq = fq_of(obj)?;
    Ok((fq.len() > 2).then(|| fq.parent().parent()))
}

/// Subnets a pool restricts its addresses to; empty for every subnet of the network.
fn pool_subnets(pool: &Map<String, Value>) -> Vec<String> {
    pool.get("floating_ip_pool_subnets")
        .and_then(|s| s.get("subnet_uuid"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

pub struct FloatingIpHooks;

#[async_trait]
impl TypeHooks for FloatingIpHooks {
    async fn pre_create(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        obj: &mut Map<String, Value>,
        undo: &mut CompensationList,
    ) -> ApiResult<()> {
        let Some(vn) = pool_network(obj)? else {
            return Ok(());
        };
        let requested = parse_addr(obj.get("floating_ip_address"))?;
        if let Some(addr) = requested
            && api.addrmgr().is_allocated(&vn, addr)
        {
            return Err(ApiError::Conflict("Ip address already in use".to_string()));
        }
        let subnets = match parent_uuid_of(obj) {
            Some(pool) => pool_subnets(&api.db().read(&pool, &ReadOptions::shallow())?),
            None => Vec::new(),
        };

        let (addr, _) = if subnets.is_empty() {
            api.addrmgr().alloc(&vn, None, None, requested)?
        } else {
            let mut last = None;
            let mut found = None;
            for subnet in &subnets {
                match api.addrmgr().alloc(&vn, None, Some(subnet), requested) {
                    Ok(got) => {
                        found = Some(got);
                        break;
                    }
                    Err(e) => last = Some(e),
                }
            }
            match (found, last) {
                (Some(got), _) => got,
                (None, Some(e)) => return Err(e),
                (None, None) => {
                    return Err(ApiError::Conflict(format!(
                        "Virtual-Network({vn}) has exhausted subnet({})",
                        subnets.join(", ")
                    )));
                }
            }
        };
        undo.push(Compensation::FreeAddress {
            vn: vn.clone(),
            addr,
        });
        debug!("Floating ip gets {addr} in {vn}");
        obj.insert("floating_ip_address".into(), json!(addr.to_string()));
        Ok(())
    }

    async fn post_delete(
        &self,
        api: &ApiServer,
        _ctx: &RequestContext,
        current: &Map<String, Value>,
    ) -> ApiResult<()> {
        if let Some(vn) = pool_network(current)?
            && let Some(addr) = parse_addr(current.get("floating_ip_address"))?
        {
            api.addrmgr().free(&vn, addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_ips_come_from_the_pool_network() {
        let obj = json!({
            "fq_name": ["default-domain", "p", "public", "pool", "fip1"],
            "parent_type": "floating-ip-pool"
        });
        assert_eq!(
            pool_network(obj.as_object().unwrap()).unwrap().unwrap().to_string(),
            "default-domain:p:public"
        );
        let obj = json!({"fq_name": ["iip", "fip1"], "parent_type": "instance-ip"});
        assert_eq!(pool_network(obj.as_object().unwrap()).unwrap(), None);
    }

    #[test]
    fn pool_subnets_restrict_allocation() {
        let pool = json!({"floating_ip_pool_subnets": {"subnet_uuid": ["s1", "s2"]}});
        assert_eq!(pool_subnets(pool.as_object().unwrap()), vec!["s1", "s2"]);
        assert!(pool_subnets(&Map::new()).is_empty());
    }
}
