// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Direct address management on a virtual network: ip-alloc, ip-free and subnet-ip-count.

use crate::addrmgr::Family;
use crate::context::RequestContext;
use crate::pipeline::{audit, perms_of};
use crate::server::ApiServer;
use config::{ApiError, ApiResult, FqName};
use id::Uuid;
use perms::Crud;
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpAlloc {
    /// `prefix/len` of the subnet to allocate from.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub family: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpFree {
    #[serde(default)]
    pub ip_addr: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubnetIpCount {
    #[serde(default)]
    pub subnet_list: Vec<String>,
}

impl ApiServer {
    fn network_for_ips(&self, ctx: &RequestContext, vn: &Uuid, op: Crud) -> ApiResult<FqName> {
        if self.db().resource_type(vn)? != "virtual-network" {
            return Err(ApiError::no_id(vn));
        }
        self.check_rbac(ctx, "virtual-network", &[], op)?;
        if !self.perms().is_admin(&ctx.identity) {
            let perms = perms_of(self, vn)?;
            match op {
                Crud::Read => self.perms().check_read(&ctx.identity, &perms)?,
                _ => self.perms().check_write(&ctx.identity, &perms)?,
            }
        }
        self.db().fq_name(vn)
    }

    pub fn ip_alloc(&self, ctx: &RequestContext, vn: &Uuid, req: &IpAlloc) -> ApiResult<Value> {
        let fq = self.network_for_ips(ctx, vn, Crud::Update)?;
        let family = req.family.as_deref().map(Family::parse).transpose()?;
        let subnet_uuid = match req.subnet.as_deref() {
            Some(cidr) => Some(
                self.addrmgr()
                    .subnets(&fq)
                    .into_iter()
                    .find(|s| s.prefix.to_string() == cidr)
                    .map(|s| s.subnet_uuid)
                    .ok_or_else(|| {
                        ApiError::bad_request(format!("Subnet {cidr} not found in {fq}"))
                    })?,
            ),
            None => None,
        };
        let count = req.count.unwrap_or(1);
        self.check_backpressure()?;
        let mut allocated: Vec<IpAddr> = Vec::with_capacity(count);
        for _ in 0..count {
            match self
                .addrmgr()
                .alloc(&fq, family, subnet_uuid.as_deref(), None)
            {
                Ok((addr, _)) => allocated.push(addr),
                Err(e) => {
                    for addr in allocated {
                        self.addrmgr().free(&fq, addr);
                    }
                    return Err(e);
                }
            }
        }
        debug!("Allocated {allocated:?} in {fq}");
        audit(ctx, "ip-alloc", "virtual-network", Some(vn), Ok(()));
        let addrs: Vec<String> = allocated.iter().map(ToString::to_string).collect();
        Ok(json!({ "ip_addr": addrs }))
    }

    pub fn ip_free(&self, ctx: &RequestContext, vn: &Uuid, req: &IpFree) -> ApiResult<Value> {
        let fq = self.network_for_ips(ctx, vn, Crud::Update)?;
        let addrs = req
            .ip_addr
            .iter()
            .map(|a| {
                IpAddr::from_str(a)
                    .map_err(|_| ApiError::bad_request(format!("Invalid ip address {a}")))
            })
            .collect::<ApiResult<Vec<_>>>()?;
        for addr in addrs {
            self.addrmgr().free(&fq, addr);
        }
        audit(ctx, "ip-free", "virtual-network", Some(vn), Ok(()));
        Ok(json!({}))
    }

    pub fn subnet_ip_count(
        &self,
        ctx: &RequestContext,
        vn: &Uuid,
        req: &SubnetIpCount,
    ) -> ApiResult<Value> {
        let fq = self.network_for_ips(ctx, vn, Crud::Read)?;
        Ok(json!({ "ip_count_list": self.addrmgr().count(&fq, &req.subnet_list) }))
    }
}
