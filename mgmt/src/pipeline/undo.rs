// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Compensating actions recorded while a request makes progress.
//!
//! Every stage that changes state outside the resource table records how to take the change
//! back. When a later stage fails the list is unwound last-in first-out.

use crate::addrmgr::SubnetSpec;
use crate::context::RequestContext;
use crate::server::ApiServer;
use config::FqName;
use id::Uuid;
use perms::QuotaTicket;
use serde_json::{Map, Value};
use std::net::IpAddr;
use tracing::{error, warn};

/// An identifier space managed by the allocators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdPool {
    VirtualNetwork,
    SecurityGroup,
    RouteTarget,
    TagType,
    VirtualPortGroup,
    BgpaasPort,
    /// Value ids of one tag type.
    TagValue(String),
    /// Service chain VLANs of one virtual machine.
    VmVlan(String),
}

#[derive(Debug, Clone)]
pub enum Compensation {
    ReleaseName {
        resource_type: &'static str,
        fq_name: FqName,
    },
    ReturnQuota(QuotaTicket),
    FreeId {
        pool: IdPool,
        id: u32,
    },
    /// Take back an id freed by the failed request.
    ReclaimId {
        pool: IdPool,
        id: u32,
        owner: String,
    },
    FreeAddress {
        vn: FqName,
        addr: IpAddr,
    },
    ForgetNetwork {
        vn: FqName,
    },
    RestoreNetwork {
        vn: FqName,
        subnets: Vec<SubnetSpec>,
    },
    /// Delete a resource created on behalf of the failed request.
    DeleteResource {
        resource_type: &'static str,
        uuid: Uuid,
    },
    /// Put back the fields a failed request changed on a resource.
    RestoreResource {
        resource_type: &'static str,
        uuid: Uuid,
        body: Map<String, Value>,
    },
}

#[derive(Debug, Default)]
pub struct CompensationList {
    records: Vec<Compensation>,
}

impl CompensationList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Compensation) {
        self.records.push(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[Compensation] {
        &self.records
    }

    /// Run every compensation, most recent first. Failures are logged and skipped.
    pub async fn unwind(self, api: &ApiServer, ctx: &RequestContext) {
        let rid = &ctx.request_id;
        for record in self.records.into_iter().rev() {
            warn!("{rid}: undo {record:?}");
            let result = match record {
                Compensation::ReleaseName {
                    resource_type,
                    fq_name,
                } => {
                    api.db().release(resource_type, &fq_name);
                    Ok(())
                }
                Compensation::ReturnQuota(ticket) => {
                    api.quota().release(&ticket).await;
                    Ok(())
                }
                Compensation::FreeId { pool, id } => {
                    api.free_id(&pool, id).await.map_err(Into::into)
                }
                Compensation::ReclaimId { pool, id, owner } => api
                    .reserve_id(&pool, id, &owner)
                    .await
                    .map(|_| ())
                    .map_err(Into::into),
                Compensation::FreeAddress { vn, addr } => {
                    api.addrmgr().free(&vn, addr);
                    Ok(())
                }
                Compensation::ForgetNetwork { vn } => {
                    api.addrmgr().net_delete(&vn);
                    Ok(())
                }
                Compensation::RestoreNetwork { vn, subnets } => {
                    api.addrmgr().net_restore(&vn, subnets);
                    Ok(())
                }
                Compensation::DeleteResource {
                    resource_type,
                    uuid,
                } => api
                    .delete_boxed(ctx.as_internal(), resource_type, uuid)
                    .await
                    .map(|_| ()),
                Compensation::RestoreResource {
                    resource_type,
                    uuid,
                    body,
                } => api
                    .update_boxed(ctx.as_internal(), resource_type, uuid, body)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                error!("{rid}: undo step failed: {e}");
            }
        }
    }
}
