// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Networks: virtual networks under the tenant's project. External networks carry a
//! floating ip pool.

use crate::errors::{NeutronError, NeutronResult};
use crate::plugin::{
    NeutronPlugin, description_of, id_perms_enable, id_perms_from, list_reply, name_of,
    project_fields, tenant_of, timestamps, uuid_of,
};
use crate::request::{NeutronRequest, Operation};
use config::{ApiError, FqName};
use id::Uuid;
use perms::{PERMS_R, PERMS_RWX, PERMS_X, Perms2};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

pub(crate) const FIP_POOL_NAME: &str = "floating-ip-pool";

fn flag(resource: &Map<String, Value>, key: &str) -> Option<bool> {
    resource.get(key).and_then(Value::as_bool)
}

pub(crate) fn is_shared(vn: &Map<String, Value>) -> bool {
    vn.get("is_shared").and_then(Value::as_bool).unwrap_or(false)
        || Perms2::of(vn).global_access == PERMS_RWX
}

pub(crate) fn is_external(vn: &Map<String, Value>) -> bool {
    vn.get("router_external").and_then(Value::as_bool).unwrap_or(false)
}

/// Subnet ids of a network, in ipam reference order.
pub(crate) fn subnet_ids(vn: &Map<String, Value>) -> Vec<String> {
    vn.get("network_ipam_refs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|edge| edge.pointer("/attr/ipam_subnets").and_then(Value::as_array))
        .flatten()
        .filter_map(|s| s.get("subnet_uuid").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Global access bits of a network shared and/or external.
fn global_access(shared: bool, external: bool) -> u8 {
    if shared {
        PERMS_RWX
    } else if external {
        PERMS_R | PERMS_X
    } else {
        0
    }
}

pub(crate) fn network_view(vn: &Map<String, Value>) -> Map<String, Value> {
    let tenant = tenant_of(vn);
    let enabled = id_perms_enable(vn);
    let mut out = Map::new();
    out.insert("id".into(), vn.get("uuid").cloned().unwrap_or(Value::Null));
    out.insert("name".into(), json!(name_of(vn)));
    out.insert("tenant_id".into(), json!(tenant));
    out.insert("project_id".into(), json!(tenant));
    out.insert("admin_state_up".into(), json!(enabled));
    out.insert("status".into(), json!(if enabled { "ACTIVE" } else { "DOWN" }));
    out.insert("shared".into(), json!(is_shared(vn)));
    out.insert("router:external".into(), json!(is_external(vn)));
    out.insert("subnets".into(), json!(subnet_ids(vn)));
    out.insert(
        "port_security_enabled".into(),
        json!(
            vn.get("port_security_enabled")
                .and_then(Value::as_bool)
                .unwrap_or(true)
        ),
    );
    out.insert("description".into(), description_of(vn));
    out.insert("fq_name".into(), vn.get("fq_name").cloned().unwrap_or(Value::Null));
    timestamps(vn, &mut out);
    out
}

impl NeutronPlugin {
    pub(crate) async fn network_request(&self, req: &NeutronRequest) -> NeutronResult<Value> {
        match req.operation() {
            Operation::Create => {
                let view = self.network_create(req).await?;
                Ok(Value::Object(view))
            }
            Operation::Read => {
                let view = network_view(&self.network_visible(req, &req.id()?)?);
                Ok(project_fields(view, req.data.fields.as_ref()))
            }
            Operation::Update => {
                let view = self.network_update(req).await?;
                Ok(Value::Object(view))
            }
            Operation::Delete => {
                self.network_delete(req).await?;
                Ok(json!({}))
            }
            Operation::ReadAll | Operation::ReadCount => {
                Ok(list_reply(req, self.network_list(req)))
            }
            op => Err(Self::unsupported("network", op)),
        }
    }

    /// A network the caller may see: its own, a shared or external one, any for an admin.
    pub(crate) fn network_visible(
        &self,
        req: &NeutronRequest,
        uuid: &Uuid,
    ) -> NeutronResult<Map<String, Value>> {
        let not_found = || NeutronError::NetworkNotFound {
            net_id: uuid.to_string(),
        };
        let vn = self.read_typed("virtual-network", uuid).ok_or_else(not_found)?;
        let public = is_shared(&vn) || is_external(&vn);
        if !Self::visible(req, &tenant_of(&vn), public) {
            return Err(not_found());
        }
        Ok(vn)
    }

    /// A network the caller may change.
    fn network_owned(&self, req: &NeutronRequest, uuid: &Uuid) -> NeutronResult<Map<String, Value>> {
        let vn = self.network_visible(req, uuid)?;
        if !Self::visible(req, &tenant_of(&vn), false) {
            return Err(NeutronError::NetworkNotFound {
                net_id: uuid.to_string(),
            });
        }
        Ok(vn)
    }

    fn check_sharing(&self, shared: bool, external: bool) -> NeutronResult<()> {
        if shared && external && !self.api().config().neutron_shared_compat {
            return Err(NeutronError::bad_request(
                "network",
                "Inconsistent is_shared and router:external settings",
            ));
        }
        Ok(())
    }

    async fn network_create(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let res = req.resource();
        let tenant = self.tenant_for_create(req)?;
        let project = self.project_fq(&tenant)?;
        let uuid = Uuid::new_v4();
        let name = res
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .map_or_else(|| uuid.to_string(), str::to_string);
        let fq = project.child(name.as_str());
        self.check_free("virtual-network", &fq)?;

        let external = flag(res, "router:external").unwrap_or(false);
        let shared = flag(res, "shared").unwrap_or(false);
        self.check_sharing(shared, external)?;

        let mut body = Map::new();
        body.insert("uuid".into(), json!(uuid.to_string()));
        body.insert("fq_name".into(), json!(fq));
        body.insert("parent_type".into(), json!("project"));
        body.insert("display_name".into(), json!(name));
        body.insert("router_external".into(), json!(external));
        body.insert("is_shared".into(), json!(shared));
        body.insert(
            "perms2".into(),
            json!({
                "owner": id::undashed(&tenant),
                "owner_access": PERMS_RWX,
                "global_access": global_access(shared, external),
                "share": []
            }),
        );
        if let Some(port_security) = flag(res, "port_security_enabled") {
            body.insert("port_security_enabled".into(), json!(port_security));
        }
        if let Some(id_perms) = id_perms_from(res, None) {
            body.insert("id_perms".into(), id_perms);
        }
        let uuid = self
            .core_create(req, "virtual-network", body)
            .await
            .map_err(|e| network_error(e, &uuid))?;
        if external {
            self.ensure_fip_pool(req, &uuid, &fq).await?;
        }
        info!("Network {fq} created as {uuid}");
        Ok(network_view(&self.network_visible(req, &uuid)?))
    }

    async fn ensure_fip_pool(&self, req: &NeutronRequest, vn: &Uuid, fq: &FqName) -> NeutronResult<Uuid> {
        let mut body = Map::new();
        body.insert("fq_name".into(), json!(fq.child(FIP_POOL_NAME)));
        body.insert("parent_type".into(), json!("virtual-network"));
        body.insert(
            "perms2".into(),
            json!({"owner_access": PERMS_RWX, "global_access": PERMS_R | PERMS_X, "share": []}),
        );
        let pool = self
            .api()
            .get_or_create(&req.core_ctx(), "floating-ip-pool", body)
            .await?;
        debug!("Floating ip pool {pool} on network {vn}");
        Ok(pool)
    }

    pub(crate) fn fip_pools(&self, vn: &Uuid) -> Vec<Uuid> {
        self.list_uuids("floating-ip-pool", Some(vec![*vn]), None)
    }

    async fn drop_fip_pools(&self, req: &NeutronRequest, vn: &Uuid) -> NeutronResult<()> {
        for pool in self.fip_pools(vn) {
            match self.core_delete(req, "floating-ip-pool", &pool).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(ApiError::RefsExist(_) | ApiError::Conflict(_)) => {
                    return Err(NeutronError::NetworkInUse {
                        net_id: vn.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn network_update(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let uuid = req.id()?;
        let vn = self.network_owned(req, &uuid)?;
        let res = req.resource();
        let was_shared = is_shared(&vn);
        let was_external = is_external(&vn);
        let shared = flag(res, "shared").unwrap_or(was_shared);
        let external = flag(res, "router:external").unwrap_or(was_external);
        self.check_sharing(shared, external)?;

        if was_shared && !shared {
            let owner = tenant_of(&vn);
            let foreign = self
                .list_uuids("virtual-machine-interface", None, Some(vec![uuid]))
                .iter()
                .filter_map(|p| self.read_typed("virtual-machine-interface", p))
                .any(|port| tenant_of(&port) != owner);
            if foreign {
                return Err(NeutronError::InvalidSharedSetting {
                    network: name_of(&vn),
                });
            }
        }
        if was_external && !external {
            self.drop_fip_pools(req, &uuid).await?;
        }

        let mut patch = Map::new();
        if let Some(name) = res.get("name").and_then(Value::as_str) {
            patch.insert("display_name".into(), json!(name));
        }
        if let Some(port_security) = flag(res, "port_security_enabled") {
            patch.insert("port_security_enabled".into(), json!(port_security));
        }
        if let Some(id_perms) = id_perms_from(res, Some(&vn)) {
            patch.insert("id_perms".into(), id_perms);
        }
        if shared != was_shared || external != was_external {
            let mut perms = Perms2::of(&vn);
            perms.global_access = global_access(shared, external);
            patch.insert("perms2".into(), perms.to_value());
            patch.insert("is_shared".into(), json!(shared));
            patch.insert("router_external".into(), json!(external));
        }
        if !patch.is_empty() {
            self.core_update(req, "virtual-network", &uuid, patch)
                .await
                .map_err(|e| network_error(e, &uuid))?;
        }
        if external && !was_external {
            let fq = self.api().db().fq_name(&uuid)?;
            self.ensure_fip_pool(req, &uuid, &fq).await?;
        }
        Ok(network_view(&self.network_visible(req, &uuid)?))
    }

    async fn network_delete(&self, req: &NeutronRequest) -> NeutronResult<()> {
        let uuid = req.id()?;
        let vn = match self.network_owned(req, &uuid) {
            Ok(vn) => vn,
            Err(_) if !self.api().db().exists(&uuid) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.drop_fip_pools(req, &uuid).await?;
        match self.core_delete(req, "virtual-network", &uuid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(network_error(e, &uuid)),
        }
        for subnet in subnet_ids(&vn) {
            self.api().useragent().delete(&subnet);
        }
        info!("Network {uuid} deleted");
        Ok(())
    }

    /// Networks of the listed projects plus the shared and external ones.
    pub(crate) fn visible_networks(&self, req: &NeutronRequest) -> Vec<Map<String, Value>> {
        let projects = self.listing_projects(req);
        let mut found: BTreeMap<Uuid, Map<String, Value>> = BTreeMap::new();
        let everything = projects.is_none();
        for vn in self.list_typed("virtual-network", projects) {
            if let Some(uuid) = uuid_of(&vn) {
                found.insert(uuid, vn);
            }
        }
        if !everything && !req.filters().has("tenant_id") {
            for vn in self.list_typed("virtual-network", None) {
                if (is_shared(&vn) || is_external(&vn))
                    && let Some(uuid) = uuid_of(&vn)
                {
                    found.entry(uuid).or_insert(vn);
                }
            }
        }
        found.into_values().collect()
    }

    fn network_list(&self, req: &NeutronRequest) -> Vec<Map<String, Value>> {
        let filters = req.filters();
        self.visible_networks(req)
            .iter()
            .filter(|vn| {
                vn.get("id_perms")
                    .and_then(|p| p.get("user_visible"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true)
            })
            .map(network_view)
            .filter(|view| {
                filters.accepts_all(
                    view,
                    &["id", "name", "shared", "router:external", "admin_state_up", "status"],
                )
            })
            .collect()
    }
}

/// Core failures of a network write.
fn network_error(e: ApiError, uuid: &Uuid) -> NeutronError {
    match e {
        ApiError::RefsExist(_) => NeutronError::NetworkInUse {
            net_id: uuid.to_string(),
        },
        ApiError::OverQuota { resource, .. } => NeutronError::OverQuota { overs: resource },
        ApiError::Validation(msg) => NeutronError::bad_request("network", msg),
        e => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sharing_bits() {
        assert_eq!(global_access(true, false), PERMS_RWX);
        assert_eq!(global_access(true, true), PERMS_RWX);
        assert_eq!(global_access(false, true), PERMS_R | PERMS_X);
        assert_eq!(global_access(false, false), 0);
    }

    #[test]
    fn view_of_a_stored_network() {
        let vn = json!({
            "uuid": "5b4c3a2e-0000-4000-8000-000000000001",
            "fq_name": ["default-domain", "p", "net"],
            "name": "net",
            "parent_type": "project",
            "parent_uuid": "5b4c3a2e-0000-4000-8000-0000000000aa",
            "router_external": true,
            "id_perms": {"enable": false, "created": "c", "last_modified": "m"},
            "perms2": {"owner": "x", "global_access": 5},
            "network_ipam_refs": [{"uuid": "u", "attr": {"ipam_subnets": [
                {"subnet_uuid": "s1"}, {"subnet_uuid": "s2"}
            ]}}]
        });
        let view = network_view(vn.as_object().unwrap());
        assert_eq!(view["tenant_id"], "5b4c3a2e0000400080000000000000aa");
        assert_eq!(view["status"], "DOWN");
        assert_eq!(view["router:external"], true);
        assert_eq!(view["shared"], false);
        assert_eq!(view["subnets"], json!(["s1", "s2"]));
        assert_eq!(view["updated_at"], "m");
    }
}
