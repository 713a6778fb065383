// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The adapter object and the helpers every resource handler shares.
//!
//! Handlers call the core pipeline in-process with system privileges and the caller's tenant
//! as owner, so tenant visibility is enforced here: a caller sees what its tenant owns, what
//! is shared, or everything when it is an admin.

use crate::errors::{NeutronError, NeutronResult};
use crate::request::{NeutronRequest, Operation, Resource};
use config::{ApiError, ApiResult, FqName};
use id::Uuid;
use mgmt::ApiServer;
use mgmt::refs::{RefOperation, RefUpdate};
use perms::Perms2;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use store::{ListQuery, ReadOptions};
use tracing::debug;

use tracectl::trace_target;
trace_target!("neutron", LevelFilter::INFO, &["neutron"]);

/// Translates Neutron requests into core operations.
pub struct NeutronPlugin {
    api: Arc<ApiServer>,
}

impl NeutronPlugin {
    #[must_use]
    pub fn new(api: Arc<ApiServer>) -> Self {
        Self { api }
    }

    #[must_use]
    pub fn api(&self) -> &ApiServer {
        &self.api
    }

    /// Serve one request. The result is the Neutron representation of the resource, a list of
    /// them, or `{"count": n}`.
    pub async fn handle(&self, resource: Resource, req: &NeutronRequest) -> NeutronResult<Value> {
        debug!(
            "{} {resource} {} for tenant {:?}",
            req.operation(),
            req.id_str(),
            req.context.tenant_id
        );
        match resource {
            Resource::Network => self.network_request(req).await,
            Resource::Subnet => self.subnet_request(req).await,
            Resource::Port => self.port_request(req).await,
            Resource::Router => self.router_request(req).await,
            Resource::FloatingIp => self.floatingip_request(req).await,
            Resource::SecurityGroup => self.security_group_request(req).await,
            Resource::SecurityGroupRule => self.security_group_rule_request(req).await,
        }
    }

    pub(crate) fn unsupported(resource: &str, op: Operation) -> NeutronError {
        NeutronError::bad_request(resource, format!("unsupported operation {op}"))
    }

    /// Full body of a resource of type `ty`, children and back references included.
    pub(crate) fn read_typed(&self, ty: &str, uuid: &Uuid) -> Option<Map<String, Value>> {
        if self.api.db().resource_type(uuid).ok()? != ty {
            return None;
        }
        self.api.db().read(uuid, &ReadOptions::default()).ok()
    }

    pub(crate) fn list_uuids(
        &self,
        ty: &str,
        parents: Option<Vec<Uuid>>,
        backrefs: Option<Vec<Uuid>>,
    ) -> Vec<Uuid> {
        let query = ListQuery {
            resource_type: ty.to_string(),
            parent_uuids: parents,
            backref_uuids: backrefs,
            ..ListQuery::default()
        };
        self.api
            .db()
            .list(&query)
            .map(|page| page.uuids)
            .unwrap_or_default()
    }

    /// Full bodies of every resource of a type, optionally restricted to some parents.
    pub(crate) fn list_typed(
        &self,
        ty: &str,
        parents: Option<Vec<Uuid>>,
    ) -> Vec<Map<String, Value>> {
        self.list_uuids(ty, parents, None)
            .iter()
            .filter_map(|u| self.read_typed(ty, u))
            .collect()
    }

    /// The projects a caller may list in: its own, or every one for an admin, narrowed by a
    /// `tenant_id` filter.
    pub(crate) fn listing_projects(&self, req: &NeutronRequest) -> Option<Vec<Uuid>> {
        let wanted: Vec<Uuid> = req
            .filters()
            .strings("tenant_id")
            .into_iter()
            .chain(req.filters().strings("project_id"))
            .filter_map(|t| id::parse_lenient(&t).ok())
            .collect();
        if req.is_admin() {
            return (!wanted.is_empty()).then_some(wanted);
        }
        let own = req.tenant().into_iter().collect::<Vec<_>>();
        if wanted.is_empty() {
            Some(own)
        } else {
            Some(wanted.into_iter().filter(|w| own.contains(w)).collect())
        }
    }

    /// The project of `tenant`, which must exist.
    pub(crate) fn project_fq(&self, tenant: &Uuid) -> NeutronResult<FqName> {
        match self.api.db().resource_type(tenant) {
            Ok("project") => Ok(self.api.db().fq_name(tenant)?),
            _ => Err(NeutronError::NotFound {
                msg: format!("Project {} could not be found", id::undashed(tenant)),
            }),
        }
    }

    /// The tenant a new resource belongs to. Only an admin may create for another tenant.
    pub(crate) fn tenant_for_create(&self, req: &NeutronRequest) -> NeutronResult<Uuid> {
        let given = req
            .resource()
            .get("tenant_id")
            .or_else(|| req.resource().get("project_id"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());
        let own = req.tenant();
        let tenant = match (given, own) {
            (Some(given), own) => {
                let given = id::parse_lenient(given)
                    .map_err(|_| NeutronError::invalid_input(format!("Invalid tenant {given}")))?;
                if !req.is_admin() && own != Some(given) {
                    return Err(NeutronError::AdminRequired {
                        reason: "Cannot create resource for another tenant".to_string(),
                    });
                }
                given
            }
            (None, Some(own)) => own,
            (None, None) => {
                return Err(NeutronError::bad_request("request", "tenant_id is required"));
            }
        };
        self.project_fq(&tenant)?;
        Ok(tenant)
    }

    /// Whether the caller may see a resource owned by `tenant`.
    pub(crate) fn visible(req: &NeutronRequest, tenant: &str, shared: bool) -> bool {
        req.is_admin()
            || shared
            || req
                .tenant()
                .is_some_and(|own| id::undashed(&own) == tenant.replace('-', ""))
    }

    pub(crate) async fn core_create(
        &self,
        req: &NeutronRequest,
        ty: &'static str,
        body: Map<String, Value>,
    ) -> ApiResult<Uuid> {
        let outcome = self.api.create(&req.core_ctx(), ty, body).await?;
        outcome
            .uuid()
            .ok_or_else(|| ApiError::Internal(format!("Create of {ty} returned no id")))
    }

    pub(crate) async fn core_update(
        &self,
        req: &NeutronRequest,
        ty: &'static str,
        uuid: &Uuid,
        patch: Map<String, Value>,
    ) -> ApiResult<()> {
        self.api.update(&req.core_ctx(), ty, uuid, patch).await?;
        Ok(())
    }

    pub(crate) async fn core_delete(
        &self,
        req: &NeutronRequest,
        ty: &'static str,
        uuid: &Uuid,
    ) -> ApiResult<()> {
        self.api.delete(&req.core_ctx(), ty, uuid).await?;
        Ok(())
    }

    pub(crate) async fn core_ref(
        &self,
        req: &NeutronRequest,
        ty: &str,
        uuid: &Uuid,
        ref_type: &str,
        ref_uuid: &Uuid,
        op: RefOperation,
        attr: Option<Value>,
    ) -> ApiResult<()> {
        let mut update = RefUpdate::new(ty, uuid, ref_type, ref_uuid, op);
        update.attr = attr;
        self.api.ref_update(&req.core_ctx(), &update).await?;
        Ok(())
    }

    /// Reject a create whose fq-name is taken, naming the existing resource.
    pub(crate) fn check_free(&self, ty: &str, fq: &FqName) -> NeutronResult<()> {
        match self.api.db().uuid_of(ty, fq) {
            Ok(existing) => Err(NeutronError::Conflict {
                message: format!("{ty} {fq} already exists with id {existing}"),
                id: Some(existing.to_string()),
            }),
            Err(_) => Ok(()),
        }
    }
}

/// Tenant a resource belongs to, undashed: its parent project, else its owner.
pub(crate) fn tenant_of(obj: &Map<String, Value>) -> String {
    if obj.get("parent_type").and_then(Value::as_str) == Some("project")
        && let Some(parent) = obj
            .get("parent_uuid")
            .and_then(Value::as_str)
            .and_then(|u| Uuid::parse_str(u).ok())
    {
        return id::undashed(&parent);
    }
    Perms2::of(obj).owner
}

pub(crate) fn uuid_of(obj: &Map<String, Value>) -> Option<Uuid> {
    obj.get("uuid")
        .and_then(Value::as_str)
        .and_then(|u| Uuid::parse_str(u).ok())
}

/// The display name, else the last fq-name segment.
pub(crate) fn name_of(obj: &Map<String, Value>) -> String {
    obj.get("display_name")
        .and_then(Value::as_str)
        .or_else(|| obj.get("name").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Targets of the `field` references of a body.
pub(crate) fn ref_uuids(obj: &Map<String, Value>, field: &str) -> Vec<Uuid> {
    obj.get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| r.get("uuid").and_then(Value::as_str))
        .filter_map(|u| Uuid::parse_str(u).ok())
        .collect()
}

/// `(uuid, attr)` of the `field` references of a body.
pub(crate) fn ref_edges(obj: &Map<String, Value>, field: &str) -> Vec<(Uuid, Value)> {
    obj.get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| {
            let uuid = Uuid::parse_str(r.get("uuid")?.as_str()?).ok()?;
            Some((uuid, r.get("attr").cloned().unwrap_or(Value::Null)))
        })
        .collect()
}

pub(crate) fn id_perms_enable(obj: &Map<String, Value>) -> bool {
    obj.get("id_perms")
        .and_then(|p| p.get("enable"))
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

pub(crate) fn description_of(obj: &Map<String, Value>) -> Value {
    obj.get("id_perms")
        .and_then(|p| p.get("description"))
        .cloned()
        .unwrap_or(Value::Null)
}

/// `created_at` and `updated_at` of a rendered resource.
pub(crate) fn timestamps(obj: &Map<String, Value>, out: &mut Map<String, Value>) {
    let id_perms = obj.get("id_perms");
    let stamp = |key: &str| {
        id_perms
            .and_then(|p| p.get(key))
            .cloned()
            .unwrap_or(Value::Null)
    };
    out.insert("created_at".into(), stamp("created"));
    out.insert("updated_at".into(), stamp("last_modified"));
}

/// Copy `admin_state_up` and `description` from a Neutron body into `id_perms`, over what
/// `current` holds.
pub(crate) fn id_perms_from(
    resource: &Map<String, Value>,
    current: Option<&Map<String, Value>>,
) -> Option<Value> {
    let admin_state = resource.get("admin_state_up").and_then(Value::as_bool);
    let description = resource.get("description").filter(|d| !d.is_null());
    if admin_state.is_none() && description.is_none() {
        return None;
    }
    let mut id_perms = current
        .and_then(|c| c.get("id_perms"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    if let Some(enable) = admin_state {
        id_perms.insert("enable".into(), json!(enable));
    }
    if let Some(description) = description {
        id_perms.insert("description".into(), description.clone());
    }
    Some(Value::Object(id_perms))
}

/// Restrict a rendered resource to the requested fields.
pub(crate) fn project_fields(item: Map<String, Value>, fields: Option<&Vec<String>>) -> Value {
    match fields.filter(|f| !f.is_empty()) {
        None => Value::Object(item),
        Some(fields) => Value::Object(
            item.into_iter()
                .filter(|(k, _)| fields.contains(k))
                .collect(),
        ),
    }
}

/// `{"count": n}` or the list itself, as the operation asks.
pub(crate) fn list_reply(req: &NeutronRequest, items: Vec<Map<String, Value>>) -> Value {
    if req.operation() == Operation::ReadCount {
        return json!({ "count": items.len() });
    }
    Value::Array(
        items
            .into_iter()
            .map(|i| project_fields(i, req.data.fields.as_ref()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tenant_comes_from_project_parent() {
        let obj = json!({
            "parent_type": "project",
            "parent_uuid": "0a0b0c0d-0000-0000-0000-000000000001",
            "perms2": {"owner": "other"}
        });
        assert_eq!(
            tenant_of(obj.as_object().unwrap()),
            "0a0b0c0d000000000000000000000001"
        );
        let obj = json!({"parent_type": "floating-ip-pool", "perms2": {"owner": "abc"}});
        assert_eq!(tenant_of(obj.as_object().unwrap()), "abc");
    }

    #[test]
    fn id_perms_merge_over_current() {
        let current = json!({"id_perms": {"enable": true, "created": "t0"}});
        let resource = json!({"admin_state_up": false});
        let merged = id_perms_from(resource.as_object().unwrap(), current.as_object()).unwrap();
        assert_eq!(merged, json!({"enable": false, "created": "t0"}));
        assert!(id_perms_from(&Map::new(), None).is_none());
    }

    #[test]
    fn fields_are_projected() {
        let item = json!({"id": "x", "name": "n", "status": "ACTIVE"});
        let fields = vec!["id".to_string()];
        assert_eq!(
            project_fields(item.as_object().unwrap().clone(), Some(&fields)),
            json!({"id": "x"})
        );
    }
}
