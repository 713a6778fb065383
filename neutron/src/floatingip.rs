// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Floating ips live in the pool of an external network and point at one fixed ip of a port.

use crate::errors::{NeutronError, NeutronResult};
use crate::plugin::{
    NeutronPlugin, description_of, list_reply, project_fields, ref_uuids, tenant_of, timestamps,
    uuid_of,
};
use crate::port::{PortMemo, ip_error, refs_of};
use crate::request::{NeutronRequest, Operation};
use crate::router::gateway_of;
use config::ApiError;
use id::Uuid;
use perms::PERMS_RWX;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use store::ReadOptions;
use tracing::{debug, info};

/// What a request asks of the association of a floating ip.
enum Association {
    Keep,
    Clear,
    Set { port: Uuid, fixed_ip: String },
}

impl NeutronPlugin {
    pub(crate) async fn floatingip_request(&self, req: &NeutronRequest) -> NeutronResult<Value> {
        match req.operation() {
            Operation::Create => Ok(Value::Object(self.fip_create(req).await?)),
            Operation::Read => {
                let fip = self.fip_visible(req, &req.id_str())?;
                Ok(project_fields(self.fip_view(&fip), req.data.fields.as_ref()))
            }
            Operation::Update => Ok(Value::Object(self.fip_update(req).await?)),
            Operation::Delete => {
                let fip = self.fip_visible(req, &req.id_str())?;
                let uuid = uuid_of(&fip).ok_or_else(|| NeutronError::FloatingIPNotFound {
                    floatingip_id: req.id_str(),
                })?;
                match self.core_delete(req, "floating-ip", &uuid).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        return Err(NeutronError::FloatingIPNotFound {
                            floatingip_id: uuid.to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
                info!("Floating ip {uuid} deleted");
                Ok(json!({}))
            }
            Operation::ReadAll | Operation::ReadCount => Ok(list_reply(req, self.fip_list(req))),
            op => Err(Self::unsupported("floatingip", op)),
        }
    }

    fn fip_visible(&self, req: &NeutronRequest, id: &str) -> NeutronResult<Map<String, Value>> {
        id::parse_lenient(id)
            .ok()
            .and_then(|u| self.read_typed("floating-ip", &u))
            .filter(|fip| Self::visible(req, &tenant_of(fip), false))
            .ok_or_else(|| NeutronError::FloatingIPNotFound {
                floatingip_id: id.to_string(),
            })
    }

    /// The network a floating ip draws from: the parent of its pool.
    fn fip_network(&self, fip: &Map<String, Value>) -> Option<Uuid> {
        let pool = fip
            .get("parent_uuid")
            .and_then(Value::as_str)
            .and_then(|u| Uuid::parse_str(u).ok())?;
        self.api().db().parent(&pool).ok().flatten().map(|p| p.uuid)
    }

    /// Routers with a gateway on `external` and an interface in `private`.
    fn routers_between(&self, external: &Uuid, private: &Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        for router in self.list_uuids("logical-router", None, Some(vec![*external])) {
            let Some(lr) = self.read_typed("logical-router", &router) else {
                continue;
            };
            if gateway_of(&lr) != Some(*external) {
                continue;
            }
            let reaches = ref_uuids(&lr, "virtual_machine_interface_refs")
                .iter()
                .filter_map(|port| self.api().db().read(port, &ReadOptions::shallow()).ok())
                .any(|port| ref_uuids(&port, "virtual_network_refs").contains(private));
            if reaches {
                out.push(router);
            }
        }
        out
    }

    pub(crate) fn fip_view(&self, fip: &Map<String, Value>) -> Map<String, Value> {
        let tenant = tenant_of(fip);
        let network = self.fip_network(fip);
        let port = ref_uuids(fip, "virtual_machine_interface_refs").first().copied();
        let router = match (network, port) {
            (Some(network), Some(port)) => self
                .api()
                .db()
                .read(&port, &ReadOptions::shallow())
                .ok()
                .and_then(|p| ref_uuids(&p, "virtual_network_refs").first().copied())
                .and_then(|private| self.routers_between(&network, &private).first().copied()),
            _ => None,
        };
        let mut out = Map::new();
        out.insert("id".into(), fip.get("uuid").cloned().unwrap_or(Value::Null));
        out.insert("tenant_id".into(), json!(tenant));
        out.insert("project_id".into(), json!(tenant));
        out.insert(
            "floating_ip_address".into(),
            fip.get("floating_ip_address").cloned().unwrap_or(Value::Null),
        );
        out.insert("floating_network_id".into(), json!(network.map(|n| n.to_string())));
        out.insert("router_id".into(), json!(router.map(|r| r.to_string())));
        out.insert("port_id".into(), json!(port.map(|p| p.to_string())));
        out.insert(
            "fixed_ip_address".into(),
            fip.get("floating_ip_fixed_ip_address").cloned().unwrap_or(Value::Null),
        );
        out.insert(
            "status".into(),
            json!(if port.is_some() { "ACTIVE" } else { "DOWN" }),
        );
        out.insert("description".into(), description_of(fip));
        timestamps(fip, &mut out);
        out
    }

    /// Validate the `port_id` and `fixed_ip_address` of a request against the port, the
    /// other floating ips of the port and, in strict mode, the routers of the network.
    fn fip_association(
        &self,
        req: &NeutronRequest,
        fip_tenant: &str,
        fip: Option<&Uuid>,
        external: &Uuid,
    ) -> NeutronResult<Association> {
        let res = req.resource();
        let fixed_ip = res.get("fixed_ip_address").and_then(Value::as_str);
        let port_id = match res.get("port_id") {
            None => {
                if fixed_ip.is_some() {
                    return Err(NeutronError::bad_request(
                        "floatingip",
                        "fixed_ip_address cannot be specified without a port_id",
                    ));
                }
                return Ok(Association::Keep);
            }
            Some(Value::String(p)) if !p.is_empty() => p.as_str(),
            Some(_) => return Ok(Association::Clear),
        };
        let not_found = || NeutronError::PortNotFound {
            port_id: port_id.to_string(),
        };
        let port_uuid = id::parse_lenient(port_id).map_err(|_| not_found())?;
        let port = self
            .read_typed("virtual-machine-interface", &port_uuid)
            .filter(|p| Self::visible(req, &tenant_of(p), false))
            .ok_or_else(not_found)?;
        if tenant_of(&port) != fip_tenant.replace('-', "") {
            return Err(NeutronError::bad_request(
                "floatingip",
                "Cannot associate a port of another tenant",
            ));
        }

        let fixed_ips = self.fixed_ips(&port, &mut PortMemo::default());
        let address_of = |ip: &Value| {
            ip.get("ip_address").and_then(Value::as_str).map(str::to_string)
        };
        let chosen = match fixed_ip {
            Some(wanted) => fixed_ips
                .iter()
                .find(|ip| address_of(ip).as_deref() == Some(wanted))
                .ok_or_else(|| {
                    NeutronError::bad_request(
                        "floatingip",
                        format!("Port {port_id} does not have fixed ip {wanted}"),
                    )
                })?,
            None => match fixed_ips.as_slice() {
                [one] => one,
                [] => {
                    return Err(NeutronError::bad_request(
                        "floatingip",
                        format!("Port {port_id} has no fixed ip"),
                    ));
                }
                _ => {
                    return Err(NeutronError::bad_request(
                        "floatingip",
                        format!("Port {port_id} has multiple fixed IPs, specify fixed_ip_address"),
                    ));
                }
            },
        };
        let address = address_of(chosen).unwrap_or_default();
        let private = ref_uuids(&port, "virtual_network_refs").first().copied();

        for other in ref_uuids(&port, "floating_ip_back_refs") {
            if Some(&other) == fip {
                continue;
            }
            let Some(body) = self.read_typed("floating-ip", &other) else {
                continue;
            };
            if body.get("floating_ip_fixed_ip_address").and_then(Value::as_str) == Some(address.as_str()) {
                return Err(NeutronError::FloatingIPPortAlreadyAssociated {
                    floating_ip_address: body
                        .get("floating_ip_address")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    fip_id: other.to_string(),
                    port_id: port_id.to_string(),
                    fixed_ip: address,
                    net_id: private.map(|p| p.to_string()).unwrap_or_default(),
                });
            }
        }

        if self.api().config().strict_compliance
            && private.is_none_or(|private| self.routers_between(external, &private).is_empty())
        {
            return Err(NeutronError::ExternalGatewayForFloatingIPNotFound {
                subnet_id: chosen
                    .get("subnet_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                external_network_id: external.to_string(),
                port_id: port_id.to_string(),
            });
        }
        Ok(Association::Set {
            port: port_uuid,
            fixed_ip: address,
        })
    }

    async fn fip_create(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let tenant = self.tenant_for_create(req)?;
        let res = req.resource();
        let net_text = res
            .get("floating_network_id")
            .and_then(Value::as_str)
            .ok_or_else(|| NeutronError::bad_request("floatingip", "floating_network_id is required"))?;
        let net = id::parse_lenient(net_text).map_err(|_| NeutronError::NetworkNotFound {
            net_id: net_text.to_string(),
        })?;
        self.network_visible(req, &net)?;
        let pool = self.fip_pools(&net).first().copied().ok_or_else(|| {
            NeutronError::bad_request(
                "floatingip",
                format!("Network {net_text} is not a valid external network"),
            )
        })?;
        let owner = id::undashed(&tenant);
        let association = self.fip_association(req, &owner, None, &net)?;

        let uuid = Uuid::new_v4();
        let pool_fq = self.api().db().fq_name(&pool)?;
        let mut body = Map::new();
        body.insert("uuid".into(), json!(uuid.to_string()));
        body.insert("fq_name".into(), json!(pool_fq.child(uuid.to_string())));
        body.insert("parent_type".into(), json!("floating-ip-pool"));
        body.insert("project_refs".into(), refs_of(&[tenant]));
        body.insert(
            "perms2".into(),
            json!({ "owner": owner, "owner_access": PERMS_RWX, "global_access": 0, "share": [] }),
        );
        let requested = res.get("floating_ip_address").and_then(Value::as_str);
        if let Some(addr) = requested {
            body.insert("floating_ip_address".into(), json!(addr));
        }
        if let Association::Set { port, fixed_ip } = &association {
            body.insert("virtual_machine_interface_refs".into(), refs_of(&[*port]));
            body.insert("floating_ip_fixed_ip_address".into(), json!(fixed_ip));
        }
        if let Some(description) = res.get("description").filter(|d| !d.is_null()) {
            body.insert("id_perms".into(), json!({ "description": description }));
        }
        let uuid = self
            .core_create(req, "floating-ip", body)
            .await
            .map_err(|e| ip_error(e, &net, requested))?;
        info!("Floating ip {uuid} created on network {net}");
        let fip = self.fip_visible(req, &uuid.to_string())?;
        Ok(self.fip_view(&fip))
    }

    async fn fip_update(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let fip = self.fip_visible(req, &req.id_str())?;
        let uuid = uuid_of(&fip).ok_or_else(|| NeutronError::FloatingIPNotFound {
            floatingip_id: req.id_str(),
        })?;
        let external = self.fip_network(&fip).ok_or_else(|| NeutronError::Internal {
            msg: format!("Floating ip {uuid} has no network"),
        })?;
        let mut patch = Map::new();
        match self.fip_association(req, &tenant_of(&fip), Some(&uuid), &external)? {
            Association::Keep => {}
            Association::Clear => {
                patch.insert("virtual_machine_interface_refs".into(), json!([]));
                patch.insert("floating_ip_fixed_ip_address".into(), Value::Null);
            }
            Association::Set { port, fixed_ip } => {
                patch.insert("virtual_machine_interface_refs".into(), refs_of(&[port]));
                patch.insert("floating_ip_fixed_ip_address".into(), json!(fixed_ip));
            }
        }
        if let Some(description) = req.resource().get("description").filter(|d| !d.is_null()) {
            let mut id_perms = fip
                .get("id_perms")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            id_perms.insert("description".into(), description.clone());
            patch.insert("id_perms".into(), Value::Object(id_perms));
        }
        if !patch.is_empty() {
            self.core_update(req, "floating-ip", &uuid, patch)
                .await
                .map_err(|e| match e {
                    ApiError::Validation(msg) => NeutronError::bad_request("floatingip", msg),
                    e => e.into(),
                })?;
            debug!("Floating ip {uuid} updated");
        }
        let fip = self.fip_visible(req, &uuid.to_string())?;
        Ok(self.fip_view(&fip))
    }

    fn fip_list(&self, req: &NeutronRequest) -> Vec<Map<String, Value>> {
        let filters = req.filters();
        let uuids: BTreeSet<Uuid> = match self.listing_projects(req) {
            None => self.list_uuids("floating-ip", None, None).into_iter().collect(),
            Some(projects) => self
                .list_uuids("floating-ip", None, Some(projects))
                .into_iter()
                .collect(),
        };
        uuids
            .iter()
            .filter_map(|u| self.read_typed("floating-ip", u))
            .filter(|fip| Self::visible(req, &tenant_of(fip), false))
            .map(|fip| self.fip_view(&fip))
            .filter(|view| {
                filters.accepts_all(
                    view,
                    &[
                        "id",
                        "floating_ip_address",
                        "floating_network_id",
                        "port_id",
                        "router_id",
                        "fixed_ip_address",
                        "status",
                    ],
                )
            })
            .collect()
    }
}
