// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Routers are logical routers. The external gateway is a network reference tagged
//! `ExternalGateway`; interfaces are ports the router refers to.

use crate::errors::{NeutronError, NeutronResult};
use crate::network::is_external;
use crate::plugin::{
    NeutronPlugin, description_of, id_perms_enable, id_perms_from, list_reply, project_fields,
    ref_edges, ref_uuids, tenant_of, timestamps,
};
use crate::port::{PortMemo, ROUTER_INTERFACE};
use crate::request::{NeutronRequest, Operation};
use config::ApiError;
use id::Uuid;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

const EXTERNAL_GATEWAY: &str = "ExternalGateway";

fn gateway_attr() -> Value {
    json!({ "logical_router_virtual_network_type": EXTERNAL_GATEWAY })
}

fn is_gateway_edge(attr: &Value) -> bool {
    attr.get("logical_router_virtual_network_type").and_then(Value::as_str) == Some(EXTERNAL_GATEWAY)
}

/// The external network of a router, if it has a gateway.
pub(crate) fn gateway_of(lr: &Map<String, Value>) -> Option<Uuid> {
    ref_edges(lr, "virtual_network_refs")
        .into_iter()
        .find(|(_, attr)| is_gateway_edge(attr))
        .map(|(uuid, _)| uuid)
}

pub(crate) fn router_view(lr: &Map<String, Value>) -> Map<String, Value> {
    let tenant = tenant_of(lr);
    let gateway = gateway_of(lr).map_or(Value::Null, |net| {
        json!({ "network_id": net.to_string(), "enable_snat": true })
    });
    let mut out = Map::new();
    out.insert("id".into(), lr.get("uuid").cloned().unwrap_or(Value::Null));
    out.insert(
        "name".into(),
        json!(lr.get("display_name").and_then(Value::as_str).unwrap_or_default()),
    );
    out.insert("tenant_id".into(), json!(tenant));
    out.insert("project_id".into(), json!(tenant));
    out.insert("admin_state_up".into(), json!(id_perms_enable(lr)));
    out.insert("status".into(), json!("ACTIVE"));
    out.insert("external_gateway_info".into(), gateway);
    out.insert("gw_port_id".into(), Value::Null);
    out.insert("description".into(), description_of(lr));
    timestamps(lr, &mut out);
    out
}

fn router_error(e: ApiError) -> NeutronError {
    match e {
        ApiError::Validation(msg) => NeutronError::bad_request("router", msg),
        e => e.into(),
    }
}

impl NeutronPlugin {
    pub(crate) async fn router_request(&self, req: &NeutronRequest) -> NeutronResult<Value> {
        match req.operation() {
            Operation::Create => Ok(Value::Object(self.router_create(req).await?)),
            Operation::Read => {
                let lr = self.router_owned(req, &req.id()?)?;
                Ok(project_fields(router_view(&lr), req.data.fields.as_ref()))
            }
            Operation::Update => Ok(Value::Object(self.router_update(req).await?)),
            Operation::Delete => {
                self.router_delete(req).await?;
                Ok(json!({}))
            }
            Operation::ReadAll | Operation::ReadCount => Ok(list_reply(req, self.router_list(req))),
            Operation::AddInterface => self.add_interface(req).await,
            Operation::DelInterface => self.remove_interface(req).await,
        }
    }

    fn router_owned(&self, req: &NeutronRequest, uuid: &Uuid) -> NeutronResult<Map<String, Value>> {
        self.read_typed("logical-router", uuid)
            .filter(|lr| Self::visible(req, &tenant_of(lr), false))
            .ok_or_else(|| NeutronError::RouterNotFound {
                router_id: uuid.to_string(),
            })
    }

    /// The network references a router keeps after `external_gateway_info` is applied.
    fn gateway_refs(
        &self,
        req: &NeutronRequest,
        info: &Value,
        current: Option<&Map<String, Value>>,
    ) -> NeutronResult<Value> {
        let mut edges: Vec<Value> = current
            .map(|lr| ref_edges(lr, "virtual_network_refs"))
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, attr)| !is_gateway_edge(attr))
            .map(|(uuid, attr)| json!({ "uuid": uuid.to_string(), "attr": attr }))
            .collect();
        if let Some(net) = info.get("network_id").and_then(Value::as_str).filter(|n| !n.is_empty()) {
            let not_found = || NeutronError::NetworkNotFound {
                net_id: net.to_string(),
            };
            let uuid = id::parse_lenient(net).map_err(|_| not_found())?;
            let vn = self.network_visible(req, &uuid)?;
            if !is_external(&vn) {
                return Err(NeutronError::bad_request(
                    "router",
                    format!("Network {net} is not a valid external network"),
                ));
            }
            edges.push(json!({ "uuid": uuid.to_string(), "attr": gateway_attr() }));
        }
        Ok(Value::Array(edges))
    }

    async fn router_create(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let tenant = self.tenant_for_create(req)?;
        let project = self.project_fq(&tenant)?;
        let res = req.resource();
        let uuid = Uuid::new_v4();
        let mut body = Map::new();
        body.insert("uuid".into(), json!(uuid.to_string()));
        body.insert("fq_name".into(), json!(project.child(uuid.to_string())));
        body.insert("parent_type".into(), json!("project"));
        body.insert(
            "display_name".into(),
            json!(res.get("name").and_then(Value::as_str).unwrap_or_default()),
        );
        if let Some(id_perms) = id_perms_from(res, None) {
            body.insert("id_perms".into(), id_perms);
        }
        if let Some(info) = res.get("external_gateway_info").filter(|i| !i.is_null()) {
            body.insert("virtual_network_refs".into(), self.gateway_refs(req, info, None)?);
        }
        let uuid = self
            .core_create(req, "logical-router", body)
            .await
            .map_err(router_error)?;
        info!("Router {uuid} created");
        let lr = self.router_owned(req, &uuid)?;
        Ok(router_view(&lr))
    }

    async fn router_update(&self, req: &NeutronRequest) -> NeutronResult<Map<String, Value>> {
        let uuid = req.id()?;
        let lr = self.router_owned(req, &uuid)?;
        let res = req.resource();
        let mut patch = Map::new();
        if let Some(name) = res.get("name").and_then(Value::as_str) {
            patch.insert("display_name".into(), json!(name));
        }
        if let Some(id_perms) = id_perms_from(res, Some(&lr)) {
            patch.insert("id_perms".into(), id_perms);
        }
        if let Some(info) = res.get("external_gateway_info") {
            patch.insert(
                "virtual_network_refs".into(),
                self.gateway_refs(req, info, Some(&lr))?,
            );
        }
        if !patch.is_empty() {
            self.core_update(req, "logical-router", &uuid, patch)
                .await
                .map_err(router_error)?;
        }
        let lr = self.router_owned(req, &uuid)?;
        Ok(router_view(&lr))
    }

    async fn router_delete(&self, req: &NeutronRequest) -> NeutronResult<()> {
        let uuid = req.id()?;
        let lr = self.router_owned(req, &uuid)?;
        if !ref_uuids(&lr, "virtual_machine_interface_refs").is_empty() {
            return Err(NeutronError::RouterInUse {
                router_id: uuid.to_string(),
            });
        }
        match self.core_delete(req, "logical-router", &uuid).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                return Err(NeutronError::RouterNotFound {
                    router_id: uuid.to_string(),
                });
            }
            Err(ApiError::RefsExist(_)) => {
                return Err(NeutronError::RouterInUse {
                    router_id: uuid.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        info!("Router {uuid} deleted");
        Ok(())
    }

    fn router_list(&self, req: &NeutronRequest) -> Vec<Map<String, Value>> {
        let filters = req.filters();
        self.list_typed("logical-router", self.listing_projects(req))
            .iter()
            .map(router_view)
            .filter(|view| filters.accepts_all(view, &["id", "name", "admin_state_up", "status"]))
            .collect()
    }

    /// Subnet of the single fixed ip of a port.
    fn interface_subnet(&self, port: &Map<String, Value>) -> NeutronResult<String> {
        let fixed = self.fixed_ips(port, &mut PortMemo::default());
        match fixed.as_slice() {
            [one] => one
                .get("subnet_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| NeutronError::bad_request("router", "Router port has no subnet")),
            _ => Err(NeutronError::bad_request(
                "router",
                "Router port must have exactly one fixed IP",
            )),
        }
    }

    /// `(port, subnet)` of every interface of a router.
    fn interfaces(&self, lr: &Map<String, Value>) -> Vec<(Uuid, Option<String>)> {
        ref_uuids(lr, "virtual_machine_interface_refs")
            .into_iter()
            .map(|port| {
                let subnet = self
                    .read_typed("virtual-machine-interface", &port)
                    .and_then(|p| self.interface_subnet(&p).ok());
                (port, subnet)
            })
            .collect()
    }

    async fn add_interface(&self, req: &NeutronRequest) -> NeutronResult<Value> {
        let router = req.id()?;
        let lr = self.router_owned(req, &router)?;
        let res = req.resource();
        let tenant = tenant_of(&lr);
        let port_id = res.get("port_id").and_then(Value::as_str).filter(|p| !p.is_empty());
        let subnet_id = res.get("subnet_id").and_then(Value::as_str).filter(|s| !s.is_empty());

        let (port, subnet, created) = match (port_id, subnet_id) {
            (Some(_), Some(_)) => {
                return Err(NeutronError::bad_request(
                    "router",
                    "Cannot specify both subnet-id and port-id",
                ));
            }
            (None, None) => {
                return Err(NeutronError::bad_request(
                    "router",
                    "Either subnet_id or port_id must be specified",
                ));
            }
            (Some(port_id), None) => {
                let not_found = || NeutronError::RouterInterfaceNotFound {
                    router_id: router.to_string(),
                    port_id: port_id.to_string(),
                };
                let uuid = id::parse_lenient(port_id).map_err(|_| NeutronError::PortNotFound {
                    port_id: port_id.to_string(),
                })?;
                let port = self.port_visible(req, &uuid)?;
                if !req.is_admin() && tenant_of(&port) != tenant {
                    return Err(not_found());
                }
                let in_use = !ref_uuids(&port, "logical_router_back_refs").is_empty()
                    || !ref_uuids(&port, "virtual_machine_refs").is_empty();
                if in_use {
                    let net = ref_uuids(&port, "virtual_network_refs");
                    return Err(NeutronError::PortInUse {
                        net_id: net.first().map(Uuid::to_string).unwrap_or_default(),
                        port_id: port_id.to_string(),
                        device_id: ref_uuids(&port, "logical_router_back_refs")
                            .first()
                            .or(ref_uuids(&port, "virtual_machine_refs").first())
                            .map(Uuid::to_string)
                            .unwrap_or_default(),
                    });
                }
                let subnet = self.interface_subnet(&port)?;
                (uuid, subnet, false)
            }
            (None, Some(subnet_id)) => {
                let found = self.subnet_visible(req, subnet_id)?;
                if !req.is_admin() && tenant_of(&found.vn) != tenant {
                    return Err(NeutronError::RouterInterfaceNotFoundForSubnet {
                        router_id: router.to_string(),
                        subnet_id: subnet_id.to_string(),
                    });
                }
                let gateway = Self::subnet_gateway(&found.subnet).ok_or_else(|| {
                    NeutronError::bad_request(
                        "router",
                        format!("Subnet {subnet_id} has no gateway to attach"),
                    )
                })?;
                let port = self
                    .gateway_port(req, &router, &found.vn_uuid, subnet_id, &gateway, &tenant)
                    .await?;
                (port, subnet_id.to_string(), true)
            }
        };

        if self
            .interfaces(&lr)
            .iter()
            .any(|(_, s)| s.as_deref() == Some(subnet.as_str()))
        {
            self.discard_interface(req, &port, created).await;
            return Err(NeutronError::bad_request(
                "router",
                format!("Router {router} already has a port on subnet {subnet}"),
            ));
        }

        let mut refs: Vec<Value> = ref_uuids(&lr, "virtual_machine_interface_refs")
            .iter()
            .map(|u| json!({ "uuid": u.to_string() }))
            .collect();
        refs.push(json!({ "uuid": port.to_string() }));
        let mut patch = Map::new();
        patch.insert("virtual_machine_interface_refs".into(), Value::Array(refs));
        if let Err(e) = self.core_update(req, "logical-router", &router, patch).await {
            self.discard_interface(req, &port, created).await;
            return Err(match e {
                ApiError::Conflict(_) => NeutronError::PortInUse {
                    net_id: String::new(),
                    port_id: port.to_string(),
                    device_id: router.to_string(),
                },
                e => router_error(e),
            });
        }
        if !created {
            let mut patch = Map::new();
            patch.insert(
                "virtual_machine_interface_device_owner".into(),
                json!(ROUTER_INTERFACE),
            );
            self.core_update(req, "virtual-machine-interface", &port, patch).await?;
        }
        info!("Router {router} got interface {port} on subnet {subnet}");
        Ok(json!({
            "id": router.to_string(),
            "tenant_id": tenant,
            "port_id": port.to_string(),
            "subnet_id": subnet,
            "subnet_ids": [subnet],
        }))
    }

    /// A router port holding the gateway address of a subnet.
    async fn gateway_port(
        &self,
        req: &NeutronRequest,
        router: &Uuid,
        net: &Uuid,
        subnet_id: &str,
        gateway: &str,
        tenant: &str,
    ) -> NeutronResult<Uuid> {
        let tenant = id::parse_lenient(tenant).map_err(|e| NeutronError::Internal { msg: e.to_string() })?;
        let body = json!({
            "network_id": net.to_string(),
            "name": "",
            "fixed_ips": [{ "subnet_id": subnet_id, "ip_address": gateway }],
            "device_owner": ROUTER_INTERFACE,
            "device_id": router.to_string(),
            "port_security_enabled": false,
        });
        let body = body.as_object().cloned().unwrap_or_default();
        self.create_port(req, &tenant, &body).await
    }

    /// Undo the port side of a failed interface add.
    async fn discard_interface(&self, req: &NeutronRequest, port: &Uuid, created: bool) {
        if !created {
            return;
        }
        if let Some(body) = self.read_typed("virtual-machine-interface", port)
            && let Err(e) = self.delete_port(req, port, &body).await
        {
            warn!("Router port {port} left behind: {e}");
        }
    }

    async fn remove_interface(&self, req: &NeutronRequest) -> NeutronResult<Value> {
        let router = req.id()?;
        let lr = self.router_owned(req, &router)?;
        let res = req.resource();
        let port_id = res.get("port_id").and_then(Value::as_str).filter(|p| !p.is_empty());
        let subnet_id = res.get("subnet_id").and_then(Value::as_str).filter(|s| !s.is_empty());
        let interfaces = self.interfaces(&lr);

        let (port, subnet) = match (port_id, subnet_id) {
            (Some(port_id), subnet_id) => {
                let found = id::parse_lenient(port_id)
                    .ok()
                    .and_then(|u| interfaces.iter().find(|(p, _)| *p == u))
                    .ok_or_else(|| NeutronError::RouterInterfaceNotFound {
                        router_id: router.to_string(),
                        port_id: port_id.to_string(),
                    })?;
                if let Some(subnet_id) = subnet_id
                    && found.1.as_deref() != Some(subnet_id)
                {
                    return Err(NeutronError::SubnetMismatchForPort {
                        router_id: router.to_string(),
                        subnet_id: subnet_id.to_string(),
                        port_id: port_id.to_string(),
                    });
                }
                (found.0, found.1.clone().unwrap_or_default())
            }
            (None, Some(subnet_id)) => {
                let found = interfaces
                    .iter()
                    .find(|(_, s)| s.as_deref() == Some(subnet_id))
                    .ok_or_else(|| NeutronError::RouterInterfaceNotFoundForSubnet {
                        router_id: router.to_string(),
                        subnet_id: subnet_id.to_string(),
                    })?;
                (found.0, subnet_id.to_string())
            }
            (None, None) => {
                return Err(NeutronError::bad_request(
                    "router",
                    "Either subnet_id or port_id must be specified",
                ));
            }
        };

        let kept: Vec<Value> = interfaces
            .iter()
            .filter(|(p, _)| *p != port)
            .map(|(p, _)| json!({ "uuid": p.to_string() }))
            .collect();
        let mut patch = Map::new();
        patch.insert("virtual_machine_interface_refs".into(), Value::Array(kept));
        self.core_update(req, "logical-router", &router, patch)
            .await
            .map_err(router_error)?;
        if let Some(body) = self.read_typed("virtual-machine-interface", &port) {
            self.delete_port(req, &port, &body).await?;
        }
        info!("Router {router} lost interface {port}");
        Ok(json!({
            "id": router.to_string(),
            "tenant_id": tenant_of(&lr),
            "port_id": port.to_string(),
            "subnet_id": subnet,
            "subnet_ids": [subnet],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn gateway_is_the_tagged_network_edge() {
        let ext = Uuid::new_v4();
        let lr = json!({
            "uuid": "r",
            "perms2": {"owner": "t"},
            "virtual_network_refs": [
                {"uuid": Uuid::new_v4().to_string(), "attr": {"logical_router_virtual_network_type": "InternalVirtualNetwork"}},
                {"uuid": ext.to_string(), "attr": gateway_attr()}
            ]
        });
        let lr = lr.as_object().unwrap();
        assert_eq!(gateway_of(lr), Some(ext));
        let view = router_view(lr);
        assert_eq!(
            view["external_gateway_info"],
            json!({"network_id": ext.to_string(), "enable_snat": true})
        );
        assert_eq!(view["gw_port_id"], Value::Null);
    }

    #[test]
    fn router_without_gateway() {
        let lr = json!({"uuid": "r", "display_name": "edge"});
        let view = router_view(lr.as_object().unwrap());
        assert_eq!(view["external_gateway_info"], Value::Null);
        assert_eq!(view["name"], "edge");
    }
}
